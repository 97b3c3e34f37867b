//! Vulkan instance creation and validation reporting.

use crate::error::{GpuError, Result};
use ash::vk;
use raw_window_handle::RawDisplayHandle;
use std::ffi::{c_char, CStr, CString};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";
const ENGINE_NAME: &CStr = c"vkh";

/// A created instance plus whether validation ended up enabled.
pub struct InstanceBundle {
    pub instance: ash::Instance,
    pub validation: bool,
}

/// Instance extensions needed to present to the given display.
pub fn required_instance_extensions(display: RawDisplayHandle) -> Result<Vec<&'static CStr>> {
    let surface_extensions = ash_window::enumerate_required_extensions(display)
        .map_err(GpuError::step("enumerate surface extensions"))?;

    // SAFETY: ash_window returns pointers to static nul-terminated names.
    Ok(surface_extensions
        .iter()
        .map(|&ptr| unsafe { CStr::from_ptr(ptr) })
        .collect())
}

/// Names in `required` that are absent from `available`.
fn missing_extensions(required: &[&CStr], available: &[vk::ExtensionProperties]) -> Vec<String> {
    required
        .iter()
        .filter(|name| {
            !available
                .iter()
                .any(|props| props.extension_name_as_c_str() == Ok(**name))
        })
        .map(|name| name.to_string_lossy().into_owned())
        .collect()
}

/// Check that the validation layer and `VK_EXT_debug_utils` are both available.
fn check_validation_support(
    layers: &[vk::LayerProperties],
    extensions: &[vk::ExtensionProperties],
) -> Result<()> {
    let layer_found = layers
        .iter()
        .any(|props| props.layer_name_as_c_str() == Ok(VALIDATION_LAYER));
    if !layer_found {
        return Err(GpuError::ExtensionNotSupported(
            VALIDATION_LAYER.to_string_lossy().into_owned(),
        ));
    }

    let missing = missing_extensions(&[ash::ext::debug_utils::NAME], extensions);
    if !missing.is_empty() {
        return Err(GpuError::ExtensionNotSupported(missing.join(", ")));
    }
    Ok(())
}

/// Create a Vulkan instance able to present to `display`.
///
/// Missing surface extensions are fatal. So is a missing validation layer or
/// `VK_EXT_debug_utils` when `enable_validation` is set.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    display: RawDisplayHandle,
    enable_validation: bool,
) -> Result<InstanceBundle> {
    let app_name = CString::new(app_name)
        .map_err(|_| GpuError::InvalidState("application name contains a nul byte".into()))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(ENGINE_NAME)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_0);

    let mut extensions = required_instance_extensions(display)?;

    let available_extensions = entry
        .enumerate_instance_extension_properties(None)
        .map_err(GpuError::step("enumerate instance extensions"))?;

    let missing = missing_extensions(&extensions, &available_extensions);
    if !missing.is_empty() {
        return Err(GpuError::ExtensionNotSupported(missing.join(", ")));
    }

    let validation = enable_validation;
    if validation {
        let layers = entry
            .enumerate_instance_layer_properties()
            .map_err(GpuError::step("enumerate instance layers"))?;
        check_validation_support(&layers, &available_extensions)?;
        extensions.push(ash::ext::debug_utils::NAME);
    }

    let extension_names: Vec<*const c_char> = extensions.iter().map(|ext| ext.as_ptr()).collect();
    let layer_names: Vec<*const c_char> = if validation {
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        Vec::new()
    };

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names);

    let instance = entry
        .create_instance(&create_info, None)
        .map_err(GpuError::step("create instance"))?;

    tracing::debug!(
        "Created instance with {} extensions, validation {}",
        extension_names.len(),
        if validation { "on" } else { "off" }
    );

    Ok(InstanceBundle {
        instance,
        validation,
    })
}

/// Routes validation-layer messages into `tracing`.
pub struct DebugMessenger {
    loader: ash::ext::debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

impl DebugMessenger {
    /// Install the messenger on an instance created with debug utils enabled.
    ///
    /// # Safety
    /// The entry and instance must be valid, and the instance must have
    /// `VK_EXT_debug_utils` enabled.
    pub unsafe fn new(entry: &ash::Entry, instance: &ash::Instance) -> Result<Self> {
        let loader = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = loader
            .create_debug_utils_messenger(&create_info, None)
            .map_err(GpuError::step("create debug messenger"))?;

        Ok(Self { loader, messenger })
    }

    /// Destroy the messenger.
    ///
    /// # Safety
    /// Must be called before the owning instance is destroyed.
    pub unsafe fn destroy(&self) {
        self.loader
            .destroy_debug_utils_messenger(self.messenger, None);
    }
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if callback_data.is_null() {
        return vk::FALSE;
    }

    // SAFETY: the loader passes a valid callback data struct for the call.
    let message = unsafe {
        let data = &*callback_data;
        if data.p_message.is_null() {
            return vk::FALSE;
        }
        CStr::from_ptr(data.p_message).to_string_lossy()
    };

    let kind = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "validation",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "performance",
        _ => "general",
    };

    match severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            tracing::error!(target: "vkh::validation", "[{kind}] {message}");
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            tracing::warn!(target: "vkh::validation", "[{kind}] {message}");
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            tracing::debug!(target: "vkh::validation", "[{kind}] {message}");
        }
        _ => {
            tracing::trace!(target: "vkh::validation", "[{kind}] {message}");
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(name: &CStr) -> vk::ExtensionProperties {
        let mut props = vk::ExtensionProperties::default();
        for (dst, &src) in props
            .extension_name
            .iter_mut()
            .zip(name.to_bytes_with_nul())
        {
            *dst = src as c_char;
        }
        props
    }

    fn layer(name: &CStr) -> vk::LayerProperties {
        let mut props = vk::LayerProperties::default();
        for (dst, &src) in props.layer_name.iter_mut().zip(name.to_bytes_with_nul()) {
            *dst = src as c_char;
        }
        props
    }

    #[test]
    fn validation_needs_layer_and_debug_utils() {
        let layers = [layer(VALIDATION_LAYER)];
        let extensions = [props(ash::khr::surface::NAME), props(ash::ext::debug_utils::NAME)];
        assert!(check_validation_support(&layers, &extensions).is_ok());
    }

    #[test]
    fn missing_validation_layer_is_fatal() {
        let layers = [layer(c"VK_LAYER_MESA_device_select")];
        let extensions = [props(ash::ext::debug_utils::NAME)];
        let err = check_validation_support(&layers, &extensions).unwrap_err();
        assert!(
            matches!(&err, GpuError::ExtensionNotSupported(name) if name == "VK_LAYER_KHRONOS_validation"),
            "{err}"
        );
        assert!(check_validation_support(&[], &extensions).is_err());
    }

    #[test]
    fn missing_debug_utils_is_fatal() {
        let layers = [layer(VALIDATION_LAYER)];
        let extensions = [props(ash::khr::surface::NAME)];
        let err = check_validation_support(&layers, &extensions).unwrap_err();
        assert!(
            matches!(&err, GpuError::ExtensionNotSupported(name) if name == "VK_EXT_debug_utils"),
            "{err}"
        );
    }

    #[test]
    fn reports_only_missing_extensions() {
        let available = [props(ash::khr::surface::NAME)];
        let required = [ash::khr::surface::NAME, ash::ext::debug_utils::NAME];
        assert_eq!(
            missing_extensions(&required, &available),
            vec!["VK_EXT_debug_utils".to_string()]
        );
        assert!(missing_extensions(&required[..1], &available).is_empty());
    }
}
