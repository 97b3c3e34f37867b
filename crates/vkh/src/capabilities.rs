//! Physical device capability detection and scoring.

use ash::vk;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Why a device was excluded from selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disqualification {
    NoDynamicSampledImageIndexing,
    NoSwapchainExtension,
    NoSurfaceFormats,
    NoPresentModes,
}

/// Score bonus for discrete GPUs and for each optional shader stage.
const DISCRETE_BONUS: u32 = 1000;
const SHADER_STAGE_BONUS: u32 = 1000;

/// Selection-relevant facts about one physical device.
#[derive(Debug, Clone)]
pub struct DeviceCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    pub device_type: vk::PhysicalDeviceType,
    /// Vulkan API version
    pub api_version: u32,

    pub max_image_dimension_2d: u32,
    pub max_fragment_input_components: u32,
    pub geometry_shader: bool,
    pub tessellation_shader: bool,
    pub sampled_image_array_dynamic_indexing: bool,
    pub sampler_anisotropy: bool,

    /// `VK_KHR_swapchain` is in the device extension list
    pub supports_swapchain: bool,
    /// Formats the target surface supports on this device
    pub surface_format_count: usize,
    /// Present modes the target surface supports on this device
    pub present_mode_count: usize,

    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
}

impl DeviceCapabilities {
    /// Query capabilities of a physical device against a surface.
    ///
    /// # Safety
    /// The instance, physical device and surface must be valid.
    pub unsafe fn query(
        instance: &ash::Instance,
        surface_loader: &ash::khr::surface::Instance,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let features = instance.get_physical_device_features(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let supports_swapchain = instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default()
            .iter()
            .any(|ext| CStr::from_ptr(ext.extension_name.as_ptr()) == ash::khr::swapchain::NAME);

        let surface_format_count = surface_loader
            .get_physical_device_surface_formats(physical_device, surface)
            .map_or(0, |formats| formats.len());
        let present_mode_count = surface_loader
            .get_physical_device_surface_present_modes(physical_device, surface)
            .map_or(0, |modes| modes.len());

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name: CStr::from_ptr(properties.device_name.as_ptr())
                .to_string_lossy()
                .into_owned(),
            device_type: properties.device_type,
            api_version: properties.api_version,
            max_image_dimension_2d: properties.limits.max_image_dimension2_d,
            max_fragment_input_components: properties.limits.max_fragment_input_components,
            geometry_shader: features.geometry_shader == vk::TRUE,
            tessellation_shader: features.tessellation_shader == vk::TRUE,
            sampled_image_array_dynamic_indexing: features
                .shader_sampled_image_array_dynamic_indexing
                == vk::TRUE,
            sampler_anisotropy: features.sampler_anisotropy == vk::TRUE,
            supports_swapchain,
            surface_format_count,
            present_mode_count,
            device_local_memory_mb,
        }
    }

    /// First reason this device cannot be used, if any.
    pub fn disqualification(&self) -> Option<Disqualification> {
        if !self.sampled_image_array_dynamic_indexing {
            Some(Disqualification::NoDynamicSampledImageIndexing)
        } else if !self.supports_swapchain {
            Some(Disqualification::NoSwapchainExtension)
        } else if self.surface_format_count == 0 {
            Some(Disqualification::NoSurfaceFormats)
        } else if self.present_mode_count == 0 {
            Some(Disqualification::NoPresentModes)
        } else {
            None
        }
    }

    /// Weighted sum of capability signals. Higher is better.
    pub fn score(&self) -> u64 {
        let mut score = u64::from(self.max_image_dimension_2d)
            + u64::from(self.max_fragment_input_components);

        if self.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            score += u64::from(DISCRETE_BONUS);
        }
        if self.geometry_shader {
            score += u64::from(SHADER_STAGE_BONUS);
        }
        if self.tessellation_shader {
            score += u64::from(SHADER_STAGE_BONUS);
        }

        score
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}, {:?}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.device_name,
            self.vendor,
            self.device_type,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }
}

/// Index of the highest-scoring qualifying candidate.
///
/// Ties keep the earliest candidate, so enumeration order breaks them.
pub fn select_best(candidates: &[DeviceCapabilities]) -> Option<usize> {
    candidates
        .iter()
        .enumerate()
        .filter(|(_, caps)| caps.disqualification().is_none())
        .fold(None, |best: Option<(usize, u64)>, (i, caps)| {
            let score = caps.score();
            match best {
                Some((_, best_score)) if best_score >= score => best,
                _ => Some((i, score)),
            }
        })
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capable(name: &str) -> DeviceCapabilities {
        DeviceCapabilities {
            vendor: GpuVendor::Other(0),
            device_name: name.to_string(),
            device_type: vk::PhysicalDeviceType::INTEGRATED_GPU,
            api_version: vk::API_VERSION_1_0,
            max_image_dimension_2d: 8192,
            max_fragment_input_components: 64,
            geometry_shader: false,
            tessellation_shader: false,
            sampled_image_array_dynamic_indexing: true,
            sampler_anisotropy: true,
            supports_swapchain: true,
            surface_format_count: 2,
            present_mode_count: 1,
            device_local_memory_mb: 2048,
        }
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn score_sums_signals() {
        let mut caps = capable("a");
        assert_eq!(caps.score(), 8192 + 64);

        caps.geometry_shader = true;
        caps.tessellation_shader = true;
        caps.device_type = vk::PhysicalDeviceType::DISCRETE_GPU;
        assert_eq!(caps.score(), 8192 + 64 + 3000);
    }

    #[test]
    fn disqualifications() {
        let mut caps = capable("a");
        assert_eq!(caps.disqualification(), None);

        caps.present_mode_count = 0;
        assert_eq!(
            caps.disqualification(),
            Some(Disqualification::NoPresentModes)
        );

        caps.surface_format_count = 0;
        assert_eq!(
            caps.disqualification(),
            Some(Disqualification::NoSurfaceFormats)
        );

        caps.supports_swapchain = false;
        assert_eq!(
            caps.disqualification(),
            Some(Disqualification::NoSwapchainExtension)
        );

        caps.sampled_image_array_dynamic_indexing = false;
        assert_eq!(
            caps.disqualification(),
            Some(Disqualification::NoDynamicSampledImageIndexing)
        );
    }

    #[test]
    fn best_qualifying_device_wins() {
        let mut strong_but_unfit = capable("strong");
        strong_but_unfit.max_image_dimension_2d = 32768;
        strong_but_unfit.supports_swapchain = false;

        let weak = capable("weak");

        let mut discrete = capable("discrete");
        discrete.device_type = vk::PhysicalDeviceType::DISCRETE_GPU;

        let candidates = [strong_but_unfit, weak, discrete];
        assert_eq!(select_best(&candidates), Some(2));
    }

    #[test]
    fn ties_keep_enumeration_order() {
        let candidates = [capable("first"), capable("second")];
        assert_eq!(select_best(&candidates), Some(0));
    }

    #[test]
    fn no_qualifying_device() {
        let mut caps = capable("a");
        caps.present_mode_count = 0;
        assert_eq!(select_best(&[caps]), None);
        assert_eq!(select_best(&[]), None);
    }
}
