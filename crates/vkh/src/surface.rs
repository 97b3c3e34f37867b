//! Presentation surface bound to an OS window.

use crate::error::{GpuError, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

/// The Vulkan surface handle plus its extension loader.
pub struct Surface {
    pub(crate) handle: vk::SurfaceKHR,
    pub(crate) loader: ash::khr::surface::Instance,
}

impl Surface {
    /// Create a surface for a window.
    ///
    /// # Safety
    /// The entry and instance must be valid and the window must outlive the surface.
    pub unsafe fn from_window<W>(entry: &ash::Entry, instance: &ash::Instance, window: &W) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get window handle: {e}")))?;

        let handle = ash_window::create_surface(
            entry,
            instance,
            display.as_raw(),
            window_handle.as_raw(),
            None,
        )
        .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;

        Ok(Self {
            handle,
            loader: ash::khr::surface::Instance::new(entry, instance),
        })
    }

    /// Get the raw surface handle.
    pub fn handle(&self) -> vk::SurfaceKHR {
        self.handle
    }

    pub fn loader(&self) -> &ash::khr::surface::Instance {
        &self.loader
    }

    /// Whether `queue_family` on `physical_device` can present here.
    ///
    /// # Safety
    /// The physical device must be valid.
    pub unsafe fn supports_present(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
    ) -> Result<bool> {
        Ok(self.loader.get_physical_device_surface_support(
            physical_device,
            queue_family,
            self.handle,
        )?)
    }

    /// Query what the device supports for this surface.
    ///
    /// # Safety
    /// The physical device must be valid.
    pub unsafe fn support(&self, physical_device: vk::PhysicalDevice) -> Result<SurfaceSupport> {
        let capabilities = self
            .loader
            .get_physical_device_surface_capabilities(physical_device, self.handle)?;
        let formats = self
            .loader
            .get_physical_device_surface_formats(physical_device, self.handle)?;
        let present_modes = self
            .loader
            .get_physical_device_surface_present_modes(physical_device, self.handle)?;

        Ok(SurfaceSupport {
            capabilities,
            formats,
            present_modes,
        })
    }

    /// Destroy the surface.
    ///
    /// # Safety
    /// The surface must not be in use.
    pub unsafe fn destroy(&self) {
        self.loader.destroy_surface(self.handle, None);
    }
}

/// Surface capabilities query result.
pub struct SurfaceSupport {
    /// Raw surface capabilities.
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    /// Supported surface formats.
    pub formats: Vec<vk::SurfaceFormatKHR>,
    /// Supported present modes.
    pub present_modes: Vec<vk::PresentModeKHR>,
}
