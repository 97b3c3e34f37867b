//! Swapchain management.

use crate::error::{GpuError, Result};
use crate::queue::QueueFamilyIndices;
use crate::surface::{Surface, SurfaceSupport};
use ash::vk;

/// The format every desktop driver is expected to support.
const PREFERRED_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::B8G8R8A8_UNORM,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

/// Swapchain wrapper.
pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
}

impl Swapchain {
    /// Create a swapchain and one view per image.
    ///
    /// # Safety
    /// All handles must be valid. `old_swapchain`, when given, must not be
    /// used again except to destroy it.
    pub unsafe fn new(
        device: &ash::Device,
        loader: &ash::khr::swapchain::Device,
        surface: &Surface,
        support: &SurfaceSupport,
        families: &QueueFamilyIndices,
        fallback_extent: vk::Extent2D,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<Self> {
        let surface_format = select_surface_format(&support.formats)?;
        let present_mode = select_present_mode(&support.present_modes);
        let extent = choose_extent(&support.capabilities, fallback_extent);
        let image_count = choose_image_count(&support.capabilities);
        let (sharing_mode, family_indices) = image_sharing(families);

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.handle())
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(&family_indices)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = loader
            .create_swapchain(&create_info, None)
            .map_err(GpuError::step("create swapchain"))?;

        let images = loader.get_swapchain_images(swapchain)?;

        let mut image_views = Vec::with_capacity(images.len());
        for &image in &images {
            match crate::resources::create_image_view_raw(
                device,
                image,
                surface_format.format,
                vk::ImageAspectFlags::COLOR,
                1,
            ) {
                Ok(view) => image_views.push(view),
                Err(e) => {
                    for &view in &image_views {
                        device.destroy_image_view(view, None);
                    }
                    loader.destroy_swapchain(swapchain, None);
                    return Err(e);
                }
            }
        }

        tracing::info!(
            "Swapchain: {} images, {:?} {:?}, {:?}, {}x{}",
            images.len(),
            surface_format.format,
            surface_format.color_space,
            present_mode,
            extent.width,
            extent.height
        );

        Ok(Self {
            swapchain,
            images,
            image_views,
            format: surface_format.format,
            extent,
            present_mode,
        })
    }

    /// Number of presentable images.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Acquire the next image, blocking until one is available.
    ///
    /// # Safety
    /// All handles must be valid.
    pub unsafe fn acquire_next_image(
        &self,
        loader: &ash::khr::swapchain::Device,
        semaphore: vk::Semaphore,
    ) -> Result<u32> {
        match loader.acquire_next_image(self.swapchain, u64::MAX, semaphore, vk::Fence::null()) {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    tracing::debug!("Acquired image {index} from a suboptimal swapchain");
                }
                Ok(index)
            }
            // No image was acquired; the caller must recreate the swapchain.
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(GpuError::SwapchainOutOfDate),
            Err(e) => Err(GpuError::from(e)),
        }
    }

    /// Present an image. Returns `true` when the swapchain is suboptimal.
    ///
    /// # Safety
    /// All handles must be valid.
    pub unsafe fn present(
        &self,
        loader: &ash::khr::swapchain::Device,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let wait_semaphores = [wait_semaphore];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match loader.queue_present(queue, &present_info) {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(GpuError::SwapchainOutOfDate),
            Err(e) => Err(GpuError::from(e)),
        }
    }

    /// Destroy the image views and the swapchain.
    ///
    /// # Safety
    /// All handles must be valid and swapchain must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device, loader: &ash::khr::swapchain::Device) {
        for &view in &self.image_views {
            device.destroy_image_view(view, None);
        }
        loader.destroy_swapchain(self.swapchain, None);
    }
}

/// Pick the surface format.
///
/// A single `UNDEFINED` entry means the surface has no preference.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    match available {
        [] => Err(GpuError::InvalidState("surface reports no formats".into())),
        [only] if only.format == vk::Format::UNDEFINED => Ok(PREFERRED_FORMAT),
        _ => Ok(available
            .iter()
            .copied()
            .find(|f| {
                f.format == PREFERRED_FORMAT.format && f.color_space == PREFERRED_FORMAT.color_space
            })
            .unwrap_or(available[0])),
    }
}

/// Mailbox when offered, otherwise FIFO (always supported).
pub fn select_present_mode(available: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    if available.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// `min + 1`, clamped to `max` when the surface has one (0 means unbounded).
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

/// The surface's fixed extent, or `fallback` clamped to the allowed range.
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    fallback: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        // Drivers can briefly report min > max while a window is resized.
        vk::Extent2D {
            width: fallback
                .width
                .max(capabilities.min_image_extent.width)
                .min(capabilities.max_image_extent.width),
            height: fallback
                .height
                .max(capabilities.min_image_extent.height)
                .min(capabilities.max_image_extent.height),
        }
    }
}

/// Concurrent across graphics and present families only when they differ.
pub fn image_sharing(families: &QueueFamilyIndices) -> (vk::SharingMode, Vec<u32>) {
    if families.present_is_separate() {
        (
            vk::SharingMode::CONCURRENT,
            vec![families.graphics, families.present],
        )
    } else {
        (vk::SharingMode::EXCLUSIVE, Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    #[test]
    fn undefined_format_means_no_preference() {
        let chosen = select_surface_format(&[format(
            vk::Format::UNDEFINED,
            vk::ColorSpaceKHR::SRGB_NONLINEAR,
        )])
        .unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_UNORM);
        assert_eq!(chosen.color_space, vk::ColorSpaceKHR::SRGB_NONLINEAR);
    }

    #[test]
    fn preferred_format_wins_over_order() {
        let available = [
            format(vk::Format::R8G8B8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(
            select_surface_format(&available).unwrap().format,
            vk::Format::B8G8R8A8_UNORM
        );
    }

    #[test]
    fn falls_back_to_first_format() {
        let available = [
            format(vk::Format::R8G8B8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(
            select_surface_format(&available).unwrap().format,
            vk::Format::R8G8B8A8_SRGB
        );
        assert!(select_surface_format(&[]).is_err());
    }

    #[test]
    fn present_mode_prefers_mailbox() {
        assert_eq!(
            select_present_mode(&[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX]),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            select_present_mode(&[vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::FIFO]),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn image_count_is_clamped() {
        let mut caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&caps), 3);

        caps.max_image_count = 2;
        assert_eq!(choose_image_count(&caps), 2);

        caps.max_image_count = 8;
        assert_eq!(choose_image_count(&caps), 3);
    }

    #[test]
    fn extent_uses_fallback_only_when_surface_is_flexible() {
        let fixed = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            ..Default::default()
        };
        let fallback = vk::Extent2D {
            width: 4000,
            height: 10,
        };
        assert_eq!(choose_extent(&fixed, fallback).width, 800);

        let flexible = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 16,
                height: 16,
            },
            max_image_extent: vk::Extent2D {
                width: 2048,
                height: 2048,
            },
            ..Default::default()
        };
        let extent = choose_extent(&flexible, fallback);
        assert_eq!((extent.width, extent.height), (2048, 16));
    }

    #[test]
    fn inverted_extent_limits_do_not_panic() {
        let resizing = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 640,
                height: 480,
            },
            max_image_extent: vk::Extent2D {
                width: 320,
                height: 240,
            },
            ..Default::default()
        };
        let fallback = vk::Extent2D {
            width: 800,
            height: 100,
        };
        let extent = choose_extent(&resizing, fallback);
        assert_eq!((extent.width, extent.height), (320, 240));
    }

    #[test]
    fn sharing_mode_follows_family_split() {
        let shared = QueueFamilyIndices {
            graphics: 0,
            transfer: 1,
            present: 0,
        };
        assert_eq!(image_sharing(&shared), (vk::SharingMode::EXCLUSIVE, vec![]));

        let split = QueueFamilyIndices {
            graphics: 0,
            transfer: 0,
            present: 2,
        };
        assert_eq!(
            image_sharing(&split),
            (vk::SharingMode::CONCURRENT, vec![0, 2])
        );
    }
}
