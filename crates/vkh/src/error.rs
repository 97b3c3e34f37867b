//! GPU error types.

use crate::queue::QueueRole;
use ash::vk;
use thiserror::Error;

/// Errors produced while bootstrapping the device or driving GPU work.
///
/// Every variant names the step that failed. None of them are retried inside
/// this crate; callers decide whether to recreate state or terminate.
#[derive(Error, Debug)]
pub enum GpuError {
    /// The Vulkan loader could not be found or loaded.
    #[error("Failed to load Vulkan: {0}")]
    Loading(String),

    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// A Vulkan call failed during a named setup step.
    #[error("{step} failed: {result}")]
    Step {
        step: &'static str,
        result: vk::Result,
    },

    /// Required instance extension or layer not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// No physical device passed qualification.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// A queue role has no matching family on the selected device.
    #[error("No queue family supports the {0} role")]
    QueueFamilyUnresolved(QueueRole),

    /// No memory type matches the requirement mask and property flags.
    #[error("No memory type in mask {type_bits:#b} has properties {required:?}")]
    NoMatchingMemoryType {
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    },

    /// Layout transition outside the supported table.
    #[error("Unsupported image layout transition {old:?} -> {new:?}")]
    UnsupportedLayoutTransition {
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },

    /// Shader binary whose length is not a whole number of SPIR-V words.
    #[error("Shader binary length {len} is not a multiple of 4")]
    InvalidShaderBinary { len: usize },

    /// The allocator was used before `activate`, or activated twice.
    #[error("Allocator not active: {0}")]
    AllocatorNotActive(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// The swapchain no longer matches the surface and must be recreated.
    #[error("Swapchain is out of date")]
    SwapchainOutOfDate,

    /// Image bytes could not be decoded.
    #[error("Image decode failed: {0}")]
    ImageDecode(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl GpuError {
    /// Attach a step name to a raw Vulkan result.
    pub fn step(step: &'static str) -> impl FnOnce(vk::Result) -> Self {
        move |result| Self::Step { step, result }
    }

    /// Whether the swapchain must be recreated before the next frame.
    pub fn is_out_of_date(&self) -> bool {
        matches!(
            self,
            Self::SwapchainOutOfDate
                | Self::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR)
                | Self::Step {
                    result: vk::Result::ERROR_OUT_OF_DATE_KHR,
                    ..
                }
        )
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
