//! Synchronization primitives.

use crate::error::{GpuError, Result};
use ash::vk;

/// Create a semaphore.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let create_info = vk::SemaphoreCreateInfo::default();
    let semaphore = device
        .create_semaphore(&create_info, None)
        .map_err(GpuError::step("create semaphore"))?;
    Ok(semaphore)
}

/// Create a fence.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };

    let create_info = vk::FenceCreateInfo::default().flags(flags);
    let fence = device
        .create_fence(&create_info, None)
        .map_err(GpuError::step("create fence"))?;
    Ok(fence)
}

/// Whether a fence is already signaled, without blocking.
///
/// # Safety
/// The device and fence must be valid.
pub unsafe fn fence_signaled(device: &ash::Device, fence: vk::Fence) -> Result<bool> {
    Ok(device.get_fence_status(fence)?)
}

/// Block until a fence is signaled. No timeout.
///
/// # Safety
/// The device and fence must be valid, and the fence must have been submitted
/// or created signaled.
pub unsafe fn wait_for_fence(device: &ash::Device, fence: vk::Fence) -> Result<()> {
    device.wait_for_fences(&[fence], true, u64::MAX)?;
    Ok(())
}

/// Reset a fence to unsignaled state.
///
/// # Safety
/// The device and fence must be valid.
pub unsafe fn reset_fence(device: &ash::Device, fence: vk::Fence) -> Result<()> {
    device.reset_fences(&[fence])?;
    Ok(())
}
