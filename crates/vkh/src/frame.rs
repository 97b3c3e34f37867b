//! Per-frame synchronization and presentation.
//!
//! Each frame runs acquire, fence wait and reset, record, submit, present in
//! that order. Two semaphores order GPU work across the swapchain; one fence
//! per image slot keeps the CPU from re-recording a command buffer the GPU is
//! still executing.

use crate::command::{begin_command_buffer, end_command_buffer, CommandPool};
use crate::error::{GpuError, Result};
use crate::swapchain::Swapchain;
use crate::sync::{create_fence, create_semaphore, fence_signaled, reset_fence, wait_for_fence};
use ash::vk;

/// What the recording callback gets to work with.
#[derive(Debug, Clone, Copy)]
pub struct FrameContext {
    /// Command buffer in the recording state.
    pub command_buffer: vk::CommandBuffer,
    /// Swapchain image being rendered.
    pub image_index: u32,
    /// Frames completed before this one.
    pub frame_number: u64,
}

/// Result of a presented frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStatus {
    pub image_index: u32,
    /// The swapchain still works but no longer matches the surface exactly.
    pub suboptimal: bool,
}

/// GPU operations the frame loop is driven through.
pub trait FrameBackend {
    /// Acquire the next image, signaling `image_available` when it is ready.
    fn acquire_next_image(&mut self, image_available: vk::Semaphore) -> Result<u32>;

    fn fence_signaled(&mut self, fence: vk::Fence) -> Result<bool>;

    /// Block until `fence` signals. No timeout.
    fn wait_for_fence(&mut self, fence: vk::Fence) -> Result<()>;

    fn reset_fence(&mut self, fence: vk::Fence) -> Result<()>;

    /// Reset `cmd` and begin recording.
    fn begin_commands(&mut self, cmd: vk::CommandBuffer) -> Result<()>;

    fn end_commands(&mut self, cmd: vk::CommandBuffer) -> Result<()>;

    /// Submit on the graphics queue: wait `wait` at color-attachment output,
    /// signal `signal` and `fence` on completion.
    fn submit(
        &mut self,
        cmd: vk::CommandBuffer,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<()>;

    /// Present on the presentation queue once `wait` signals.
    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> Result<bool>;

    /// Unsignal `image_available` after a frame was abandoned between
    /// acquire and submit, and block until that completes.
    fn consume_semaphore(&mut self, image_available: vk::Semaphore) -> Result<()>;
}

/// Per-image fence and command buffer.
#[derive(Debug)]
struct FrameSlot {
    fence: vk::Fence,
    command_buffer: vk::CommandBuffer,
    /// The fence has been handed to a submission since its last reset.
    in_flight: bool,
}

/// The frame-control semaphores plus one slot per swapchain image.
pub struct FrameSync {
    image_available: vk::Semaphore,
    render_finished: vk::Semaphore,
    slots: Vec<FrameSlot>,
    frame_count: u64,
}

impl FrameSync {
    /// Create the semaphores, and one signaled fence and command buffer per image.
    ///
    /// # Safety
    /// The device must be valid and `pool` must belong to the graphics family.
    pub unsafe fn new(device: &ash::Device, pool: &CommandPool, image_count: usize) -> Result<Self> {
        let image_available = create_semaphore(device)?;
        let render_finished = create_semaphore(device)?;

        let mut sync = Self {
            image_available,
            render_finished,
            slots: Vec::new(),
            frame_count: 0,
        };
        if let Err(e) = sync.create_slots(device, pool, image_count) {
            sync.destroy(device, pool);
            return Err(e);
        }

        Ok(sync)
    }

    unsafe fn create_slots(
        &mut self,
        device: &ash::Device,
        pool: &CommandPool,
        image_count: usize,
    ) -> Result<()> {
        let command_buffers = pool.allocate_command_buffers(device, image_count as u32)?;
        for command_buffer in command_buffers {
            let fence = match create_fence(device, true) {
                Ok(fence) => fence,
                Err(e) => {
                    device.free_command_buffers(pool.handle(), &[command_buffer]);
                    return Err(e);
                }
            };
            self.slots.push(FrameSlot {
                fence,
                command_buffer,
                in_flight: false,
            });
        }
        Ok(())
    }

    unsafe fn destroy_slots(&mut self, device: &ash::Device, pool: &CommandPool) {
        for slot in self.slots.drain(..) {
            device.destroy_fence(slot.fence, None);
            device.free_command_buffers(pool.handle(), &[slot.command_buffer]);
        }
    }

    /// Replace every slot after the swapchain changed its image count.
    ///
    /// # Safety
    /// The device must be idle.
    pub unsafe fn rebuild(
        &mut self,
        device: &ash::Device,
        pool: &CommandPool,
        image_count: usize,
    ) -> Result<()> {
        self.destroy_slots(device, pool);
        self.create_slots(device, pool, image_count)
    }

    /// Number of image slots.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Frames presented so far.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Run one frame through `backend`, recording with `record`.
    ///
    /// If anything fails after the image was acquired but before it was
    /// submitted, the image-available semaphore is consumed so the next
    /// acquire can signal it again, and a fence that was reset but never
    /// resubmitted is not waited on again.
    pub fn run_frame<B, F>(&mut self, backend: &mut B, record: F) -> Result<FrameStatus>
    where
        B: FrameBackend,
        F: FnOnce(&FrameContext) -> Result<()>,
    {
        let image_index = backend.acquire_next_image(self.image_available)?;

        if let Err(e) = self.record_and_submit(backend, image_index, record) {
            if let Err(release) = backend.consume_semaphore(self.image_available) {
                tracing::error!("Failed to release image-available semaphore: {release}");
            }
            return Err(e);
        }

        let suboptimal = backend.present(image_index, self.render_finished)?;
        self.frame_count += 1;

        Ok(FrameStatus {
            image_index,
            suboptimal,
        })
    }

    fn record_and_submit<B, F>(&mut self, backend: &mut B, image_index: u32, record: F) -> Result<()>
    where
        B: FrameBackend,
        F: FnOnce(&FrameContext) -> Result<()>,
    {
        let slot_count = self.slots.len();
        let slot = self.slots.get_mut(image_index as usize).ok_or_else(|| {
            GpuError::InvalidState(format!(
                "acquired image {image_index} but only {slot_count} slots exist"
            ))
        })?;

        // Waiting on a fence nobody will signal would hang forever.
        if slot.in_flight && !backend.fence_signaled(slot.fence)? {
            backend.wait_for_fence(slot.fence)?;
        }
        backend.reset_fence(slot.fence)?;
        slot.in_flight = false;

        backend.begin_commands(slot.command_buffer)?;
        record(&FrameContext {
            command_buffer: slot.command_buffer,
            image_index,
            frame_number: self.frame_count,
        })?;
        backend.end_commands(slot.command_buffer)?;

        backend.submit(
            slot.command_buffer,
            self.image_available,
            self.render_finished,
            slot.fence,
        )?;
        slot.in_flight = true;
        Ok(())
    }

    /// Destroy the semaphores, fences and command buffers.
    ///
    /// # Safety
    /// The device must be idle.
    pub unsafe fn destroy(&mut self, device: &ash::Device, pool: &CommandPool) {
        self.destroy_slots(device, pool);
        device.destroy_semaphore(self.render_finished, None);
        device.destroy_semaphore(self.image_available, None);
    }
}

/// [`FrameBackend`] over a real device and swapchain.
pub struct VulkanFrameBackend<'a> {
    pub device: &'a ash::Device,
    pub swapchain_loader: &'a ash::khr::swapchain::Device,
    pub swapchain: &'a Swapchain,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
}

impl FrameBackend for VulkanFrameBackend<'_> {
    fn acquire_next_image(&mut self, image_available: vk::Semaphore) -> Result<u32> {
        unsafe {
            self.swapchain
                .acquire_next_image(self.swapchain_loader, image_available)
        }
    }

    fn fence_signaled(&mut self, fence: vk::Fence) -> Result<bool> {
        unsafe { fence_signaled(self.device, fence) }
    }

    fn wait_for_fence(&mut self, fence: vk::Fence) -> Result<()> {
        unsafe { wait_for_fence(self.device, fence) }
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> Result<()> {
        unsafe { reset_fence(self.device, fence) }
    }

    fn begin_commands(&mut self, cmd: vk::CommandBuffer) -> Result<()> {
        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
            begin_command_buffer(
                self.device,
                cmd,
                vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
                    | vk::CommandBufferUsageFlags::SIMULTANEOUS_USE,
            )
        }
    }

    fn end_commands(&mut self, cmd: vk::CommandBuffer) -> Result<()> {
        unsafe { end_command_buffer(self.device, cmd) }
    }

    fn submit(
        &mut self,
        cmd: vk::CommandBuffer,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<()> {
        let wait_semaphores = [wait];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [signal];
        let command_buffers = [cmd];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device
                .queue_submit(self.graphics_queue, &[submit_info], fence)?;
        }
        Ok(())
    }

    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> Result<bool> {
        unsafe {
            self.swapchain
                .present(self.swapchain_loader, self.present_queue, image_index, wait)
        }
    }

    fn consume_semaphore(&mut self, image_available: vk::Semaphore) -> Result<()> {
        let wait_semaphores = [image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages);

        unsafe {
            self.device
                .queue_submit(self.graphics_queue, &[submit_info], vk::Fence::null())?;
            self.device.queue_wait_idle(self.graphics_queue)?;
        }
        Ok(())
    }
}

#[cfg(test)]
impl FrameSync {
    fn with_handles(
        image_available: vk::Semaphore,
        render_finished: vk::Semaphore,
        slots: Vec<(vk::Fence, vk::CommandBuffer)>,
    ) -> Self {
        Self {
            image_available,
            render_finished,
            slots: slots
                .into_iter()
                .map(|(fence, command_buffer)| FrameSlot {
                    fence,
                    command_buffer,
                    in_flight: false,
                })
                .collect(),
            frame_count: 0,
        }
    }
}
