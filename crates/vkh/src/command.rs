//! Command pools and the scratch command protocol.
//!
//! A scratch buffer moves through Recording (begin, one-time-submit) to
//! Submitted (end, submit, wait for the queue to drain) to Reclaimed (freed
//! back to its pool). Every submission blocks the calling thread.

use crate::error::{GpuError, Result};
use crate::queue::{QueueFamilyIndices, QueueRole};
use ash::vk;

/// Command pool for allocating command buffers.
pub struct CommandPool {
    pool: vk::CommandPool,
    queue_family: u32,
}

impl CommandPool {
    /// Create a pool whose buffers can be reset individually.
    ///
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub unsafe fn new(device: &ash::Device, queue_family: u32) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let pool = device
            .create_command_pool(&create_info, None)
            .map_err(GpuError::step("create command pool"))?;

        Ok(Self { pool, queue_family })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Get the queue family index.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Allocate primary command buffers.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate_command_buffers(
        &self,
        device: &ash::Device,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        let buffers = device.allocate_command_buffers(&alloc_info)?;
        Ok(buffers)
    }

    /// Destroy the command pool.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_command_pool(self.pool, None);
    }
}

/// One pool per queue role, created even when roles share a family.
pub struct CommandPools {
    graphics: CommandPool,
    transfer: CommandPool,
    present: CommandPool,
}

impl CommandPools {
    /// # Safety
    /// The device must be valid and the families must exist.
    pub unsafe fn new(device: &ash::Device, families: &QueueFamilyIndices) -> Result<Self> {
        let graphics = CommandPool::new(device, families.graphics)?;
        let transfer = match CommandPool::new(device, families.transfer) {
            Ok(pool) => pool,
            Err(e) => {
                graphics.destroy(device);
                return Err(e);
            }
        };
        let present = match CommandPool::new(device, families.present) {
            Ok(pool) => pool,
            Err(e) => {
                transfer.destroy(device);
                graphics.destroy(device);
                return Err(e);
            }
        };

        Ok(Self {
            graphics,
            transfer,
            present,
        })
    }

    pub fn get(&self, role: QueueRole) -> &CommandPool {
        match role {
            QueueRole::Graphics => &self.graphics,
            QueueRole::Transfer => &self.transfer,
            QueueRole::Present => &self.present,
        }
    }

    /// # Safety
    /// The device must be valid and no buffer from these pools may be pending.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        self.present.destroy(device);
        self.transfer.destroy(device);
        self.graphics.destroy(device);
    }
}

/// Begin recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn begin_command_buffer(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    flags: vk::CommandBufferUsageFlags,
) -> Result<()> {
    let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
    device.begin_command_buffer(cmd, &begin_info)?;
    Ok(())
}

/// End recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn end_command_buffer(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    device.end_command_buffer(cmd)?;
    Ok(())
}

/// Device calls the scratch protocol is built on.
pub trait ScratchBackend {
    /// # Safety
    /// `pool` must be a valid command pool.
    unsafe fn allocate_scratch(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer>;

    /// Begin recording with the one-time-submit flag.
    ///
    /// # Safety
    /// `cmd` must be in the initial state.
    unsafe fn begin_scratch(&self, cmd: vk::CommandBuffer) -> Result<()>;

    /// End recording, submit to `queue` and block until the queue drains.
    ///
    /// # Safety
    /// `cmd` must be recording and `queue` must match its pool's family.
    unsafe fn submit_and_wait(&self, queue: vk::Queue, cmd: vk::CommandBuffer) -> Result<()>;

    /// # Safety
    /// `cmd` must have come from `pool` and must not be pending.
    unsafe fn free_scratch(&self, pool: vk::CommandPool, cmd: vk::CommandBuffer);
}

impl ScratchBackend for ash::Device {
    unsafe fn allocate_scratch(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        self.allocate_command_buffers(&alloc_info)?
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::InvalidState("driver returned no command buffer".into()))
    }

    unsafe fn begin_scratch(&self, cmd: vk::CommandBuffer) -> Result<()> {
        begin_command_buffer(self, cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
    }

    unsafe fn submit_and_wait(&self, queue: vk::Queue, cmd: vk::CommandBuffer) -> Result<()> {
        end_command_buffer(self, cmd)?;

        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
        self.queue_submit(queue, &[submit_info], vk::Fence::null())?;
        self.queue_wait_idle(queue)?;
        Ok(())
    }

    unsafe fn free_scratch(&self, pool: vk::CommandPool, cmd: vk::CommandBuffer) {
        self.free_command_buffers(pool, &[cmd]);
    }
}

/// A one-shot command buffer in the Recording state.
///
/// Carries its pool and queue so [`Self::submit`] routes to the right queue.
/// Dropping it without submitting frees the buffer unsubmitted.
pub struct ScratchCommandBuffer<'a, B: ScratchBackend + ?Sized = ash::Device> {
    backend: &'a B,
    pool: vk::CommandPool,
    queue: vk::Queue,
    role: QueueRole,
    cmd: vk::CommandBuffer,
    reclaimed: bool,
}

impl<'a, B: ScratchBackend + ?Sized> ScratchCommandBuffer<'a, B> {
    /// Allocate a buffer from `pool` and begin recording.
    ///
    /// # Safety
    /// `queue` must belong to the family `pool` was created for.
    pub unsafe fn begin(
        backend: &'a B,
        pool: vk::CommandPool,
        queue: vk::Queue,
        role: QueueRole,
    ) -> Result<Self> {
        let cmd = backend.allocate_scratch(pool)?;

        // Reclaimed on drop if beginning fails.
        let scratch = Self {
            backend,
            pool,
            queue,
            role,
            cmd,
            reclaimed: false,
        };
        backend.begin_scratch(cmd)?;

        Ok(scratch)
    }

    /// Command buffer to record into.
    pub fn handle(&self) -> vk::CommandBuffer {
        self.cmd
    }

    pub fn role(&self) -> QueueRole {
        self.role
    }

    /// Queue the buffer will be submitted to.
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    /// End recording, submit, wait for the queue to drain, then free.
    pub fn submit(mut self) -> Result<()> {
        let result = unsafe { self.backend.submit_and_wait(self.queue, self.cmd) };
        self.reclaim();
        result
    }

    fn reclaim(&mut self) {
        if !self.reclaimed {
            unsafe { self.backend.free_scratch(self.pool, self.cmd) };
            self.reclaimed = true;
        }
    }
}

impl<B: ScratchBackend + ?Sized> Drop for ScratchCommandBuffer<'_, B> {
    fn drop(&mut self) {
        self.reclaim();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::cell::{Cell, RefCell};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Event {
        Allocate(u64),
        Begin(u64),
        Submit { queue: u64, cmd: u64 },
        Free { pool: u64, cmd: u64 },
    }

    #[derive(Default)]
    struct FakeDevice {
        next: Cell<u64>,
        fail_begin: Cell<bool>,
        fail_submit: Cell<bool>,
        log: RefCell<Vec<Event>>,
    }

    impl FakeDevice {
        fn events(&self) -> Vec<Event> {
            self.log.borrow().clone()
        }
    }

    impl ScratchBackend for FakeDevice {
        unsafe fn allocate_scratch(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
            self.next.set(self.next.get() + 1);
            let cmd = pool.as_raw() * 100 + self.next.get();
            self.log.borrow_mut().push(Event::Allocate(cmd));
            Ok(vk::CommandBuffer::from_raw(cmd))
        }

        unsafe fn begin_scratch(&self, cmd: vk::CommandBuffer) -> Result<()> {
            if self.fail_begin.get() {
                return Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY));
            }
            self.log.borrow_mut().push(Event::Begin(cmd.as_raw()));
            Ok(())
        }

        unsafe fn submit_and_wait(&self, queue: vk::Queue, cmd: vk::CommandBuffer) -> Result<()> {
            if self.fail_submit.get() {
                return Err(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST));
            }
            self.log.borrow_mut().push(Event::Submit {
                queue: queue.as_raw(),
                cmd: cmd.as_raw(),
            });
            Ok(())
        }

        unsafe fn free_scratch(&self, pool: vk::CommandPool, cmd: vk::CommandBuffer) {
            self.log.borrow_mut().push(Event::Free {
                pool: pool.as_raw(),
                cmd: cmd.as_raw(),
            });
        }
    }

    fn begin(device: &FakeDevice, pool: u64, queue: u64, role: QueueRole) -> Result<ScratchCommandBuffer<'_, FakeDevice>> {
        unsafe {
            ScratchCommandBuffer::begin(
                device,
                vk::CommandPool::from_raw(pool),
                vk::Queue::from_raw(queue),
                role,
            )
        }
    }

    #[test]
    fn submit_records_then_reclaims() {
        let device = FakeDevice::default();
        let scratch = begin(&device, 1, 10, QueueRole::Transfer).unwrap();
        let cmd = scratch.handle().as_raw();
        assert_eq!(scratch.role(), QueueRole::Transfer);

        scratch.submit().unwrap();

        assert_eq!(
            device.events(),
            vec![
                Event::Allocate(cmd),
                Event::Begin(cmd),
                Event::Submit { queue: 10, cmd },
                Event::Free { pool: 1, cmd },
            ]
        );
    }

    #[test]
    fn each_buffer_submits_to_its_own_queue() {
        let device = FakeDevice::default();
        let graphics = begin(&device, 1, 10, QueueRole::Graphics).unwrap();
        let transfer = begin(&device, 2, 20, QueueRole::Transfer).unwrap();
        let (g, t) = (graphics.handle().as_raw(), transfer.handle().as_raw());

        transfer.submit().unwrap();
        graphics.submit().unwrap();

        let events = device.events();
        assert!(events.contains(&Event::Submit { queue: 20, cmd: t }));
        assert!(events.contains(&Event::Submit { queue: 10, cmd: g }));
        assert!(events.contains(&Event::Free { pool: 2, cmd: t }));
        assert!(events.contains(&Event::Free { pool: 1, cmd: g }));
    }

    #[test]
    fn dropping_unsubmitted_buffer_reclaims_it() {
        let device = FakeDevice::default();
        let scratch = begin(&device, 3, 30, QueueRole::Graphics).unwrap();
        let cmd = scratch.handle().as_raw();
        drop(scratch);

        assert_eq!(
            device.events(),
            vec![Event::Allocate(cmd), Event::Begin(cmd), Event::Free { pool: 3, cmd }]
        );
    }

    #[test]
    fn failed_submit_reclaims_once() {
        let device = FakeDevice::default();
        device.fail_submit.set(true);
        let scratch = begin(&device, 1, 10, QueueRole::Transfer).unwrap();
        let cmd = scratch.handle().as_raw();

        let err = scratch.submit().unwrap_err();
        assert!(matches!(err, GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST)));

        let frees = device
            .events()
            .into_iter()
            .filter(|e| *e == Event::Free { pool: 1, cmd })
            .count();
        assert_eq!(frees, 1);
    }

    #[test]
    fn failed_begin_reclaims_the_allocation() {
        let device = FakeDevice::default();
        device.fail_begin.set(true);
        assert!(begin(&device, 4, 40, QueueRole::Present).is_err());

        let events = device.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Event::Allocate(_)));
        assert!(matches!(events[1], Event::Free { pool: 4, .. }));
    }

    #[test]
    fn pools_are_looked_up_by_role() {
        let pool = |raw, family| CommandPool {
            pool: vk::CommandPool::from_raw(raw),
            queue_family: family,
        };
        let pools = CommandPools {
            graphics: pool(1, 0),
            transfer: pool(2, 1),
            present: pool(3, 0),
        };

        assert_eq!(pools.get(QueueRole::Graphics).handle().as_raw(), 1);
        assert_eq!(pools.get(QueueRole::Transfer).handle().as_raw(), 2);
        assert_eq!(pools.get(QueueRole::Transfer).queue_family(), 1);
        assert_eq!(pools.get(QueueRole::Present).handle().as_raw(), 3);
    }
}
