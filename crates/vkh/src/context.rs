//! Device context bootstrap and teardown.

use crate::capabilities::{select_best, DeviceCapabilities};
use crate::command::{CommandPool, CommandPools, ScratchCommandBuffer};
use crate::descriptors::{DescriptorPool, DescriptorPoolSizing};
use crate::error::{GpuError, Result};
use crate::frame::{FrameContext, FrameStatus, FrameSync, VulkanFrameBackend};
use crate::instance::{create_instance, DebugMessenger};
use crate::memory::{Allocation, AllocationCreateInfo, AllocatorTarget, DeviceAllocator, PassthroughAllocator};
use crate::queue::{resolve_queue_families, QueueFamilyIndices, QueueRole};
use crate::surface::Surface;
use crate::swapchain::Swapchain;
use ash::vk;
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

/// Everything needed to create resources and drive frames on one device.
///
/// Built once by [`DeviceContextBuilder`] and torn down on drop in reverse
/// creation order.
pub struct DeviceContext {
    // Entry must be kept alive for the lifetime of the context
    #[allow(dead_code)]
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) debug_messenger: Option<DebugMessenger>,
    pub(crate) surface: Surface,

    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) properties: vk::PhysicalDeviceProperties,
    pub(crate) features: vk::PhysicalDeviceFeatures,
    pub(crate) memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub(crate) capabilities: DeviceCapabilities,
    pub(crate) queue_families: QueueFamilyIndices,

    pub(crate) device: ash::Device,
    pub(crate) graphics_queue: vk::Queue,
    pub(crate) transfer_queue: vk::Queue,
    pub(crate) present_queue: vk::Queue,

    pub(crate) allocator: Mutex<Box<dyn DeviceAllocator>>,

    pub(crate) swapchain_loader: ash::khr::swapchain::Device,
    pub(crate) swapchain: Swapchain,
    pub(crate) fallback_extent: vk::Extent2D,

    pub(crate) command_pools: CommandPools,
    pub(crate) descriptor_pool: DescriptorPool,
    pub(crate) frames: Mutex<FrameSync>,
}

impl DeviceContext {
    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    pub fn features(&self) -> &vk::PhysicalDeviceFeatures {
        &self.features
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    /// Get the capabilities the device was selected on.
    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    pub fn queue_families(&self) -> &QueueFamilyIndices {
        &self.queue_families
    }

    /// Queue serving `role`.
    pub fn queue(&self, role: QueueRole) -> vk::Queue {
        match role {
            QueueRole::Graphics => self.graphics_queue,
            QueueRole::Transfer => self.transfer_queue,
            QueueRole::Present => self.present_queue,
        }
    }

    /// Command pool serving `role`.
    pub fn command_pool(&self, role: QueueRole) -> &CommandPool {
        self.command_pools.get(role)
    }

    pub fn surface(&self) -> &Surface {
        &self.surface
    }

    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }

    pub fn swapchain_loader(&self) -> &ash::khr::swapchain::Device {
        &self.swapchain_loader
    }

    pub fn swapchain_extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    pub fn swapchain_format(&self) -> vk::Format {
        self.swapchain.format
    }

    /// Pool sized from the builder's sizing table.
    pub fn descriptor_pool(&self) -> &DescriptorPool {
        &self.descriptor_pool
    }

    /// Whether validation messages are being routed to `tracing`.
    pub fn validation_enabled(&self) -> bool {
        self.debug_messenger.is_some()
    }

    /// Get access to the active allocation strategy.
    pub fn allocator(&self) -> &Mutex<Box<dyn DeviceAllocator>> {
        &self.allocator
    }

    /// Allocate through the active strategy.
    pub fn allocate(&self, info: &AllocationCreateInfo<'_>) -> Result<Allocation> {
        self.allocator.lock().alloc(info)
    }

    /// Return an allocation to the strategy that produced it.
    pub fn free_allocation(&self, allocation: Allocation) -> Result<()> {
        self.allocator.lock().free(allocation)
    }

    /// Live allocations in the active strategy.
    pub fn num_allocs(&self) -> usize {
        self.allocator.lock().num_allocs()
    }

    /// Run `f` with the active allocator locked.
    pub(crate) fn with_allocator<T>(&self, f: impl FnOnce(&mut dyn DeviceAllocator) -> Result<T>) -> Result<T> {
        let mut allocator = self.allocator.lock();
        f(&mut **allocator)
    }

    /// Bytes allocated from one memory type.
    pub fn allocated_size(&self, memory_type: u32) -> vk::DeviceSize {
        self.allocator.lock().allocated_size(memory_type)
    }

    /// Begin a one-shot command buffer on the queue serving `role`.
    pub fn begin_scratch(&self, role: QueueRole) -> Result<ScratchCommandBuffer<'_>> {
        // SAFETY: the pool and queue are both taken from the same role.
        unsafe {
            ScratchCommandBuffer::begin(
                &self.device,
                self.command_pools.get(role).handle(),
                self.queue(role),
                role,
            )
        }
    }

    /// Record `f` into a scratch buffer, submit it, and block until done.
    pub fn execute_scratch<F>(&self, role: QueueRole, f: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let scratch = self.begin_scratch(role)?;
        f(&self.device, scratch.handle());
        scratch.submit()
    }

    /// Frames presented so far.
    pub fn frame_count(&self) -> u64 {
        self.frames.lock().frame_count()
    }

    /// Acquire, record with `record`, submit and present one frame.
    ///
    /// Returns [`GpuError::SwapchainOutOfDate`] when the swapchain must be
    /// recreated with [`Self::recreate_swapchain`]. `record` must not call
    /// back into [`Self::draw_frame`] or [`Self::frame_count`].
    pub fn draw_frame<F>(&self, record: F) -> Result<FrameStatus>
    where
        F: FnOnce(&FrameContext) -> Result<()>,
    {
        let mut backend = VulkanFrameBackend {
            device: &self.device,
            swapchain_loader: &self.swapchain_loader,
            swapchain: &self.swapchain,
            graphics_queue: self.graphics_queue,
            present_queue: self.present_queue,
        };
        self.frames.lock().run_frame(&mut backend, record)
    }

    /// Wait for device to be idle.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }

    /// Rebuild the swapchain, its views, and the per-image frame slots.
    ///
    /// `width`/`height` are used only when the surface has no fixed extent.
    pub fn recreate_swapchain(&mut self, width: u32, height: u32) -> Result<()> {
        self.wait_idle()?;
        self.fallback_extent = vk::Extent2D { width, height };

        unsafe {
            let support = self.surface.support(self.physical_device)?;
            let swapchain = Swapchain::new(
                &self.device,
                &self.swapchain_loader,
                &self.surface,
                &support,
                &self.queue_families,
                self.fallback_extent,
                self.swapchain.swapchain,
            )?;

            let old = std::mem::replace(&mut self.swapchain, swapchain);
            old.destroy(&self.device, &self.swapchain_loader);

            self.frames.get_mut().rebuild(
                &self.device,
                self.command_pools.get(QueueRole::Graphics),
                self.swapchain.image_count(),
            )?;
        }

        Ok(())
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            self.frames
                .get_mut()
                .destroy(&self.device, self.command_pools.get(QueueRole::Graphics));
            self.descriptor_pool.destroy(&self.device);
            self.command_pools.destroy(&self.device);
            self.swapchain.destroy(&self.device, &self.swapchain_loader);

            // Allocator releases its memory before the device goes away
            self.allocator.get_mut().shutdown();

            self.device.destroy_device(None);
            self.surface.destroy();
            if let Some(messenger) = &self.debug_messenger {
                messenger.destroy();
            }
            self.instance.destroy_instance(None);
        }
        tracing::debug!("Device context destroyed");
    }
}

/// Builder for creating a device context.
pub struct DeviceContextBuilder {
    app_name: String,
    enable_validation: bool,
    fallback_extent: vk::Extent2D,
    descriptor_sizing: DescriptorPoolSizing,
    allocator: Option<Box<dyn DeviceAllocator>>,
}

impl Default for DeviceContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "vkh".to_string(),
            enable_validation: cfg!(debug_assertions),
            fallback_extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
            descriptor_sizing: DescriptorPoolSizing::new()
                .with(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 16)
                .with(vk::DescriptorType::UNIFORM_BUFFER, 16),
            allocator: None,
        }
    }
}

impl DeviceContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers. When enabled, a missing
    /// validation layer fails [`Self::build`].
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Swapchain size used when the surface does not dictate one.
    pub fn extent(mut self, width: u32, height: u32) -> Self {
        self.fallback_extent = vk::Extent2D { width, height };
        self
    }

    /// Size the context's descriptor pool.
    pub fn descriptor_pool(mut self, sizing: DescriptorPoolSizing) -> Self {
        self.descriptor_sizing = sizing;
        self
    }

    /// Choose the allocation strategy. Defaults to [`PassthroughAllocator`].
    pub fn allocator(mut self, allocator: impl DeviceAllocator + 'static) -> Self {
        self.allocator = Some(Box::new(allocator));
        self
    }

    /// Build the device context for `window`.
    ///
    /// Steps run in a fixed order and the first failure is returned, naming
    /// the step. Nothing is retried.
    pub fn build<W>(self, window: &W) -> Result<DeviceContext>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?
            .as_raw();

        // Load Vulkan entry point
        let entry = unsafe { ash::Entry::load() }.map_err(|e| GpuError::Loading(e.to_string()))?;

        // 1. Instance and validation reporting
        let bundle =
            unsafe { create_instance(&entry, &self.app_name, display, self.enable_validation)? };
        let instance = bundle.instance;
        let debug_messenger = if bundle.validation {
            Some(unsafe { DebugMessenger::new(&entry, &instance)? })
        } else {
            None
        };
        tracing::debug!("Instance created");

        // 2. Surface
        let surface = unsafe { Surface::from_window(&entry, &instance, window)? };
        tracing::debug!("Surface created");

        // 3. Physical device
        let physical_device = unsafe { select_physical_device(&instance, &surface)? };
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let features = unsafe { instance.get_physical_device_features(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let capabilities = unsafe {
            DeviceCapabilities::query(&instance, surface.loader(), physical_device, surface.handle())
        };
        tracing::info!("Selected GPU: {}", capabilities.summary());

        // 4. Queue families
        let queue_families = unsafe { find_queue_families(&instance, &surface, physical_device)? };
        tracing::debug!("Queue families: {queue_families:?}");

        // 5. Logical device
        let device = unsafe {
            create_device(&instance, physical_device, &queue_families, &capabilities)?
        };
        let graphics_queue = unsafe { device.get_device_queue(queue_families.graphics, 0) };
        let transfer_queue = unsafe { device.get_device_queue(queue_families.transfer, 0) };
        let present_queue = unsafe { device.get_device_queue(queue_families.present, 0) };

        // 6. Allocator
        let mut allocator: Box<dyn DeviceAllocator> = match self.allocator {
            Some(allocator) => allocator,
            None => Box::new(PassthroughAllocator::new()),
        };
        allocator.activate(&AllocatorTarget {
            instance: &instance,
            device: &device,
            physical_device,
            memory_properties,
        })?;
        tracing::debug!("Activated {} allocator", allocator.name());

        // 7. Swapchain
        let swapchain_loader = ash::khr::swapchain::Device::new(&instance, &device);
        let support = unsafe { surface.support(physical_device)? };
        let swapchain = unsafe {
            Swapchain::new(
                &device,
                &swapchain_loader,
                &surface,
                &support,
                &queue_families,
                self.fallback_extent,
                vk::SwapchainKHR::null(),
            )?
        };

        // 8. Command pools
        let command_pools = unsafe { CommandPools::new(&device, &queue_families)? };

        // 9. Descriptor pool
        let descriptor_pool = unsafe { DescriptorPool::new(&device, &self.descriptor_sizing)? };
        tracing::debug!(
            "Descriptor pool: {} sets across {} types",
            descriptor_pool.max_sets(),
            self.descriptor_sizing.entries().len()
        );

        // 10. Frame semaphores and per-image fences
        let frames = unsafe {
            FrameSync::new(
                &device,
                command_pools.get(QueueRole::Graphics),
                swapchain.image_count(),
            )?
        };

        Ok(DeviceContext {
            entry,
            instance,
            debug_messenger,
            surface,
            physical_device,
            properties,
            features,
            memory_properties,
            capabilities,
            queue_families,
            device,
            graphics_queue,
            transfer_queue,
            present_queue,
            allocator: Mutex::new(allocator),
            swapchain_loader,
            swapchain,
            fallback_extent: self.fallback_extent,
            command_pools,
            descriptor_pool,
            frames: Mutex::new(frames),
        })
    }
}

/// Pick the highest-scoring qualifying device.
///
/// # Safety
/// The instance and surface must be valid.
unsafe fn select_physical_device(
    instance: &ash::Instance,
    surface: &Surface,
) -> Result<vk::PhysicalDevice> {
    let devices = instance
        .enumerate_physical_devices()
        .map_err(GpuError::step("enumerate physical devices"))?;

    let candidates: Vec<DeviceCapabilities> = devices
        .iter()
        .map(|&device| DeviceCapabilities::query(instance, surface.loader(), device, surface.handle()))
        .collect();

    for caps in &candidates {
        match caps.disqualification() {
            Some(reason) => tracing::debug!("Skipping {}: {reason:?}", caps.device_name),
            None => tracing::debug!("Candidate {} scored {}", caps.device_name, caps.score()),
        }
    }

    select_best(&candidates)
        .map(|i| devices[i])
        .ok_or(GpuError::NoSuitableDevice)
}

/// Resolve graphics, transfer and present families.
///
/// # Safety
/// The instance, surface and physical device must be valid.
unsafe fn find_queue_families(
    instance: &ash::Instance,
    surface: &Surface,
    physical_device: vk::PhysicalDevice,
) -> Result<QueueFamilyIndices> {
    let families = instance.get_physical_device_queue_family_properties(physical_device);

    let mut present_support = Vec::with_capacity(families.len());
    for index in 0..families.len() as u32 {
        present_support.push(surface.supports_present(physical_device, index)?);
    }

    resolve_queue_families(&families, &present_support)
}

/// Create the logical device with one queue per unique family.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_families: &QueueFamilyIndices,
    capabilities: &DeviceCapabilities,
) -> Result<ash::Device> {
    let queue_priority = 1.0_f32;
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = queue_families
        .unique()
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(std::slice::from_ref(&queue_priority))
        })
        .collect();

    let extension_names = [ash::khr::swapchain::NAME.as_ptr()];

    if !capabilities.sampler_anisotropy {
        tracing::warn!("{} lacks anisotropic filtering", capabilities.device_name);
    }
    let features = vk::PhysicalDeviceFeatures::default()
        .sampler_anisotropy(capabilities.sampler_anisotropy)
        .shader_sampled_image_array_dynamic_indexing(true);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .enabled_features(&features);

    instance
        .create_device(physical_device, &device_create_info, None)
        .map_err(GpuError::step("create logical device"))
}
