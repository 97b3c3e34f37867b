//! Device memory allocation strategies.
//!
//! Call sites depend only on [`DeviceAllocator`]. The context owns exactly one
//! strategy, chosen before the device is built:
//! - [`PassthroughAllocator`] makes one `vkAllocateMemory` call per request
//! - [`PoolingAllocator`](crate::pooling::PoolingAllocator) sub-allocates
//!   from larger blocks through `gpu-allocator`

use crate::error::{GpuError, Result};
use ash::vk;
use std::collections::HashMap;

/// Index of the first memory type allowed by `type_bits` whose property flags
/// contain every flag in `required`.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Result<u32> {
    memory_properties
        .memory_types
        .iter()
        .take(memory_properties.memory_type_count as usize)
        .enumerate()
        .find(|(i, memory_type)| {
            type_bits & (1 << i) != 0 && memory_type.property_flags.contains(required)
        })
        .map(|(i, _)| i as u32)
        .ok_or(GpuError::NoMatchingMemoryType {
            type_bits,
            required,
        })
}

/// A block of device memory handed out by an allocator.
///
/// Not `Clone`: returning it to the allocator consumes it, so a block cannot
/// be freed twice through safe code.
#[derive(Debug, PartialEq, Eq)]
pub struct Allocation {
    id: u64,
    memory: vk::DeviceMemory,
    offset: vk::DeviceSize,
    size: vk::DeviceSize,
    memory_type: u32,
}

impl Allocation {
    /// Assemble an allocation. Intended for [`DeviceAllocator`] implementations.
    pub fn new(
        id: u64,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        memory_type: u32,
    ) -> Self {
        Self {
            id,
            memory,
            offset,
            size,
            memory_type,
        }
    }

    /// Allocator-assigned identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Backing memory object.
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// Byte offset of this block inside [`Self::memory`].
    pub fn offset(&self) -> vk::DeviceSize {
        self.offset
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn memory_type(&self) -> u32 {
        self.memory_type
    }
}

/// Parameters for a single allocation request.
#[derive(Debug, Clone, Copy)]
pub struct AllocationCreateInfo<'a> {
    /// Debug label, surfaced in allocator logs.
    pub label: &'a str,
    /// Size, alignment and allowed memory types of the resource.
    pub requirements: vk::MemoryRequirements,
    /// Flags the chosen memory type must contain.
    pub properties: vk::MemoryPropertyFlags,
    /// Linear resources (buffers, linear images) vs optimal-tiling images.
    pub linear: bool,
}

/// Handles an allocator needs to bind itself to a device.
pub struct AllocatorTarget<'a> {
    pub instance: &'a ash::Instance,
    pub device: &'a ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
}

/// Allocation strategy capability set.
///
/// `activate` is called exactly once, before any `alloc`. The strategy is
/// only touched from the thread driving the context.
pub trait DeviceAllocator: Send {
    /// Short strategy name for logs.
    fn name(&self) -> &'static str;

    /// Bind the strategy to a device.
    fn activate(&mut self, target: &AllocatorTarget<'_>) -> Result<()>;

    /// Allocate memory satisfying `info`.
    fn alloc(&mut self, info: &AllocationCreateInfo<'_>) -> Result<Allocation>;

    /// Return an allocation to the strategy.
    fn free(&mut self, allocation: Allocation) -> Result<()>;

    /// Bytes currently allocated from the given memory type.
    fn allocated_size(&self, memory_type: u32) -> vk::DeviceSize;

    /// Number of live allocations.
    fn num_allocs(&self) -> usize;

    /// Host pointer to the start of a host-visible allocation.
    fn map(&mut self, allocation: &Allocation) -> Result<*mut u8>;

    /// Release a mapping obtained from [`Self::map`].
    fn unmap(&mut self, allocation: &Allocation);

    /// Release everything still held. Must run before the device is destroyed.
    fn shutdown(&mut self);
}

/// Raw memory operations the passthrough strategy is built on.
pub trait MemoryBackend: Send {
    /// # Safety
    /// `memory_type` must be a valid index for the device.
    unsafe fn allocate(&self, size: vk::DeviceSize, memory_type: u32)
        -> Result<vk::DeviceMemory>;

    /// # Safety
    /// `memory` must come from [`Self::allocate`] and not be in use.
    unsafe fn free(&self, memory: vk::DeviceMemory);

    /// # Safety
    /// `memory` must be host-visible and not already mapped.
    unsafe fn map(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<*mut u8>;

    /// # Safety
    /// `memory` must currently be mapped.
    unsafe fn unmap(&self, memory: vk::DeviceMemory);
}

impl MemoryBackend for ash::Device {
    unsafe fn allocate(
        &self,
        size: vk::DeviceSize,
        memory_type: u32,
    ) -> Result<vk::DeviceMemory> {
        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type);

        self.allocate_memory(&alloc_info, None)
            .map_err(|e| GpuError::AllocationFailed(format!("{size} bytes of type {memory_type}: {e}")))
    }

    unsafe fn free(&self, memory: vk::DeviceMemory) {
        self.free_memory(memory, None);
    }

    unsafe fn map(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<*mut u8> {
        let ptr = self.map_memory(memory, offset, size, vk::MemoryMapFlags::empty())?;
        Ok(ptr.cast())
    }

    unsafe fn unmap(&self, memory: vk::DeviceMemory) {
        self.unmap_memory(memory);
    }
}

/// Bookkeeping shared by strategies: live blocks and bytes per memory type.
#[derive(Debug, Default)]
pub(crate) struct AllocationLedger {
    next_id: u64,
    live: HashMap<u64, (u32, vk::DeviceSize)>,
    bytes_per_type: [vk::DeviceSize; vk::MAX_MEMORY_TYPES],
}

impl AllocationLedger {
    pub(crate) fn record(&mut self, memory_type: u32, size: vk::DeviceSize) -> u64 {
        self.next_id += 1;
        self.live.insert(self.next_id, (memory_type, size));
        self.bytes_per_type[memory_type as usize] += size;
        self.next_id
    }

    pub(crate) fn release(&mut self, id: u64) -> Result<()> {
        let (memory_type, size) = self
            .live
            .remove(&id)
            .ok_or_else(|| GpuError::InvalidState(format!("allocation {id} is not live")))?;
        self.bytes_per_type[memory_type as usize] -= size;
        Ok(())
    }

    pub(crate) fn bytes(&self, memory_type: u32) -> vk::DeviceSize {
        self.bytes_per_type
            .get(memory_type as usize)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn count(&self) -> usize {
        self.live.len()
    }
}

/// One dedicated memory object per request.
pub struct PassthroughAllocator {
    backend: Option<Box<dyn MemoryBackend>>,
    memory_properties: Option<vk::PhysicalDeviceMemoryProperties>,
    blocks: HashMap<u64, vk::DeviceMemory>,
    ledger: AllocationLedger,
}

impl PassthroughAllocator {
    /// Allocator that binds to the context's device on activation.
    pub fn new() -> Self {
        Self {
            backend: None,
            memory_properties: None,
            blocks: HashMap::new(),
            ledger: AllocationLedger::default(),
        }
    }

    /// Allocator over a custom backend, kept across activation.
    pub fn with_backend(backend: impl MemoryBackend + 'static) -> Self {
        Self {
            backend: Some(Box::new(backend)),
            ..Self::new()
        }
    }

    fn bind(&mut self, memory_properties: vk::PhysicalDeviceMemoryProperties) -> Result<()> {
        if self.memory_properties.is_some() {
            return Err(GpuError::AllocatorNotActive(
                "passthrough allocator activated twice".into(),
            ));
        }
        self.memory_properties = Some(memory_properties);
        Ok(())
    }

    fn active(&self) -> Result<(&dyn MemoryBackend, &vk::PhysicalDeviceMemoryProperties)> {
        match (&self.backend, &self.memory_properties) {
            (Some(backend), Some(props)) => Ok((backend.as_ref(), props)),
            _ => Err(GpuError::AllocatorNotActive(
                "passthrough allocator used before activate".into(),
            )),
        }
    }
}

impl Default for PassthroughAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceAllocator for PassthroughAllocator {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn activate(&mut self, target: &AllocatorTarget<'_>) -> Result<()> {
        if self.backend.is_none() {
            self.backend = Some(Box::new(target.device.clone()));
        }
        self.bind(target.memory_properties)
    }

    fn alloc(&mut self, info: &AllocationCreateInfo<'_>) -> Result<Allocation> {
        let (backend, memory_properties) = self.active()?;
        let size = info.requirements.size;
        let memory_type = find_memory_type(
            memory_properties,
            info.requirements.memory_type_bits,
            info.properties,
        )?;

        let memory = unsafe { backend.allocate(size, memory_type)? };
        let id = self.ledger.record(memory_type, size);
        self.blocks.insert(id, memory);

        tracing::trace!("alloc #{id} '{}': {size} bytes, type {memory_type}", info.label);

        Ok(Allocation::new(id, memory, 0, size, memory_type))
    }

    fn free(&mut self, allocation: Allocation) -> Result<()> {
        let (backend, _) = self.active()?;
        let memory = *self.blocks.get(&allocation.id).ok_or_else(|| {
            GpuError::InvalidState(format!("allocation {} is not live", allocation.id))
        })?;

        unsafe { backend.free(memory) };
        self.blocks.remove(&allocation.id);
        self.ledger.release(allocation.id)?;

        tracing::trace!("free #{}", allocation.id);
        Ok(())
    }

    fn allocated_size(&self, memory_type: u32) -> vk::DeviceSize {
        self.ledger.bytes(memory_type)
    }

    fn num_allocs(&self) -> usize {
        self.ledger.count()
    }

    fn map(&mut self, allocation: &Allocation) -> Result<*mut u8> {
        let (backend, _) = self.active()?;
        unsafe { backend.map(allocation.memory, allocation.offset, allocation.size) }
    }

    fn unmap(&mut self, allocation: &Allocation) {
        if let Some(backend) = &self.backend {
            unsafe { backend.unmap(allocation.memory) };
        }
    }

    fn shutdown(&mut self) {
        if !self.blocks.is_empty() {
            tracing::warn!(
                "passthrough allocator shutting down with {} live allocations",
                self.blocks.len()
            );
        }
        if let Some(backend) = &self.backend {
            for (_, memory) in self.blocks.drain() {
                unsafe { backend.free(memory) };
            }
        }
        self.ledger = AllocationLedger::default();
        self.memory_properties = None;
        self.backend = None;
    }
}
