//! Pooled sub-allocation backed by `gpu-allocator`.

use crate::error::{GpuError, Result};
use crate::memory::{
    find_memory_type, Allocation, AllocationCreateInfo, AllocationLedger, AllocatorTarget,
    DeviceAllocator,
};
use ash::vk;
use gpu_allocator::vulkan::{AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::MemoryLocation;
use std::collections::HashMap;

/// One sub-allocation request, after the memory type has been chosen.
#[derive(Debug, Clone, Copy)]
pub struct BlockRequest<'a> {
    pub label: &'a str,
    pub requirements: vk::MemoryRequirements,
    pub location: MemoryLocation,
    pub linear: bool,
}

/// Where a block lives inside device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPlacement {
    pub memory: vk::DeviceMemory,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

/// Block sub-allocator the pooling strategy drives.
pub trait BlockSource: Send + Sized {
    type Block: Send;

    /// Build a source bound to the target device.
    fn create(target: &AllocatorTarget<'_>) -> Result<Self>;

    fn allocate(&mut self, request: &BlockRequest<'_>) -> Result<Self::Block>;

    fn free(&mut self, block: Self::Block) -> Result<()>;

    fn placement(block: &Self::Block) -> BlockPlacement;

    /// Persistent host mapping, if the block is host visible.
    fn mapped_ptr(block: &Self::Block) -> Option<*mut u8>;
}

impl BlockSource for Allocator {
    type Block = gpu_allocator::vulkan::Allocation;

    fn create(target: &AllocatorTarget<'_>) -> Result<Self> {
        Self::new(&AllocatorCreateDesc {
            instance: target.instance.clone(),
            device: target.device.clone(),
            physical_device: target.physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: gpu_allocator::AllocationSizes::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))
    }

    fn allocate(&mut self, request: &BlockRequest<'_>) -> Result<Self::Block> {
        Self::allocate(
            self,
            &AllocationCreateDesc {
                name: request.label,
                requirements: request.requirements,
                location: request.location,
                linear: request.linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            },
        )
        .map_err(|e| GpuError::AllocationFailed(format!("'{}': {e}", request.label)))
    }

    fn free(&mut self, block: Self::Block) -> Result<()> {
        Self::free(self, block).map_err(|e| GpuError::AllocationFailed(e.to_string()))
    }

    fn placement(block: &Self::Block) -> BlockPlacement {
        BlockPlacement {
            memory: unsafe { block.memory() },
            offset: block.offset(),
            size: block.size(),
        }
    }

    fn mapped_ptr(block: &Self::Block) -> Option<*mut u8> {
        block.mapped_ptr().map(|ptr| ptr.as_ptr().cast::<u8>())
    }
}

/// Sub-allocates from large per-memory-type blocks.
///
/// Host-visible requests are persistently mapped, so `map` hands back the
/// existing pointer and `unmap` does nothing.
pub struct PoolingAllocator<S: BlockSource = Allocator> {
    source: Option<S>,
    memory_properties: Option<vk::PhysicalDeviceMemoryProperties>,
    live: HashMap<u64, S::Block>,
    ledger: AllocationLedger,
}

impl PoolingAllocator {
    /// Allocator that creates its `gpu-allocator` pool on activation.
    pub fn new() -> Self {
        Self::empty(None)
    }
}

impl<S: BlockSource> PoolingAllocator<S> {
    fn empty(source: Option<S>) -> Self {
        Self {
            source,
            memory_properties: None,
            live: HashMap::new(),
            ledger: AllocationLedger::default(),
        }
    }

    /// Allocator over an existing block source, kept across activation.
    pub fn with_source(source: S) -> Self {
        Self::empty(Some(source))
    }

    fn bind(&mut self, memory_properties: vk::PhysicalDeviceMemoryProperties) -> Result<()> {
        if self.memory_properties.is_some() {
            return Err(GpuError::AllocatorNotActive(
                "pooling allocator activated twice".into(),
            ));
        }
        self.memory_properties = Some(memory_properties);
        Ok(())
    }

    fn active(&mut self) -> Result<(&mut S, &vk::PhysicalDeviceMemoryProperties)> {
        match (&mut self.source, &self.memory_properties) {
            (Some(source), Some(props)) => Ok((source, props)),
            _ => Err(GpuError::AllocatorNotActive(
                "pooling allocator used before activate".into(),
            )),
        }
    }
}

impl Default for PoolingAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Where `gpu-allocator` should place memory with the given flags.
pub fn memory_location(properties: vk::MemoryPropertyFlags) -> MemoryLocation {
    if !properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
        MemoryLocation::GpuOnly
    } else if properties.contains(vk::MemoryPropertyFlags::HOST_CACHED) {
        MemoryLocation::GpuToCpu
    } else {
        MemoryLocation::CpuToGpu
    }
}

impl<S: BlockSource> DeviceAllocator for PoolingAllocator<S> {
    fn name(&self) -> &'static str {
        "pooling"
    }

    fn activate(&mut self, target: &AllocatorTarget<'_>) -> Result<()> {
        if self.memory_properties.is_some() {
            return Err(GpuError::AllocatorNotActive(
                "pooling allocator activated twice".into(),
            ));
        }
        if self.source.is_none() {
            self.source = Some(S::create(target)?);
        }
        self.bind(target.memory_properties)
    }

    fn alloc(&mut self, info: &AllocationCreateInfo<'_>) -> Result<Allocation> {
        let (source, memory_properties) = self.active()?;
        let memory_type = find_memory_type(
            memory_properties,
            info.requirements.memory_type_bits,
            info.properties,
        )?;

        let block = source.allocate(&BlockRequest {
            label: info.label,
            requirements: vk::MemoryRequirements {
                memory_type_bits: 1 << memory_type,
                ..info.requirements
            },
            location: memory_location(info.properties),
            linear: info.linear,
        })?;

        let placement = S::placement(&block);
        let id = self.ledger.record(memory_type, placement.size);
        self.live.insert(id, block);

        tracing::trace!(
            "pooled alloc #{id} '{}': {} bytes at offset {}, type {memory_type}",
            info.label,
            placement.size,
            placement.offset
        );

        Ok(Allocation::new(
            id,
            placement.memory,
            placement.offset,
            placement.size,
            memory_type,
        ))
    }

    fn free(&mut self, allocation: Allocation) -> Result<()> {
        self.active()?;
        let block = self.live.remove(&allocation.id()).ok_or_else(|| {
            GpuError::InvalidState(format!("allocation {} is not live", allocation.id()))
        })?;

        self.ledger.release(allocation.id())?;
        let (source, _) = self.active()?;
        source.free(block)
    }

    fn allocated_size(&self, memory_type: u32) -> vk::DeviceSize {
        self.ledger.bytes(memory_type)
    }

    fn num_allocs(&self) -> usize {
        self.ledger.count()
    }

    fn map(&mut self, allocation: &Allocation) -> Result<*mut u8> {
        self.live
            .get(&allocation.id())
            .and_then(S::mapped_ptr)
            .ok_or_else(|| {
                GpuError::InvalidState(format!("allocation {} is not host mapped", allocation.id()))
            })
    }

    fn unmap(&mut self, _allocation: &Allocation) {}

    fn shutdown(&mut self) {
        if let Some(mut source) = self.source.take() {
            if !self.live.is_empty() {
                tracing::warn!(
                    "pooling allocator shutting down with {} live allocations",
                    self.live.len()
                );
            }
            for (_, block) in self.live.drain() {
                if let Err(e) = source.free(block) {
                    tracing::warn!("failed to release block during shutdown: {e}");
                }
            }
            // Dropping the source releases its memory blocks.
            drop(source);
        }
        self.ledger = AllocationLedger::default();
        self.memory_properties = None;
    }
}

impl<S: BlockSource> Drop for PoolingAllocator<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::tests::memory_table;
    use ash::vk::Handle;
    use parking_lot::Mutex;
    use std::sync::Arc;

    const BLOCK_SIZE: vk::DeviceSize = 1024;

    #[derive(Debug)]
    struct FakeBlock {
        chunk: u64,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    }

    #[derive(Default)]
    struct PoolState {
        cursor: vk::DeviceSize,
        live: usize,
        freed: usize,
    }

    /// Bump allocator carving fixed-size chunks, one chunk per memory location.
    #[derive(Clone, Default)]
    struct FakeSource {
        state: Arc<Mutex<PoolState>>,
    }

    impl BlockSource for FakeSource {
        type Block = FakeBlock;

        fn create(_target: &AllocatorTarget<'_>) -> Result<Self> {
            Err(GpuError::InvalidState("fake source is injected".into()))
        }

        fn allocate(&mut self, request: &BlockRequest<'_>) -> Result<FakeBlock> {
            let mut state = self.state.lock();
            let size = request.requirements.size;
            let align = request.requirements.alignment.max(1);
            let offset = state.cursor.div_ceil(align) * align;
            if offset + size > BLOCK_SIZE {
                return Err(GpuError::AllocationFailed(format!("'{}' does not fit", request.label)));
            }
            state.cursor = offset + size;
            state.live += 1;
            Ok(FakeBlock {
                chunk: match request.location {
                    MemoryLocation::GpuOnly => 1,
                    _ => 2,
                },
                offset,
                size,
            })
        }

        fn free(&mut self, _block: FakeBlock) -> Result<()> {
            let mut state = self.state.lock();
            state.live -= 1;
            state.freed += 1;
            Ok(())
        }

        fn placement(block: &FakeBlock) -> BlockPlacement {
            BlockPlacement {
                memory: vk::DeviceMemory::from_raw(block.chunk),
                offset: block.offset,
                size: block.size,
            }
        }

        fn mapped_ptr(_block: &FakeBlock) -> Option<*mut u8> {
            None
        }
    }

    fn active_pool() -> (PoolingAllocator<FakeSource>, FakeSource) {
        let source = FakeSource::default();
        let mut pool = PoolingAllocator::with_source(source.clone());
        pool.bind(memory_table()).unwrap();
        (pool, source)
    }

    fn request(size: vk::DeviceSize, properties: vk::MemoryPropertyFlags) -> AllocationCreateInfo<'static> {
        AllocationCreateInfo {
            label: "test",
            requirements: vk::MemoryRequirements {
                size,
                alignment: 64,
                memory_type_bits: 0b111,
            },
            properties,
            linear: true,
        }
    }

    #[test]
    fn locations_follow_property_flags() {
        assert_eq!(
            memory_location(vk::MemoryPropertyFlags::DEVICE_LOCAL),
            MemoryLocation::GpuOnly
        );
        assert_eq!(
            memory_location(
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            ),
            MemoryLocation::CpuToGpu
        );
        assert_eq!(
            memory_location(
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED
            ),
            MemoryLocation::GpuToCpu
        );
    }

    #[test]
    fn alloc_before_activate_reports_inactive() {
        let mut pool = PoolingAllocator::with_source(FakeSource::default());
        let err = pool
            .alloc(&request(64, vk::MemoryPropertyFlags::DEVICE_LOCAL))
            .unwrap_err();
        assert!(matches!(err, GpuError::AllocatorNotActive(_)), "{err}");
        assert_eq!(pool.num_allocs(), 0);
    }

    #[test]
    fn second_activation_is_rejected() {
        let (mut pool, _) = active_pool();
        assert!(pool.bind(memory_table()).is_err());
    }

    #[test]
    fn blocks_share_memory_at_aligned_offsets() {
        let (mut pool, _) = active_pool();
        let first = pool
            .alloc(&request(100, vk::MemoryPropertyFlags::DEVICE_LOCAL))
            .unwrap();
        let second = pool
            .alloc(&request(100, vk::MemoryPropertyFlags::DEVICE_LOCAL))
            .unwrap();

        assert_eq!(first.memory(), second.memory());
        assert_eq!(first.offset(), 0);
        assert_eq!(second.offset(), 128);
        assert_eq!(first.memory_type(), 0);
        assert_eq!(pool.allocated_size(0), 200);
    }

    #[test]
    fn free_restores_counts() {
        let (mut pool, source) = active_pool();
        let allocations: Vec<_> = (1..=4)
            .map(|i| {
                pool.alloc(&request(
                    i * 32,
                    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                ))
                .unwrap()
            })
            .collect();

        assert_eq!(pool.num_allocs(), 4);
        assert_eq!(pool.allocated_size(1), 320);
        assert_eq!(source.state.lock().live, 4);

        for allocation in allocations {
            pool.free(allocation).unwrap();
        }

        assert_eq!(pool.num_allocs(), 0);
        assert_eq!(pool.allocated_size(1), 0);
        assert_eq!(source.state.lock().live, 0);
    }

    #[test]
    fn unsatisfiable_properties_fail_without_touching_the_source() {
        let (mut pool, source) = active_pool();
        let err = pool
            .alloc(&request(64, vk::MemoryPropertyFlags::PROTECTED))
            .unwrap_err();
        assert!(matches!(err, GpuError::NoMatchingMemoryType { .. }));
        assert_eq!(source.state.lock().live, 0);
    }

    #[test]
    fn unmapped_blocks_cannot_be_mapped() {
        let (mut pool, _) = active_pool();
        let allocation = pool
            .alloc(&request(16, vk::MemoryPropertyFlags::DEVICE_LOCAL))
            .unwrap();
        assert!(pool.map(&allocation).is_err());
    }

    #[test]
    fn shutdown_releases_blocks_once() {
        let (mut pool, source) = active_pool();
        let _leaked = pool
            .alloc(&request(64, vk::MemoryPropertyFlags::DEVICE_LOCAL))
            .unwrap();
        let _also_leaked = pool
            .alloc(&request(64, vk::MemoryPropertyFlags::DEVICE_LOCAL))
            .unwrap();

        pool.shutdown();
        pool.shutdown();

        let state = source.state.lock();
        assert_eq!(state.live, 0);
        assert_eq!(state.freed, 2);
        drop(state);
        assert_eq!(pool.num_allocs(), 0);

        let err = pool
            .alloc(&request(64, vk::MemoryPropertyFlags::DEVICE_LOCAL))
            .unwrap_err();
        assert!(matches!(err, GpuError::AllocatorNotActive(_)));
    }
}
