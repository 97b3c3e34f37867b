//! Thin Vulkan helper layer.
//!
//! This crate provides:
//! - Instance, device and queue bootstrap against a window surface
//! - Pluggable device memory allocation (passthrough or pooled)
//! - Buffer and image creation with staged uploads
//! - One-shot scratch command submission
//! - Swapchain presentation with per-image frame synchronization
//! - Mesh and texture assets

pub mod capabilities;
pub mod command;
pub mod context;
pub mod descriptors;
pub mod error;
pub mod frame;
pub mod instance;
pub mod memory;
pub mod mesh;
pub mod pooling;
pub mod queue;
pub mod render_pass;
pub mod resources;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod texture;

pub use capabilities::{DeviceCapabilities, Disqualification, GpuVendor};
pub use command::{CommandPool, ScratchBackend, ScratchCommandBuffer};
pub use context::{DeviceContext, DeviceContextBuilder};
pub use descriptors::{
    create_sampler, write_sampled_images, write_sampler, DescriptorPool,
    DescriptorPoolSizing, DescriptorSetLayoutBuilder,
};
pub use error::{GpuError, Result};
pub use frame::{FrameBackend, FrameContext, FrameStatus, FrameSync};
pub use memory::{
    find_memory_type, Allocation, AllocationCreateInfo, AllocatorTarget, DeviceAllocator,
    MemoryBackend, PassthroughAllocator,
};
pub use mesh::{quad_geometry, MeshAsset, Vertex};
pub use pooling::{BlockPlacement, BlockRequest, BlockSource, PoolingAllocator};
pub use queue::{QueueFamilyIndices, QueueRole};
pub use render_pass::{create_framebuffers, create_render_pass, destroy_framebuffers};
pub use resources::{Buffer, Image, LayoutTransition};
pub use swapchain::Swapchain;
pub use texture::TextureAsset;
