//! Indexed triangle meshes in device-local memory.

use crate::context::DeviceContext;
use crate::error::{GpuError, Result};
use crate::resources::Buffer;
use ash::vk;
use glam::{Vec2, Vec3, Vec4};

/// Interleaved vertex: position, texture coordinate, color.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex {
    pub pos: [f32; 3],
    pub uv: [f32; 2],
    pub col: [f32; 4],
}

impl Vertex {
    pub fn new(pos: Vec3, uv: Vec2, col: Vec4) -> Self {
        Self {
            pos: pos.to_array(),
            uv: uv.to_array(),
            col: col.to_array(),
        }
    }

    /// One per-vertex binding at slot 0.
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<Self>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    /// Position at location 0 and uv at location 1. Color is not consumed
    /// by the vertex stage.
    pub fn attribute_descriptions() -> Vec<vk::VertexInputAttributeDescription> {
        vec![
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: std::mem::offset_of!(Vertex, pos) as u32,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: std::mem::offset_of!(Vertex, uv) as u32,
            },
        ]
    }
}

/// Corners and indices of an axis-aligned quad centred on `(x_offset, y_offset)`.
///
/// Vertex order is right-top, left-top, left-bottom, right-bottom.
pub fn quad_geometry(width: f32, height: f32, x_offset: f32, y_offset: f32) -> ([Vertex; 4], [u32; 6]) {
    let half_w = width / 2.0;
    let half_h = height / 2.0;

    let left = -half_w + x_offset;
    let right = half_w + x_offset;
    let bottom = -half_h + y_offset;
    let top = half_h + y_offset;

    let vertices = [
        Vertex::new(Vec3::new(right, top, 0.0), Vec2::new(1.0, 1.0), Vec4::ONE),
        Vertex::new(Vec3::new(left, top, 0.0), Vec2::new(0.0, 1.0), Vec4::new(0.0, 1.0, 1.0, 1.0)),
        Vertex::new(Vec3::new(left, bottom, 0.0), Vec2::new(0.0, 0.0), Vec4::ONE),
        Vertex::new(Vec3::new(right, bottom, 0.0), Vec2::new(1.0, 0.0), Vec4::ONE),
    ];

    (vertices, [0, 2, 1, 2, 0, 3])
}

/// Vertex and index buffers for one mesh.
#[derive(Debug)]
pub struct MeshAsset {
    pub vertex_buffer: Buffer,
    pub index_buffer: Buffer,
    pub vertex_count: u32,
    pub index_count: u32,
}

impl MeshAsset {
    /// Upload `vertices` and 32-bit `indices` into device-local buffers.
    pub fn new(ctx: &DeviceContext, vertices: &[Vertex], indices: &[u32]) -> Result<Self> {
        if vertices.is_empty() || indices.is_empty() {
            return Err(GpuError::InvalidState("mesh needs vertices and indices".into()));
        }

        let vertex_buffer = ctx.create_buffer(
            std::mem::size_of_val(vertices) as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::VERTEX_BUFFER,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        let index_buffer = match ctx.create_buffer(
            std::mem::size_of_val(indices) as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_DST
                | vk::BufferUsageFlags::TRANSFER_SRC
                | vk::BufferUsageFlags::INDEX_BUFFER,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                ctx.destroy_buffer(vertex_buffer)?;
                return Err(e);
            }
        };

        let mesh = Self {
            vertex_buffer,
            index_buffer,
            vertex_count: vertices.len() as u32,
            index_count: indices.len() as u32,
        };

        let uploaded = ctx
            .copy_slice_to_buffer(&mesh.vertex_buffer, 0, vertices)
            .and_then(|()| ctx.copy_slice_to_buffer(&mesh.index_buffer, 0, indices));
        if let Err(e) = uploaded {
            mesh.destroy(ctx)?;
            return Err(e);
        }

        tracing::debug!(
            "Uploaded mesh: {} vertices, {} indices",
            mesh.vertex_count,
            mesh.index_count
        );
        Ok(mesh)
    }

    /// Upload a quad built by [`quad_geometry`].
    pub fn quad(
        ctx: &DeviceContext,
        width: f32,
        height: f32,
        x_offset: f32,
        y_offset: f32,
    ) -> Result<Self> {
        let (vertices, indices) = quad_geometry(width, height, x_offset, y_offset);
        Self::new(ctx, &vertices, &indices)
    }

    /// Read the index buffer back from device memory.
    pub fn read_indices(&self, ctx: &DeviceContext) -> Result<Vec<u32>> {
        let bytes = ctx.read_buffer(&self.index_buffer, self.index_buffer.size(), 0)?;
        Ok(bytes
            .chunks_exact(std::mem::size_of::<u32>())
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }

    /// Bind both buffers and issue one indexed draw.
    ///
    /// # Safety
    /// `cmd` must be recording inside a render pass with a compatible pipeline bound.
    pub unsafe fn draw(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        device.cmd_bind_vertex_buffers(cmd, 0, &[self.vertex_buffer.handle()], &[0]);
        device.cmd_bind_index_buffer(cmd, self.index_buffer.handle(), 0, vk::IndexType::UINT32);
        device.cmd_draw_indexed(cmd, self.index_count, 1, 0, 0, 0);
    }

    pub fn destroy(self, ctx: &DeviceContext) -> Result<()> {
        let vertex = ctx.destroy_buffer(self.vertex_buffer);
        let index = ctx.destroy_buffer(self.index_buffer);
        vertex.and(index)
    }
}
