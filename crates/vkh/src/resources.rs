//! Buffer and image creation, host uploads and layout transitions.
//!
//! Host data only reaches device-local memory through a host-visible staging
//! buffer and a scratch copy. Device-local memory is never mapped directly.

use crate::context::DeviceContext;
use crate::error::{GpuError, Result};
use crate::memory::{Allocation, AllocationCreateInfo, DeviceAllocator};
use crate::queue::{QueueFamilyIndices, QueueRole};
use ash::vk;

const STAGING_PROPERTIES: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

/// A buffer bound to its allocation.
#[derive(Debug)]
pub struct Buffer {
    pub(crate) handle: vk::Buffer,
    pub(crate) allocation: Allocation,
    pub(crate) size: vk::DeviceSize,
}

impl Buffer {
    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    /// Requested size in bytes. The allocation may be larger.
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn allocation(&self) -> &Allocation {
        &self.allocation
    }
}

/// A 2D single-mip, single-layer image bound to its allocation.
#[derive(Debug)]
pub struct Image {
    pub(crate) handle: vk::Image,
    pub(crate) allocation: Allocation,
    pub(crate) format: vk::Format,
    pub(crate) extent: vk::Extent2D,
}

impl Image {
    pub fn handle(&self) -> vk::Image {
        self.handle
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn allocation(&self) -> &Allocation {
        &self.allocation
    }
}

/// Barrier parameters for one supported layout change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutTransition {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

impl LayoutTransition {
    /// Look up the barrier for `old -> new`.
    ///
    /// Only two transitions exist: undefined to transfer-destination, and
    /// transfer-destination to shader-read-only.
    pub fn between(old: vk::ImageLayout, new: vk::ImageLayout) -> Result<Self> {
        match (old, new) {
            (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => Ok(Self {
                src_access: vk::AccessFlags::empty(),
                dst_access: vk::AccessFlags::TRANSFER_WRITE,
                src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
                dst_stage: vk::PipelineStageFlags::TRANSFER,
            }),
            (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => {
                Ok(Self {
                    src_access: vk::AccessFlags::TRANSFER_WRITE,
                    dst_access: vk::AccessFlags::SHADER_READ,
                    src_stage: vk::PipelineStageFlags::TRANSFER,
                    dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
                })
            }
            _ => Err(GpuError::UnsupportedLayoutTransition { old, new }),
        }
    }

    /// Record the barrier for a color image.
    ///
    /// # Safety
    /// `cmd` must be recording and `image` must be in layout `old`.
    pub unsafe fn record(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    ) {
        let barrier = vk::ImageMemoryBarrier::default()
            .old_layout(old)
            .new_layout(new)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(color_subresource_range(1))
            .src_access_mask(self.src_access)
            .dst_access_mask(self.dst_access);

        device.cmd_pipeline_barrier(
            cmd,
            self.src_stage,
            self.dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

fn color_subresource_range(mip_levels: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .base_mip_level(0)
        .level_count(mip_levels)
        .base_array_layer(0)
        .layer_count(1)
}

/// Sharing for buffers: concurrent across graphics and transfer only when
/// they are different families.
pub fn buffer_sharing(families: &QueueFamilyIndices) -> (vk::SharingMode, Vec<u32>) {
    if families.transfer_is_separate() {
        (
            vk::SharingMode::CONCURRENT,
            vec![families.graphics, families.transfer],
        )
    } else {
        (vk::SharingMode::EXCLUSIVE, Vec::new())
    }
}

/// Create a 2D view of `image`.
///
/// # Safety
/// The device and image must be valid.
pub unsafe fn create_image_view_raw(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
    mip_levels: u32,
) -> Result<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping::default())
        .subresource_range(color_subresource_range(mip_levels).aspect_mask(aspect));

    device
        .create_image_view(&view_info, None)
        .map_err(GpuError::step("create image view"))
}

/// Record a buffer-to-buffer copy.
///
/// # Safety
/// `cmd` must be recording and both buffers must cover the copied range.
pub unsafe fn record_copy_buffer(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    src: vk::Buffer,
    dst: vk::Buffer,
    size: vk::DeviceSize,
    src_offset: vk::DeviceSize,
    dst_offset: vk::DeviceSize,
) {
    let region = vk::BufferCopy {
        src_offset,
        dst_offset,
        size,
    };
    device.cmd_copy_buffer(cmd, src, dst, &[region]);
}

/// The first `size` bytes of `data`.
fn upload_slice(data: &[u8], size: vk::DeviceSize) -> Result<&[u8]> {
    usize::try_from(size)
        .ok()
        .and_then(|len| data.get(..len))
        .ok_or_else(|| {
            GpuError::InvalidState(format!("upload of {size} bytes from {} bytes of data", data.len()))
        })
}

/// Zero-fill the first `size` bytes of a host-visible allocation, then copy
/// `data` to its start.
fn write_mapped(
    allocator: &mut dyn DeviceAllocator,
    allocation: &Allocation,
    size: vk::DeviceSize,
    data: &[u8],
) -> Result<()> {
    check_range("staging write", 0, size, allocation.size())?;
    check_range("staging write", 0, data.len() as vk::DeviceSize, size)?;

    let ptr = allocator.map(allocation)?;
    unsafe {
        std::ptr::write_bytes(ptr, 0, size as usize);
        std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len());
    }
    allocator.unmap(allocation);
    Ok(())
}

/// Read `len` bytes from the start of a host-visible allocation.
fn read_mapped(allocator: &mut dyn DeviceAllocator, allocation: &Allocation, len: usize) -> Result<Vec<u8>> {
    check_range("staging read", 0, len as vk::DeviceSize, allocation.size())?;

    let ptr = allocator.map(allocation)?;
    let bytes = unsafe { std::slice::from_raw_parts(ptr.cast_const(), len).to_vec() };
    allocator.unmap(allocation);
    Ok(bytes)
}

fn check_range(what: &str, offset: vk::DeviceSize, len: vk::DeviceSize, size: vk::DeviceSize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(GpuError::InvalidState(format!(
            "{what}: range {offset}+{len} exceeds buffer of {size} bytes"
        ))),
    }
}

impl DeviceContext {
    /// Create a buffer and bind freshly allocated memory to it.
    pub fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Buffer> {
        if size == 0 {
            return Err(GpuError::InvalidState("buffer size must be non-zero".into()));
        }

        let (sharing_mode, families) = buffer_sharing(&self.queue_families);
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(sharing_mode)
            .queue_family_indices(&families);

        let handle = unsafe {
            self.device
                .create_buffer(&buffer_info, None)
                .map_err(GpuError::step("create buffer"))?
        };

        let requirements = unsafe { self.device.get_buffer_memory_requirements(handle) };
        let allocation = match self.allocate(&AllocationCreateInfo {
            label: "buffer",
            requirements,
            properties,
            linear: true,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(handle, None) };
                return Err(e);
            }
        };

        if let Err(e) = unsafe {
            self.device
                .bind_buffer_memory(handle, allocation.memory(), allocation.offset())
        } {
            unsafe { self.device.destroy_buffer(handle, None) };
            self.free_allocation(allocation)?;
            return Err(GpuError::step("bind buffer memory")(e));
        }

        Ok(Buffer {
            handle,
            allocation,
            size,
        })
    }

    /// Destroy the buffer handle, then free its memory.
    pub fn destroy_buffer(&self, buffer: Buffer) -> Result<()> {
        unsafe { self.device.destroy_buffer(buffer.handle, None) };
        self.free_allocation(buffer.allocation)
    }

    /// Create a device-local 2D image with exclusive sharing.
    pub fn create_image(
        &self,
        width: u32,
        height: u32,
        format: vk::Format,
        tiling: vk::ImageTiling,
        usage: vk::ImageUsageFlags,
    ) -> Result<Image> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(tiling)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .samples(vk::SampleCountFlags::TYPE_1);

        let handle = unsafe {
            self.device
                .create_image(&image_info, None)
                .map_err(GpuError::step("create image"))?
        };

        let requirements = unsafe { self.device.get_image_memory_requirements(handle) };
        let allocation = match self.allocate(&AllocationCreateInfo {
            label: "image",
            requirements,
            properties: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            linear: tiling == vk::ImageTiling::LINEAR,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(handle, None) };
                return Err(e);
            }
        };

        if let Err(e) = unsafe {
            self.device
                .bind_image_memory(handle, allocation.memory(), allocation.offset())
        } {
            unsafe { self.device.destroy_image(handle, None) };
            self.free_allocation(allocation)?;
            return Err(GpuError::step("bind image memory")(e));
        }

        Ok(Image {
            handle,
            allocation,
            format,
            extent: vk::Extent2D { width, height },
        })
    }

    /// Destroy the image handle, then free its memory.
    pub fn destroy_image(&self, image: Image) -> Result<()> {
        unsafe { self.device.destroy_image(image.handle, None) };
        self.free_allocation(image.allocation)
    }

    /// Create a 2D view covering `mip_levels` levels.
    pub fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
        mip_levels: u32,
    ) -> Result<vk::ImageView> {
        unsafe { create_image_view_raw(&self.device, image, format, aspect, mip_levels) }
    }

    /// Copy between buffers on a transfer scratch submission.
    pub fn copy_buffer(
        &self,
        src: &Buffer,
        dst: &Buffer,
        size: vk::DeviceSize,
        src_offset: vk::DeviceSize,
        dst_offset: vk::DeviceSize,
    ) -> Result<()> {
        check_range("copy source", src_offset, size, src.size)?;
        check_range("copy destination", dst_offset, size, dst.size)?;

        self.execute_scratch(QueueRole::Transfer, |device, cmd| unsafe {
            record_copy_buffer(device, cmd, src.handle, dst.handle, size, src_offset, dst_offset);
        })
    }

    /// Upload the first `size` bytes of `data` into `dst` at `dst_offset`
    /// through a staging buffer.
    ///
    /// `dst` needs `TRANSFER_DST` usage.
    pub fn copy_data_to_buffer(
        &self,
        dst: &Buffer,
        size: vk::DeviceSize,
        dst_offset: vk::DeviceSize,
        data: &[u8],
    ) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        let data = upload_slice(data, size)?;
        check_range("upload", dst_offset, size, dst.size)?;

        let staging = self.create_buffer(size, vk::BufferUsageFlags::TRANSFER_SRC, STAGING_PROPERTIES)?;
        let result = self
            .with_allocator(|allocator| write_mapped(allocator, &staging.allocation, size, data))
            .and_then(|()| self.copy_buffer(&staging, dst, size, 0, dst_offset));
        let freed = self.destroy_buffer(staging);

        result.and(freed)
    }

    /// Typed convenience over [`Self::copy_data_to_buffer`].
    pub fn copy_slice_to_buffer<T: bytemuck::Pod>(
        &self,
        dst: &Buffer,
        dst_offset: vk::DeviceSize,
        data: &[T],
    ) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        self.copy_data_to_buffer(dst, bytes.len() as vk::DeviceSize, dst_offset, bytes)
    }

    /// Read `len` bytes of `src` starting at `src_offset` back to the host.
    ///
    /// `src` needs `TRANSFER_SRC` usage.
    pub fn read_buffer(
        &self,
        src: &Buffer,
        len: vk::DeviceSize,
        src_offset: vk::DeviceSize,
    ) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        check_range("readback", src_offset, len, src.size)?;

        let staging = self.create_buffer(len, vk::BufferUsageFlags::TRANSFER_DST, STAGING_PROPERTIES)?;
        let result = self
            .copy_buffer(src, &staging, len, src_offset, 0)
            .and_then(|()| {
                self.with_allocator(|allocator| read_mapped(allocator, &staging.allocation, len as usize))
            });
        let freed = self.destroy_buffer(staging);

        let bytes = result?;
        freed?;
        Ok(bytes)
    }

    /// Copy tightly packed texels from `buffer` into mip 0 of `image`.
    ///
    /// `image` must be in `TRANSFER_DST_OPTIMAL`. Runs on the graphics queue,
    /// which owns exclusively shared images.
    pub fn copy_buffer_to_image(
        &self,
        buffer: &Buffer,
        image: vk::Image,
        width: u32,
        height: u32,
    ) -> Result<()> {
        let region = vk::BufferImageCopy::default()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(1),
            )
            .image_offset(vk::Offset3D::default())
            .image_extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            });

        self.execute_scratch(QueueRole::Graphics, |device, cmd| unsafe {
            device.cmd_copy_buffer_to_image(
                cmd,
                buffer.handle,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        })
    }

    /// Move `image` between layouts with a single barrier on a graphics
    /// scratch submission.
    ///
    /// Unsupported pairs are rejected before any command is recorded.
    pub fn transition_image_layout(
        &self,
        image: vk::Image,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    ) -> Result<()> {
        let transition = LayoutTransition::between(old, new)?;
        self.execute_scratch(QueueRole::Graphics, |device, cmd| unsafe {
            transition.record(device, cmd, image, old, new);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::tests::active_passthrough;

    #[test]
    fn upload_then_sample_transitions_are_supported() {
        let to_dst = LayoutTransition::between(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap();
        assert_eq!(to_dst.src_access, vk::AccessFlags::empty());
        assert_eq!(to_dst.dst_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(to_dst.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(to_dst.dst_stage, vk::PipelineStageFlags::TRANSFER);

        let to_read = LayoutTransition::between(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();
        assert_eq!(to_read.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(to_read.dst_access, vk::AccessFlags::SHADER_READ);
        assert_eq!(to_read.src_stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(to_read.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
    }

    #[test]
    fn skipping_transfer_destination_is_rejected() {
        let err = LayoutTransition::between(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            GpuError::UnsupportedLayoutTransition {
                old: vk::ImageLayout::UNDEFINED,
                new: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            }
        ));
    }

    #[test]
    fn reverse_transitions_are_rejected() {
        assert!(LayoutTransition::between(
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .is_err());
        assert!(LayoutTransition::between(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::UNDEFINED,
        )
        .is_err());
    }

    #[test]
    fn buffers_are_concurrent_only_across_distinct_families() {
        let same = QueueFamilyIndices {
            graphics: 0,
            transfer: 0,
            present: 1,
        };
        assert_eq!(buffer_sharing(&same), (vk::SharingMode::EXCLUSIVE, vec![]));

        let split = QueueFamilyIndices {
            graphics: 0,
            transfer: 2,
            present: 0,
        };
        assert_eq!(
            buffer_sharing(&split),
            (vk::SharingMode::CONCURRENT, vec![0, 2])
        );
    }

    fn host_visible(
        allocator: &mut dyn DeviceAllocator,
        size: vk::DeviceSize,
    ) -> Allocation {
        allocator
            .alloc(&AllocationCreateInfo {
                label: "staging",
                requirements: vk::MemoryRequirements {
                    size,
                    alignment: 4,
                    memory_type_bits: 0b111,
                },
                properties: STAGING_PROPERTIES,
                linear: true,
            })
            .unwrap()
    }

    #[test]
    fn staged_bytes_read_back_identically() {
        let (mut allocator, _) = active_passthrough();
        for size in [1u64, 3, 64, 4096] {
            let data: Vec<u8> = (0..size).map(|i| (i * 7 + 1) as u8).collect();
            let staging = host_visible(&mut allocator, size);

            write_mapped(&mut allocator, &staging, size, &data).unwrap();
            assert_eq!(read_mapped(&mut allocator, &staging, size as usize).unwrap(), data);

            allocator.free(staging).unwrap();
        }
        assert_eq!(allocator.num_allocs(), 0);
    }

    #[test]
    fn staging_is_zero_filled_past_the_payload() {
        let (mut allocator, backend) = active_passthrough();
        let staging = host_visible(&mut allocator, 8);

        write_mapped(&mut allocator, &staging, 8, &[9, 9, 9]).unwrap();
        assert_eq!(
            read_mapped(&mut allocator, &staging, 8).unwrap(),
            vec![9, 9, 9, 0, 0, 0, 0, 0]
        );
        assert!(backend.state.lock().mapped.is_empty());
    }

    #[test]
    fn mapped_access_is_bounded_by_the_allocation() {
        let (mut allocator, _) = active_passthrough();
        let staging = host_visible(&mut allocator, 8);

        assert!(write_mapped(&mut allocator, &staging, 9, &[0; 9]).is_err());
        assert!(write_mapped(&mut allocator, &staging, 4, &[0; 5]).is_err());
        assert!(read_mapped(&mut allocator, &staging, 9).is_err());
        assert_eq!(read_mapped(&mut allocator, &staging, 8).unwrap().len(), 8);
    }

    #[test]
    fn upload_takes_a_prefix_of_the_data() {
        assert_eq!(upload_slice(&[1, 2, 3, 4], 2).unwrap(), &[1, 2]);
        assert_eq!(upload_slice(&[1, 2, 3, 4], 4).unwrap(), &[1, 2, 3, 4]);
        assert!(upload_slice(&[1, 2, 3, 4], 5).is_err());
    }

    #[test]
    fn range_checks() {
        assert!(check_range("t", 0, 16, 16).is_ok());
        assert!(check_range("t", 8, 8, 16).is_ok());
        assert!(check_range("t", 8, 9, 16).is_err());
        assert!(check_range("t", u64::MAX, 1, 16).is_err());
        assert!(check_range("t", 16, 0, 16).is_ok());
        assert!(check_range("t", 17, 0, 16).is_err());
    }
}
