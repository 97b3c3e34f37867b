//! Sampled 2D textures.

use crate::context::DeviceContext;
use crate::error::{GpuError, Result};
use crate::resources::{Buffer, Image};
use ash::vk;
use std::path::Path;

/// Format of every texture this module creates.
pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

/// Decode an encoded image, forcing four 8-bit channels.
pub fn decode_rgba(bytes: &[u8]) -> Result<(u32, u32, Vec<u8>)> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|e| GpuError::ImageDecode(e.to_string()))?
        .to_rgba8();
    let (width, height) = decoded.dimensions();
    Ok((width, height, decoded.into_raw()))
}

/// A shader-readable image and its view.
#[derive(Debug)]
pub struct TextureAsset {
    pub image: Image,
    pub view: vk::ImageView,
}

impl TextureAsset {
    /// Load and upload an image file.
    pub fn from_file(ctx: &DeviceContext, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let decoded = image::open(path)
            .map_err(|e| GpuError::ImageDecode(format!("{}: {e}", path.display())))?
            .to_rgba8();
        let (width, height) = decoded.dimensions();

        tracing::debug!("Loaded texture {} ({width}x{height})", path.display());
        Self::from_rgba8(ctx, width, height, decoded.as_raw())
    }

    /// Decode an in-memory encoded image and upload it.
    pub fn from_bytes(ctx: &DeviceContext, bytes: &[u8]) -> Result<Self> {
        let (width, height, pixels) = decode_rgba(bytes)?;
        Self::from_rgba8(ctx, width, height, &pixels)
    }

    /// Upload tightly packed RGBA8 texels.
    ///
    /// The image goes undefined -> transfer destination, receives the staged
    /// texels, then moves to shader-read-only before its view is created.
    pub fn from_rgba8(ctx: &DeviceContext, width: u32, height: u32, pixels: &[u8]) -> Result<Self> {
        let expected = width as usize * height as usize * 4;
        if width == 0 || height == 0 || pixels.len() != expected {
            return Err(GpuError::ImageDecode(format!(
                "{width}x{height} RGBA8 needs {expected} bytes, got {}",
                pixels.len()
            )));
        }

        let staging = ctx.create_buffer(
            expected as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;

        let image = match ctx.create_image(
            width,
            height,
            TEXTURE_FORMAT,
            vk::ImageTiling::OPTIMAL,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
        ) {
            Ok(image) => image,
            Err(e) => {
                ctx.destroy_buffer(staging)?;
                return Err(e);
            }
        };

        let uploaded = upload(ctx, &staging, &image, pixels);
        let freed = ctx.destroy_buffer(staging);

        let view = match uploaded.and(freed).and_then(|()| {
            ctx.create_image_view(image.handle(), TEXTURE_FORMAT, vk::ImageAspectFlags::COLOR, 1)
        }) {
            Ok(view) => view,
            Err(e) => {
                ctx.destroy_image(image)?;
                return Err(e);
            }
        };

        Ok(Self { image, view })
    }

    pub fn width(&self) -> u32 {
        self.image.extent().width
    }

    pub fn height(&self) -> u32 {
        self.image.extent().height
    }

    /// Destroy the view, then the image and its memory.
    pub fn destroy(self, ctx: &DeviceContext) -> Result<()> {
        unsafe { ctx.device().destroy_image_view(self.view, None) };
        ctx.destroy_image(self.image)
    }
}

fn upload(ctx: &DeviceContext, staging: &Buffer, image: &Image, pixels: &[u8]) -> Result<()> {
    {
        let mut allocator = ctx.allocator().lock();
        let ptr = allocator.map(staging.allocation())?;
        unsafe { std::ptr::copy_nonoverlapping(pixels.as_ptr(), ptr, pixels.len()) };
        allocator.unmap(staging.allocation());
    }

    ctx.transition_image_layout(
        image.handle(),
        vk::ImageLayout::UNDEFINED,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    )?;
    let extent = image.extent();
    ctx.copy_buffer_to_image(staging, image.handle(), extent.width, extent.height)?;
    ctx.transition_image_layout(
        image.handle(),
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb, Rgba};
    use std::io::Cursor;

    fn encode_png(img: DynamicImage) -> Vec<u8> {
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn decodes_rgba_png() {
        let img = ImageBuffer::from_fn(3, 2, |x, y| Rgba([x as u8, y as u8, 7, 200]));
        let (w, h, pixels) = decode_rgba(&encode_png(DynamicImage::ImageRgba8(img))).unwrap();
        assert_eq!((w, h), (3, 2));
        assert_eq!(pixels.len(), 3 * 2 * 4);
        assert_eq!(&pixels[4..8], &[1, 0, 7, 200]);
    }

    #[test]
    fn rgb_input_gains_opaque_alpha() {
        let img = ImageBuffer::from_pixel(2, 2, Rgb([10u8, 20, 30]));
        let (_, _, pixels) = decode_rgba(&encode_png(DynamicImage::ImageRgb8(img))).unwrap();
        assert_eq!(&pixels[..4], &[10, 20, 30, 255]);
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(
            decode_rgba(b"definitely not an image"),
            Err(GpuError::ImageDecode(_))
        ));
    }
}
