//! GPU resources owned by the demo.

use crate::config::{DemoConfig, TEXTURE_ARRAY_SIZE};
use crate::cycle::{checkerboard, ImageCycle, PALETTE};
use crate::pipeline::QuadPipeline;
use anyhow::Context as _;
use ash::vk;
use tracing::{info, warn};
use vkh::{
    create_framebuffers, create_render_pass, create_sampler, destroy_framebuffers, quad_geometry,
    write_sampled_images, write_sampler, DescriptorSetLayoutBuilder, DeviceContext, FrameContext,
    MeshAsset, TextureAsset,
};

const GENERATED_TEXTURE_SIZE: u32 = 64;
const FIRST_IMAGE: u32 = 5;

pub struct DemoScene {
    quad: MeshAsset,
    textures: Vec<TextureAsset>,
    sampler: vk::Sampler,
    set_layout: vk::DescriptorSetLayout,
    descriptor_set: vk::DescriptorSet,
    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,
    pipeline: Option<QuadPipeline>,
    cycle: ImageCycle,
}

impl DemoScene {
    pub fn new(ctx: &DeviceContext, config: &DemoConfig) -> anyhow::Result<Self> {
        let device = ctx.device();

        let quad = MeshAsset::quad(ctx, 2.0, 2.0, 0.0, 0.0).context("upload quad")?;
        if config.verify_uploads {
            verify_quad(ctx, &quad)?;
        }

        let mut textures = Vec::with_capacity(TEXTURE_ARRAY_SIZE as usize);
        for i in 0..TEXTURE_ARRAY_SIZE {
            textures.push(load_texture(ctx, config, i)?);
        }

        let max_anisotropy = ctx
            .capabilities()
            .sampler_anisotropy
            .then(|| ctx.properties().limits.max_sampler_anisotropy.min(16.0));
        let sampler = unsafe { create_sampler(device, max_anisotropy)? };

        let set_layout = unsafe {
            DescriptorSetLayoutBuilder::new()
                .sampler(0, vk::ShaderStageFlags::FRAGMENT)
                .sampled_images(1, TEXTURE_ARRAY_SIZE, vk::ShaderStageFlags::FRAGMENT)
                .build(device)?
        };
        let descriptor_set = unsafe { ctx.descriptor_pool().allocate(device, &[set_layout])?[0] };

        let views: Vec<_> = textures.iter().map(|t| t.view).collect();
        unsafe {
            write_sampler(device, descriptor_set, 0, sampler);
            write_sampled_images(device, descriptor_set, 1, &views);
        }

        let render_pass = unsafe { create_render_pass(device, ctx.swapchain_format(), None)? };
        let framebuffers = unsafe {
            create_framebuffers(
                device,
                render_pass,
                &ctx.swapchain().image_views,
                None,
                ctx.swapchain_extent(),
            )?
        };

        let pipeline = load_pipeline(ctx, config, render_pass, set_layout);

        Ok(Self {
            quad,
            textures,
            sampler,
            set_layout,
            descriptor_set,
            render_pass,
            framebuffers,
            pipeline,
            cycle: ImageCycle::new(FIRST_IMAGE, TEXTURE_ARRAY_SIZE, config.frames_per_image),
        })
    }

    /// Count a frame toward the texture rotation.
    pub fn advance(&mut self) {
        if self.cycle.tick() {
            tracing::debug!("Showing texture {}", self.cycle.index());
        }
    }

    /// Record the render pass for one frame.
    pub fn record(&self, device: &ash::Device, frame: &FrameContext, extent: vk::Extent2D) -> vkh::Result<()> {
        let framebuffer = *self
            .framebuffers
            .get(frame.image_index as usize)
            .ok_or_else(|| vkh::GpuError::InvalidState(format!("no framebuffer for image {}", frame.image_index)))?;

        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.cycle.clear_color(),
            },
        }];
        let render_pass_info = vk::RenderPassBeginInfo::default()
            .render_pass(self.render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            })
            .clear_values(&clear_values);

        let cmd = frame.command_buffer;
        unsafe {
            device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
            if let Some(pipeline) = &self.pipeline {
                pipeline.bind(device, cmd, self.descriptor_set, self.cycle.index(), extent);
                self.quad.draw(device, cmd);
            }
            device.cmd_end_render_pass(cmd);
        }
        Ok(())
    }

    /// Rebuild framebuffers after the swapchain changed.
    pub fn rebuild_framebuffers(&mut self, ctx: &DeviceContext) -> anyhow::Result<()> {
        unsafe {
            destroy_framebuffers(ctx.device(), &self.framebuffers);
            self.framebuffers.clear();
            self.framebuffers = create_framebuffers(
                ctx.device(),
                self.render_pass,
                &ctx.swapchain().image_views,
                None,
                ctx.swapchain_extent(),
            )?;
        }
        Ok(())
    }

    /// Release everything. The device must be idle.
    pub fn destroy(self, ctx: &DeviceContext) -> anyhow::Result<()> {
        let device = ctx.device();
        unsafe {
            if let Some(pipeline) = &self.pipeline {
                pipeline.destroy(device);
            }
            destroy_framebuffers(device, &self.framebuffers);
            device.destroy_render_pass(self.render_pass, None);
            ctx.descriptor_pool().free(device, &[self.descriptor_set])?;
            device.destroy_descriptor_set_layout(self.set_layout, None);
            device.destroy_sampler(self.sampler, None);
        }
        for texture in self.textures {
            texture.destroy(ctx)?;
        }
        self.quad.destroy(ctx)?;

        info!("Demo resources released ({} allocations left)", ctx.num_allocs());
        Ok(())
    }
}

fn verify_quad(ctx: &DeviceContext, quad: &MeshAsset) -> anyhow::Result<()> {
    let (_, expected) = quad_geometry(2.0, 2.0, 0.0, 0.0);
    let indices = quad.read_indices(ctx).context("read back quad indices")?;
    anyhow::ensure!(
        indices == expected,
        "quad indices read back as {indices:?}, expected {expected:?}"
    );
    info!("Verified {} uploaded quad indices", indices.len());
    Ok(())
}

fn load_texture(ctx: &DeviceContext, config: &DemoConfig, index: u32) -> anyhow::Result<TextureAsset> {
    let path = config.texture_dir.join(format!("{index}.png"));
    if path.exists() {
        return TextureAsset::from_file(ctx, &path).with_context(|| format!("load {}", path.display()));
    }

    let color = PALETTE[index as usize % PALETTE.len()];
    let pixels = checkerboard(GENERATED_TEXTURE_SIZE, 8, color);
    TextureAsset::from_rgba8(ctx, GENERATED_TEXTURE_SIZE, GENERATED_TEXTURE_SIZE, &pixels)
        .with_context(|| format!("generate texture {index}"))
}

fn load_pipeline(
    ctx: &DeviceContext,
    config: &DemoConfig,
    render_pass: vk::RenderPass,
    set_layout: vk::DescriptorSetLayout,
) -> Option<QuadPipeline> {
    let vertex_path = config.shader_dir.join("vanilla_vertex.spv");
    let fragment_path = config.shader_dir.join("texture_array.spv");

    let loaded = vkh_platform::load_binary_file(&vertex_path)
        .and_then(|vert| Ok((vert, vkh_platform::load_binary_file(&fragment_path)?)));
    let (vert, frag) = match loaded {
        Ok(code) => code,
        Err(e) => {
            warn!("{e}; drawing clear color only");
            return None;
        }
    };

    match QuadPipeline::new(ctx, &vert, &frag, render_pass, set_layout) {
        Ok(pipeline) => Some(pipeline),
        Err(e) => {
            warn!("Quad pipeline unavailable: {e:#}");
            None
        }
    }
}
