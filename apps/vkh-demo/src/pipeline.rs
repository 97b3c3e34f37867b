//! Textured quad pipeline.

use anyhow::Context as _;
use ash::vk;
use vkh::{DeviceContext, Vertex};

/// Pipeline drawing a quad that samples one element of a texture array,
/// selected by a fragment-stage push constant.
pub struct QuadPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

impl QuadPipeline {
    pub fn new(
        ctx: &DeviceContext,
        vertex_spirv: &[u8],
        fragment_spirv: &[u8],
        render_pass: vk::RenderPass,
        set_layout: vk::DescriptorSetLayout,
    ) -> anyhow::Result<Self> {
        let vert_module = ctx
            .create_shader_module(vertex_spirv)
            .context("vertex shader")?;
        let frag_module = match ctx.create_shader_module(fragment_spirv) {
            Ok(module) => module,
            Err(e) => {
                ctx.destroy_shader_module(vert_module);
                return Err(anyhow::Error::new(e).context("fragment shader"));
            }
        };

        let result = unsafe { Self::build(ctx.device(), vert_module, frag_module, render_pass, set_layout) };

        // Modules are no longer needed once the pipeline exists
        ctx.destroy_shader_module(vert_module);
        ctx.destroy_shader_module(frag_module);
        result
    }

    unsafe fn build(
        device: &ash::Device,
        vert_module: vk::ShaderModule,
        frag_module: vk::ShaderModule,
        render_pass: vk::RenderPass,
        set_layout: vk::DescriptorSetLayout,
    ) -> anyhow::Result<Self> {
        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vert_module)
                .name(c"main"),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(frag_module)
                .name(c"main"),
        ];

        let bindings = [Vertex::binding_description()];
        let attributes = Vertex::attribute_descriptions();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        // Viewport (dynamic)
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(false)
            .color_write_mask(vk::ColorComponentFlags::RGBA)];
        let color_blending =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&color_blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let set_layouts = [set_layout];
        let push_constant_ranges = [vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::FRAGMENT,
            offset: 0,
            size: std::mem::size_of::<u32>() as u32,
        }];
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constant_ranges);
        let layout = device
            .create_pipeline_layout(&layout_info, None)
            .context("create pipeline layout")?;

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisampling)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(render_pass)
            .subpass(0);

        match device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None) {
            Ok(pipelines) => Ok(Self {
                pipeline: pipelines[0],
                layout,
            }),
            Err((_pipelines, e)) => {
                device.destroy_pipeline_layout(layout, None);
                Err(anyhow::anyhow!("create graphics pipeline: {e}"))
            }
        }
    }

    /// Bind the pipeline, descriptor set and texture index, and set the
    /// viewport to `extent`.
    ///
    /// # Safety
    /// `cmd` must be recording inside a compatible render pass.
    pub unsafe fn bind(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        set: vk::DescriptorSet,
        texture_index: u32,
        extent: vk::Extent2D,
    ) {
        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline);
        device.cmd_set_viewport(
            cmd,
            0,
            &[vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            }],
        );
        device.cmd_set_scissor(
            cmd,
            0,
            &[vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            }],
        );
        device.cmd_push_constants(
            cmd,
            self.layout,
            vk::ShaderStageFlags::FRAGMENT,
            0,
            &texture_index.to_ne_bytes(),
        );
        device.cmd_bind_descriptor_sets(
            cmd,
            vk::PipelineBindPoint::GRAPHICS,
            self.layout,
            0,
            &[set],
            &[],
        );
    }

    /// # Safety
    /// The pipeline must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_pipeline(self.pipeline, None);
        device.destroy_pipeline_layout(self.layout, None);
    }
}
