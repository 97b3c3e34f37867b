//! Single-subpass render pass and per-image framebuffers.

use crate::error::{GpuError, Result};
use ash::vk;

/// Attachment descriptions: a cleared, stored color target that ends ready
/// for presentation, then an optional cleared depth target.
pub fn attachment_descriptions(
    color_format: vk::Format,
    depth_format: Option<vk::Format>,
) -> Vec<vk::AttachmentDescription> {
    let mut attachments = vec![vk::AttachmentDescription::default()
        .format(color_format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)];

    if let Some(format) = depth_format {
        attachments.push(
            vk::AttachmentDescription::default()
                .format(format)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::DONT_CARE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
        );
    }

    attachments
}

/// External-to-subpass dependency so the first write waits for the acquire.
pub fn external_dependency(with_depth: bool) -> vk::SubpassDependency {
    let (stages, access) = if with_depth {
        (
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )
    } else {
        (
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        )
    };

    vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(stages)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(stages)
        .dst_access_mask(access)
}

/// Create the render pass.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_render_pass(
    device: &ash::Device,
    color_format: vk::Format,
    depth_format: Option<vk::Format>,
) -> Result<vk::RenderPass> {
    let attachments = attachment_descriptions(color_format, depth_format);

    let color_refs = [vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];
    let depth_ref = vk::AttachmentReference {
        attachment: 1,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };

    let mut subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs);
    if depth_format.is_some() {
        subpass = subpass.depth_stencil_attachment(&depth_ref);
    }

    let subpasses = [subpass];
    let dependencies = [external_dependency(depth_format.is_some())];
    let render_pass_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    device
        .create_render_pass(&render_pass_info, None)
        .map_err(GpuError::step("create render pass"))
}

/// One framebuffer per color view, each sharing `depth_view` when given.
///
/// # Safety
/// The device, render pass and views must be valid and compatible.
pub unsafe fn create_framebuffers(
    device: &ash::Device,
    render_pass: vk::RenderPass,
    color_views: &[vk::ImageView],
    depth_view: Option<vk::ImageView>,
    extent: vk::Extent2D,
) -> Result<Vec<vk::Framebuffer>> {
    let mut framebuffers = Vec::with_capacity(color_views.len());

    for &view in color_views {
        let mut attachments = vec![view];
        attachments.extend(depth_view);

        let framebuffer_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(&attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        match device.create_framebuffer(&framebuffer_info, None) {
            Ok(framebuffer) => framebuffers.push(framebuffer),
            Err(e) => {
                destroy_framebuffers(device, &framebuffers);
                return Err(GpuError::step("create framebuffer")(e));
            }
        }
    }

    Ok(framebuffers)
}

/// # Safety
/// The framebuffers must not be in use.
pub unsafe fn destroy_framebuffers(device: &ash::Device, framebuffers: &[vk::Framebuffer]) {
    for &framebuffer in framebuffers {
        device.destroy_framebuffer(framebuffer, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_attachment_ends_presentable() {
        let attachments = attachment_descriptions(vk::Format::B8G8R8A8_UNORM, None);
        assert_eq!(attachments.len(), 1);
        let color = attachments[0];
        assert_eq!(color.load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(color.store_op, vk::AttachmentStoreOp::STORE);
        assert_eq!(color.initial_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(color.final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
    }

    #[test]
    fn depth_attachment_is_appended() {
        let attachments =
            attachment_descriptions(vk::Format::B8G8R8A8_UNORM, Some(vk::Format::D32_SFLOAT));
        assert_eq!(attachments.len(), 2);
        assert_eq!(attachments[1].format, vk::Format::D32_SFLOAT);
        assert_eq!(attachments[1].store_op, vk::AttachmentStoreOp::DONT_CARE);
    }

    #[test]
    fn dependency_waits_on_color_output() {
        let dep = external_dependency(false);
        assert_eq!(dep.src_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(dep.dst_subpass, 0);
        assert_eq!(dep.src_stage_mask, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
        assert_eq!(dep.dst_access_mask, vk::AccessFlags::COLOR_ATTACHMENT_WRITE);

        let with_depth = external_dependency(true);
        assert!(with_depth
            .dst_stage_mask
            .contains(vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS));
    }
}
