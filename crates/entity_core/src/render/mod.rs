//! Render-pass builder
//!
//! Stateful builder producing an immutable `VkRenderPass`: attachments are
//! appended and bound to *layers* (subpasses), dependencies are recorded
//! relative to the layer under construction, and `build` finalizes the pass
//! and pre-sizes the per-framebuffer begin state used by the frame
//! orchestrator.

use std::sync::{Arc, Mutex};

use ash::vk;

use crate::context::VulkanContext;
use crate::error::{VulkanError, VulkanResult};
use crate::logging::LogLevel;

#[derive(Default)]
struct Layer {
    input: Vec<vk::AttachmentReference>,
    color: Vec<vk::AttachmentReference>,
    depth: Vec<vk::AttachmentReference>,
    resolve: Vec<vk::AttachmentReference>,
    preserve: Vec<u32>,
    bind_point: vk::PipelineBindPoint,
}

/// Derive the attachment description from its boundary layouts: an undefined
/// initial layout means the previous content is irrelevant, an undefined
/// final layout means the content is discarded after the pass.
fn attachment_description(
    format: vk::Format,
    samples: vk::SampleCountFlags,
    initial_layout: vk::ImageLayout,
    final_layout: vk::ImageLayout,
) -> vk::AttachmentDescription {
    vk::AttachmentDescription {
        flags: vk::AttachmentDescriptionFlags::empty(),
        format,
        samples,
        load_op: if initial_layout == vk::ImageLayout::UNDEFINED {
            vk::AttachmentLoadOp::DONT_CARE
        } else {
            vk::AttachmentLoadOp::LOAD
        },
        store_op: if final_layout == vk::ImageLayout::UNDEFINED {
            vk::AttachmentStoreOp::DONT_CARE
        } else {
            vk::AttachmentStoreOp::STORE
        },
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout,
        final_layout,
    }
}

/// Retarget the dependencies recorded against the would-be next subpass to
/// `SUBPASS_EXTERNAL`; they describe what happens after the pass ends.
fn retarget_final_dependencies(deps: &mut [vk::SubpassDependency], pass_count: u32) {
    for dep in deps.iter_mut().rev() {
        if dep.dst_subpass != pass_count {
            break;
        }
        dep.dst_subpass = vk::SUBPASS_EXTERNAL;
    }
}

/// Builder and owner of one render pass.
pub struct RenderMgr {
    ctx: Arc<VulkanContext>,
    render_pass: vk::RenderPass,
    attachments: Vec<vk::AttachmentDescription>,
    samples: Vec<vk::SampleCountFlags>,
    layers: Vec<Layer>,
    dependencies: Vec<vk::SubpassDependency>,
    clears: Vec<vk::ClearValue>,
    begin_states: Mutex<Vec<Option<(vk::Framebuffer, vk::Rect2D)>>>,
    subpass: i32,
    pass_count: u32,
    built: bool,
}

// Clear values are unions of plain scalars; the begin state holds handles.
unsafe impl Send for RenderMgr {}
unsafe impl Sync for RenderMgr {}

impl RenderMgr {
    /// Start building a render pass.
    pub fn new(ctx: &Arc<VulkanContext>) -> Self {
        Self {
            ctx: Arc::clone(ctx),
            render_pass: vk::RenderPass::null(),
            attachments: Vec::new(),
            samples: Vec::new(),
            layers: vec![Layer {
                bind_point: vk::PipelineBindPoint::GRAPHICS,
                ..Layer::default()
            }],
            dependencies: Vec::new(),
            clears: Vec::new(),
            begin_states: Mutex::new(Vec::new()),
            subpass: -1,
            pass_count: 0,
            built: false,
        }
    }

    /// Attach a resource and return its attachment id.
    pub fn attach(
        &mut self,
        format: vk::Format,
        samples: vk::SampleCountFlags,
        initial_layout: vk::ImageLayout,
        final_layout: vk::ImageLayout,
    ) -> u32 {
        self.attachments
            .push(attachment_description(format, samples, initial_layout, final_layout));
        self.samples.push(samples);
        (self.attachments.len() - 1) as u32
    }

    fn clear_slot(&mut self, id: u32) -> &mut vk::ClearValue {
        let id = id as usize;
        self.attachments[id].load_op = vk::AttachmentLoadOp::CLEAR;
        if self.clears.len() <= id {
            self.clears.resize(id + 1, vk::ClearValue::default());
        }
        &mut self.clears[id]
    }

    /// Clear a color attachment to the given value at pass begin.
    pub fn setup_clear_color(&mut self, id: u32, color: [f32; 4]) {
        self.clear_slot(id).color = vk::ClearColorValue { float32: color };
    }

    /// Clear a depth attachment to the given value at pass begin.
    pub fn setup_clear_depth(&mut self, id: u32, depth: f32) {
        self.clear_slot(id).depth_stencil = vk::ClearDepthStencilValue { depth, stencil: 0 };
    }

    /// Record a dependency from a specific layer (or `None` for external) to
    /// the next layer.
    pub fn add_dependency_from(
        &mut self,
        from: Option<u32>,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
        framebuffer_local: bool,
    ) {
        self.dependencies.push(vk::SubpassDependency {
            src_subpass: from.unwrap_or(vk::SUBPASS_EXTERNAL),
            dst_subpass: (self.subpass + 1) as u32,
            src_stage_mask: src_stage,
            dst_stage_mask: dst_stage,
            src_access_mask: src_access,
            dst_access_mask: dst_access,
            dependency_flags: if framebuffer_local {
                vk::DependencyFlags::BY_REGION
            } else {
                vk::DependencyFlags::empty()
            },
        });
    }

    /// Record a dependency from the layer under construction to the next one.
    pub fn add_dependency(
        &mut self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
        framebuffer_local: bool,
    ) {
        let from = if self.subpass == -1 {
            None
        } else {
            Some(self.subpass as u32)
        };
        self.add_dependency_from(from, src_stage, dst_stage, src_access, dst_access, framebuffer_local);
    }

    /// Record a self-dependency inside the layer under construction.
    pub fn add_self_dependency(
        &mut self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
    ) {
        self.dependencies.push(vk::SubpassDependency {
            src_subpass: self.subpass as u32,
            dst_subpass: self.subpass as u32,
            src_stage_mask: src_stage,
            dst_stage_mask: dst_stage,
            src_access_mask: src_access,
            dst_access_mask: dst_access,
            dependency_flags: vk::DependencyFlags::BY_REGION,
        });
    }

    /// Bind an input attachment to the layer under construction.
    pub fn bind_input(&mut self, id: u32, layout: vk::ImageLayout) {
        self.layers.last_mut().unwrap().input.push(vk::AttachmentReference { attachment: id, layout });
    }

    /// Bind a color attachment to the layer under construction.
    pub fn bind_color(&mut self, id: u32, layout: vk::ImageLayout) {
        self.layers.last_mut().unwrap().color.push(vk::AttachmentReference { attachment: id, layout });
    }

    /// Bind the depth attachment of the layer under construction.
    pub fn bind_depth(&mut self, id: u32, layout: vk::ImageLayout) {
        self.layers.last_mut().unwrap().depth.push(vk::AttachmentReference { attachment: id, layout });
    }

    /// Bind the multisample resolve destination of the layer under construction.
    pub fn bind_resolve_dst(&mut self, id: u32, layout: vk::ImageLayout) {
        self.layers.last_mut().unwrap().resolve.push(vk::AttachmentReference { attachment: id, layout });
    }

    /// Preserve an attachment's content across the layer under construction.
    pub fn bind_preserve(&mut self, id: u32) {
        self.layers.last_mut().unwrap().preserve.push(id);
    }

    /// Close the layer under construction as a subpass.
    pub fn push_layer(&mut self, bind_point: vk::PipelineBindPoint) {
        self.layers.last_mut().unwrap().bind_point = bind_point;
        self.subpass += 1;
        self.layers.push(Layer::default());
    }

    /// Build the render pass and pre-size the begin state for
    /// `max_framebuffers` bindable framebuffers.
    pub fn build(&mut self, max_framebuffers: usize) -> VulkanResult<()> {
        self.subpass += 1;
        self.pass_count = self.subpass as u32;
        retarget_final_dependencies(&mut self.dependencies, self.pass_count);

        let subpasses: Vec<vk::SubpassDescription> = self.layers[..self.pass_count as usize]
            .iter()
            .map(|layer| {
                let mut desc = vk::SubpassDescription::builder()
                    .pipeline_bind_point(layer.bind_point)
                    .input_attachments(&layer.input)
                    .color_attachments(&layer.color)
                    .preserve_attachments(&layer.preserve);
                if !layer.resolve.is_empty() {
                    desc = desc.resolve_attachments(&layer.resolve);
                }
                if let Some(depth) = layer.depth.first() {
                    desc = desc.depth_stencil_attachment(depth);
                }
                desc.build()
            })
            .collect();

        let info = vk::RenderPassCreateInfo::builder()
            .attachments(&self.attachments)
            .subpasses(&subpasses)
            .dependencies(&self.dependencies);
        self.render_pass = unsafe {
            self.ctx
                .device()
                .create_render_pass(&info, None)
                .map_err(|e| {
                    self.ctx.put_log("Failed to build RenderPass", LogLevel::Error);
                    VulkanError::Api(e)
                })?
        };
        self.built = true;
        self.layers.clear();
        self.attachments.clear();
        self.dependencies.clear();
        *self.begin_states.lock().unwrap() = vec![None; max_framebuffers];
        Ok(())
    }

    /// Bind a framebuffer to a begin-state slot.
    pub fn bind(&self, bind_id: usize, framebuffer: vk::Framebuffer, render_area: vk::Rect2D) {
        self.begin_states.lock().unwrap()[bind_id] = Some((framebuffer, render_area));
    }

    /// Begin the render pass on the framebuffer bound at `bind_id`.
    pub fn begin(&self, bind_id: usize, cmd: vk::CommandBuffer, content: vk::SubpassContents) {
        let (framebuffer, render_area) = self.begin_states.lock().unwrap()[bind_id]
            .expect("framebuffer must be bound before use");
        let info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.render_pass)
            .framebuffer(framebuffer)
            .render_area(render_area)
            .clear_values(&self.clears);
        unsafe { self.ctx.device().cmd_begin_render_pass(cmd, &info, content) };
    }

    /// Advance to the next subpass.
    pub fn next(&self, cmd: vk::CommandBuffer, content: vk::SubpassContents) {
        unsafe { self.ctx.device().cmd_next_subpass(cmd, content) };
    }

    /// Number of subpasses after build.
    pub fn pass_count(&self) -> u32 {
        self.pass_count
    }

    /// Sample count of an attachment; single-sampled when out of range.
    pub fn sample_count(&self, attachment: u32) -> vk::SampleCountFlags {
        self.samples
            .get(attachment as usize)
            .copied()
            .unwrap_or(vk::SampleCountFlags::TYPE_1)
    }

    /// Render pass handle, for framebuffer creation and pipelines.
    pub fn handle(&self) -> vk::RenderPass {
        self.render_pass
    }
}

impl Drop for RenderMgr {
    fn drop(&mut self) {
        if self.built {
            unsafe { self.ctx.device().destroy_render_pass(self.render_pass, None) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attachment_ops_follow_boundary_layouts() {
        let kept = attachment_description(
            vk::Format::R8G8B8A8_UNORM,
            vk::SampleCountFlags::TYPE_1,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        assert_eq!(kept.load_op, vk::AttachmentLoadOp::LOAD);
        assert_eq!(kept.store_op, vk::AttachmentStoreOp::STORE);

        let transient = attachment_description(
            vk::Format::D24_UNORM_S8_UINT,
            vk::SampleCountFlags::TYPE_1,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::UNDEFINED,
        );
        assert_eq!(transient.load_op, vk::AttachmentLoadOp::DONT_CARE);
        assert_eq!(transient.store_op, vk::AttachmentStoreOp::DONT_CARE);
    }

    #[test]
    fn test_final_dependencies_are_retargeted() {
        let dep = |dst: u32| vk::SubpassDependency {
            src_subpass: 0,
            dst_subpass: dst,
            ..Default::default()
        };
        // Two subpasses: dependencies to subpass 2 were recorded "to next"
        // from the last layer and belong to the outside world.
        let mut deps = vec![dep(1), dep(2), dep(2)];
        retarget_final_dependencies(&mut deps, 2);
        assert_eq!(deps[0].dst_subpass, 1);
        assert_eq!(deps[1].dst_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(deps[2].dst_subpass, vk::SUBPASS_EXTERNAL);
    }

    #[test]
    fn test_retarget_stops_at_first_interior_dependency() {
        let dep = |dst: u32| vk::SubpassDependency {
            src_subpass: 0,
            dst_subpass: dst,
            ..Default::default()
        };
        let mut deps = vec![dep(3), dep(1), dep(3)];
        retarget_final_dependencies(&mut deps, 3);
        // Only the trailing run is retargeted
        assert_eq!(deps[0].dst_subpass, 3);
        assert_eq!(deps[1].dst_subpass, 1);
        assert_eq!(deps[2].dst_subpass, vk::SUBPASS_EXTERNAL);
    }
}
