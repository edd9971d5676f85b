//! Graphics pipeline builder
//!
//! A [`Pipeline`] owns every piece of its creation state: shader stages with
//! specialization constants, the vertex layout copied from a
//! [`VertexArray`], input assembly, rasterizer, depth-stencil, multisample,
//! blend, tessellation and dynamic state. [`Pipeline::clone_unbuilt`]
//! produces a linked sibling sharing the shader modules;
//! [`Pipeline::build_batch`] creates the whole family in a single
//! `vkCreateGraphicsPipelines` call against the context's persistent cache.

pub mod layout;

use std::ffi::CString;
use std::path::Path;
use std::sync::Arc;

use ash::vk;

use crate::context::VulkanContext;
use crate::error::{VulkanError, VulkanResult};
use crate::logging::LogLevel;
use crate::render::RenderMgr;
use crate::vertex::VertexArray;

const COLOR_ALL: vk::ColorComponentFlags = vk::ColorComponentFlags::from_raw(
    vk::ColorComponentFlags::R.as_raw()
        | vk::ColorComponentFlags::G.as_raw()
        | vk::ColorComponentFlags::B.as_raw()
        | vk::ColorComponentFlags::A.as_raw(),
);

/// No blending, source overwrites destination.
pub const BLEND_NONE: vk::PipelineColorBlendAttachmentState = vk::PipelineColorBlendAttachmentState {
    blend_enable: vk::FALSE,
    src_color_blend_factor: vk::BlendFactor::ONE,
    dst_color_blend_factor: vk::BlendFactor::ZERO,
    color_blend_op: vk::BlendOp::ADD,
    src_alpha_blend_factor: vk::BlendFactor::ONE,
    dst_alpha_blend_factor: vk::BlendFactor::ZERO,
    alpha_blend_op: vk::BlendOp::ADD,
    color_write_mask: COLOR_ALL,
};

/// Classic source-alpha blending.
pub const BLEND_SRC_ALPHA: vk::PipelineColorBlendAttachmentState =
    vk::PipelineColorBlendAttachmentState {
        blend_enable: vk::TRUE,
        src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
        dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        color_blend_op: vk::BlendOp::ADD,
        src_alpha_blend_factor: vk::BlendFactor::ONE,
        dst_alpha_blend_factor: vk::BlendFactor::ZERO,
        alpha_blend_op: vk::BlendOp::ADD,
        color_write_mask: COLOR_ALL,
    };

/// Blend weighted by what the destination alpha still allows.
pub const BLEND_DST_ALPHA: vk::PipelineColorBlendAttachmentState =
    vk::PipelineColorBlendAttachmentState {
        blend_enable: vk::TRUE,
        src_color_blend_factor: vk::BlendFactor::ONE_MINUS_DST_ALPHA,
        dst_color_blend_factor: vk::BlendFactor::DST_ALPHA,
        color_blend_op: vk::BlendOp::ADD,
        src_alpha_blend_factor: vk::BlendFactor::ZERO,
        dst_alpha_blend_factor: vk::BlendFactor::ONE,
        alpha_blend_op: vk::BlendOp::ADD,
        color_write_mask: COLOR_ALL,
    };

/// Additive blending.
pub const BLEND_ADD: vk::PipelineColorBlendAttachmentState = vk::PipelineColorBlendAttachmentState {
    blend_enable: vk::TRUE,
    src_color_blend_factor: vk::BlendFactor::ONE,
    dst_color_blend_factor: vk::BlendFactor::ONE,
    color_blend_op: vk::BlendOp::ADD,
    src_alpha_blend_factor: vk::BlendFactor::ZERO,
    dst_alpha_blend_factor: vk::BlendFactor::ONE,
    alpha_blend_op: vk::BlendOp::ADD,
    color_write_mask: COLOR_ALL,
};

struct OwnedModule {
    device: ash::Device,
    module: vk::ShaderModule,
}

impl Drop for OwnedModule {
    fn drop(&mut self) {
        unsafe { self.device.destroy_shader_module(self.module, None) };
    }
}

#[derive(Clone)]
struct ShaderStage {
    module: Arc<OwnedModule>,
    stage: vk::ShaderStageFlags,
    entry: CString,
    spec_entries: Vec<vk::SpecializationMapEntry>,
    spec_data: Vec<u8>,
}

/// Guess the shader stage from the conventional double extension
/// (`.vert.spv`, `.frag.spv`, ...).
fn stage_from_path(path: &Path) -> Option<vk::ShaderStageFlags> {
    let name = path.file_name()?.to_str()?;
    let stage = if name.contains(".vert") {
        vk::ShaderStageFlags::VERTEX
    } else if name.contains(".frag") {
        vk::ShaderStageFlags::FRAGMENT
    } else if name.contains(".geom") {
        vk::ShaderStageFlags::GEOMETRY
    } else if name.contains(".tesc") {
        vk::ShaderStageFlags::TESSELLATION_CONTROL
    } else if name.contains(".tese") {
        vk::ShaderStageFlags::TESSELLATION_EVALUATION
    } else if name.contains(".comp") {
        vk::ShaderStageFlags::COMPUTE
    } else {
        return None;
    };
    Some(stage)
}

/// Per-pipeline arena of the transient creation structs; filled for the
/// whole batch before any `VkGraphicsPipelineCreateInfo` points into it.
struct BuildData {
    stages: Vec<vk::PipelineShaderStageCreateInfo>,
    spec_infos: Vec<vk::SpecializationInfo>,
    vertex_input: vk::PipelineVertexInputStateCreateInfo,
    input_assembly: vk::PipelineInputAssemblyStateCreateInfo,
    viewport: vk::Viewport,
    scissor: vk::Rect2D,
    viewport_state: vk::PipelineViewportStateCreateInfo,
    rasterizer: vk::PipelineRasterizationStateCreateInfo,
    multisample: vk::PipelineMultisampleStateCreateInfo,
    depth_stencil: vk::PipelineDepthStencilStateCreateInfo,
    blend_attachment: vk::PipelineColorBlendAttachmentState,
    blend: vk::PipelineColorBlendStateCreateInfo,
    dynamic: vk::PipelineDynamicStateCreateInfo,
    tessellation: vk::PipelineTessellationStateCreateInfo,
}

/// Graphics pipeline under construction, then built.
pub struct Pipeline {
    ctx: Arc<VulkanContext>,
    render_pass: vk::RenderPass,
    subpass: u32,
    layout: vk::PipelineLayout,
    handle: vk::Pipeline,
    name: String,

    shaders: Vec<ShaderStage>,
    bindings: Vec<vk::VertexInputBindingDescription>,
    attributes: Vec<vk::VertexInputAttributeDescription>,
    dynamic_states: Vec<vk::DynamicState>,

    topology: vk::PrimitiveTopology,
    primitive_restart: bool,
    cull_mode: vk::CullModeFlags,
    front_face: vk::FrontFace,
    polygon_mode: vk::PolygonMode,
    line_width: f32,
    blend: vk::PipelineColorBlendAttachmentState,
    depth_test: bool,
    depth_write: bool,
    depth_compare: vk::CompareOp,
    samples: vk::SampleCountFlags,
    sample_shading: bool,
    patch_control_points: u32,
}

impl Pipeline {
    /// Start a pipeline for one subpass of a built render pass.
    pub fn new(
        ctx: &Arc<VulkanContext>,
        render: &RenderMgr,
        subpass: u32,
        layout: &layout::PipelineLayout,
        dynamic_states: Vec<vk::DynamicState>,
    ) -> Self {
        Self {
            ctx: Arc::clone(ctx),
            render_pass: render.handle(),
            subpass,
            layout: layout.handle(),
            handle: vk::Pipeline::null(),
            name: String::new(),
            shaders: Vec::new(),
            bindings: Vec::new(),
            attributes: Vec::new(),
            dynamic_states,
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            primitive_restart: false,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            polygon_mode: vk::PolygonMode::FILL,
            line_width: 1.0,
            blend: BLEND_SRC_ALPHA,
            depth_test: true,
            depth_write: true,
            depth_compare: vk::CompareOp::LESS_OR_EQUAL,
            samples: render.sample_count(subpass),
            sample_shading: false,
            patch_control_points: 0,
        }
    }

    /// Load a SPIR-V module, inferring the stage from the file name.
    pub fn bind_shader(&mut self, path: &Path, entry: &str) -> VulkanResult<()> {
        let stage = stage_from_path(path).ok_or_else(|| VulkanError::InvalidOperation {
            reason: format!("cannot infer shader stage of {}", path.display()),
        })?;
        self.bind_shader_stage(path, stage, entry)
    }

    /// Load a SPIR-V module for an explicit stage.
    pub fn bind_shader_stage(
        &mut self,
        path: &Path,
        stage: vk::ShaderStageFlags,
        entry: &str,
    ) -> VulkanResult<()> {
        let mut file = std::fs::File::open(path).map_err(|e| {
            self.ctx.put_log(
                &format!("Failed to open shader {}: {e}", path.display()),
                LogLevel::Error,
            );
            VulkanError::InitializationFailed(format!("missing shader {}", path.display()))
        })?;
        let code = ash::util::read_spv(&mut file)
            .map_err(|e| VulkanError::InitializationFailed(format!("invalid SPIR-V: {e}")))?;
        let info = vk::ShaderModuleCreateInfo::builder().code(&code);
        let module = unsafe {
            self.ctx
                .device()
                .create_shader_module(&info, None)
                .map_err(VulkanError::Api)?
        };
        self.shaders.push(ShaderStage {
            module: Arc::new(OwnedModule {
                device: self.ctx.device().clone(),
                module,
            }),
            stage,
            entry: CString::new(entry).unwrap_or_default(),
            spec_entries: Vec::new(),
            spec_data: Vec::new(),
        });
        Ok(())
    }

    /// Append a specialization constant to the last bound shader.
    pub fn set_specialized_constant(&mut self, constant_id: u32, data: &[u8]) {
        let shader = self
            .shaders
            .last_mut()
            .expect("bind a shader before specializing it");
        shader.spec_entries.push(vk::SpecializationMapEntry {
            constant_id,
            offset: shader.spec_data.len() as u32,
            size: data.len(),
        });
        shader.spec_data.extend_from_slice(data);
    }

    /// Copy the vertex layout of a [`VertexArray`].
    pub fn bind_vertex(&mut self, vertex: &VertexArray) {
        self.bindings = vertex.binding_descriptions().to_vec();
        self.attributes = vertex.attribute_descriptions().to_vec();
    }

    /// Drop a vertex input so it is no longer fed to the vertex shader.
    pub fn remove_vertex_entry(&mut self, location: u32) {
        self.attributes.retain(|a| a.location != location);
    }

    /// Enable or disable back-face culling.
    pub fn set_cull_mode(&mut self, enable: bool) {
        self.cull_mode = if enable {
            vk::CullModeFlags::BACK
        } else {
            vk::CullModeFlags::NONE
        };
    }

    /// Winding order of front faces.
    pub fn set_front_face(&mut self, clockwise: bool) {
        self.front_face = if clockwise {
            vk::FrontFace::CLOCKWISE
        } else {
            vk::FrontFace::COUNTER_CLOCKWISE
        };
    }

    /// Primitive topology, optionally with strip restarts.
    pub fn set_topology(&mut self, topology: vk::PrimitiveTopology, enable_strip_breaks: bool) {
        self.topology = topology;
        self.primitive_restart = enable_strip_breaks;
    }

    /// Color blend state of the subpass color attachment.
    pub fn set_blend_mode(&mut self, blend: vk::PipelineColorBlendAttachmentState) {
        self.blend = blend;
    }

    /// Depth test configuration.
    pub fn set_depth_stencil_mode(&mut self, test: bool, write: bool, compare: vk::CompareOp) {
        self.depth_test = test;
        self.depth_write = write;
        self.depth_compare = compare;
    }

    /// Number of control points per tessellation patch; zero disables
    /// tessellation state.
    pub fn set_tessellation_state(&mut self, patch_control_points: u32) {
        self.patch_control_points = patch_control_points;
    }

    /// Rasterized line width.
    pub fn set_line_width(&mut self, line_width: f32) {
        self.line_width = line_width;
    }

    /// Polygon fill mode.
    pub fn set_polygon_mode(&mut self, mode: vk::PolygonMode) {
        self.polygon_mode = mode;
    }

    /// Clone the unbuilt pipeline into a linked sibling sharing the shader
    /// modules. Shader binding and specialization must not be used on the
    /// clone; build the family with [`Pipeline::build_batch`].
    pub fn clone_unbuilt(&self, name: &str) -> Pipeline {
        Pipeline {
            ctx: Arc::clone(&self.ctx),
            render_pass: self.render_pass,
            subpass: self.subpass,
            layout: self.layout,
            handle: vk::Pipeline::null(),
            name: name.to_owned(),
            shaders: self.shaders.clone(),
            bindings: self.bindings.clone(),
            attributes: self.attributes.clone(),
            dynamic_states: self.dynamic_states.clone(),
            topology: self.topology,
            primitive_restart: self.primitive_restart,
            cull_mode: self.cull_mode,
            front_face: self.front_face,
            polygon_mode: self.polygon_mode,
            line_width: self.line_width,
            blend: self.blend,
            depth_test: self.depth_test,
            depth_write: self.depth_write,
            depth_compare: self.depth_compare,
            samples: self.samples,
            sample_shading: self.sample_shading,
            patch_control_points: self.patch_control_points,
        }
    }

    /// Build this pipeline alone.
    pub fn build(&mut self, name: &str) -> VulkanResult<()> {
        self.name = name.to_owned();
        let mut family = [self];
        Self::build_family(&mut family)
    }

    /// Build a family of pipelines in one `vkCreateGraphicsPipelines` call.
    pub fn build_batch(pipelines: &mut [Pipeline]) -> VulkanResult<()> {
        let mut family: Vec<&mut Pipeline> = pipelines.iter_mut().collect();
        Self::build_family(&mut family)
    }

    fn build_family(family: &mut [&mut Pipeline]) -> VulkanResult<()> {
        if family.is_empty() {
            return Ok(());
        }
        let ctx = Arc::clone(&family[0].ctx);
        let screen = ctx.viewport_state();
        // Fill the whole arena first so nothing moves once the create infos
        // start pointing into it
        let mut arena: Vec<BuildData> = family.iter().map(|p| p.build_data(&screen)).collect();
        for data in &mut arena {
            data.finalize();
        }
        let infos: Vec<vk::GraphicsPipelineCreateInfo> = family
            .iter()
            .zip(&arena)
            .map(|(pipeline, data)| {
                let mut info = vk::GraphicsPipelineCreateInfo::builder()
                    .stages(&data.stages)
                    .vertex_input_state(&data.vertex_input)
                    .input_assembly_state(&data.input_assembly)
                    .viewport_state(&data.viewport_state)
                    .rasterization_state(&data.rasterizer)
                    .multisample_state(&data.multisample)
                    .depth_stencil_state(&data.depth_stencil)
                    .color_blend_state(&data.blend)
                    .layout(pipeline.layout)
                    .render_pass(pipeline.render_pass)
                    .subpass(pipeline.subpass);
                if !pipeline.dynamic_states.is_empty() {
                    info = info.dynamic_state(&data.dynamic);
                }
                if pipeline.patch_control_points > 0 {
                    info = info.tessellation_state(&data.tessellation);
                }
                info.build()
            })
            .collect();
        let handles = unsafe {
            ctx.device()
                .create_graphics_pipelines(ctx.pipeline_cache(), &infos, None)
                .map_err(|(_, e)| {
                    ctx.put_log("Failed to build graphics pipelines", LogLevel::Error);
                    VulkanError::Api(e)
                })?
        };
        for (pipeline, handle) in family.iter_mut().zip(handles) {
            pipeline.handle = handle;
            if !pipeline.name.is_empty() {
                ctx.set_object_name(handle, vk::ObjectType::PIPELINE, &pipeline.name);
            }
        }
        Ok(())
    }

    fn build_data(&self, screen: &crate::context::swapchain::ViewportState) -> BuildData {
        let spec_infos: Vec<vk::SpecializationInfo> = self
            .shaders
            .iter()
            .map(|shader| {
                vk::SpecializationInfo::builder()
                    .map_entries(&shader.spec_entries)
                    .data(&shader.spec_data)
                    .build()
            })
            .collect();
        let stages = self
            .shaders
            .iter()
            .map(|shader| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(shader.stage)
                    .module(shader.module.module)
                    .name(&shader.entry)
                    .build()
            })
            .collect();
        BuildData {
            stages,
            spec_infos,
            vertex_input: vk::PipelineVertexInputStateCreateInfo::builder()
                .vertex_binding_descriptions(&self.bindings)
                .vertex_attribute_descriptions(&self.attributes)
                .build(),
            input_assembly: vk::PipelineInputAssemblyStateCreateInfo::builder()
                .topology(self.topology)
                .primitive_restart_enable(self.primitive_restart)
                .build(),
            viewport: screen.viewport,
            scissor: screen.scissor,
            viewport_state: vk::PipelineViewportStateCreateInfo::default(),
            rasterizer: vk::PipelineRasterizationStateCreateInfo::builder()
                .polygon_mode(self.polygon_mode)
                .cull_mode(self.cull_mode)
                .front_face(self.front_face)
                .line_width(self.line_width)
                .build(),
            multisample: vk::PipelineMultisampleStateCreateInfo::builder()
                .rasterization_samples(self.samples)
                .sample_shading_enable(self.sample_shading)
                .build(),
            depth_stencil: vk::PipelineDepthStencilStateCreateInfo::builder()
                .depth_test_enable(self.depth_test)
                .depth_write_enable(self.depth_write)
                .depth_compare_op(self.depth_compare)
                .build(),
            blend_attachment: self.blend,
            blend: vk::PipelineColorBlendStateCreateInfo::default(),
            dynamic: vk::PipelineDynamicStateCreateInfo::builder()
                .dynamic_states(&self.dynamic_states)
                .build(),
            tessellation: vk::PipelineTessellationStateCreateInfo::builder()
                .patch_control_points(self.patch_control_points)
                .build(),
        }
    }

    /// Bind in a command buffer; requires a built pipeline.
    pub fn bind(&self, cmd: vk::CommandBuffer) {
        unsafe {
            self.ctx
                .device()
                .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.handle);
        }
    }

    /// Pipeline handle.
    pub fn handle(&self) -> vk::Pipeline {
        self.handle
    }
}

impl BuildData {
    /// Wire the self-referential pointers once the arena entry has its final
    /// address.
    fn finalize(&mut self) {
        for (stage, spec) in self.stages.iter_mut().zip(&self.spec_infos) {
            if spec.map_entry_count > 0 {
                stage.p_specialization_info = spec;
            }
        }
        self.viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewports(std::slice::from_ref(&self.viewport))
            .scissors(std::slice::from_ref(&self.scissor))
            .build();
        self.blend = vk::PipelineColorBlendStateCreateInfo::builder()
            .attachments(std::slice::from_ref(&self.blend_attachment))
            .build();
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.handle != vk::Pipeline::null() {
            unsafe { self.ctx.device().destroy_pipeline(self.handle, None) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_inference_from_file_name() {
        assert_eq!(
            stage_from_path(Path::new("shaders/mesh.vert.spv")),
            Some(vk::ShaderStageFlags::VERTEX)
        );
        assert_eq!(
            stage_from_path(Path::new("lighting.frag.spv")),
            Some(vk::ShaderStageFlags::FRAGMENT)
        );
        assert_eq!(
            stage_from_path(Path::new("update.comp.spv")),
            Some(vk::ShaderStageFlags::COMPUTE)
        );
        assert_eq!(stage_from_path(Path::new("mystery.spv")), None);
    }

    #[test]
    fn test_blend_constants_write_all_channels() {
        for blend in [BLEND_NONE, BLEND_SRC_ALPHA, BLEND_DST_ALPHA, BLEND_ADD] {
            assert_eq!(blend.color_write_mask, COLOR_ALL);
        }
        assert_eq!(BLEND_NONE.blend_enable, vk::FALSE);
        assert_eq!(BLEND_ADD.dst_color_blend_factor, vk::BlendFactor::ONE);
    }
}
