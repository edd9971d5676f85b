//! Pipeline layout builder
//!
//! Accumulates descriptor-set-layout bindings per set, builds one set layout
//! per [`PipelineLayout::build_layout`] call (or borrows another layout's
//! set), tracks push-constant ranges, and finally produces the
//! `VkPipelineLayout`.
//!
//! Set and push-constant compatibility across layouts follows the Vulkan
//! pipeline-layout compatibility rules.

use std::sync::Arc;

use ash::vk;

use crate::context::VulkanContext;
use crate::descriptor::Set;
use crate::error::{VulkanError, VulkanResult};

/// Layout binding for a uniform, dynamic or not.
fn uniform_binding(
    stages: vk::ShaderStageFlags,
    binding: u32,
    array_size: u32,
    dynamic: bool,
) -> vk::DescriptorSetLayoutBinding {
    vk::DescriptorSetLayoutBinding::builder()
        .binding(binding)
        .descriptor_type(if dynamic {
            vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
        } else {
            vk::DescriptorType::UNIFORM_BUFFER
        })
        .descriptor_count(array_size)
        .stage_flags(stages)
        .build()
}

/// Layout binding for a storage buffer.
fn storage_buffer_binding(
    stages: vk::ShaderStageFlags,
    binding: u32,
    array_size: u32,
) -> vk::DescriptorSetLayoutBinding {
    vk::DescriptorSetLayoutBinding::builder()
        .binding(binding)
        .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
        .descriptor_count(array_size)
        .stage_flags(stages)
        .build()
}

/// Layout binding for a storage image.
fn storage_image_binding(binding: u32, stages: vk::ShaderStageFlags) -> vk::DescriptorSetLayoutBinding {
    vk::DescriptorSetLayoutBinding::builder()
        .binding(binding)
        .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
        .descriptor_count(1)
        .stage_flags(stages)
        .build()
}

/// Index of the first set layout this pipeline layout owns itself, falling
/// back to the first slot.
fn first_owned(owned: &[bool]) -> usize {
    owned.iter().position(|owned| *owned).unwrap_or_default()
}

/// Builder and owner of a pipeline layout.
pub struct PipelineLayout {
    ctx: Arc<VulkanContext>,
    layout: vk::PipelineLayout,
    bindings: Vec<vk::DescriptorSetLayoutBinding>,
    set_layouts: Vec<vk::DescriptorSetLayout>,
    /// Which entries of `set_layouts` this layout owns and must destroy
    owned: Vec<bool>,
    push_constants: Vec<vk::PushConstantRange>,
    /// Keeps immutable-sampler arrays alive until the set layouts are built
    cached_samplers: Vec<Vec<vk::Sampler>>,
}

impl PipelineLayout {
    /// Start an empty layout.
    pub fn new(ctx: &Arc<VulkanContext>) -> Self {
        Self {
            ctx: Arc::clone(ctx),
            layout: vk::PipelineLayout::null(),
            bindings: Vec::new(),
            set_layouts: Vec::new(),
            owned: Vec::new(),
            push_constants: Vec::new(),
            cached_samplers: Vec::new(),
        }
    }

    /// Declare a uniform binding in the set under construction.
    pub fn set_uniform_location(
        &mut self,
        stages: vk::ShaderStageFlags,
        binding: u32,
        array_size: u32,
        dynamic: bool,
    ) {
        self.bindings.push(uniform_binding(stages, binding, array_size, dynamic));
    }

    /// Declare a combined image sampler binding, optionally with an
    /// immutable sampler from the context's sampler cache.
    pub fn set_texture_location(
        &mut self,
        binding: u32,
        sampler_info: Option<&vk::SamplerCreateInfo>,
        stages: vk::ShaderStageFlags,
    ) -> VulkanResult<()> {
        self.set_texture_array_location(binding, 1, sampler_info, stages)
    }

    /// Declare an array of combined image samplers; every element shares the
    /// same immutable sampler when one is given.
    pub fn set_texture_array_location(
        &mut self,
        binding: u32,
        count: u32,
        sampler_info: Option<&vk::SamplerCreateInfo>,
        stages: vk::ShaderStageFlags,
    ) -> VulkanResult<()> {
        let mut builder = vk::DescriptorSetLayoutBinding::builder()
            .binding(binding)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(count)
            .stage_flags(stages);
        if let Some(info) = sampler_info {
            let sampler = self.ctx.get_sampler(info)?;
            self.cached_samplers.push(vec![sampler; count as usize]);
            builder = builder.immutable_samplers(self.cached_samplers.last().unwrap());
        }
        self.bindings.push(builder.build());
        Ok(())
    }

    /// Declare a storage image binding.
    pub fn set_image_location(&mut self, binding: u32, stages: vk::ShaderStageFlags) {
        self.bindings.push(storage_image_binding(binding, stages));
    }

    /// Declare a storage buffer binding.
    pub fn set_storage_buffer_location(
        &mut self,
        stages: vk::ShaderStageFlags,
        binding: u32,
        array_size: u32,
    ) {
        self.bindings.push(storage_buffer_binding(stages, binding, array_size));
    }

    /// Declare a push-constant range; the index of the range matches the
    /// call order for [`PipelineLayout::push_constant`].
    pub fn set_push_constant(&mut self, stages: vk::ShaderStageFlags, offset: u32, size: u32) {
        self.push_constants.push(vk::PushConstantRange {
            stage_flags: stages,
            offset,
            size,
        });
    }

    /// Build one set layout from the bindings accumulated since the last
    /// call.
    pub fn build_layout(&mut self, flags: vk::DescriptorSetLayoutCreateFlags) -> VulkanResult<()> {
        let info = vk::DescriptorSetLayoutCreateInfo::builder()
            .flags(flags)
            .bindings(&self.bindings);
        let layout = unsafe {
            self.ctx
                .device()
                .create_descriptor_set_layout(&info, None)
                .map_err(VulkanError::Api)?
        };
        self.set_layouts.push(layout);
        self.owned.push(true);
        self.bindings.clear();
        Ok(())
    }

    /// Borrow a set emplacement from another pipeline layout; `index` of
    /// `None` takes its first owned set.
    pub fn set_global_pipeline_layout(&mut self, other: &PipelineLayout, index: Option<usize>) {
        let idx = index.unwrap_or_else(|| first_owned(&other.owned));
        self.set_layouts.push(other.set_layouts[idx]);
        self.owned.push(false);
    }

    /// Build the pipeline layout.
    pub fn build(&mut self) -> VulkanResult<()> {
        let info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&self.set_layouts)
            .push_constant_ranges(&self.push_constants);
        self.layout = unsafe {
            self.ctx
                .device()
                .create_pipeline_layout(&info, None)
                .map_err(VulkanError::Api)?
        };
        Ok(())
    }

    /// Bind one set at the given index.
    pub fn bind_set(
        &self,
        cmd: vk::CommandBuffer,
        set: &mut Set,
        index: u32,
        bind_point: vk::PipelineBindPoint,
    ) -> VulkanResult<()> {
        let handle = set.get()?;
        unsafe {
            self.ctx.device().cmd_bind_descriptor_sets(
                cmd,
                bind_point,
                self.layout,
                index,
                &[handle],
                set.dynamic_offsets(),
            );
        }
        Ok(())
    }

    /// Bind several already-allocated sets starting at `first`.
    pub fn bind_sets(
        &self,
        cmd: vk::CommandBuffer,
        sets: &[vk::DescriptorSet],
        first: u32,
        bind_point: vk::PipelineBindPoint,
    ) {
        unsafe {
            self.ctx
                .device()
                .cmd_bind_descriptor_sets(cmd, bind_point, self.layout, first, sets, &[]);
        }
    }

    /// Push the constants of the range declared at `index`.
    pub fn push_constant(&self, cmd: vk::CommandBuffer, index: usize, data: &[u8]) {
        let range = &self.push_constants[index];
        unsafe {
            self.ctx
                .device()
                .cmd_push_constants(cmd, self.layout, range.stage_flags, range.offset, data);
        }
    }

    /// Pipeline layout handle.
    pub fn handle(&self) -> vk::PipelineLayout {
        self.layout
    }

    /// Set layout at `index`, defaulting to the first owned one.
    pub fn descriptor_layout(&self, index: Option<usize>) -> vk::DescriptorSetLayout {
        self.set_layouts[index.unwrap_or_else(|| first_owned(&self.owned))]
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        unsafe {
            if self.layout != vk::PipelineLayout::null() {
                self.ctx.device().destroy_pipeline_layout(self.layout, None);
            }
            for (layout, owned) in self.set_layouts.iter().zip(&self.owned) {
                if *owned {
                    self.ctx.device().destroy_descriptor_set_layout(*layout, None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_binding_switches_on_dynamic() {
        let plain = uniform_binding(vk::ShaderStageFlags::VERTEX, 0, 1, false);
        assert_eq!(plain.descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(plain.binding, 0);
        assert_eq!(plain.descriptor_count, 1);
        assert_eq!(plain.stage_flags, vk::ShaderStageFlags::VERTEX);

        let dynamic = uniform_binding(
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
            3,
            4,
            true,
        );
        assert_eq!(dynamic.descriptor_type, vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC);
        assert_eq!(dynamic.binding, 3);
        assert_eq!(dynamic.descriptor_count, 4);
    }

    #[test]
    fn test_storage_bindings() {
        let buffer = storage_buffer_binding(vk::ShaderStageFlags::COMPUTE, 1, 2);
        assert_eq!(buffer.descriptor_type, vk::DescriptorType::STORAGE_BUFFER);
        assert_eq!(buffer.descriptor_count, 2);

        let image = storage_image_binding(2, vk::ShaderStageFlags::COMPUTE);
        assert_eq!(image.descriptor_type, vk::DescriptorType::STORAGE_IMAGE);
        assert_eq!(image.descriptor_count, 1);
        assert_eq!(image.stage_flags, vk::ShaderStageFlags::COMPUTE);
    }

    #[test]
    fn test_first_owned_skips_borrowed_slots() {
        // A layout that borrowed a global set before building its own
        assert_eq!(first_owned(&[false, true, true]), 1);
        assert_eq!(first_owned(&[true]), 0);
        // Nothing owned: fall back to the first slot
        assert_eq!(first_owned(&[false, false]), 0);
        assert_eq!(first_owned(&[]), 0);
    }
}
