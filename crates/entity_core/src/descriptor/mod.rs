//! Descriptor pool manager and descriptor sets
//!
//! A [`SetMgr`] owns one descriptor pool sized by capacity per descriptor
//! kind, plus a reclaim queue for temporary sets which is drained only by
//! [`SetMgr::update`]. A [`Set`] records its bindings lazily and flushes
//! them in a single `vkUpdateDescriptorSets` on first use; a push-only set
//! skips the pool entirely and goes through the push-descriptor entry point.
//!
//! A set must not be updated while a command buffer that binds it may still
//! execute.

use std::sync::{Arc, Mutex};

use ash::vk;

use crate::buffer::SubBuffer;
use crate::context::VulkanContext;
use crate::error::{VulkanError, VulkanResult};
use crate::texture::Texture;

/// Descriptor pool with a reclaim queue for temporary sets.
pub struct SetMgr {
    ctx: Arc<VulkanContext>,
    pool: vk::DescriptorPool,
    reclaim: Mutex<Vec<vk::DescriptorSet>>,
}

impl SetMgr {
    /// Create the pool. Capacities of zero skip the corresponding descriptor
    /// kind. `temporary_sets` allows individual sets to be returned to the
    /// pool.
    pub fn new(
        ctx: &Arc<VulkanContext>,
        max_sets: u32,
        max_uniforms: u32,
        max_textures: u32,
        max_storage_buffers: u32,
        temporary_sets: bool,
    ) -> VulkanResult<Self> {
        let mut sizes = Vec::new();
        if max_uniforms > 0 {
            sizes.push(vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: max_uniforms,
            });
        }
        if max_textures > 0 {
            sizes.push(vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: max_textures,
            });
        }
        if max_storage_buffers > 0 {
            sizes.push(vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: max_storage_buffers,
            });
        }
        let info = vk::DescriptorPoolCreateInfo::builder()
            .flags(if temporary_sets {
                vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET
            } else {
                vk::DescriptorPoolCreateFlags::empty()
            })
            .max_sets(max_sets)
            .pool_sizes(&sizes);
        let pool = unsafe {
            ctx.device()
                .create_descriptor_pool(&info, None)
                .map_err(VulkanError::Api)?
        };
        Ok(Self {
            ctx: Arc::clone(ctx),
            pool,
            reclaim: Mutex::new(Vec::new()),
        })
    }

    /// Queue a set for destruction; internal use.
    pub(crate) fn destroy_set(&self, set: vk::DescriptorSet) {
        self.reclaim.lock().unwrap().push(set);
    }

    /// Drain the reclaim queue, returning the queued sets to the pool. Call
    /// from the owning thread once the sets are no longer referenced by any
    /// pending command buffer.
    pub fn update(&self) {
        let sets: Vec<_> = std::mem::take(&mut *self.reclaim.lock().unwrap());
        if !sets.is_empty() {
            unsafe {
                let _ = self.ctx.device().free_descriptor_sets(self.pool, &sets);
            }
        }
    }

    /// Pool handle; internal use.
    pub(crate) fn pool(&self) -> vk::DescriptorPool {
        self.pool
    }
}

impl Drop for SetMgr {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device().destroy_descriptor_pool(self.pool, None);
        }
    }
}

enum BindingInfo {
    Buffer(vk::DescriptorBufferInfo),
    Image(vk::DescriptorImageInfo),
}

struct Recorded {
    binding: u32,
    ty: vk::DescriptorType,
    info: BindingInfo,
}

/// Buffer descriptor over a sub-buffer; `range` of `None` covers the whole
/// sub-buffer past `offset`.
fn buffer_descriptor_info(
    buffer: &SubBuffer,
    range: Option<u32>,
    offset: u32,
) -> vk::DescriptorBufferInfo {
    vk::DescriptorBufferInfo {
        buffer: buffer.buffer,
        offset: vk::DeviceSize::from(buffer.offset + offset),
        range: vk::DeviceSize::from(range.unwrap_or(buffer.size - offset)),
    }
}

/// Turn the recorded bindings into write descriptors against `dst`. The
/// writes point back into `pending`, which must stay in place until they are
/// consumed.
fn build_writes(dst: vk::DescriptorSet, pending: &[Recorded]) -> Vec<vk::WriteDescriptorSet> {
    pending
        .iter()
        .map(|record| {
            let mut write = vk::WriteDescriptorSet::builder()
                .dst_set(dst)
                .dst_binding(record.binding)
                .descriptor_type(record.ty);
            match &record.info {
                BindingInfo::Buffer(info) => {
                    write = write.buffer_info(std::slice::from_ref(info));
                }
                BindingInfo::Image(info) => {
                    write = write.image_info(std::slice::from_ref(info));
                }
            }
            write.build()
        })
        .collect()
}

/// A descriptor set recording bindings against a set layout.
pub struct Set {
    ctx: Arc<VulkanContext>,
    mgr: Option<Arc<SetMgr>>,
    layout: vk::DescriptorSetLayout,
    set: vk::DescriptorSet,
    writes: Vec<Recorded>,
    dynamic_offsets: Vec<u32>,
    flushed: usize,
    temporary: bool,
}

impl Set {
    /// Create a bindable set allocated from `mgr` against `layout`.
    /// Temporary sets return their descriptor to the pool on drop, through
    /// the manager's reclaim queue.
    pub fn new(
        ctx: &Arc<VulkanContext>,
        mgr: &Arc<SetMgr>,
        layout: vk::DescriptorSetLayout,
        temporary: bool,
    ) -> Self {
        Self {
            ctx: Arc::clone(ctx),
            mgr: Some(Arc::clone(mgr)),
            layout,
            set: vk::DescriptorSet::null(),
            writes: Vec::new(),
            dynamic_offsets: Vec::new(),
            flushed: 0,
            temporary,
        }
    }

    /// Create a push-only set; it records bindings but never allocates from
    /// a pool, and is bound with [`Set::push`].
    pub fn new_push(ctx: &Arc<VulkanContext>) -> Self {
        Self {
            ctx: Arc::clone(ctx),
            mgr: None,
            layout: vk::DescriptorSetLayout::null(),
            set: vk::DescriptorSet::null(),
            writes: Vec::new(),
            dynamic_offsets: Vec::new(),
            flushed: 0,
            temporary: false,
        }
    }

    /// Bind a uniform sub-buffer; `range` of `None` covers the whole
    /// sub-buffer.
    pub fn bind_uniform(&mut self, buffer: &SubBuffer, binding: u32, range: Option<u32>, offset: u32) {
        self.writes.push(Recorded {
            binding,
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            info: BindingInfo::Buffer(buffer_descriptor_info(buffer, range, offset)),
        });
    }

    /// Bind a dynamic uniform; the draw-time offset is appended to the
    /// dynamic-offset list in binding order.
    pub fn bind_dynamic_uniform(&mut self, buffer: &SubBuffer, binding: u32, range: u32) {
        self.writes.push(Recorded {
            binding,
            ty: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            info: BindingInfo::Buffer(vk::DescriptorBufferInfo {
                buffer: buffer.buffer,
                offset: vk::DeviceSize::from(buffer.offset),
                range: vk::DeviceSize::from(range),
            }),
        });
        self.dynamic_offsets.push(0);
    }

    /// Bind a texture at its sampled layout.
    pub fn bind_texture(&mut self, texture: &Texture, binding: u32, layout: vk::ImageLayout) {
        self.bind_combined_image(texture.view(), vk::Sampler::null(), binding, layout);
    }

    /// Bind an image view / sampler pair.
    pub fn bind_combined_image(
        &mut self,
        view: vk::ImageView,
        sampler: vk::Sampler,
        binding: u32,
        layout: vk::ImageLayout,
    ) {
        self.writes.push(Recorded {
            binding,
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            info: BindingInfo::Image(vk::DescriptorImageInfo {
                sampler,
                image_view: view,
                image_layout: layout,
            }),
        });
    }

    /// Bind a storage sub-buffer.
    pub fn bind_storage_buffer(&mut self, buffer: &SubBuffer, binding: u32, range: u32, offset: u32) {
        self.writes.push(Recorded {
            binding,
            ty: vk::DescriptorType::STORAGE_BUFFER,
            info: BindingInfo::Buffer(buffer_descriptor_info(buffer, Some(range), offset)),
        });
    }

    /// Set the draw-time offset of a dynamic uniform.
    pub fn set_dynamic_offset(&mut self, index: usize, offset: u32) {
        self.dynamic_offsets[index] = offset;
    }

    /// Dynamic offsets in binding order; internal use.
    pub(crate) fn dynamic_offsets(&self) -> &[u32] {
        &self.dynamic_offsets
    }

    /// Descriptor set handle, allocating and flushing the recorded bindings
    /// on first use.
    pub fn get(&mut self) -> VulkanResult<vk::DescriptorSet> {
        if self.set == vk::DescriptorSet::null() {
            let mgr = self.mgr.as_ref().ok_or_else(|| VulkanError::InvalidOperation {
                reason: "a push-only set cannot be allocated".into(),
            })?;
            let layouts = [self.layout];
            let info = vk::DescriptorSetAllocateInfo::builder()
                .descriptor_pool(mgr.pool())
                .set_layouts(&layouts);
            self.set = unsafe {
                self.ctx
                    .device()
                    .allocate_descriptor_sets(&info)
                    .map_err(VulkanError::Api)?[0]
            };
        }
        self.update();
        Ok(self.set)
    }

    /// Flush recorded bindings not written yet.
    pub fn update(&mut self) {
        if self.flushed == self.writes.len() || self.set == vk::DescriptorSet::null() {
            return;
        }
        let writes = build_writes(self.set, &self.writes[self.flushed..]);
        unsafe { self.ctx.device().update_descriptor_sets(&writes, &[]) };
        self.flushed = self.writes.len();
    }

    /// Push the recorded bindings directly into the command buffer; requires
    /// the push-descriptor extension.
    pub fn push(
        &self,
        cmd: vk::CommandBuffer,
        pipeline_layout: vk::PipelineLayout,
        set_index: u32,
        bind_point: vk::PipelineBindPoint,
    ) -> VulkanResult<()> {
        let loader = self
            .ctx
            .push_descriptor()
            .ok_or_else(|| VulkanError::InvalidOperation {
                reason: "push descriptors are not available on this device".into(),
            })?;
        let writes = build_writes(vk::DescriptorSet::null(), &self.writes);
        unsafe { loader.cmd_push_descriptor_set(cmd, bind_point, pipeline_layout, set_index, &writes) };
        Ok(())
    }

    /// Drop every recorded binding, for push-only reuse.
    pub fn clear(&mut self) {
        self.writes.clear();
        self.dynamic_offsets.clear();
        self.flushed = 0;
    }

    /// Hand the descriptor back to the pool; requires a temporary set.
    pub fn uninit(&mut self) {
        debug_assert!(self.temporary, "only temporary sets may be uninitialized");
        if self.set != vk::DescriptorSet::null() {
            if let Some(mgr) = &self.mgr {
                mgr.destroy_set(self.set);
            }
            self.set = vk::DescriptorSet::null();
            self.flushed = 0;
        }
    }
}

impl Drop for Set {
    fn drop(&mut self) {
        if self.temporary {
            self.uninit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn sub(buffer: u64, offset: u32, size: u32) -> SubBuffer {
        SubBuffer {
            buffer: vk::Buffer::from_raw(buffer),
            offset,
            size,
        }
    }

    #[test]
    fn test_buffer_info_defaults_to_remaining_range() {
        let info = buffer_descriptor_info(&sub(1, 256, 128), None, 0);
        assert_eq!(info.buffer, vk::Buffer::from_raw(1));
        assert_eq!(info.offset, 256);
        assert_eq!(info.range, 128);
    }

    #[test]
    fn test_buffer_info_applies_offset_and_range() {
        let info = buffer_descriptor_info(&sub(1, 256, 128), Some(32), 64);
        assert_eq!(info.offset, 320);
        assert_eq!(info.range, 32);
        // No explicit range: whatever remains past the offset
        let rest = buffer_descriptor_info(&sub(1, 256, 128), None, 64);
        assert_eq!(rest.range, 64);
    }

    #[test]
    fn test_build_writes_maps_buffer_and_image_records() {
        let set = vk::DescriptorSet::from_raw(9);
        let pending = [
            Recorded {
                binding: 0,
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                info: BindingInfo::Buffer(buffer_descriptor_info(&sub(1, 0, 64), None, 0)),
            },
            Recorded {
                binding: 2,
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                info: BindingInfo::Image(vk::DescriptorImageInfo {
                    sampler: vk::Sampler::from_raw(3),
                    image_view: vk::ImageView::from_raw(4),
                    image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                }),
            },
        ];
        let writes = build_writes(set, &pending);
        assert_eq!(writes.len(), 2);

        assert_eq!(writes[0].dst_set, set);
        assert_eq!(writes[0].dst_binding, 0);
        assert_eq!(writes[0].descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(writes[0].descriptor_count, 1);
        let buffer_info = unsafe { *writes[0].p_buffer_info };
        assert_eq!(buffer_info.buffer, vk::Buffer::from_raw(1));
        assert_eq!(buffer_info.range, 64);

        assert_eq!(writes[1].dst_binding, 2);
        assert_eq!(
            writes[1].descriptor_type,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );
        let image_info = unsafe { *writes[1].p_image_info };
        assert_eq!(image_info.image_view, vk::ImageView::from_raw(4));
        assert_eq!(image_info.image_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }

    #[test]
    fn test_build_writes_against_null_set_for_push() {
        let pending = [Recorded {
            binding: 1,
            ty: vk::DescriptorType::STORAGE_BUFFER,
            info: BindingInfo::Buffer(buffer_descriptor_info(&sub(5, 0, 256), Some(128), 0)),
        }];
        let writes = build_writes(vk::DescriptorSet::null(), &pending);
        assert_eq!(writes[0].dst_set, vk::DescriptorSet::null());
        assert_eq!(writes[0].descriptor_type, vk::DescriptorType::STORAGE_BUFFER);
        let buffer_info = unsafe { *writes[0].p_buffer_info };
        assert_eq!(buffer_info.range, 128);
    }
}

