//! Texture: image, view, backing sub-memory and staging sub-buffer
//!
//! A texture starts on the CPU side as a staging sub-buffer carved from a
//! [`BufferMgr`] and moves to the GPU on first [`Texture::use_in`], which
//! records the upload, generates the mip chain by iterated blits and
//! transitions the image to its sampled layout. [`Texture::unuse`] releases
//! the GPU side, [`Texture::detach`] the staging side.
//!
//! Framebuffer attachments skip staging entirely and create their image
//! eagerly.

use std::sync::{Arc, Mutex};

use ash::vk;

use crate::buffer::{BufferMgr, SubBuffer};
use crate::context::VulkanContext;
use crate::error::{VulkanError, VulkanResult};
use crate::logging::LogLevel;
use crate::memory::SubMemory;

/// Number of mip levels of a full chain for the given extent.
fn mip_chain_length(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

struct TexState {
    image: vk::Image,
    view: vk::ImageView,
    memory: SubMemory,
    staging: SubBuffer,
    width: u32,
    height: u32,
    depth: u32,
    mip_levels: u32,
    channels: u32,
    elem_size: u32,
    aspect: vk::ImageAspectFlags,
    samples: vk::SampleCountFlags,
    on_cpu: bool,
    on_gpu: bool,
}

/// Sampled texture or framebuffer attachment.
pub struct Texture {
    ctx: Arc<VulkanContext>,
    mgr: Option<Arc<BufferMgr>>,
    name: String,
    format: vk::Format,
    usage: vk::ImageUsageFlags,
    image_type: vk::ImageType,
    state: Mutex<TexState>,
}

impl Texture {
    /// Create a framebuffer attachment: image, memory and view are created
    /// eagerly and there is no staging side.
    pub fn attachment(
        ctx: &Arc<VulkanContext>,
        width: u32,
        height: u32,
        samples: vk::SampleCountFlags,
        name: &str,
        usage: vk::ImageUsageFlags,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> VulkanResult<Self> {
        let texture = Self {
            ctx: Arc::clone(ctx),
            mgr: None,
            name: name.to_owned(),
            format,
            usage,
            image_type: vk::ImageType::TYPE_2D,
            state: Mutex::new(TexState {
                image: vk::Image::null(),
                view: vk::ImageView::null(),
                memory: SubMemory::default(),
                staging: SubBuffer::default(),
                width,
                height,
                depth: 1,
                mip_levels: 1,
                channels: 0,
                elem_size: 0,
                aspect,
                samples,
                on_cpu: false,
                on_gpu: false,
            }),
        };
        texture.create_image(&mut texture.state.lock().unwrap(), usage)?;
        texture.state.lock().unwrap().on_gpu = true;
        Ok(texture)
    }

    /// Create a sampled texture whose staging memory comes from `mgr`.
    pub fn new(
        ctx: &Arc<VulkanContext>,
        mgr: &Arc<BufferMgr>,
        usage: vk::ImageUsageFlags,
        name: &str,
        format: vk::Format,
        image_type: vk::ImageType,
    ) -> Self {
        Self {
            ctx: Arc::clone(ctx),
            mgr: Some(Arc::clone(mgr)),
            name: name.to_owned(),
            format,
            usage,
            image_type,
            state: Mutex::new(TexState {
                image: vk::Image::null(),
                view: vk::ImageView::null(),
                memory: SubMemory::default(),
                staging: SubBuffer::default(),
                width: 0,
                height: 0,
                depth: 1,
                mip_levels: 1,
                channels: 4,
                elem_size: 1,
                aspect: vk::ImageAspectFlags::COLOR,
                samples: vk::SampleCountFlags::TYPE_1,
                on_cpu: false,
                on_gpu: false,
            }),
        }
    }

    /// Allocate the staging side and optionally fill it. The GPU image is
    /// created lazily on first [`Texture::use_in`].
    pub fn init(
        &mut self,
        width: u32,
        height: u32,
        content: Option<&[u8]>,
        mipmap: bool,
        channels: u32,
        elem_size: u32,
    ) -> VulkanResult<()> {
        let mgr = self.mgr.as_ref().ok_or_else(|| VulkanError::InvalidOperation {
            reason: "attachments have no staging side".into(),
        })?;
        let state = self.state.get_mut().unwrap();
        state.width = width;
        state.height = height;
        state.channels = channels;
        state.elem_size = elem_size;
        state.mip_levels = if mipmap { mip_chain_length(width, height) } else { 1 };
        let size = width * height * channels * elem_size;
        state.staging = mgr.acquire(size, false)?;
        if let Some(content) = content {
            debug_assert!(content.len() as u32 <= size);
            mgr.write(&state.staging, content);
        }
        state.on_cpu = true;
        Ok(())
    }

    /// Host pointer into the staging sub-buffer.
    pub fn acquire_staging_ptr(&self) -> *mut u8 {
        let state = self.state.lock().unwrap();
        self.mgr
            .as_ref()
            .map(|mgr| mgr.ptr(&state.staging))
            .unwrap_or(std::ptr::null_mut())
    }

    fn create_image(&self, state: &mut TexState, usage: vk::ImageUsageFlags) -> VulkanResult<()> {
        let device = self.ctx.device();
        let info = vk::ImageCreateInfo::builder()
            .image_type(self.image_type)
            .format(self.format)
            .extent(vk::Extent3D {
                width: state.width,
                height: state.height,
                depth: state.depth,
            })
            .mip_levels(state.mip_levels)
            .array_layers(1)
            .samples(state.samples)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        state.image = unsafe { device.create_image(&info, None).map_err(VulkanError::Api)? };
        if !self.name.is_empty() {
            self.ctx
                .set_object_name(state.image, vk::ObjectType::IMAGE, &self.name);
        }

        let mut dedicated = vk::MemoryDedicatedRequirements::default();
        let mut requirements = vk::MemoryRequirements2::builder()
            .push_next(&mut dedicated)
            .build();
        let image_info = vk::ImageMemoryRequirementsInfo2::builder().image(state.image);
        unsafe { device.get_image_memory_requirements2(&image_info, &mut requirements) };
        let allocation = if dedicated.prefers_dedicated_allocation == vk::TRUE {
            let dedicated_info = vk::MemoryDedicatedAllocateInfo::builder()
                .image(state.image)
                .build();
            self.ctx.allocator().allocate_dedicated(
                &requirements.memory_requirements,
                &dedicated_info,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                vk::MemoryPropertyFlags::empty(),
            )
        } else {
            self.ctx.allocator().allocate(
                &requirements.memory_requirements,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                vk::MemoryPropertyFlags::empty(),
                0,
            )
        };
        state.memory = match allocation {
            Ok(memory) if !memory.is_null() => memory,
            Ok(_) | Err(_) => {
                unsafe { device.destroy_image(state.image, None) };
                state.image = vk::Image::null();
                self.ctx.put_log(
                    &format!("Failed to allocate memory for texture '{}'", self.name),
                    LogLevel::Error,
                );
                return Err(VulkanError::OutOfMemory {
                    requested: requirements.memory_requirements.size,
                });
            }
        };
        unsafe {
            device
                .bind_image_memory(state.image, state.memory.memory, state.memory.offset)
                .map_err(VulkanError::Api)?;
        }

        let view_type = match self.image_type {
            vk::ImageType::TYPE_1D => vk::ImageViewType::TYPE_1D,
            vk::ImageType::TYPE_3D => vk::ImageViewType::TYPE_3D,
            _ => vk::ImageViewType::TYPE_2D,
        };
        let view_info = vk::ImageViewCreateInfo::builder()
            .image(state.image)
            .view_type(view_type)
            .format(self.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: state.aspect,
                base_mip_level: 0,
                level_count: state.mip_levels,
                base_array_layer: 0,
                layer_count: 1,
            });
        state.view = unsafe {
            device
                .create_image_view(&view_info, None)
                .map_err(VulkanError::Api)?
        };
        Ok(())
    }

    fn transition(
        &self,
        cmd: vk::CommandBuffer,
        state: &TexState,
        base_mip: u32,
        mip_count: u32,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
    ) {
        let barrier = vk::ImageMemoryBarrier::builder()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(state.image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: state.aspect,
                base_mip_level: base_mip,
                level_count: mip_count,
                base_array_layer: 0,
                layer_count: 1,
            })
            .build();
        unsafe {
            self.ctx.device().cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }

    /// Record the upload of the staging content. With `include_transition`
    /// the mip chain is generated by iterated blits and the image ends in
    /// `SHADER_READ_ONLY_OPTIMAL`; without it the image is left in
    /// `TRANSFER_DST_OPTIMAL`. When the texture is already on the GPU the
    /// image is assumed to be in `TRANSFER_DST_OPTIMAL` and only the copy is
    /// recorded.
    pub fn use_in(&self, cmd: vk::CommandBuffer, include_transition: bool) -> VulkanResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.on_cpu {
            return Err(VulkanError::InvalidOperation {
                reason: format!("texture '{}' has no staging content", self.name),
            });
        }
        let first_upload = !state.on_gpu;
        if first_upload {
            let mut usage = self.usage | vk::ImageUsageFlags::TRANSFER_DST;
            if state.mip_levels > 1 {
                usage |= vk::ImageUsageFlags::TRANSFER_SRC;
            }
            self.create_image(&mut state, usage)?;
            state.on_gpu = true;
            self.transition(
                cmd,
                &state,
                0,
                vk::REMAINING_MIP_LEVELS,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::AccessFlags::empty(),
                vk::AccessFlags::TRANSFER_WRITE,
            );
        }

        let region = vk::BufferImageCopy {
            buffer_offset: vk::DeviceSize::from(state.staging.offset),
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: state.aspect,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
            image_extent: vk::Extent3D {
                width: state.width,
                height: state.height,
                depth: state.depth,
            },
        };
        unsafe {
            self.ctx.device().cmd_copy_buffer_to_image(
                cmd,
                state.staging.buffer,
                state.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }

        if include_transition && first_upload {
            if state.mip_levels > 1 {
                self.generate_mipmaps(cmd, &state);
            } else {
                self.transition(
                    cmd,
                    &state,
                    0,
                    1,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::FRAGMENT_SHADER,
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::AccessFlags::SHADER_READ,
                );
            }
        }
        Ok(())
    }

    fn generate_mipmaps(&self, cmd: vk::CommandBuffer, state: &TexState) {
        let mut src_width = state.width as i32;
        let mut src_height = state.height as i32;
        for level in 1..state.mip_levels {
            self.transition(
                cmd,
                state,
                level - 1,
                1,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::TRANSFER,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::TRANSFER_READ,
            );
            let dst_width = (src_width / 2).max(1);
            let dst_height = (src_height / 2).max(1);
            let blit = vk::ImageBlit {
                src_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: state.aspect,
                    mip_level: level - 1,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                src_offsets: [
                    vk::Offset3D { x: 0, y: 0, z: 0 },
                    vk::Offset3D {
                        x: src_width,
                        y: src_height,
                        z: 1,
                    },
                ],
                dst_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: state.aspect,
                    mip_level: level,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                dst_offsets: [
                    vk::Offset3D { x: 0, y: 0, z: 0 },
                    vk::Offset3D {
                        x: dst_width,
                        y: dst_height,
                        z: 1,
                    },
                ],
            };
            unsafe {
                self.ctx.device().cmd_blit_image(
                    cmd,
                    state.image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    state.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[blit],
                    vk::Filter::LINEAR,
                );
            }
            self.transition(
                cmd,
                state,
                level - 1,
                1,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::AccessFlags::TRANSFER_READ,
                vk::AccessFlags::SHADER_READ,
            );
            src_width = dst_width;
            src_height = dst_height;
        }
        // Last level was only ever a blit destination
        self.transition(
            cmd,
            state,
            state.mip_levels - 1,
            1,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::SHADER_READ,
        );
    }

    /// Release the GPU side; every previous binding becomes invalid.
    pub fn unuse(&self) {
        let mut state = self.state.lock().unwrap();
        if state.on_gpu {
            unsafe {
                self.ctx.device().destroy_image_view(state.view, None);
                self.ctx.device().destroy_image(state.image, None);
            }
            self.ctx.allocator().free(state.memory);
            state.view = vk::ImageView::null();
            state.image = vk::Image::null();
            state.memory = SubMemory::default();
            state.on_gpu = false;
        }
    }

    /// Release the staging side, assuming the last upload has completed.
    pub fn detach(&self) {
        let mut state = self.state.lock().unwrap();
        if state.on_cpu {
            if let Some(mgr) = &self.mgr {
                mgr.release(state.staging);
            }
            state.staging = SubBuffer::default();
            state.on_cpu = false;
        }
    }

    /// True while the staging side is allocated.
    pub fn is_on_cpu(&self) -> bool {
        self.state.lock().unwrap().on_cpu
    }

    /// True while the GPU image exists.
    pub fn is_on_gpu(&self) -> bool {
        self.state.lock().unwrap().on_gpu
    }

    /// Image handle; internal use.
    pub fn image(&self) -> vk::Image {
        self.state.lock().unwrap().image
    }

    /// Image view; internal use.
    pub fn view(&self) -> vk::ImageView {
        self.state.lock().unwrap().view
    }

    /// Image aspect.
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        self.state.lock().unwrap().aspect
    }

    /// Width and height.
    pub fn dimensions(&self) -> (u32, u32) {
        let state = self.state.lock().unwrap();
        (state.width, state.height)
    }

    /// Number of mip levels.
    pub fn mip_count(&self) -> u32 {
        self.state.lock().unwrap().mip_levels
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        self.unuse();
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mip_chain_length() {
        assert_eq!(mip_chain_length(1, 1), 1);
        assert_eq!(mip_chain_length(2, 2), 2);
        assert_eq!(mip_chain_length(256, 256), 9);
        assert_eq!(mip_chain_length(512, 256), 10);
        assert_eq!(mip_chain_length(1000, 600), 10);
    }
}
