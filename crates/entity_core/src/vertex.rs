//! Vertex layout and typed vertex sub-buffers
//!
//! A [`VertexArray`] records binding and attribute descriptions for pipeline
//! creation. A [`VertexBuffer`] is a sub-buffer whose offset is expressed in
//! vertices, so indexed draws can switch models through `vertexOffset`
//! without rebinding anything.

use std::sync::Arc;

use ash::vk;

use crate::buffer::{BufferMgr, SubBuffer};
use crate::error::VulkanResult;

/// Byte size of the vertex-attribute formats the layout recorder accepts.
fn format_size(format: vk::Format) -> u32 {
    match format {
        vk::Format::R8_UNORM | vk::Format::R8_UINT | vk::Format::R8_SINT => 1,
        vk::Format::R8G8_UNORM | vk::Format::R16_SFLOAT | vk::Format::R16_UINT => 2,
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_UINT
        | vk::Format::R16G16_SFLOAT
        | vk::Format::R32_SFLOAT
        | vk::Format::R32_UINT
        | vk::Format::R32_SINT => 4,
        vk::Format::R16G16B16A16_SFLOAT | vk::Format::R32G32_SFLOAT | vk::Format::R32G32_UINT => 8,
        vk::Format::R32G32B32_SFLOAT | vk::Format::R32G32B32_UINT => 12,
        vk::Format::R32G32B32A32_SFLOAT | vk::Format::R32G32B32A32_UINT => 16,
        _ => 0,
    }
}

/// Recorder of vertex bindings and attributes.
pub struct VertexArray {
    bindings: Vec<vk::VertexInputBindingDescription>,
    attributes: Vec<vk::VertexInputAttributeDescription>,
    location: u32,
    offset: u32,
}

impl Default for VertexArray {
    fn default() -> Self {
        Self::new()
    }
}

impl VertexArray {
    /// Start an empty layout.
    pub fn new() -> Self {
        Self {
            bindings: Vec::new(),
            attributes: Vec::new(),
            location: 0,
            offset: 0,
        }
    }

    /// Open a binding entry matching one vertex-buffer binding.
    pub fn create_binding_entry(&mut self, stride: u32, rate: vk::VertexInputRate) -> u32 {
        let binding = self.bindings.len() as u32;
        self.bindings.push(vk::VertexInputBindingDescription {
            binding,
            stride,
            input_rate: rate,
        });
        self.offset = 0;
        binding
    }

    /// Append an input to the last opened binding entry. Unused inputs still
    /// advance the offset so the host layout stays in step with the shader.
    pub fn add_input(&mut self, format: vk::Format, used: bool) -> bool {
        let Some(binding) = self.bindings.last() else {
            return false;
        };
        if used {
            self.attributes.push(vk::VertexInputAttributeDescription {
                location: self.location,
                binding: binding.binding,
                format,
                offset: self.offset,
            });
            self.location += 1;
        }
        self.offset += format_size(format);
        true
    }

    /// Drop a previously added input so it is no longer fed to the shader.
    pub fn remove_entry(&mut self, location: u32) {
        self.attributes.retain(|a| a.location != location);
    }

    /// Binding descriptions for pipeline creation.
    pub fn binding_descriptions(&self) -> &[vk::VertexInputBindingDescription] {
        &self.bindings
    }

    /// Attribute descriptions for pipeline creation.
    pub fn attribute_descriptions(&self) -> &[vk::VertexInputAttributeDescription] {
        &self.attributes
    }

    /// Stride of one binding entry.
    pub fn stride(&self, binding: u32) -> u32 {
        self.bindings[binding as usize].stride
    }

    /// Carve a vertex buffer of `vertex_count` vertices matching a binding
    /// entry out of the given buffer manager.
    pub fn create_buffer(
        &self,
        binding: u32,
        vertex_count: u32,
        mgr: &Arc<BufferMgr>,
    ) -> VulkanResult<VertexBuffer> {
        let stride = self.stride(binding);
        let sub = mgr.acquire(stride * vertex_count, false)?;
        Ok(VertexBuffer {
            mgr: Arc::clone(mgr),
            buffer: sub,
            binding,
            stride,
            vertex_count,
        })
    }
}

/// A sub-buffer with vertex-granular offset semantics.
pub struct VertexBuffer {
    mgr: Arc<BufferMgr>,
    buffer: SubBuffer,
    binding: u32,
    stride: u32,
    vertex_count: u32,
}

impl VertexBuffer {
    /// Offset in vertices, usable as `vertexOffset` of an indexed draw.
    pub fn vertex_offset(&self) -> i32 {
        (self.buffer.offset / self.stride) as i32
    }

    /// Offset in bytes inside the backing buffer.
    pub fn byte_offset(&self) -> vk::DeviceSize {
        vk::DeviceSize::from(self.buffer.offset)
    }

    /// Underlying sub-buffer.
    pub fn sub_buffer(&self) -> &SubBuffer {
        &self.buffer
    }

    /// Number of vertices.
    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    /// Copy vertex data through the host mapping.
    pub fn write<T: bytemuck::Pod>(&self, vertices: &[T]) {
        self.mgr.write(&self.buffer, vertices);
    }

    /// Bind at the recorded binding index. The whole backing buffer is bound
    /// at offset zero so the vertex offset stays meaningful across models.
    pub fn bind(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        unsafe {
            device.cmd_bind_vertex_buffers(cmd, self.binding, &[self.buffer.buffer], &[0]);
        }
    }
}

impl Drop for VertexBuffer {
    fn drop(&mut self) {
        self.mgr.release(self.buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_offsets_accumulate() {
        let mut va = VertexArray::new();
        va.create_binding_entry(32, vk::VertexInputRate::VERTEX);
        va.add_input(vk::Format::R32G32B32_SFLOAT, true); // position
        va.add_input(vk::Format::R32G32B32_SFLOAT, true); // normal
        va.add_input(vk::Format::R32G32_SFLOAT, true); // uv
        let attrs = va.attribute_descriptions();
        assert_eq!(attrs.len(), 3);
        assert_eq!(attrs[0].offset, 0);
        assert_eq!(attrs[1].offset, 12);
        assert_eq!(attrs[2].offset, 24);
        assert_eq!(attrs[2].location, 2);
    }

    #[test]
    fn test_unused_input_advances_offset_only() {
        let mut va = VertexArray::new();
        va.create_binding_entry(24, vk::VertexInputRate::VERTEX);
        va.add_input(vk::Format::R32G32B32_SFLOAT, true);
        va.add_input(vk::Format::R32G32_SFLOAT, false);
        va.add_input(vk::Format::R32_SFLOAT, true);
        let attrs = va.attribute_descriptions();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[1].offset, 20);
        assert_eq!(attrs[1].location, 1);
    }

    #[test]
    fn test_instance_binding_restarts_offset() {
        let mut va = VertexArray::new();
        va.create_binding_entry(12, vk::VertexInputRate::VERTEX);
        va.add_input(vk::Format::R32G32B32_SFLOAT, true);
        let instance = va.create_binding_entry(16, vk::VertexInputRate::INSTANCE);
        va.add_input(vk::Format::R32G32B32A32_SFLOAT, true);
        let attrs = va.attribute_descriptions();
        assert_eq!(attrs[1].binding, instance);
        assert_eq!(attrs[1].offset, 0);
    }

    #[test]
    fn test_remove_entry() {
        let mut va = VertexArray::new();
        va.create_binding_entry(24, vk::VertexInputRate::VERTEX);
        va.add_input(vk::Format::R32G32B32_SFLOAT, true);
        va.add_input(vk::Format::R32G32B32_SFLOAT, true);
        va.remove_entry(0);
        let attrs = va.attribute_descriptions();
        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs[0].location, 1);
    }
}
