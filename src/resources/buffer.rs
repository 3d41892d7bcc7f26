//! Vertex formats and buffer contents

use std::sync::Arc;

use bytemuck::Pod;

use super::ResourceId;
use crate::backend::{IndexFormat, VertexAttribute, VertexAttributeFormat, VertexBufferLayout};

/// Layout of the vertices of one vertex buffer
#[derive(Debug)]
pub struct VertexFormat {
    id: ResourceId,
    layout: VertexBufferLayout,
}

impl VertexFormat {
    /// Attributes are packed in order, locations follow the slice index
    pub fn new(attributes: &[VertexAttributeFormat]) -> Self {
        let mut offset = 0;
        let attributes = attributes
            .iter()
            .enumerate()
            .map(|(location, &format)| {
                let attribute = VertexAttribute {
                    location: location as u32,
                    format,
                    offset,
                };
                offset += format.size();
                attribute
            })
            .collect();
        Self {
            id: ResourceId::next(),
            layout: VertexBufferLayout {
                array_stride: offset,
                attributes,
            },
        }
    }

    /// position: vec3, normal: vec3, uv: vec2
    pub fn position_normal_uv() -> Self {
        Self::new(&[
            VertexAttributeFormat::Float32x3,
            VertexAttributeFormat::Float32x3,
            VertexAttributeFormat::Float32x2,
        ])
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn layout(&self) -> &VertexBufferLayout {
        &self.layout
    }

    pub fn stride(&self) -> u64 {
        self.layout.array_stride
    }
}

/// Vertex data in a given format
#[derive(Debug)]
pub struct VertexBuffer {
    id: ResourceId,
    format: Arc<VertexFormat>,
    data: Vec<u8>,
}

impl VertexBuffer {
    /// # Panics
    ///
    /// Panics if the size of `T` doesn't match the format's stride.
    pub fn new<T: Pod>(format: Arc<VertexFormat>, vertices: &[T]) -> Self {
        assert_eq!(
            std::mem::size_of::<T>() as u64,
            format.stride(),
            "vertex type doesn't match the vertex format stride"
        );
        Self {
            id: ResourceId::next(),
            format,
            data: bytemuck::cast_slice(vertices).to_vec(),
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn format(&self) -> &Arc<VertexFormat> {
        &self.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn vertex_count(&self) -> u32 {
        (self.data.len() as u64 / self.format.stride()) as u32
    }
}

/// Index data
#[derive(Debug)]
pub struct IndexBuffer {
    id: ResourceId,
    format: IndexFormat,
    data: Vec<u8>,
}

impl IndexBuffer {
    pub fn from_u16(indices: &[u16]) -> Self {
        Self {
            id: ResourceId::next(),
            format: IndexFormat::Uint16,
            data: bytemuck::cast_slice(indices).to_vec(),
        }
    }

    pub fn from_u32(indices: &[u32]) -> Self {
        Self {
            id: ResourceId::next(),
            format: IndexFormat::Uint32,
            data: bytemuck::cast_slice(indices).to_vec(),
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn format(&self) -> IndexFormat {
        self.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn index_count(&self) -> u32 {
        let width = match self.format {
            IndexFormat::Uint16 => 2,
            IndexFormat::Uint32 => 4,
        };
        (self.data.len() / width) as u32
    }
}

/// How often the contents of a uniform buffer change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniformUsage {
    /// Written once when bound
    Static,
    /// Rewritten every frame, once per pass that draws it
    PerFrame,
}

/// A block of shader uniforms
#[derive(Debug)]
pub struct UniformBuffer {
    id: ResourceId,
    label: String,
    usage: UniformUsage,
    size: u64,
    contents: Vec<u8>,
}

impl UniformBuffer {
    /// Uniforms the renderer fills every frame
    pub fn per_frame(label: &str, size: u64) -> Self {
        assert!(size > 0, "uniform buffer can't be empty");
        Self {
            id: ResourceId::next(),
            label: label.to_string(),
            usage: UniformUsage::PerFrame,
            size,
            contents: Vec::new(),
        }
    }

    /// Uniforms with fixed contents
    pub fn with_contents(label: &str, contents: Vec<u8>) -> Self {
        assert!(!contents.is_empty(), "uniform buffer can't be empty");
        Self {
            id: ResourceId::next(),
            label: label.to_string(),
            usage: UniformUsage::Static,
            size: contents.len() as u64,
            contents,
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn usage(&self) -> UniformUsage {
        self.usage
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Initial contents, empty for per-frame buffers
    pub fn contents(&self) -> &[u8] {
        &self.contents
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_format_offsets() {
        let format = VertexFormat::position_normal_uv();
        let offsets: Vec<u64> = format.layout().attributes.iter().map(|a| a.offset).collect();
        assert_eq!(offsets, vec![0, 12, 24]);
        assert_eq!(format.stride(), 32);
    }

    #[test]
    fn test_vertex_count() {
        let format = Arc::new(VertexFormat::new(&[VertexAttributeFormat::Float32x2]));
        let buffer = VertexBuffer::new(format, &[[0.0f32; 2]; 3]);
        assert_eq!(buffer.vertex_count(), 3);
        assert_eq!(buffer.data().len(), 24);
    }

    #[test]
    #[should_panic(expected = "vertex format stride")]
    fn test_vertex_type_must_match_stride() {
        let format = Arc::new(VertexFormat::new(&[VertexAttributeFormat::Float32x3]));
        VertexBuffer::new(format, &[0.0f32; 4]);
    }

    #[test]
    fn test_index_count() {
        assert_eq!(IndexBuffer::from_u16(&[0, 1, 2, 2, 3, 0]).index_count(), 6);
        assert_eq!(IndexBuffer::from_u32(&[0, 1, 2]).index_count(), 3);
    }
}
