//! API-independent resources
//!
//! These describe GPU data without owning any GPU object. Scene nodes share
//! them through `Arc`; the renderer binds each one to a backend wrapper keyed
//! by its [`ResourceId`].

mod buffer;
mod material;
mod mesh;
mod shader;
mod texture;

pub use buffer::*;
pub use material::*;
pub use mesh::*;
pub use shader::*;
pub use texture::*;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

/// Failure to build a resource from external data
#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("Failed to decode image: {0}")]
    Image(#[from] image::ImageError),
    #[error("WGSL parse error: {0}")]
    ShaderParse(String),
    #[error("Shader validation error: {0}")]
    ShaderValidation(String),
    #[error("SPIR-V generation error: {0}")]
    ShaderGeneration(String),
    #[error("Entry point '{name}' not found for {stage} stage")]
    MissingEntryPoint { stage: &'static str, name: String },
}

/// Identity of an API-independent resource.
///
/// Ids are unique for the lifetime of the process and never reused, so a
/// cache keyed by them can't confuse a dropped resource with a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl ResourceId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Kind of an API-independent resource, used in logs and errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    VertexFormat,
    VertexBuffer,
    IndexBuffer,
    UniformBuffer,
    Texture,
    RenderTarget,
    FrameBuffer,
    Shader,
    Material,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::VertexFormat => "vertex format",
            ResourceKind::VertexBuffer => "vertex buffer",
            ResourceKind::IndexBuffer => "index buffer",
            ResourceKind::UniformBuffer => "uniform buffer",
            ResourceKind::Texture => "texture",
            ResourceKind::RenderTarget => "render target",
            ResourceKind::FrameBuffer => "frame buffer",
            ResourceKind::Shader => "shader",
            ResourceKind::Material => "material",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let a = ResourceId::next();
        let b = ResourceId::next();
        assert_ne!(a, b);
        assert!(b.raw() > a.raw());
    }
}
