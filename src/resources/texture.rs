//! Textures, render targets and frame buffers

use std::path::Path;
use std::sync::Arc;

use glam::UVec2;
use image::{DynamicImage, GenericImageView};

use super::{ResourceError, ResourceId};
use crate::backend::{SamplerDescriptor, TextureFormat};

/// Sampled image data
#[derive(Debug)]
pub struct Texture {
    id: ResourceId,
    name: String,
    width: u32,
    height: u32,
    format: TextureFormat,
    data: Vec<u8>,
    sampler: SamplerDescriptor,
}

impl Texture {
    /// Wrap raw texels.
    ///
    /// # Panics
    ///
    /// Panics if `data` doesn't hold exactly `width * height` texels.
    pub fn new(name: &str, width: u32, height: u32, format: TextureFormat, data: Vec<u8>) -> Self {
        assert_eq!(
            data.len(),
            (width * height * format.bytes_per_pixel()) as usize,
            "texel data doesn't match the texture size"
        );
        Self {
            id: ResourceId::next(),
            name: name.to_string(),
            width,
            height,
            format,
            data,
            sampler: SamplerDescriptor::default(),
        }
    }

    /// Load texture from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ResourceError> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();
        let img = image::open(path)?;
        Ok(Self::from_image(img, &name))
    }

    /// Decode an encoded image (PNG, JPEG, ...)
    pub fn from_bytes(bytes: &[u8], name: &str) -> Result<Self, ResourceError> {
        let img = image::load_from_memory(bytes)?;
        Ok(Self::from_image(img, name))
    }

    fn from_image(img: DynamicImage, name: &str) -> Self {
        let (width, height) = img.dimensions();
        Self::new(
            name,
            width,
            height,
            TextureFormat::Rgba8UnormSrgb,
            img.to_rgba8().into_raw(),
        )
    }

    /// A 1x1 texture
    pub fn solid_color(color: [u8; 4], name: &str) -> Self {
        Self::new(name, 1, 1, TextureFormat::Rgba8UnormSrgb, color.to_vec())
    }

    pub fn with_sampler(mut self, sampler: SamplerDescriptor) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn extent(&self) -> UVec2 {
        UVec2::new(self.width, self.height)
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn sampler(&self) -> &SamplerDescriptor {
        &self.sampler
    }
}

/// Size of a render target
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TargetSize {
    Fixed(UVec2),
    /// Follows the swapchain, scaled by the factor
    Swapchain(f32),
}

impl TargetSize {
    /// Pixel extent for the given swapchain extent, never zero
    pub fn resolve(&self, swapchain: UVec2) -> UVec2 {
        match *self {
            TargetSize::Fixed(size) => size.max(UVec2::ONE),
            TargetSize::Swapchain(scale) => {
                let scaled = (swapchain.as_vec2() * scale).round().as_uvec2();
                scaled.max(UVec2::ONE)
            }
        }
    }

    pub fn follows_swapchain(&self) -> bool {
        matches!(self, TargetSize::Swapchain(_))
    }
}

/// An image passes render into
#[derive(Debug)]
pub struct RenderTarget {
    id: ResourceId,
    label: String,
    format: TextureFormat,
    size: TargetSize,
    sampled: bool,
}

impl RenderTarget {
    pub fn new(label: &str, format: TextureFormat, size: TargetSize) -> Self {
        Self {
            id: ResourceId::next(),
            label: label.to_string(),
            format,
            size,
            sampled: !format.is_depth(),
        }
    }

    /// Whether later passes sample from this target
    pub fn with_sampled(mut self, sampled: bool) -> Self {
        self.sampled = sampled;
        self
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn size(&self) -> TargetSize {
        self.size
    }

    pub fn sampled(&self) -> bool {
        self.sampled
    }
}

/// Color and depth attachments a pass renders into
#[derive(Debug)]
pub struct FrameBuffer {
    id: ResourceId,
    label: String,
    color: Vec<Arc<RenderTarget>>,
    depth: Option<Arc<RenderTarget>>,
}

impl FrameBuffer {
    /// # Panics
    ///
    /// Panics if there is no attachment, if a color target has a depth
    /// format, if the depth target doesn't, or if the attachments differ in
    /// size.
    pub fn new(label: &str, color: Vec<Arc<RenderTarget>>, depth: Option<Arc<RenderTarget>>) -> Self {
        assert!(
            !color.is_empty() || depth.is_some(),
            "frame buffer needs at least one attachment"
        );
        assert!(
            color.iter().all(|target| !target.format().is_depth()),
            "color attachment with a depth format"
        );
        if let Some(depth) = &depth {
            assert!(depth.format().is_depth(), "depth attachment without a depth format");
        }
        let mut sizes = color.iter().chain(depth.iter()).map(|target| target.size());
        if let Some(first) = sizes.next() {
            assert!(
                sizes.all(|size| size == first),
                "frame buffer attachments differ in size"
            );
        }
        Self {
            id: ResourceId::next(),
            label: label.to_string(),
            color,
            depth,
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn color_targets(&self) -> &[Arc<RenderTarget>] {
        &self.color
    }

    pub fn depth_target(&self) -> Option<&Arc<RenderTarget>> {
        self.depth.as_ref()
    }

    /// Size shared by every attachment
    pub fn size(&self) -> TargetSize {
        self.color
            .iter()
            .chain(self.depth.iter())
            .map(|target| target.size())
            .next()
            .unwrap_or(TargetSize::Swapchain(1.0))
    }

    pub fn color_formats(&self) -> Vec<TextureFormat> {
        self.color.iter().map(|target| target.format()).collect()
    }

    pub fn depth_format(&self) -> Option<TextureFormat> {
        self.depth.as_ref().map(|target| target.format())
    }
}
