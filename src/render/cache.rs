//! GPU resource cache
//!
//! Every API-independent resource bound to the renderer has exactly one
//! backend wrapper, keyed by its [`ResourceId`]. Binding creates the wrapper
//! if it doesn't exist yet, unbinding destroys it along with the wrappers
//! built from it. A creation that fails leaves the cache untouched.

use std::collections::HashMap;

use glam::UVec2;

use super::{PassType, RenderError, RenderResult};
use crate::backend::{
    BindingLayoutEntry, BlendState, BufferDescriptor, BufferHandle, BufferUsage, CompareFunction,
    FrontFace, GraphicsDevice, IndexFormat, PrimitiveTopology, RenderPipelineDescriptor,
    RenderPipelineHandle, SamplerHandle, ShaderModuleDescriptor, ShaderModuleHandle,
    TextureDescriptor, TextureFormat, TextureHandle, TextureUsage, VertexBufferLayout,
};
use crate::resources::{
    BlendMode, FrameBuffer, IndexBuffer, Material, RenderTarget, ResourceId, ResourceKind, Shader,
    TargetSize, Texture, UniformBuffer, UniformUsage, VertexBuffer, VertexFormat,
};

/// Backend objects owned by a cache entry
pub trait GpuResource {
    /// Release the backend objects
    fn destroy(self, device: &mut dyn GraphicsDevice);
}

/// One cache per resource kind
#[derive(Debug)]
pub struct ResourceCache<T> {
    kind: ResourceKind,
    entries: HashMap<ResourceId, T>,
}

impl<T> ResourceCache<T> {
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            entries: HashMap::new(),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn get(&self, id: ResourceId) -> Option<&T> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: ResourceId) -> Option<&mut T> {
        self.entries.get_mut(&id)
    }

    /// Like `get`, failing with [`RenderError::NotBound`]
    pub fn require(&self, id: ResourceId) -> RenderResult<&T> {
        self.entries.get(&id).ok_or(RenderError::NotBound {
            kind: self.kind,
            id,
        })
    }

    pub fn contains(&self, id: ResourceId) -> bool {
        self.entries.contains_key(&id)
    }

    fn insert(&mut self, id: ResourceId, value: T) {
        let previous = self.entries.insert(id, value);
        debug_assert!(previous.is_none(), "{} {} bound twice", self.kind, id);
    }

    fn remove(&mut self, id: ResourceId) -> Option<T> {
        self.entries.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ResourceId, &T)> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&ResourceId, &mut T)> {
        self.entries.iter_mut()
    }
}

impl<T: GpuResource> ResourceCache<T> {
    fn destroy_all(&mut self, device: &mut dyn GraphicsDevice) {
        for (_, entry) in self.entries.drain() {
            entry.destroy(device);
        }
    }

    /// Destroy the entries matching `predicate`. Returns how many there were.
    fn evict(
        &mut self,
        device: &mut dyn GraphicsDevice,
        predicate: impl Fn(&T) -> bool,
    ) -> usize {
        let ids: Vec<ResourceId> = self
            .entries
            .iter()
            .filter(|&(_, entry)| predicate(entry))
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(entry) = self.entries.remove(id) {
                entry.destroy(device);
            }
        }
        if !ids.is_empty() {
            log::debug!("Evicted {} dependent {} entries", ids.len(), self.kind);
        }
        ids.len()
    }
}

/// Values resource creation depends on
#[derive(Debug, Clone, Copy)]
pub struct BindSettings {
    pub frames_in_flight: usize,
    /// Size swapchain-relative render targets are resolved against
    pub swapchain_extent: UVec2,
}

/// Wrapper of a vertex format: only its layout, nothing lives on the GPU
#[derive(Debug, Clone)]
pub struct GpuVertexFormat {
    pub layout: VertexBufferLayout,
}

#[derive(Debug, Clone, Copy)]
pub struct GpuVertexBuffer {
    pub buffer: BufferHandle,
    pub format: ResourceId,
    pub vertex_count: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct GpuIndexBuffer {
    pub buffer: BufferHandle,
    pub format: IndexFormat,
    pub index_count: u32,
}

/// Uniform buffer holding one aligned slot per in-flight frame and pass
#[derive(Debug, Clone, Copy)]
pub struct GpuUniformBuffer {
    pub buffer: BufferHandle,
    /// Size of the uniform block
    pub size: u64,
    pub stride: u64,
    pub slots: u64,
}

impl GpuUniformBuffer {
    /// Offset of the slot written for `pass_type` in frame slot `frame`
    pub fn slot_offset(&self, frame: usize, pass_type: PassType) -> u64 {
        if self.slots == 1 {
            return 0;
        }
        let slot = (frame * PassType::COUNT + pass_type.index()) as u64;
        debug_assert!(slot < self.slots);
        slot * self.stride
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GpuTexture {
    pub texture: TextureHandle,
    pub sampler: SamplerHandle,
}

#[derive(Debug, Clone, Copy)]
pub struct GpuRenderTarget {
    pub texture: TextureHandle,
    pub format: TextureFormat,
    pub size: TargetSize,
    pub sampled: bool,
    pub extent: UVec2,
}

/// Attachment formats a pipeline renders into
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetSignature {
    pub color: Vec<TextureFormat>,
    pub depth: Option<TextureFormat>,
}

/// Resolved attachments of a frame buffer.
///
/// Holds the ids of its render targets so it can be regenerated when those
/// are recreated.
#[derive(Debug, Clone)]
pub struct GpuFrameBuffer {
    pub color_targets: Vec<ResourceId>,
    pub depth_target: Option<ResourceId>,
    pub color: Vec<TextureHandle>,
    pub depth: Option<TextureHandle>,
    pub extent: UVec2,
    pub signature: TargetSignature,
}

impl GpuFrameBuffer {
    pub fn uses_target(&self, id: ResourceId) -> bool {
        self.color_targets
            .iter()
            .chain(self.depth_target.iter())
            .any(|target| *target == id)
    }

    fn resolve(
        color_targets: Vec<ResourceId>,
        depth_target: Option<ResourceId>,
        render_targets: &ResourceCache<GpuRenderTarget>,
    ) -> RenderResult<Self> {
        let color = color_targets
            .iter()
            .map(|id| render_targets.require(*id))
            .collect::<RenderResult<Vec<_>>>()?;
        let depth = depth_target.map(|id| render_targets.require(id)).transpose()?;
        let extent = color
            .iter()
            .chain(depth.iter())
            .map(|target| target.extent)
            .next()
            .unwrap_or(UVec2::ONE);
        let signature = TargetSignature {
            color: color.iter().map(|target| target.format).collect(),
            depth: depth.map(|target| target.format),
        };
        Ok(Self {
            color: color.iter().map(|target| target.texture).collect(),
            depth: depth.map(|target| target.texture),
            color_targets,
            depth_target,
            extent,
            signature,
        })
    }
}

#[derive(Debug, Clone)]
pub struct GpuShader {
    pub vertex: ShaderModuleHandle,
    pub fragment: ShaderModuleHandle,
    pub vertex_entry: String,
    pub fragment_entry: String,
    pub bindings: Vec<BindingLayoutEntry>,
}

/// Pipeline identity within a material
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pub vertex_format: ResourceId,
    pub signature: TargetSignature,
}

/// A material keeps one pipeline per vertex format and attachment layout
#[derive(Debug)]
pub struct GpuMaterial {
    pub shader: ResourceId,
    pub uniforms: Option<ResourceId>,
    pub textures: Vec<ResourceId>,
    pub pipelines: HashMap<PipelineKey, RenderPipelineHandle>,
}

impl GpuMaterial {
    /// Whether the shader, uniforms or one of the textures is `id`
    pub fn depends_on(&self, id: ResourceId) -> bool {
        self.shader == id || self.uniforms == Some(id) || self.textures.contains(&id)
    }
}

impl GpuResource for GpuVertexFormat {
    fn destroy(self, _device: &mut dyn GraphicsDevice) {}
}

impl GpuResource for GpuVertexBuffer {
    fn destroy(self, device: &mut dyn GraphicsDevice) {
        device.destroy_buffer(self.buffer);
    }
}

impl GpuResource for GpuIndexBuffer {
    fn destroy(self, device: &mut dyn GraphicsDevice) {
        device.destroy_buffer(self.buffer);
    }
}

impl GpuResource for GpuUniformBuffer {
    fn destroy(self, device: &mut dyn GraphicsDevice) {
        device.destroy_buffer(self.buffer);
    }
}

impl GpuResource for GpuTexture {
    fn destroy(self, device: &mut dyn GraphicsDevice) {
        device.destroy_sampler(self.sampler);
        device.destroy_texture(self.texture);
    }
}

impl GpuResource for GpuRenderTarget {
    fn destroy(self, device: &mut dyn GraphicsDevice) {
        device.destroy_texture(self.texture);
    }
}

// Attachments belong to the render target entries
impl GpuResource for GpuFrameBuffer {
    fn destroy(self, _device: &mut dyn GraphicsDevice) {}
}

impl GpuResource for GpuShader {
    fn destroy(self, device: &mut dyn GraphicsDevice) {
        device.destroy_shader_module(self.vertex);
        device.destroy_shader_module(self.fragment);
    }
}

impl GpuResource for GpuMaterial {
    fn destroy(self, device: &mut dyn GraphicsDevice) {
        for (_, pipeline) in self.pipelines {
            device.destroy_render_pipeline(pipeline);
        }
    }
}

/// The caches of every resource kind
#[derive(Debug)]
pub struct GpuCaches {
    pub vertex_formats: ResourceCache<GpuVertexFormat>,
    pub vertex_buffers: ResourceCache<GpuVertexBuffer>,
    pub index_buffers: ResourceCache<GpuIndexBuffer>,
    pub uniform_buffers: ResourceCache<GpuUniformBuffer>,
    pub textures: ResourceCache<GpuTexture>,
    pub render_targets: ResourceCache<GpuRenderTarget>,
    pub frame_buffers: ResourceCache<GpuFrameBuffer>,
    pub shaders: ResourceCache<GpuShader>,
    pub materials: ResourceCache<GpuMaterial>,
}

impl Default for GpuCaches {
    fn default() -> Self {
        Self {
            vertex_formats: ResourceCache::new(ResourceKind::VertexFormat),
            vertex_buffers: ResourceCache::new(ResourceKind::VertexBuffer),
            index_buffers: ResourceCache::new(ResourceKind::IndexBuffer),
            uniform_buffers: ResourceCache::new(ResourceKind::UniformBuffer),
            textures: ResourceCache::new(ResourceKind::Texture),
            render_targets: ResourceCache::new(ResourceKind::RenderTarget),
            frame_buffers: ResourceCache::new(ResourceKind::FrameBuffer),
            shaders: ResourceCache::new(ResourceKind::Shader),
            materials: ResourceCache::new(ResourceKind::Material),
        }
    }
}

impl GpuCaches {
    /// Total number of cache entries
    pub fn len(&self) -> usize {
        self.vertex_formats.len()
            + self.vertex_buffers.len()
            + self.index_buffers.len()
            + self.uniform_buffers.len()
            + self.textures.len()
            + self.render_targets.len()
            + self.frame_buffers.len()
            + self.shaders.len()
            + self.materials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Destroy every wrapper, dependents first
    pub fn destroy_all(&mut self, device: &mut dyn GraphicsDevice) {
        self.materials.destroy_all(device);
        self.shaders.destroy_all(device);
        self.frame_buffers.destroy_all(device);
        self.render_targets.destroy_all(device);
        self.textures.destroy_all(device);
        self.uniform_buffers.destroy_all(device);
        self.index_buffers.destroy_all(device);
        self.vertex_buffers.destroy_all(device);
        self.vertex_formats.destroy_all(device);
    }

    /// Recreate swapchain-relative render targets for a new extent and
    /// re-resolve the frame buffers using them.
    ///
    /// Every new texture is created before any old one is destroyed, so a
    /// failed creation leaves targets and frame buffers as they were.
    pub fn regenerate_swapchain_targets(
        &mut self,
        device: &mut dyn GraphicsDevice,
        swapchain_extent: UVec2,
    ) -> RenderResult<()> {
        let stale: Vec<(ResourceId, TextureDescriptor, UVec2)> = self
            .render_targets
            .iter()
            .filter(|(_, target)| target.size.follows_swapchain())
            .filter_map(|(id, target)| {
                let extent = target.size.resolve(swapchain_extent);
                (extent != target.extent).then(|| {
                    let descriptor =
                        target_descriptor(*id, target.format, target.sampled, extent);
                    (*id, descriptor, extent)
                })
            })
            .collect();
        if stale.is_empty() {
            return Ok(());
        }

        let mut created = Vec::with_capacity(stale.len());
        for (id, descriptor, extent) in &stale {
            match device.create_texture(descriptor, None) {
                Ok(texture) => created.push((*id, texture, *extent)),
                Err(e) => {
                    for (_, texture, _) in created {
                        device.destroy_texture(texture);
                    }
                    return Err(e.into());
                }
            }
        }

        for (id, texture, extent) in &created {
            if let Some(target) = self.render_targets.get_mut(*id) {
                device.destroy_texture(std::mem::replace(&mut target.texture, *texture));
                target.extent = *extent;
            }
        }

        let render_targets = &self.render_targets;
        let mut unresolved = Vec::new();
        for (id, frame_buffer) in self.frame_buffers.iter_mut() {
            if !created.iter().any(|(target, _, _)| frame_buffer.uses_target(*target)) {
                continue;
            }
            match GpuFrameBuffer::resolve(
                frame_buffer.color_targets.clone(),
                frame_buffer.depth_target,
                render_targets,
            ) {
                Ok(resolved) => *frame_buffer = resolved,
                Err(e) => {
                    log::warn!("Dropping frame buffer {}: {}", id, e);
                    unresolved.push(*id);
                }
            }
        }
        for id in unresolved {
            self.frame_buffers.remove(id);
        }
        log::debug!(
            "Regenerated {} render targets for {}x{}",
            created.len(),
            swapchain_extent.x,
            swapchain_extent.y
        );
        Ok(())
    }
}

fn target_descriptor(
    id: ResourceId,
    format: TextureFormat,
    sampled: bool,
    extent: UVec2,
) -> TextureDescriptor {
    let mut usage = TextureUsage::RENDER_ATTACHMENT;
    if sampled {
        usage = usage | TextureUsage::TEXTURE_BINDING;
    }
    TextureDescriptor {
        label: Some(format!("render target {}", id)),
        width: extent.x,
        height: extent.y,
        format,
        usage,
    }
}

/// An API-independent resource with a backend wrapper
pub trait Bindable {
    type Gpu: GpuResource;

    const KIND: ResourceKind;

    fn resource_id(&self) -> ResourceId;

    fn cache(caches: &GpuCaches) -> &ResourceCache<Self::Gpu>;

    fn cache_mut(caches: &mut GpuCaches) -> &mut ResourceCache<Self::Gpu>;

    /// Create the wrapper, binding the resources it depends on first
    fn create(
        &self,
        device: &mut dyn GraphicsDevice,
        caches: &mut GpuCaches,
        settings: &BindSettings,
    ) -> RenderResult<Self::Gpu>;

    /// Destroy the wrappers of other kinds built from the wrapper `id`.
    /// Called by [`unbind`] before that wrapper is destroyed.
    fn release_dependents(
        _id: ResourceId,
        _device: &mut dyn GraphicsDevice,
        _caches: &mut GpuCaches,
    ) {
    }
}

/// Create the wrapper of `resource` unless it exists.
/// Returns whether a wrapper was created.
pub fn bind<R: Bindable + ?Sized>(
    resource: &R,
    device: &mut dyn GraphicsDevice,
    caches: &mut GpuCaches,
    settings: &BindSettings,
) -> RenderResult<bool> {
    let id = resource.resource_id();
    if R::cache(caches).contains(id) {
        return Ok(false);
    }
    let gpu = resource.create(device, caches, settings)?;
    R::cache_mut(caches).insert(id, gpu);
    log::debug!("Bound {} {}", R::KIND, id);
    Ok(true)
}

/// Destroy the wrapper of `resource` and every wrapper depending on it.
/// Returns whether there was one.
///
/// Dependents are bound again, with their dependencies, by the next `bind`
/// of the resources they wrap.
pub fn unbind<R: Bindable + ?Sized>(
    resource: &R,
    device: &mut dyn GraphicsDevice,
    caches: &mut GpuCaches,
) -> bool {
    let id = resource.resource_id();
    if !R::cache(caches).contains(id) {
        return false;
    }
    R::release_dependents(id, device, caches);
    match R::cache_mut(caches).remove(id) {
        Some(gpu) => {
            gpu.destroy(device);
            log::debug!("Unbound {} {}", R::KIND, id);
            true
        }
        None => false,
    }
}

impl Bindable for VertexFormat {
    type Gpu = GpuVertexFormat;
    const KIND: ResourceKind = ResourceKind::VertexFormat;

    fn resource_id(&self) -> ResourceId {
        self.id()
    }

    fn cache(caches: &GpuCaches) -> &ResourceCache<Self::Gpu> {
        &caches.vertex_formats
    }

    fn cache_mut(caches: &mut GpuCaches) -> &mut ResourceCache<Self::Gpu> {
        &mut caches.vertex_formats
    }

    fn create(
        &self,
        _device: &mut dyn GraphicsDevice,
        _caches: &mut GpuCaches,
        _settings: &BindSettings,
    ) -> RenderResult<Self::Gpu> {
        Ok(GpuVertexFormat {
            layout: self.layout().clone(),
        })
    }

    fn release_dependents(
        id: ResourceId,
        device: &mut dyn GraphicsDevice,
        caches: &mut GpuCaches,
    ) {
        caches.vertex_buffers.evict(device, |buffer| buffer.format == id);
        for (_, material) in caches.materials.iter_mut() {
            material.pipelines.retain(|key, pipeline| {
                if key.vertex_format == id {
                    device.destroy_render_pipeline(*pipeline);
                }
                key.vertex_format != id
            });
        }
    }
}

impl Bindable for VertexBuffer {
    type Gpu = GpuVertexBuffer;
    const KIND: ResourceKind = ResourceKind::VertexBuffer;

    fn resource_id(&self) -> ResourceId {
        self.id()
    }

    fn cache(caches: &GpuCaches) -> &ResourceCache<Self::Gpu> {
        &caches.vertex_buffers
    }

    fn cache_mut(caches: &mut GpuCaches) -> &mut ResourceCache<Self::Gpu> {
        &mut caches.vertex_buffers
    }

    fn create(
        &self,
        device: &mut dyn GraphicsDevice,
        caches: &mut GpuCaches,
        settings: &BindSettings,
    ) -> RenderResult<Self::Gpu> {
        bind(self.format().as_ref(), device, caches, settings)?;
        let buffer = device.create_buffer_init(
            &BufferDescriptor {
                label: Some(format!("vertex buffer {}", self.id())),
                size: self.data().len() as u64,
                usage: BufferUsage::VERTEX | BufferUsage::COPY_DST,
                mapped: false,
            },
            self.data(),
        )?;
        Ok(GpuVertexBuffer {
            buffer,
            format: self.format().id(),
            vertex_count: self.vertex_count(),
        })
    }
}

impl Bindable for IndexBuffer {
    type Gpu = GpuIndexBuffer;
    const KIND: ResourceKind = ResourceKind::IndexBuffer;

    fn resource_id(&self) -> ResourceId {
        self.id()
    }

    fn cache(caches: &GpuCaches) -> &ResourceCache<Self::Gpu> {
        &caches.index_buffers
    }

    fn cache_mut(caches: &mut GpuCaches) -> &mut ResourceCache<Self::Gpu> {
        &mut caches.index_buffers
    }

    fn create(
        &self,
        device: &mut dyn GraphicsDevice,
        _caches: &mut GpuCaches,
        _settings: &BindSettings,
    ) -> RenderResult<Self::Gpu> {
        let buffer = device.create_buffer_init(
            &BufferDescriptor {
                label: Some(format!("index buffer {}", self.id())),
                size: self.data().len() as u64,
                usage: BufferUsage::INDEX | BufferUsage::COPY_DST,
                mapped: false,
            },
            self.data(),
        )?;
        Ok(GpuIndexBuffer {
            buffer,
            format: self.format(),
            index_count: self.index_count(),
        })
    }
}

impl Bindable for UniformBuffer {
    type Gpu = GpuUniformBuffer;
    const KIND: ResourceKind = ResourceKind::UniformBuffer;

    fn resource_id(&self) -> ResourceId {
        self.id()
    }

    fn cache(caches: &GpuCaches) -> &ResourceCache<Self::Gpu> {
        &caches.uniform_buffers
    }

    fn cache_mut(caches: &mut GpuCaches) -> &mut ResourceCache<Self::Gpu> {
        &mut caches.uniform_buffers
    }

    fn create(
        &self,
        device: &mut dyn GraphicsDevice,
        _caches: &mut GpuCaches,
        settings: &BindSettings,
    ) -> RenderResult<Self::Gpu> {
        let label = Some(format!("{} uniforms {}", self.label(), self.id()));
        match self.usage() {
            UniformUsage::Static => {
                let buffer = device.create_buffer_init(
                    &BufferDescriptor {
                        label,
                        size: self.size(),
                        usage: BufferUsage::UNIFORM | BufferUsage::COPY_DST,
                        mapped: false,
                    },
                    self.contents(),
                )?;
                Ok(GpuUniformBuffer {
                    buffer,
                    size: self.size(),
                    stride: self.size(),
                    slots: 1,
                })
            }
            UniformUsage::PerFrame => {
                let alignment = device.uniform_offset_alignment().max(1);
                let stride = self.size().div_ceil(alignment) * alignment;
                let slots = (settings.frames_in_flight * PassType::COUNT) as u64;
                let buffer = device.create_buffer(&BufferDescriptor {
                    label,
                    size: stride * slots,
                    usage: BufferUsage::UNIFORM,
                    mapped: true,
                })?;
                Ok(GpuUniformBuffer {
                    buffer,
                    size: self.size(),
                    stride,
                    slots,
                })
            }
        }
    }

    fn release_dependents(
        id: ResourceId,
        device: &mut dyn GraphicsDevice,
        caches: &mut GpuCaches,
    ) {
        caches.materials.evict(device, |material| material.depends_on(id));
    }
}

impl Bindable for Texture {
    type Gpu = GpuTexture;
    const KIND: ResourceKind = ResourceKind::Texture;

    fn resource_id(&self) -> ResourceId {
        self.id()
    }

    fn cache(caches: &GpuCaches) -> &ResourceCache<Self::Gpu> {
        &caches.textures
    }

    fn cache_mut(caches: &mut GpuCaches) -> &mut ResourceCache<Self::Gpu> {
        &mut caches.textures
    }

    fn create(
        &self,
        device: &mut dyn GraphicsDevice,
        _caches: &mut GpuCaches,
        _settings: &BindSettings,
    ) -> RenderResult<Self::Gpu> {
        let extent = self.extent();
        let texture = device.create_texture(
            &TextureDescriptor {
                label: Some(self.name().to_string()),
                width: extent.x,
                height: extent.y,
                format: self.format(),
                usage: TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
            },
            Some(self.data()),
        )?;
        let sampler = match device.create_sampler(self.sampler()) {
            Ok(sampler) => sampler,
            Err(e) => {
                device.destroy_texture(texture);
                return Err(e.into());
            }
        };
        Ok(GpuTexture { texture, sampler })
    }

    fn release_dependents(
        id: ResourceId,
        device: &mut dyn GraphicsDevice,
        caches: &mut GpuCaches,
    ) {
        caches.materials.evict(device, |material| material.depends_on(id));
    }
}

impl Bindable for RenderTarget {
    type Gpu = GpuRenderTarget;
    const KIND: ResourceKind = ResourceKind::RenderTarget;

    fn resource_id(&self) -> ResourceId {
        self.id()
    }

    fn cache(caches: &GpuCaches) -> &ResourceCache<Self::Gpu> {
        &caches.render_targets
    }

    fn cache_mut(caches: &mut GpuCaches) -> &mut ResourceCache<Self::Gpu> {
        &mut caches.render_targets
    }

    fn create(
        &self,
        device: &mut dyn GraphicsDevice,
        _caches: &mut GpuCaches,
        settings: &BindSettings,
    ) -> RenderResult<Self::Gpu> {
        let extent = self.size().resolve(settings.swapchain_extent);
        let texture = device.create_texture(
            &target_descriptor(self.id(), self.format(), self.sampled(), extent),
            None,
        )?;
        Ok(GpuRenderTarget {
            texture,
            format: self.format(),
            size: self.size(),
            sampled: self.sampled(),
            extent,
        })
    }

    fn release_dependents(
        id: ResourceId,
        device: &mut dyn GraphicsDevice,
        caches: &mut GpuCaches,
    ) {
        caches.frame_buffers.evict(device, |frame_buffer| frame_buffer.uses_target(id));
    }
}

impl Bindable for FrameBuffer {
    type Gpu = GpuFrameBuffer;
    const KIND: ResourceKind = ResourceKind::FrameBuffer;

    fn resource_id(&self) -> ResourceId {
        self.id()
    }

    fn cache(caches: &GpuCaches) -> &ResourceCache<Self::Gpu> {
        &caches.frame_buffers
    }

    fn cache_mut(caches: &mut GpuCaches) -> &mut ResourceCache<Self::Gpu> {
        &mut caches.frame_buffers
    }

    fn create(
        &self,
        device: &mut dyn GraphicsDevice,
        caches: &mut GpuCaches,
        settings: &BindSettings,
    ) -> RenderResult<Self::Gpu> {
        for target in self.color_targets().iter().chain(self.depth_target()) {
            bind(target.as_ref(), device, caches, settings)?;
        }
        GpuFrameBuffer::resolve(
            self.color_targets().iter().map(|target| target.id()).collect(),
            self.depth_target().map(|target| target.id()),
            &caches.render_targets,
        )
    }
}

impl Bindable for Shader {
    type Gpu = GpuShader;
    const KIND: ResourceKind = ResourceKind::Shader;

    fn resource_id(&self) -> ResourceId {
        self.id()
    }

    fn cache(caches: &GpuCaches) -> &ResourceCache<Self::Gpu> {
        &caches.shaders
    }

    fn cache_mut(caches: &mut GpuCaches) -> &mut ResourceCache<Self::Gpu> {
        &mut caches.shaders
    }

    fn create(
        &self,
        device: &mut dyn GraphicsDevice,
        _caches: &mut GpuCaches,
        _settings: &BindSettings,
    ) -> RenderResult<Self::Gpu> {
        let vertex = device.create_shader_module(&ShaderModuleDescriptor {
            label: Some(self.label()),
            spirv: &self.vertex().spirv,
        })?;
        let fragment = match device.create_shader_module(&ShaderModuleDescriptor {
            label: Some(self.label()),
            spirv: &self.fragment().spirv,
        }) {
            Ok(module) => module,
            Err(e) => {
                device.destroy_shader_module(vertex);
                return Err(e.into());
            }
        };
        Ok(GpuShader {
            vertex,
            fragment,
            vertex_entry: self.vertex().entry_point.clone(),
            fragment_entry: self.fragment().entry_point.clone(),
            bindings: self.bindings().to_vec(),
        })
    }

    fn release_dependents(
        id: ResourceId,
        device: &mut dyn GraphicsDevice,
        caches: &mut GpuCaches,
    ) {
        caches.materials.evict(device, |material| material.depends_on(id));
    }
}

impl Bindable for Material {
    type Gpu = GpuMaterial;
    const KIND: ResourceKind = ResourceKind::Material;

    fn resource_id(&self) -> ResourceId {
        self.id()
    }

    fn cache(caches: &GpuCaches) -> &ResourceCache<Self::Gpu> {
        &caches.materials
    }

    fn cache_mut(caches: &mut GpuCaches) -> &mut ResourceCache<Self::Gpu> {
        &mut caches.materials
    }

    fn create(
        &self,
        device: &mut dyn GraphicsDevice,
        caches: &mut GpuCaches,
        settings: &BindSettings,
    ) -> RenderResult<Self::Gpu> {
        bind(self.shader().as_ref(), device, caches, settings)?;
        if let Some(uniforms) = self.uniform_buffer() {
            bind(uniforms.as_ref(), device, caches, settings)?;
        }
        for texture in self.textures() {
            bind(texture.texture.as_ref(), device, caches, settings)?;
        }
        Ok(GpuMaterial {
            shader: self.shader().id(),
            uniforms: self.uniform_buffer().map(|uniforms| uniforms.id()),
            textures: self.textures().iter().map(|texture| texture.texture.id()).collect(),
            pipelines: HashMap::new(),
        })
    }
}

/// Pipeline drawing `material` with `vertex_format` into `signature`
/// attachments, created on first use.
///
/// The material, its shader and the vertex format must be bound.
pub fn prepare_pipeline(
    material: &Material,
    vertex_format: &VertexFormat,
    signature: &TargetSignature,
    device: &mut dyn GraphicsDevice,
    caches: &mut GpuCaches,
) -> RenderResult<RenderPipelineHandle> {
    let key = PipelineKey {
        vertex_format: vertex_format.id(),
        signature: signature.clone(),
    };
    if let Some(pipeline) = caches
        .materials
        .require(material.id())?
        .pipelines
        .get(&key)
    {
        return Ok(*pipeline);
    }

    let shader = caches.shaders.require(material.shader().id())?;
    let layout = &caches.vertex_formats.require(vertex_format.id())?.layout;
    let translucent = material.blend_mode() == BlendMode::Translucent;
    let label = format!("{} pipeline", material.name());
    let pipeline = device.create_render_pipeline(&RenderPipelineDescriptor {
        label: Some(&label),
        vertex_module: shader.vertex,
        vertex_entry: &shader.vertex_entry,
        fragment_module: shader.fragment,
        fragment_entry: &shader.fragment_entry,
        vertex_layout: layout,
        bindings: &shader.bindings,
        topology: PrimitiveTopology::TriangleList,
        front_face: FrontFace::Ccw,
        color_formats: &signature.color,
        depth_format: signature.depth,
        depth_write: !translucent,
        depth_compare: CompareFunction::Less,
        blend: translucent.then(BlendState::alpha_blending),
    })?;

    if let Some(gpu) = caches.materials.get_mut(material.id()) {
        gpu.pipelines.insert(key, pipeline);
    }
    log::debug!(
        "Created pipeline for material '{}' ({:?}, depth {:?})",
        material.name(),
        signature.color,
        signature.depth
    );
    Ok(pipeline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessDevice;
    use std::sync::Arc;

    fn settings() -> BindSettings {
        BindSettings {
            frames_in_flight: 2,
            swapchain_extent: UVec2::new(640, 480),
        }
    }

    fn vertex_buffer() -> VertexBuffer {
        let format = Arc::new(VertexFormat::position_normal_uv());
        VertexBuffer::new(format, &[[0.0f32; 8]; 3])
    }

    #[test]
    fn test_bind_is_create_or_fetch() {
        let mut device = HeadlessDevice::new(640, 480);
        let mut caches = GpuCaches::default();
        let buffer = vertex_buffer();

        assert!(bind(&buffer, &mut device, &mut caches, &settings()).unwrap());
        let first = caches.vertex_buffers.get(buffer.id()).unwrap().buffer;
        assert!(!bind(&buffer, &mut device, &mut caches, &settings()).unwrap());
        assert_eq!(caches.vertex_buffers.get(buffer.id()).unwrap().buffer, first);
        // The format was bound as a dependency
        assert!(caches.vertex_formats.contains(buffer.format().id()));
        assert_eq!(device.live_resource_count(), 1);
    }

    #[test]
    fn test_unbind_then_bind_creates_new_wrapper() {
        let mut device = HeadlessDevice::new(640, 480);
        let mut caches = GpuCaches::default();
        let buffer = vertex_buffer();

        bind(&buffer, &mut device, &mut caches, &settings()).unwrap();
        let first = caches.vertex_buffers.get(buffer.id()).unwrap().buffer;
        assert!(unbind(&buffer, &mut device, &mut caches));
        assert!(caches.vertex_buffers.get(buffer.id()).is_none());
        assert!(!unbind(&buffer, &mut device, &mut caches));

        bind(&buffer, &mut device, &mut caches, &settings()).unwrap();
        assert_ne!(caches.vertex_buffers.get(buffer.id()).unwrap().buffer, first);
        assert_eq!(device.live_resource_count(), 1);
    }

    #[test]
    fn test_failed_bind_leaves_no_entry() {
        let mut device = HeadlessDevice::new(640, 480);
        let mut caches = GpuCaches::default();
        let texture = Texture::solid_color([0, 0, 0, 255], "black");

        device.fail_next_creations(1);
        assert!(bind(&texture, &mut device, &mut caches, &settings()).is_err());
        assert!(caches.textures.is_empty());

        assert!(bind(&texture, &mut device, &mut caches, &settings()).unwrap());
        assert_eq!(caches.textures.len(), 1);
    }

    #[test]
    fn test_partial_creation_is_rolled_back() {
        let mut device = HeadlessDevice::new(640, 480);
        let mut caches = GpuCaches::default();
        let texture = Texture::solid_color([0, 0, 0, 255], "black");

        // The texture is created, its sampler fails
        device.fail_creations_after(1, 1);
        assert!(bind(&texture, &mut device, &mut caches, &settings()).is_err());
        assert!(caches.textures.require(texture.id()).is_err());
        assert_eq!(device.live_resource_count(), 0);
    }

    #[test]
    fn test_require_reports_kind() {
        let caches = GpuCaches::default();
        let shader_id = ResourceId::next();
        match caches.shaders.require(shader_id) {
            Err(RenderError::NotBound { kind, id }) => {
                assert_eq!(kind, ResourceKind::Shader);
                assert_eq!(id, shader_id);
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_per_frame_uniform_slots() {
        let mut device = HeadlessDevice::new(640, 480);
        let mut caches = GpuCaches::default();
        let uniforms = UniformBuffer::per_frame("object", 240);
        bind(&uniforms, &mut device, &mut caches, &settings()).unwrap();

        let gpu = *caches.uniform_buffers.get(uniforms.id()).unwrap();
        assert_eq!(gpu.stride, 256);
        assert_eq!(gpu.slots, (2 * PassType::COUNT) as u64);
        assert_eq!(gpu.slot_offset(0, PassType::Offscreen), 0);
        assert_eq!(gpu.slot_offset(0, PassType::Standard), 2 * 256);
        assert_eq!(gpu.slot_offset(1, PassType::Offscreen), 4 * 256);
        assert_eq!(
            device.buffer_contents(gpu.buffer).map(<[u8]>::len),
            Some(256 * 8)
        );
    }

    #[test]
    fn test_swapchain_targets_regenerate() {
        let mut device = HeadlessDevice::new(640, 480);
        let mut caches = GpuCaches::default();
        let color = Arc::new(RenderTarget::new(
            "color",
            TextureFormat::Rgba16Float,
            TargetSize::Swapchain(0.5),
        ));
        let fixed = Arc::new(RenderTarget::new(
            "fixed",
            TextureFormat::Rgba8Unorm,
            TargetSize::Fixed(UVec2::new(64, 64)),
        ));
        let frame_buffer = FrameBuffer::new("half", vec![color.clone()], None);
        bind(&frame_buffer, &mut device, &mut caches, &settings()).unwrap();
        bind(fixed.as_ref(), &mut device, &mut caches, &settings()).unwrap();
        assert_eq!(
            caches.frame_buffers.get(frame_buffer.id()).unwrap().extent,
            UVec2::new(320, 240)
        );
        let old_texture = caches.render_targets.get(color.id()).unwrap().texture;

        caches
            .regenerate_swapchain_targets(&mut device, UVec2::new(1000, 800))
            .unwrap();

        let gpu_frame_buffer = caches.frame_buffers.get(frame_buffer.id()).unwrap();
        assert_eq!(gpu_frame_buffer.extent, UVec2::new(500, 400));
        assert_ne!(gpu_frame_buffer.color[0], old_texture);
        assert_eq!(
            caches.render_targets.get(fixed.id()).unwrap().extent,
            UVec2::new(64, 64)
        );
        assert_eq!(device.live_resource_count(), 2);
    }

    #[test]
    fn test_failed_regeneration_keeps_old_targets() {
        let mut device = HeadlessDevice::new(640, 480);
        let mut caches = GpuCaches::default();
        let full = Arc::new(RenderTarget::new(
            "full",
            TextureFormat::Rgba16Float,
            TargetSize::Swapchain(1.0),
        ));
        let normal = Arc::new(RenderTarget::new(
            "normal",
            TextureFormat::Rgba8Unorm,
            TargetSize::Swapchain(1.0),
        ));
        let frame_buffer = FrameBuffer::new("gbuffer", vec![full.clone(), normal.clone()], None);
        bind(&frame_buffer, &mut device, &mut caches, &settings()).unwrap();
        let old = [full.id(), normal.id()].map(|id| caches.render_targets.get(id).unwrap().texture);

        // The first new texture is created, the second fails
        device.fail_creations_after(1, 1);
        assert!(caches
            .regenerate_swapchain_targets(&mut device, UVec2::new(1000, 800))
            .is_err());

        let targets = [full.id(), normal.id()].map(|id| *caches.render_targets.get(id).unwrap());
        assert_eq!(targets.map(|target| target.texture), old);
        assert_eq!(targets[0].extent, UVec2::new(640, 480));
        let gpu_frame_buffer = caches.frame_buffers.get(frame_buffer.id()).unwrap();
        assert_eq!(gpu_frame_buffer.color, old.to_vec());
        assert_eq!(gpu_frame_buffer.extent, UVec2::new(640, 480));
        assert_eq!(device.live_resource_count(), 2);

        caches
            .regenerate_swapchain_targets(&mut device, UVec2::new(1000, 800))
            .unwrap();
        let targets = [full.id(), normal.id()].map(|id| *caches.render_targets.get(id).unwrap());
        let gpu_frame_buffer = caches.frame_buffers.get(frame_buffer.id()).unwrap();
        assert_eq!(gpu_frame_buffer.color, targets.map(|target| target.texture).to_vec());
        assert_eq!(targets[1].extent, UVec2::new(1000, 800));
        assert_eq!(device.live_resource_count(), 2);
    }

    #[test]
    fn test_unbind_render_target_evicts_frame_buffers() {
        let mut device = HeadlessDevice::new(640, 480);
        let mut caches = GpuCaches::default();
        let color = Arc::new(RenderTarget::new(
            "color",
            TextureFormat::Rgba8Unorm,
            TargetSize::Fixed(UVec2::new(64, 64)),
        ));
        let depth = Arc::new(RenderTarget::new(
            "depth",
            TextureFormat::Depth32Float,
            TargetSize::Fixed(UVec2::new(64, 64)),
        ));
        let with_depth = FrameBuffer::new("shadow", vec![color.clone()], Some(depth.clone()));
        let depth_only = FrameBuffer::new("depth only", vec![], Some(depth.clone()));
        bind(&with_depth, &mut device, &mut caches, &settings()).unwrap();
        bind(&depth_only, &mut device, &mut caches, &settings()).unwrap();

        assert!(unbind(color.as_ref(), &mut device, &mut caches));
        assert!(caches.frame_buffers.get(with_depth.id()).is_none());
        assert!(caches.frame_buffers.contains(depth_only.id()));
        assert_eq!(device.live_resource_count(), 1);

        // Binding the frame buffer again brings its target back
        assert!(bind(&with_depth, &mut device, &mut caches, &settings()).unwrap());
        let color_texture = caches.render_targets.get(color.id()).unwrap().texture;
        assert_eq!(
            caches.frame_buffers.get(with_depth.id()).unwrap().color,
            vec![color_texture]
        );
    }

    #[test]
    fn test_unbind_material_dependencies_evicts_material() {
        let mut device = HeadlessDevice::new(640, 480);
        let mut caches = GpuCaches::default();
        let shader = Arc::new(Shader::basic().unwrap());
        let texture = Arc::new(Texture::solid_color([255, 255, 255, 255], "white"));
        let material = Material::new("textured", shader.clone()).with_texture(1, texture.clone());
        let other = Material::new("plain", shader.clone());
        let format = VertexFormat::position_normal_uv();
        let signature = TargetSignature {
            color: vec![TextureFormat::Bgra8UnormSrgb],
            depth: Some(TextureFormat::Depth32Float),
        };
        bind(&format, &mut device, &mut caches, &settings()).unwrap();
        bind(&material, &mut device, &mut caches, &settings()).unwrap();
        bind(&other, &mut device, &mut caches, &settings()).unwrap();
        prepare_pipeline(&material, &format, &signature, &mut device, &mut caches).unwrap();
        let live = device.live_resource_count();

        // Its pipeline goes with the material, the shared shader stays
        assert!(unbind(texture.as_ref(), &mut device, &mut caches));
        assert!(caches.materials.get(material.id()).is_none());
        assert!(caches.materials.contains(other.id()));
        assert!(caches.shaders.contains(shader.id()));
        assert_eq!(device.live_resource_count(), live - 3);

        bind(&material, &mut device, &mut caches, &settings()).unwrap();
        assert!(caches.textures.contains(texture.id()));
        assert_eq!(caches.materials.get(material.id()).unwrap().textures, vec![texture.id()]);

        assert!(unbind(shader.as_ref(), &mut device, &mut caches));
        assert!(caches.materials.is_empty());
    }

    #[test]
    fn test_unbind_vertex_format_evicts_buffers_and_pipelines() {
        let mut device = HeadlessDevice::new(640, 480);
        let mut caches = GpuCaches::default();
        let buffer = vertex_buffer();
        let material = Material::new("plain", Arc::new(Shader::basic().unwrap()));
        let signature = TargetSignature {
            color: vec![TextureFormat::Bgra8UnormSrgb],
            depth: None,
        };
        bind(&buffer, &mut device, &mut caches, &settings()).unwrap();
        bind(&material, &mut device, &mut caches, &settings()).unwrap();
        prepare_pipeline(&material, buffer.format(), &signature, &mut device, &mut caches)
            .unwrap();

        assert!(unbind(buffer.format().as_ref(), &mut device, &mut caches));
        assert!(caches.vertex_buffers.is_empty());
        assert!(caches.materials.get(material.id()).unwrap().pipelines.is_empty());

        bind(&buffer, &mut device, &mut caches, &settings()).unwrap();
        assert!(caches.vertex_formats.contains(buffer.format().id()));
    }
}
