//! Frame lifecycle driver on top of a [`GraphicsDevice`]

use std::collections::HashSet;

use glam::{UVec2, Vec2, Vec3};

use super::{
    cache, Bindable, BindSettings, FrameState, FrameStats, FrameSync, GpuCaches, PassType,
    PipelineKey, RenderError, RenderQueue, RenderResult, Renderable, Renderer, ScenePass,
    TargetSignature,
};
use crate::backend::{
    AcquiredImage, BackendError, BindingKind, ColorTarget, CullMode, GraphicsDevice,
    RenderPassBeginInfo, RenderPipelineHandle, ResourceBinding, TextureDescriptor, TextureFormat,
    TextureHandle, TextureUsage, Viewport,
};
use crate::resources::{ObjectUniforms, ResourceId, ResourceKind, OBJECT_UNIFORM_BINDING};
use crate::scene::{Camera, GpuLightData};
use crate::EngineConfig;

/// Settings the renderer is created with
#[derive(Debug, Clone)]
pub struct RendererConfig {
    pub frames_in_flight: usize,
    pub clear_color: [f32; 4],
    pub clear_depth: f32,
    pub depth_format: TextureFormat,
    pub vsync: bool,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            clear_depth: 1.0,
            depth_format: TextureFormat::Depth32Float,
            vsync: true,
        }
    }
}

impl From<&EngineConfig> for RendererConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            frames_in_flight: config.frames_in_flight,
            clear_color: config.clear_color,
            vsync: config.vsync,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct DepthTarget {
    texture: TextureHandle,
    extent: UVec2,
}

/// Pass currently being recorded
#[derive(Debug)]
struct ActivePass {
    pass_type: PassType,
    signature: TargetSignature,
    pipeline: Option<RenderPipelineHandle>,
    cull_mode: Option<CullMode>,
}

/// Renders scene passes through a [`GraphicsDevice`].
///
/// Owns the GPU resource caches, the per-frame synchronization objects and
/// the swapchain depth target. A frame is driven by calling, in order,
/// [`begin_frame`](Self::begin_frame), [`update_frame`](Self::update_frame),
/// [`render_frame`](Self::render_frame), [`submit_frame`](Self::submit_frame)
/// and [`end_frame`](Self::end_frame); calling them out of order returns
/// [`RenderError::FrameOrder`].
pub struct SceneRenderer<D: GraphicsDevice> {
    device: D,
    config: RendererConfig,
    state: FrameState,
    sync: Option<FrameSync>,
    caches: GpuCaches,
    depth: Option<DepthTarget>,
    swapchain_extent: UVec2,
    frame_number: u64,
    image: Option<AcquiredImage>,
    /// (uniform buffer, pass) pairs written this frame
    uploaded: HashSet<(ResourceId, PassType)>,
    primary_light: GpuLightData,
    active_pass: Option<ActivePass>,
    stats: FrameStats,
    last_stats: FrameStats,
    needs_resize: bool,
}

impl<D: GraphicsDevice> SceneRenderer<D> {
    pub fn new(device: D, config: RendererConfig) -> Self {
        let swapchain_extent = device.surface_size();
        Self {
            device,
            config,
            state: FrameState::Uninitialized,
            sync: None,
            caches: GpuCaches::default(),
            depth: None,
            swapchain_extent,
            frame_number: 0,
            image: None,
            uploaded: HashSet::new(),
            primary_light: GpuLightData::default(),
            active_pass: None,
            stats: FrameStats::default(),
            last_stats: FrameStats::default(),
            needs_resize: false,
        }
    }

    /// Create the synchronization objects and the depth target.
    ///
    /// # Panics
    ///
    /// Panics if the renderer was already initialized or if no frame is
    /// allowed in flight.
    pub fn init(&mut self) -> RenderResult<()> {
        assert_eq!(
            self.state,
            FrameState::Uninitialized,
            "renderer initialized twice"
        );
        assert!(self.sync.is_none(), "renderer initialized twice");

        self.sync = Some(FrameSync::new(&mut self.device, self.config.frames_in_flight)?);
        self.create_depth_target()?;
        self.state = FrameState::Prepared;
        log::info!(
            "Renderer initialized on {} ({}x{}, {} frames in flight)",
            self.device.name(),
            self.swapchain_extent.x,
            self.swapchain_extent.y,
            self.config.frames_in_flight
        );
        Ok(())
    }

    fn expect_state(&self, expected: FrameState) -> RenderResult<()> {
        if self.state != expected {
            return Err(RenderError::FrameOrder {
                expected,
                found: self.state,
            });
        }
        Ok(())
    }

    fn sync(&self) -> RenderResult<&FrameSync> {
        self.sync.as_ref().ok_or(RenderError::FrameOrder {
            expected: FrameState::Prepared,
            found: self.state,
        })
    }

    fn bind_settings(&self) -> BindSettings {
        BindSettings {
            frames_in_flight: self.config.frames_in_flight,
            swapchain_extent: self.swapchain_extent,
        }
    }

    /// Attachment formats of passes rendering to the swapchain
    pub fn swapchain_signature(&self) -> TargetSignature {
        TargetSignature {
            color: vec![self.device.swapchain_format()],
            depth: Some(self.config.depth_format),
        }
    }

    fn create_depth_target(&mut self) -> RenderResult<()> {
        if let Some(depth) = self.depth.take() {
            self.device.destroy_texture(depth.texture);
        }
        let extent = self.swapchain_extent;
        if extent.x == 0 || extent.y == 0 {
            return Ok(());
        }
        let texture = self.device.create_texture(
            &TextureDescriptor {
                label: Some("swapchain depth".to_string()),
                width: extent.x,
                height: extent.y,
                format: self.config.depth_format,
                usage: TextureUsage::RENDER_ATTACHMENT,
            },
            None,
        )?;
        self.depth = Some(DepthTarget { texture, extent });
        Ok(())
    }

    /// Create the backend wrapper of `resource` unless it exists.
    /// Returns whether a wrapper was created.
    pub fn bind<R: Bindable + ?Sized>(&mut self, resource: &R) -> RenderResult<bool> {
        let settings = self.bind_settings();
        cache::bind(resource, &mut self.device, &mut self.caches, &settings)
    }

    /// Backend wrapper of `resource`, without creating it
    pub fn get<R: Bindable + ?Sized>(&self, resource: &R) -> Option<&R::Gpu> {
        R::cache(&self.caches).get(resource.resource_id())
    }

    /// Destroy the backend wrapper of `resource` once the device is idle.
    /// Only allowed between frames.
    pub fn unbind<R: Bindable + ?Sized>(&mut self, resource: &R) -> RenderResult<bool> {
        self.expect_state(FrameState::Prepared)?;
        if !R::cache(&self.caches).contains(resource.resource_id()) {
            return Ok(false);
        }
        self.device.wait_idle()?;
        Ok(cache::unbind(resource, &mut self.device, &mut self.caches))
    }

    /// Bind every resource the renderables drawn by `pass` use, and prepare
    /// their pipelines for the targets they are drawn into
    pub fn compute_graphics_resources(
        &mut self,
        queue: &RenderQueue,
        pass: &ScenePass,
    ) -> RenderResult<()> {
        self.expect_state(FrameState::Prepared)?;
        let settings = self.bind_settings();
        let swapchain_signature = self.swapchain_signature();
        let bound_before = self.caches.len();

        pass.visit(&mut |scene_pass| {
            let signature = match &scene_pass.data.target {
                Some(target) => {
                    cache::bind(target.as_ref(), &mut self.device, &mut self.caches, &settings)?;
                    self.caches.frame_buffers.require(target.id())?.signature.clone()
                }
                None => swapchain_signature.clone(),
            };
            for renderable in scene_pass.eligible(queue) {
                self.bind_renderable(renderable, &settings)?;
                cache::prepare_pipeline(
                    &renderable.material,
                    renderable.geometry.vertex_format(),
                    &signature,
                    &mut self.device,
                    &mut self.caches,
                )?;
            }
            Ok(())
        })?;

        log::debug!(
            "Computed graphics resources for {} renderables ({} new cache entries)",
            queue.len(),
            self.caches.len() - bound_before
        );
        Ok(())
    }

    fn bind_renderable(
        &mut self,
        renderable: &Renderable,
        settings: &BindSettings,
    ) -> RenderResult<()> {
        let geometry = &renderable.geometry;
        cache::bind(
            geometry.vertex_buffer().as_ref(),
            &mut self.device,
            &mut self.caches,
            settings,
        )?;
        if let Some(index_buffer) = geometry.index_buffer() {
            cache::bind(index_buffer.as_ref(), &mut self.device, &mut self.caches, settings)?;
        }
        cache::bind(
            renderable.uniforms.as_ref(),
            &mut self.device,
            &mut self.caches,
            settings,
        )?;
        cache::bind(
            renderable.material.as_ref(),
            &mut self.device,
            &mut self.caches,
            settings,
        )?;
        Ok(())
    }

    /// Wait for the frame slot to be free and acquire the next swapchain
    /// image. Returns the image index.
    ///
    /// An out of date swapchain is reported as
    /// [`BackendError::SurfaceOutdated`] and leaves the renderer between
    /// frames.
    pub fn begin_frame(&mut self) -> RenderResult<u32> {
        self.expect_state(FrameState::Prepared)?;
        let slot = *self.sync()?.slot(self.frame_number);

        // Blocks while the GPU still executes the slot's previous frame
        self.device.wait_fence(slot.in_flight)?;
        let image = self.device.acquire_next_image(slot.present_complete)?;
        if image.suboptimal {
            self.needs_resize = true;
        }
        self.device.begin_command_buffer(slot.command_buffer)?;

        self.image = Some(image);
        self.uploaded.clear();
        self.stats = FrameStats {
            frame: self.frame_number,
            image_index: image.index,
            ..Default::default()
        };
        self.state = FrameState::Begun;
        log::trace!("Frame {} begun on image {}", self.frame_number, image.index);
        Ok(image.index)
    }

    /// Upload the per-object uniforms of every renderable `pass` draws
    pub fn update_frame(
        &mut self,
        queue: &RenderQueue,
        pass: &ScenePass,
        camera: &Camera,
        time: f32,
    ) -> RenderResult<()> {
        self.expect_state(FrameState::Begun)?;
        self.primary_light = queue.lights().first().copied().unwrap_or_default();
        pass.update(self, queue, camera, time)?;
        self.state = FrameState::Updated;
        Ok(())
    }

    /// Record the draws of `pass` into the frame's command buffer
    pub fn render_frame(&mut self, queue: &RenderQueue, pass: &ScenePass) -> RenderResult<()> {
        self.expect_state(FrameState::Updated)?;
        let image_index = self.image.map(|image| image.index).unwrap_or_default();
        pass.render(self, queue, image_index)?;

        let slot = *self.sync()?.slot(self.frame_number);
        self.device.end_command_buffer(slot.command_buffer)?;
        self.state = FrameState::Recorded;
        log::trace!(
            "Frame {} recorded: {} passes, {} draws",
            self.frame_number,
            self.stats.passes,
            self.stats.total_draw_calls()
        );
        Ok(())
    }

    /// Submit the recorded frame and present its image.
    ///
    /// An out of date or suboptimal swapchain at presentation is not an
    /// error; it is reported by [`take_resize_request`](Self::take_resize_request).
    pub fn submit_frame(&mut self) -> RenderResult<()> {
        self.expect_state(FrameState::Recorded)?;
        self.submit_and_present()
    }

    fn submit_and_present(&mut self) -> RenderResult<()> {
        let sync = self.sync()?;
        let slot = *sync.slot(self.frame_number);
        let image = self.image.ok_or(RenderError::FrameOrder {
            expected: FrameState::Begun,
            found: self.state,
        })?;
        let render_complete = sync.render_complete(image.index)?;

        // The slot's fence stays signaled until a submission will signal it
        self.device.reset_fence(slot.in_flight)?;
        self.device.submit(
            slot.command_buffer,
            slot.present_complete,
            render_complete,
            slot.in_flight,
        )?;
        self.image = None;
        self.state = FrameState::Submitted;

        match self.device.present(image.index, render_complete) {
            Ok(suboptimal) => self.needs_resize |= suboptimal,
            Err(BackendError::SurfaceOutdated) => {
                log::debug!("Swapchain out of date at present");
                self.needs_resize = true;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Abandon a frame that failed after [`begin_frame`](Self::begin_frame)
    /// and return between frames.
    ///
    /// Whatever was recorded is closed and submitted so the slot's fence
    /// and the acquired image go through their usual signal and present
    /// cycle. Does nothing between frames.
    pub fn abort_frame(&mut self) -> RenderResult<()> {
        let cmd = match self.state {
            FrameState::Prepared => return Ok(()),
            FrameState::Begun | FrameState::Updated | FrameState::Recorded => {
                self.sync()?.slot(self.frame_number).command_buffer
            }
            FrameState::Submitted => return self.end_frame(),
            found => {
                return Err(RenderError::FrameOrder {
                    expected: FrameState::Begun,
                    found,
                })
            }
        };
        log::warn!("Aborting frame {} in state {}", self.frame_number, self.state);

        if self.active_pass.take().is_some() {
            self.device.cmd_end_render_pass(cmd);
        }
        if self.state != FrameState::Recorded {
            self.device.end_command_buffer(cmd)?;
            self.state = FrameState::Recorded;
        }
        let presented = self.submit_and_present();
        if self.state == FrameState::Submitted {
            self.end_frame()?;
        }
        presented
    }

    /// Close the frame and advance to the next frame slot
    pub fn end_frame(&mut self) -> RenderResult<()> {
        self.expect_state(FrameState::Submitted)?;
        self.last_stats = self.stats;
        self.frame_number += 1;
        self.state = FrameState::Prepared;
        Ok(())
    }

    /// Recreate the swapchain and every swapchain-sized resource.
    ///
    /// Does nothing while the window is minimized.
    pub fn on_window_resize(&mut self, width: u32, height: u32) -> RenderResult<()> {
        if width == 0 || height == 0 {
            log::debug!("Window minimized, keeping swapchain resources");
            return Ok(());
        }
        self.expect_state(FrameState::Prepared)?;

        self.device.wait_idle()?;
        self.device.resize_swapchain(width, height)?;
        if let Some(sync) = self.sync.as_mut() {
            sync.match_swapchain(&mut self.device)?;
        }
        self.swapchain_extent = self.device.surface_size();
        self.create_depth_target()?;
        self.caches
            .regenerate_swapchain_targets(&mut self.device, self.swapchain_extent)?;
        self.needs_resize = false;
        log::debug!(
            "Renderer resized to {}x{}",
            self.swapchain_extent.x,
            self.swapchain_extent.y
        );
        Ok(())
    }

    /// Whether the swapchain was reported suboptimal or out of date since
    /// the last call
    pub fn take_resize_request(&mut self) -> bool {
        std::mem::take(&mut self.needs_resize)
    }

    /// Wait for the device and release every GPU object
    pub fn shutdown(&mut self) -> RenderResult<()> {
        if matches!(
            self.state,
            FrameState::Terminated | FrameState::Uninitialized
        ) {
            self.state = FrameState::Terminated;
            return Ok(());
        }
        self.device.wait_idle()?;
        self.caches.destroy_all(&mut self.device);
        if let Some(depth) = self.depth.take() {
            self.device.destroy_texture(depth.texture);
        }
        if let Some(sync) = self.sync.take() {
            sync.destroy(&mut self.device);
        }
        self.state = FrameState::Terminated;
        log::info!("Renderer shut down after {} frames", self.frame_number);
        Ok(())
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Statistics of the frame being recorded, or of the last one
    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    /// Statistics of the last completed frame
    pub fn last_stats(&self) -> &FrameStats {
        &self.last_stats
    }

    pub fn swapchain_extent(&self) -> UVec2 {
        self.swapchain_extent
    }

    pub fn caches(&self) -> &GpuCaches {
        &self.caches
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }
}

/// Scissor covering the part of `viewport` inside a target of `extent`
fn scissor_rect(viewport: &Viewport, extent: UVec2) -> (UVec2, UVec2) {
    let origin = Vec2::new(viewport.x, viewport.y);
    let min = origin.clamp(Vec2::ZERO, extent.as_vec2());
    let max = (origin + Vec2::new(viewport.width, viewport.height)).clamp(min, extent.as_vec2());
    (min.as_uvec2(), max.as_uvec2() - min.as_uvec2())
}

impl<D: GraphicsDevice> Renderer for SceneRenderer<D> {
    fn begin_pass(&mut self, pass: &ScenePass, image_index: u32) -> RenderResult<()> {
        let (mut info, signature) = match &pass.data.target {
            Some(target) => {
                let frame_buffer = self.caches.frame_buffers.require(target.id())?;
                let info = RenderPassBeginInfo {
                    color_targets: frame_buffer
                        .color
                        .iter()
                        .map(|texture| ColorTarget::Texture(*texture))
                        .collect(),
                    depth_target: frame_buffer.depth,
                    extent: frame_buffer.extent,
                    clear_color: None,
                    clear_depth: None,
                    clear_stencil: 0,
                };
                (info, frame_buffer.signature.clone())
            }
            None => {
                let info = RenderPassBeginInfo {
                    color_targets: vec![ColorTarget::Swapchain(image_index)],
                    depth_target: self.depth.map(|depth| depth.texture),
                    extent: self.depth.map_or(self.swapchain_extent, |depth| depth.extent),
                    clear_color: None,
                    clear_depth: None,
                    clear_stencil: 0,
                };
                (info, self.swapchain_signature())
            }
        };
        info.clear_color = pass.data.clear_color;
        if info.depth_target.is_some() {
            info.clear_depth = pass.data.clear_depth;
            info.clear_stencil = pass.data.clear_stencil;
        }

        let cmd = self.sync()?.slot(self.frame_number).command_buffer;
        self.device.cmd_begin_render_pass(cmd, &info);
        let viewport = pass
            .data
            .viewport
            .unwrap_or_else(|| Viewport::from_extent(info.extent));
        self.device.cmd_set_viewport(cmd, &viewport);
        let (offset, extent) = scissor_rect(&viewport, info.extent);
        self.device.cmd_set_scissor(cmd, offset, extent);

        self.active_pass = Some(ActivePass {
            pass_type: pass.pass_type(),
            signature,
            pipeline: None,
            cull_mode: None,
        });
        self.stats.passes += 1;
        log::trace!("Begin {} pass", pass.pass_type());
        Ok(())
    }

    fn end_pass(&mut self, pass: &ScenePass, _image_index: u32) -> RenderResult<()> {
        let cmd = self.sync()?.slot(self.frame_number).command_buffer;
        if self.active_pass.take().is_none() {
            return Err(RenderError::PassNotBegun(pass.pass_type()));
        }
        self.device.cmd_end_render_pass(cmd);
        Ok(())
    }

    fn draw(&mut self, pass: &ScenePass, renderable: &Renderable) -> RenderResult<()> {
        let sync = self.sync()?;
        let cmd = sync.slot(self.frame_number).command_buffer;
        let frame_slot = sync.slot_index(self.frame_number);

        let active = match self.active_pass.as_mut() {
            Some(active) if active.pass_type == pass.pass_type() => active,
            _ => return Err(RenderError::PassNotBegun(pass.pass_type())),
        };

        let material = &renderable.material;
        let shader = material.shader();
        let geometry = &renderable.geometry;
        let key = PipelineKey {
            vertex_format: geometry.vertex_format().id(),
            signature: active.signature.clone(),
        };
        let pipeline = *self
            .caches
            .materials
            .require(material.id())?
            .pipelines
            .get(&key)
            .ok_or(RenderError::NotBound {
                kind: ResourceKind::Material,
                id: material.id(),
            })?;

        let mut bindings = Vec::new();
        if shader.declares(OBJECT_UNIFORM_BINDING, BindingKind::UniformBuffer) {
            let object = self.caches.uniform_buffers.require(renderable.uniforms.id())?;
            bindings.push(ResourceBinding::Uniform {
                binding: OBJECT_UNIFORM_BINDING,
                buffer: object.buffer,
                offset: object.slot_offset(frame_slot, pass.pass_type()),
                size: object.size,
            });
        }
        if let Some(uniforms) = material.uniform_buffer() {
            if shader.declares(material.uniform_binding(), BindingKind::UniformBuffer) {
                let gpu = self.caches.uniform_buffers.require(uniforms.id())?;
                bindings.push(ResourceBinding::Uniform {
                    binding: material.uniform_binding(),
                    buffer: gpu.buffer,
                    offset: 0,
                    size: gpu.size,
                });
            }
        }
        for texture in material.textures() {
            if !shader.declares(texture.binding, BindingKind::SampledTexture) {
                continue;
            }
            let gpu = self.caches.textures.require(texture.texture.id())?;
            bindings.push(ResourceBinding::Texture {
                binding: texture.binding,
                texture: gpu.texture,
                sampler: gpu.sampler,
            });
        }

        let vertex = *self
            .caches
            .vertex_buffers
            .require(geometry.vertex_buffer().id())?;
        let index = match geometry.index_buffer() {
            Some(index_buffer) => Some(*self.caches.index_buffers.require(index_buffer.id())?),
            None => None,
        };

        let (cull_mode, _) = renderable.effect_in(&pass.effect).apply(&renderable.world);
        if active.pipeline != Some(pipeline) {
            self.device.cmd_set_pipeline(cmd, pipeline);
            active.pipeline = Some(pipeline);
        }
        if active.cull_mode != Some(cull_mode) {
            self.device.cmd_set_cull_mode(cmd, cull_mode);
            active.cull_mode = Some(cull_mode);
        }
        if !bindings.is_empty() {
            self.device.cmd_bind_resources(cmd, pipeline, &bindings);
        }
        self.device.cmd_set_vertex_buffer(cmd, 0, vertex.buffer);
        match index {
            Some(index) => {
                self.device
                    .cmd_set_index_buffer(cmd, index.buffer, index.format);
                self.device.cmd_draw_indexed(cmd, index.index_count, 1);
            }
            None => self.device.cmd_draw(cmd, vertex.vertex_count, 1),
        }
        self.stats.draws[pass.pass_type().index()] += 1;
        Ok(())
    }

    fn update_object(
        &mut self,
        pass: &ScenePass,
        renderable: &Renderable,
        camera: &Camera,
        time: f32,
    ) -> RenderResult<()> {
        if !self.uploaded.insert((renderable.uniforms.id(), pass.pass_type())) {
            return Ok(());
        }
        let frame_slot = self.sync()?.slot_index(self.frame_number);
        let gpu = *self
            .caches
            .uniform_buffers
            .require(renderable.uniforms.id())?;

        let (_, model) = renderable.effect_in(&pass.effect).apply(&renderable.world);
        let light = self.primary_light;
        let light_direction = if light.position_or_direction.w == 0.0 {
            light.position_or_direction.truncate()
        } else {
            let position = model.transform_point3(Vec3::ZERO);
            (position - light.position_or_direction.truncate()).normalize_or_zero()
        };
        let uniforms = ObjectUniforms {
            model,
            normal_matrix: model.inverse().transpose(),
            view_proj: camera.projection_view(),
            camera_position: camera.position().extend(time),
            light_direction: light_direction.extend(0.0),
            light_color: light.color_intensity,
        };

        self.device.write_buffer(
            gpu.buffer,
            gpu.slot_offset(frame_slot, pass.pass_type()),
            bytemuck::bytes_of(&uniforms),
        )?;
        self.stats.uniform_uploads += 1;
        Ok(())
    }
}

impl<D: GraphicsDevice> Drop for SceneRenderer<D> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("Renderer shutdown failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HeadlessDevice, RecordedCommand};
    use crate::render::{PassData, PassMask, RenderableType, VisualEffect};
    use crate::resources::{
        BlendMode, FrameBuffer, Material, Mesh, RenderTarget, Shader, TargetSize, VertexFormat,
    };
    use crate::scene::{ClipSpace, GeometryNode, Node};
    use std::sync::Arc;

    fn renderer(frames_in_flight: usize) -> SceneRenderer<HeadlessDevice> {
        let config = RendererConfig {
            frames_in_flight,
            ..Default::default()
        };
        let mut renderer = SceneRenderer::new(HeadlessDevice::new(320, 240), config);
        renderer.init().unwrap();
        renderer
    }

    fn geometry_node(passes: PassMask) -> Node {
        let shader = Arc::new(Shader::basic().unwrap());
        let material = Material::new("red", shader).with_param("base_color", glam::Vec4::X);
        let format = Arc::new(VertexFormat::position_normal_uv());
        let geometry = GeometryNode::new(Mesh::cube().to_geometry(format), Arc::new(material))
            .with_passes(passes);
        Node::geometry("cube", geometry)
    }

    fn camera() -> Camera {
        let mut camera = Camera::new(ClipSpace::VULKAN);
        camera.set_position(Vec3::new(0.0, 0.0, 5.0));
        camera.update_view_matrix();
        camera.update_perspective_projection_matrix(45, 4.0 / 3.0, 0.1, 100.0);
        camera
    }

    fn run_frame(
        renderer: &mut SceneRenderer<HeadlessDevice>,
        queue: &RenderQueue,
        pass: &ScenePass,
    ) {
        renderer.begin_frame().unwrap();
        renderer.update_frame(queue, pass, &camera(), 0.0).unwrap();
        renderer.render_frame(queue, pass).unwrap();
        renderer.submit_frame().unwrap();
        renderer.end_frame().unwrap();
    }

    #[test]
    fn test_frame_lifecycle() {
        let mut renderer = renderer(2);
        let root = geometry_node(PassMask::STANDARD);
        let mut queue = RenderQueue::new();
        queue.populate(&root, &camera());
        let pass = ScenePass::new(PassType::Standard);
        renderer.compute_graphics_resources(&queue, &pass).unwrap();

        run_frame(&mut renderer, &queue, &pass);
        assert_eq!(renderer.state(), FrameState::Prepared);
        assert_eq!(renderer.frame_number(), 1);
        assert_eq!(renderer.last_stats().draw_calls(PassType::Standard), 1);
        assert_eq!(renderer.last_stats().uniform_uploads, 1);
        assert_eq!(renderer.device().stats().submissions, 1);
        assert_eq!(renderer.device().stats().presents, 1);
    }

    #[test]
    fn test_out_of_order_call_is_rejected() {
        let mut renderer = renderer(2);
        let queue = RenderQueue::new();
        let pass = ScenePass::new(PassType::Standard);
        let err = renderer.render_frame(&queue, &pass).unwrap_err();
        assert!(matches!(
            err,
            RenderError::FrameOrder {
                expected: FrameState::Updated,
                found: FrameState::Prepared
            }
        ));
        assert!(matches!(
            renderer.submit_frame(),
            Err(RenderError::FrameOrder { .. })
        ));
    }

    #[test]
    #[should_panic(expected = "initialized twice")]
    fn test_double_init_panics() {
        let mut renderer = renderer(2);
        let _ = renderer.init();
    }

    #[test]
    fn test_draw_records_bindings() {
        let mut renderer = renderer(2);
        let root = geometry_node(PassMask::STANDARD);
        let mut queue = RenderQueue::new();
        queue.populate(&root, &camera());
        let pass = ScenePass::new(PassType::Standard);
        renderer.compute_graphics_resources(&queue, &pass).unwrap();
        run_frame(&mut renderer, &queue, &pass);

        let commands = &renderer.device().submissions()[0].commands;
        assert!(matches!(commands[0], RecordedCommand::BeginRenderPass(_)));
        let bindings = commands
            .iter()
            .find_map(|command| match command {
                RecordedCommand::BindResources { bindings, .. } => Some(bindings.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(bindings.len(), 2);
        assert!(commands
            .iter()
            .any(|command| matches!(command, RecordedCommand::DrawIndexed { index_count: 36, .. })));
        assert!(matches!(commands.last(), Some(RecordedCommand::EndRenderPass)));
    }

    #[test]
    fn test_object_uniforms_use_per_frame_slots() {
        let mut renderer = renderer(2);
        let root = geometry_node(PassMask::STANDARD);
        let mut queue = RenderQueue::new();
        queue.populate(&root, &camera());
        let pass = ScenePass::new(PassType::Standard);
        renderer.compute_graphics_resources(&queue, &pass).unwrap();

        let renderable = &queue.get_renderables(RenderableType::Opaque)[0];
        let gpu = *renderer.get(renderable.uniforms.as_ref()).unwrap();
        run_frame(&mut renderer, &queue, &pass);
        run_frame(&mut renderer, &queue, &pass);

        let offsets: Vec<u64> = renderer
            .device()
            .submissions()
            .iter()
            .filter_map(|submission| {
                submission.commands.iter().find_map(|command| match command {
                    RecordedCommand::BindResources { bindings, .. } => match bindings[0] {
                        ResourceBinding::Uniform { offset, .. } => Some(offset),
                        _ => None,
                    },
                    _ => None,
                })
            })
            .collect();
        assert_eq!(
            offsets,
            [
                gpu.slot_offset(0, PassType::Standard),
                gpu.slot_offset(1, PassType::Standard)
            ]
        );
        assert_ne!(offsets[0], offsets[1]);
    }

    #[test]
    fn test_uploads_deduplicated_per_pass() {
        let mut renderer = renderer(1);
        let root = geometry_node(PassMask::STANDARD | PassType::Shadows);
        let mut queue = RenderQueue::new();
        queue.populate(&root, &camera());
        let pass = ScenePass::composite()
            .with_child(ScenePass::new(PassType::Shadows))
            .with_child(
                ScenePass::new(PassType::Standard)
                    .with_effect(VisualEffect::default().with_cull_mode(CullMode::Front)),
            );
        renderer.compute_graphics_resources(&queue, &pass).unwrap();

        renderer.begin_frame().unwrap();
        renderer.update_frame(&queue, &pass, &camera(), 0.0).unwrap();
        assert_eq!(renderer.stats().uniform_uploads, 2);
        renderer.render_frame(&queue, &pass).unwrap();
        assert_eq!(renderer.stats().draw_calls(PassType::Shadows), 1);
        assert_eq!(renderer.stats().draw_calls(PassType::Standard), 1);
        assert_eq!(renderer.stats().passes, 2);

        assert!(renderer.device().submissions().is_empty());
        renderer.submit_frame().unwrap();
        let culls: Vec<CullMode> = renderer.device().submissions()[0]
            .commands
            .iter()
            .filter_map(|command| match command {
                RecordedCommand::SetCullMode(mode) => Some(*mode),
                _ => None,
            })
            .collect();
        assert_eq!(culls, [CullMode::Back, CullMode::Front]);
    }

    #[test]
    fn test_offscreen_target_pipeline() {
        let mut renderer = renderer(2);
        let root = geometry_node(PassMask::OFFSCREEN | PassType::Standard);
        let mut queue = RenderQueue::new();
        queue.populate(&root, &camera());

        let color = Arc::new(RenderTarget::new(
            "offscreen color",
            TextureFormat::Rgba8Unorm,
            TargetSize::Fixed(UVec2::new(128, 128)),
        ));
        let frame_buffer = Arc::new(FrameBuffer::new("offscreen", vec![color], None));
        let pass = ScenePass::composite()
            .with_child(ScenePass::new(PassType::Offscreen).with_data(PassData {
                target: Some(frame_buffer.clone()),
                ..Default::default()
            }))
            .with_child(ScenePass::new(PassType::Standard));
        renderer.compute_graphics_resources(&queue, &pass).unwrap();

        let material = &queue.get_renderables(RenderableType::Opaque)[0].material;
        assert_eq!(renderer.get(material.as_ref()).unwrap().pipelines.len(), 2);
        assert!(renderer.get(frame_buffer.as_ref()).is_some());

        run_frame(&mut renderer, &queue, &pass);
        let begins: Vec<UVec2> = renderer.device().submissions()[0]
            .commands
            .iter()
            .filter_map(|command| match command {
                RecordedCommand::BeginRenderPass(info) => Some(info.extent),
                _ => None,
            })
            .collect();
        assert_eq!(begins, [UVec2::new(128, 128), UVec2::new(320, 240)]);
    }

    #[test]
    fn test_translucent_material_has_own_pipeline() {
        let mut renderer = renderer(2);
        let shader = Arc::new(Shader::basic().unwrap());
        let glass = Material::new("glass", shader)
            .with_param("base_color", glam::Vec4::new(1.0, 1.0, 1.0, 0.5))
            .with_blend_mode(BlendMode::Translucent);
        let format = Arc::new(VertexFormat::position_normal_uv());
        let root = Node::group("root")
            .with_child(geometry_node(PassMask::STANDARD))
            .with_child(Node::geometry(
                "glass",
                GeometryNode::new(Mesh::plane(1.0, 1.0).to_geometry(format), Arc::new(glass)),
            ));
        let mut queue = RenderQueue::new();
        queue.populate(&root, &camera());
        let pass = ScenePass::new(PassType::Standard);
        renderer.compute_graphics_resources(&queue, &pass).unwrap();
        run_frame(&mut renderer, &queue, &pass);

        assert_eq!(renderer.last_stats().draw_calls(PassType::Standard), 2);
        let pipelines = renderer.device().submissions()[0]
            .commands
            .iter()
            .filter(|command| matches!(command, RecordedCommand::SetPipeline(_)))
            .count();
        assert_eq!(pipelines, 2);
    }

    #[test]
    fn test_draw_without_resources_fails() {
        let mut renderer = renderer(2);
        let root = geometry_node(PassMask::STANDARD);
        let mut queue = RenderQueue::new();
        queue.populate(&root, &camera());
        let pass = ScenePass::new(PassType::Standard);

        renderer.begin_frame().unwrap();
        let err = renderer
            .update_frame(&queue, &pass, &camera(), 0.0)
            .unwrap_err();
        assert!(matches!(
            err,
            RenderError::NotBound {
                kind: ResourceKind::UniformBuffer,
                ..
            }
        ));
    }

    #[test]
    fn test_failed_update_is_aborted() {
        let mut renderer = renderer(1);
        let root = geometry_node(PassMask::STANDARD);
        let mut queue = RenderQueue::new();
        queue.populate(&root, &camera());
        let pass = ScenePass::new(PassType::Standard);

        renderer.begin_frame().unwrap();
        assert!(renderer.update_frame(&queue, &pass, &camera(), 0.0).is_err());
        renderer.abort_frame().unwrap();
        assert_eq!(renderer.state(), FrameState::Prepared);
        assert_eq!(renderer.frame_number(), 1);
        assert_eq!(renderer.device().stats().presents, 1);
        assert!(renderer.device().submissions()[0].commands.is_empty());

        // The single frame slot is usable again
        renderer.compute_graphics_resources(&queue, &pass).unwrap();
        run_frame(&mut renderer, &queue, &pass);
        assert_eq!(renderer.last_stats().draw_calls(PassType::Standard), 1);
        // Between frames there is nothing to abort
        renderer.abort_frame().unwrap();
        assert_eq!(renderer.frame_number(), 2);
    }

    #[test]
    fn test_failed_draw_closes_pass_on_abort() {
        let mut renderer = renderer(2);
        let root = geometry_node(PassMask::STANDARD);
        let mut queue = RenderQueue::new();
        queue.populate(&root, &camera());
        let pass = ScenePass::new(PassType::Standard);
        renderer.compute_graphics_resources(&queue, &pass).unwrap();
        let vertex_buffer = queue.get_renderables(RenderableType::Opaque)[0]
            .geometry
            .vertex_buffer()
            .clone();
        renderer.unbind(vertex_buffer.as_ref()).unwrap();

        renderer.begin_frame().unwrap();
        renderer.update_frame(&queue, &pass, &camera(), 0.0).unwrap();
        let err = renderer.render_frame(&queue, &pass).unwrap_err();
        assert!(matches!(
            err,
            RenderError::NotBound {
                kind: ResourceKind::VertexBuffer,
                ..
            }
        ));
        renderer.abort_frame().unwrap();
        assert_eq!(renderer.state(), FrameState::Prepared);
        let commands = &renderer.device().submissions()[0].commands;
        assert!(matches!(commands.first(), Some(RecordedCommand::BeginRenderPass(_))));
        assert!(matches!(commands.last(), Some(RecordedCommand::EndRenderPass)));

        renderer.compute_graphics_resources(&queue, &pass).unwrap();
        run_frame(&mut renderer, &queue, &pass);
        assert_eq!(renderer.last_stats().draw_calls(PassType::Standard), 1);
    }

    #[test]
    fn test_scissor_clamped_to_target() {
        let extent = UVec2::new(320, 240);
        let viewport = |x: f32, y: f32, width: f32, height: f32| Viewport {
            x,
            y,
            width,
            height,
            min_depth: 0.0,
            max_depth: 1.0,
        };

        let inside = scissor_rect(&viewport(10.0, 20.0, 100.0, 50.0), extent);
        assert_eq!(inside, (UVec2::new(10, 20), UVec2::new(100, 50)));
        let left = scissor_rect(&viewport(-10.0, 0.0, 100.0, 240.0), extent);
        assert_eq!(left, (UVec2::ZERO, UVec2::new(90, 240)));
        let right = scissor_rect(&viewport(300.0, 200.0, 100.0, 100.0), extent);
        assert_eq!(right, (UVec2::new(300, 200), UVec2::new(20, 40)));
        let outside = scissor_rect(&viewport(-200.0, 0.0, 100.0, 240.0), extent);
        assert_eq!(outside.1.x, 0);
    }

    #[test]
    fn test_resize_while_minimized_is_noop() {
        let mut renderer = renderer(2);
        renderer.on_window_resize(0, 240).unwrap();
        renderer.on_window_resize(320, 0).unwrap();
        assert_eq!(renderer.device().stats().swapchain_recreations, 0);
        assert_eq!(renderer.swapchain_extent(), UVec2::new(320, 240));

        renderer.on_window_resize(640, 480).unwrap();
        assert_eq!(renderer.device().stats().swapchain_recreations, 1);
        assert_eq!(renderer.swapchain_extent(), UVec2::new(640, 480));
    }

    #[test]
    fn test_outdated_acquire_keeps_renderer_between_frames() {
        let mut renderer = renderer(2);
        renderer.device_mut().mark_swapchain_outdated();
        let err = renderer.begin_frame().unwrap_err();
        assert!(matches!(
            err,
            RenderError::Backend(BackendError::SurfaceOutdated)
        ));
        assert_eq!(renderer.state(), FrameState::Prepared);
        renderer.on_window_resize(320, 240).unwrap();
        assert!(renderer.begin_frame().is_ok());
    }

    #[test]
    fn test_unbind_between_frames_only() {
        let mut renderer = renderer(2);
        let root = geometry_node(PassMask::STANDARD);
        let mut queue = RenderQueue::new();
        queue.populate(&root, &camera());
        let pass = ScenePass::new(PassType::Standard);
        renderer.compute_graphics_resources(&queue, &pass).unwrap();
        let uniforms = queue.get_renderables(RenderableType::Opaque)[0].uniforms.clone();

        renderer.begin_frame().unwrap();
        assert!(renderer.unbind(uniforms.as_ref()).is_err());
        renderer.update_frame(&queue, &pass, &camera(), 0.0).unwrap();
        renderer.render_frame(&queue, &pass).unwrap();
        renderer.submit_frame().unwrap();
        renderer.end_frame().unwrap();

        assert!(renderer.unbind(uniforms.as_ref()).unwrap());
        assert!(renderer.get(uniforms.as_ref()).is_none());
        assert!(!renderer.unbind(uniforms.as_ref()).unwrap());
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let mut renderer = renderer(2);
        let root = geometry_node(PassMask::STANDARD);
        let mut queue = RenderQueue::new();
        queue.populate(&root, &camera());
        let pass = ScenePass::new(PassType::Standard);
        renderer.compute_graphics_resources(&queue, &pass).unwrap();
        run_frame(&mut renderer, &queue, &pass);

        renderer.shutdown().unwrap();
        assert_eq!(renderer.state(), FrameState::Terminated);
        assert!(renderer.caches().is_empty());
        assert_eq!(renderer.device().live_resource_count(), 0);
    }
}
