//! Graphics system orchestrating the frame loop

use std::collections::HashSet;

use glam::{UVec2, Vec2, Vec3};

use super::{
    PassData, PassType, RenderError, RenderQueue, RenderResult, RendererConfig, ScenePass,
    SceneRenderer,
};
use crate::backend::{BackendError, GraphicsDevice};
use crate::context::EngineContext;
use crate::scene::{Camera, CameraInput, FpsController, Node, SceneSummary};
use crate::window::{KeyCode, PlatformWindow, WindowEvent};

/// Owns the renderer, the main camera, the render queue and the root pass,
/// and drives one frame per [`run`](Self::run).
pub struct GraphicsSystem<D: GraphicsDevice> {
    renderer: SceneRenderer<D>,
    camera: Camera,
    controller: FpsController,
    input: CameraInput,
    held_keys: HashSet<KeyCode>,
    queue: RenderQueue,
    pass: ScenePass,
    scene: Option<Node>,
    /// Last known window client size
    extent: UVec2,
    elapsed_time: f32,
    should_close: bool,
}

impl<D: GraphicsDevice> GraphicsSystem<D> {
    /// Create the renderer on `device`, then the main camera sized after
    /// `window`, the render queue and a composite pass holding a standard
    /// pass.
    pub fn init(
        ctx: &EngineContext,
        window: &impl PlatformWindow,
        device: D,
    ) -> RenderResult<Self> {
        let config = ctx.config();
        config.validate()?;

        let mut renderer = SceneRenderer::new(device, RendererConfig::from(config));
        renderer.init()?;

        let extent = if window.is_minimized() {
            UVec2::new(config.width, config.height)
        } else {
            window.dimensions()
        };
        let mut camera = Camera::new(config.clip_space);
        camera.update_perspective_projection_matrix(
            config.fov_degrees,
            extent.x as f32 / extent.y as f32,
            config.near,
            config.far,
        );
        camera.update_view_matrix();

        let mut controller = FpsController::new();
        controller.sync_with_camera(&camera);

        let pass = ScenePass::composite().with_child(ScenePass::new(PassType::Standard).with_data(
            PassData {
                clear_color: Some(renderer.config().clear_color),
                clear_depth: Some(renderer.config().clear_depth),
                ..Default::default()
            },
        ));

        log::info!("Graphics system initialized ({}x{})", extent.x, extent.y);
        Ok(Self {
            renderer,
            camera,
            controller,
            input: CameraInput::new(),
            held_keys: HashSet::new(),
            queue: RenderQueue::new(),
            pass,
            scene: None,
            extent: window.dimensions(),
            elapsed_time: 0.0,
            should_close: false,
        })
    }

    /// Make `root` the rendered scene and bind everything it draws
    pub fn set_scene(&mut self, root: Node) -> RenderResult<()> {
        self.camera.update_view_matrix();
        self.camera.update_perspective_projection_matrix_current();

        let summary = SceneSummary::of(&root);
        log::info!(
            "Scene '{}' set: {} nodes, {} geometries, {} lights, {} triangles",
            root.name(),
            summary.nodes,
            summary.geometries,
            summary.lights,
            summary.triangles
        );
        self.scene = Some(root);
        self.recompute_graphics_resources()
    }

    /// Repopulate the queue and bind resources the scene gained since the
    /// last call
    pub fn recompute_graphics_resources(&mut self) -> RenderResult<()> {
        let root = self.scene.as_ref().ok_or(RenderError::NoScene)?;
        self.queue.populate(root, &self.camera);
        self.renderer
            .compute_graphics_resources(&self.queue, &self.pass)
    }

    /// Drain the window's events: resizes reach the renderer and the camera,
    /// input reaches the camera controller
    pub fn process_events(&mut self, window: &mut impl PlatformWindow) -> RenderResult<()> {
        for event in window.drain_events() {
            match event {
                WindowEvent::Resized { width, height } => self.resize(width, height)?,
                WindowEvent::KeyPressed(key) => {
                    self.held_keys.insert(key);
                }
                WindowEvent::KeyReleased(key) => {
                    self.held_keys.remove(&key);
                }
                WindowEvent::MouseMoved { dx, dy } => self.input.mouse_delta += Vec2::new(dx, dy),
                WindowEvent::CloseRequested => self.should_close = true,
            }
        }
        self.input.movement = self.movement_axes();
        self.input.speed_multiplier = if self.held_keys.contains(&KeyCode::ShiftLeft) {
            3.0
        } else {
            1.0
        };
        Ok(())
    }

    fn movement_axes(&self) -> Vec3 {
        let axis = |positive: KeyCode, negative: KeyCode| {
            let held = |key: KeyCode| self.held_keys.contains(&key) as i32 as f32;
            held(positive) - held(negative)
        };
        Vec3::new(
            axis(KeyCode::KeyD, KeyCode::KeyA),
            axis(KeyCode::KeyE, KeyCode::KeyQ),
            axis(KeyCode::KeyW, KeyCode::KeyS),
        )
    }

    fn resize(&mut self, width: u32, height: u32) -> RenderResult<()> {
        self.extent = UVec2::new(width, height);
        self.renderer.on_window_resize(width, height)?;
        if width > 0 && height > 0 {
            self.camera.set_aspect(width as f32 / height as f32);
            self.camera.update_perspective_projection_matrix_current();
        }
        Ok(())
    }

    /// Render one frame of the scene `dt` seconds after the previous one.
    ///
    /// Skips the frame while the window is minimized or when the swapchain
    /// had to be recreated. A frame that fails after it began is aborted, so
    /// the next call starts from a clean state.
    pub fn run(&mut self, dt: f32) -> RenderResult<()> {
        let root = self.scene.as_ref().ok_or(RenderError::NoScene)?;
        if self.extent.x == 0 || self.extent.y == 0 {
            log::trace!("Window minimized, skipping frame");
            return Ok(());
        }
        self.elapsed_time += dt;

        if self.input.mouse_delta != Vec2::ZERO || self.input.movement != Vec3::ZERO {
            self.controller.sync_with_camera(&self.camera);
            self.controller.update(&mut self.camera, &self.input, dt);
            self.input.reset_deltas();
        }
        self.camera.refresh_altitude_correction();
        self.camera.update_view_matrix();
        self.queue.populate(root, &self.camera);

        match self.renderer.begin_frame() {
            Ok(_) => {}
            Err(RenderError::Backend(BackendError::SurfaceOutdated)) => {
                log::debug!("Swapchain out of date, recreating");
                return self.renderer.on_window_resize(self.extent.x, self.extent.y);
            }
            Err(e) => return Err(e),
        }
        if let Err(e) = self.record_and_present() {
            log::warn!("Frame {} failed: {}", self.renderer.frame_number(), e);
            self.renderer.abort_frame()?;
            return Err(e);
        }

        if self.renderer.take_resize_request() {
            self.renderer
                .on_window_resize(self.extent.x, self.extent.y)?;
        }
        Ok(())
    }

    fn record_and_present(&mut self) -> RenderResult<()> {
        self.renderer
            .update_frame(&self.queue, &self.pass, &self.camera, self.elapsed_time)?;
        self.renderer.render_frame(&self.queue, &self.pass)?;
        self.renderer.submit_frame()?;
        self.renderer.end_frame()
    }

    /// Wait for the GPU and release every GPU object
    pub fn shutdown(&mut self) -> RenderResult<()> {
        self.renderer.shutdown()
    }

    pub fn scene(&self) -> Option<&Node> {
        self.scene.as_ref()
    }

    /// Mutable scene root. Nodes added through it are drawn after
    /// [`recompute_graphics_resources`](Self::recompute_graphics_resources).
    pub fn scene_mut(&mut self) -> Option<&mut Node> {
        self.scene.as_mut()
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    /// Main camera. The view matrix and the altitude correction of the
    /// projection are recomputed every frame.
    pub fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }

    pub fn controller_mut(&mut self) -> &mut FpsController {
        &mut self.controller
    }

    pub fn queue(&self) -> &RenderQueue {
        &self.queue
    }

    pub fn render_pass(&self) -> &ScenePass {
        &self.pass
    }

    /// Root pass. Resources for passes added through it are bound by
    /// [`recompute_graphics_resources`](Self::recompute_graphics_resources).
    pub fn render_pass_mut(&mut self) -> &mut ScenePass {
        &mut self.pass
    }

    pub fn renderer(&self) -> &SceneRenderer<D> {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut SceneRenderer<D> {
        &mut self.renderer
    }

    pub fn should_close(&self) -> bool {
        self.should_close
    }

    /// Seconds of frame time accumulated by [`run`](Self::run)
    pub fn elapsed_time(&self) -> f32 {
        self.elapsed_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessDevice;
    use crate::window::HeadlessWindow;
    use crate::{BackendType, EngineConfig};

    fn system(window: &HeadlessWindow) -> GraphicsSystem<HeadlessDevice> {
        let config = EngineConfig::default()
            .with_backend(BackendType::Headless)
            .with_size(800, 600);
        let ctx = EngineContext::new(config).unwrap();
        let size = window.dimensions();
        GraphicsSystem::init(&ctx, window, HeadlessDevice::new(size.x, size.y)).unwrap()
    }

    #[test]
    fn test_camera_aspect_follows_window() {
        let window = HeadlessWindow::new(800, 400);
        let system = system(&window);
        assert_eq!(system.camera().aspect(), 2.0);
    }

    #[test]
    fn test_minimized_window_uses_config_size() {
        let window = HeadlessWindow::new(0, 0);
        let system = system(&window);
        assert_eq!(system.camera().aspect(), 800.0 / 600.0);
    }

    #[test]
    fn test_run_without_scene() {
        let window = HeadlessWindow::new(800, 600);
        let mut system = system(&window);
        assert!(matches!(system.run(0.016), Err(RenderError::NoScene)));
        assert!(matches!(
            system.recompute_graphics_resources(),
            Err(RenderError::NoScene)
        ));
    }

    #[test]
    fn test_default_pass_is_standard() {
        let window = HeadlessWindow::new(800, 600);
        let system = system(&window);
        let standard = system.render_pass().child(PassType::Standard).unwrap();
        assert_eq!(
            standard.data.clear_color,
            Some(EngineConfig::default().clear_color)
        );
        assert!(system.render_pass().child(PassType::Shadows).is_none());
    }

    #[test]
    fn test_keys_drive_movement() {
        let mut window = HeadlessWindow::new(800, 600);
        let mut system = system(&window);
        window.push_event(WindowEvent::KeyPressed(KeyCode::KeyW));
        window.push_event(WindowEvent::KeyPressed(KeyCode::KeyA));
        system.process_events(&mut window).unwrap();
        assert_eq!(system.input.movement, Vec3::new(-1.0, 0.0, 1.0));

        window.push_event(WindowEvent::KeyReleased(KeyCode::KeyW));
        system.process_events(&mut window).unwrap();
        assert_eq!(system.input.movement, Vec3::new(-1.0, 0.0, 0.0));
    }

    #[test]
    fn test_close_requested() {
        let mut window = HeadlessWindow::new(800, 600);
        let mut system = system(&window);
        window.push_event(WindowEvent::CloseRequested);
        system.process_events(&mut window).unwrap();
        assert!(system.should_close());
    }
}
