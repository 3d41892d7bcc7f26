//! # Scene Demo
//!
//! Renders a small lit scene: a ground plane, an opaque cube, a translucent
//! sphere and a sun light. WASD/QE move the camera, the mouse looks around,
//! Shift speeds up.
//!
//! ```bash
//! # Vulkan window
//! cargo run --example scene_demo
//!
//! # Headless run of 10 frames, triple buffered
//! cargo run --example scene_demo -- --backend headless --max-frames 10 --frames-in-flight 3
//! ```

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use glam::{Quat, Vec3, Vec4};
use scene_graphics::backend::{GraphicsDevice, HeadlessDevice};
use scene_graphics::render::{GraphicsSystem, PassMask};
use scene_graphics::resources::{BlendMode, Material, Mesh, ResourceError, Shader, VertexFormat};
use scene_graphics::scene::{DirectionalLight, GeometryNode, Light, Node, Transform};
use scene_graphics::{BackendType, EngineConfig, EngineContext, HeadlessWindow, PlatformWindow};

// ============================================================================
// CLI
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
enum CliBackend {
    /// Native Vulkan backend via ash.
    #[default]
    Vulkan,
    /// No GPU; frames are recorded and discarded.
    Headless,
}

impl From<CliBackend> for BackendType {
    fn from(cli: CliBackend) -> Self {
        match cli {
            CliBackend::Vulkan => BackendType::Vulkan,
            CliBackend::Headless => BackendType::Headless,
        }
    }
}

/// Scene graphics demo arguments.
#[derive(Parser, Debug)]
#[command(
    name = "Scene Demo",
    about = "Renders a small scene through the scene graphics pipeline",
    version
)]
struct Args {
    /// Graphics backend to use.
    #[arg(long, default_value = "vulkan", value_enum)]
    backend: CliBackend,

    /// Initial window width in pixels.
    #[arg(long, default_value = "1280")]
    width: u32,

    /// Initial window height in pixels.
    #[arg(long, default_value = "720")]
    height: u32,

    /// Disable vertical sync (may cause tearing).
    #[arg(long)]
    no_vsync: bool,

    /// Frames the CPU may record ahead of the GPU.
    #[arg(long, default_value = "2")]
    frames_in_flight: usize,

    /// Exit after rendering N frames. Headless runs default to 60.
    #[arg(long)]
    max_frames: Option<u64>,
}

impl Args {
    fn config(&self) -> EngineConfig {
        EngineConfig::default()
            .with_title("Scene Demo")
            .with_size(self.width, self.height)
            .with_backend(self.backend.into())
            .with_vsync(!self.no_vsync)
            .with_frames_in_flight(self.frames_in_flight)
    }
}

// ============================================================================
// Scene
// ============================================================================

fn material(shader: &Arc<Shader>, name: &str, color: Vec4, blend_mode: BlendMode) -> Arc<Material> {
    Arc::new(
        Material::new(name, shader.clone())
            .with_param("base_color", color)
            .with_blend_mode(blend_mode),
    )
}

fn build_scene() -> Result<Node, ResourceError> {
    log::info!("Setting up scene...");
    let shader = Arc::new(Shader::basic()?);
    let format = Arc::new(VertexFormat::position_normal_uv());

    let ground = GeometryNode::new(
        Mesh::plane(20.0, 20.0).to_geometry(format.clone()),
        material(&shader, "ground", Vec4::new(0.35, 0.35, 0.4, 1.0), BlendMode::Opaque),
    );
    let cube = GeometryNode::new(
        Mesh::cube().to_geometry(format.clone()),
        material(&shader, "cube", Vec4::new(0.8, 0.2, 0.2, 1.0), BlendMode::Opaque),
    )
    .with_passes(PassMask::STANDARD);
    let sphere = GeometryNode::new(
        Mesh::sphere(32, 16).to_geometry(format),
        material(&shader, "glass", Vec4::new(0.2, 0.4, 0.9, 0.5), BlendMode::Translucent),
    );

    Ok(Node::group("root")
        .with_child(Node::geometry("ground", ground).with_transform(Transform::from_position(
            Vec3::new(0.0, -1.0, 0.0),
        )))
        .with_child(
            Node::geometry("cube", cube).with_transform(
                Transform::from_position(Vec3::new(-1.5, 0.0, 0.0))
                    .with_rotation(Quat::from_rotation_y(0.6)),
            ),
        )
        .with_child(
            Node::geometry("sphere", sphere)
                .with_transform(Transform::from_position(Vec3::new(1.5, 0.0, 0.0))),
        )
        .with_child(Node::light(
            "sun",
            Light::Directional(DirectionalLight::new(
                Vec3::new(-0.4, -1.0, -0.3),
                Vec3::new(1.0, 0.95, 0.9),
                1.2,
            )),
        )))
}

fn log_frame<D: GraphicsDevice>(system: &GraphicsSystem<D>) {
    let stats = system.renderer().last_stats();
    log::debug!(
        "Frame {} (image {}): {} passes, {:?} draws, {} uniform uploads",
        stats.frame,
        stats.image_index,
        stats.passes,
        stats.draws,
        stats.uniform_uploads
    );
}

// ============================================================================
// Backends
// ============================================================================

fn run_headless(args: &Args) -> Result<(), Box<dyn Error>> {
    let mut ctx = EngineContext::new(args.config())?;
    let mut window = HeadlessWindow::new(args.width, args.height);
    let size = window.dimensions();
    let mut system = GraphicsSystem::init(&ctx, &window, HeadlessDevice::new(size.x, size.y))?;
    system.set_scene(build_scene()?)?;

    let frames = args.max_frames.unwrap_or(60);
    let step = Duration::from_secs_f32(1.0 / 60.0);
    for _ in 0..frames {
        ctx.clock_mut().advance(step);
        system.process_events(&mut window)?;
        system.run(ctx.clock().delta_time())?;
        log_frame(&system);
    }

    let stats = system.renderer().device().stats();
    log::info!(
        "Rendered {} frames: {} submissions, {} presents, {} blocked fence waits",
        ctx.clock().frame_number(),
        stats.submissions,
        stats.presents,
        stats.blocked_waits
    );
    system.shutdown()?;
    Ok(())
}

fn run_vulkan(args: &Args) -> Result<(), Box<dyn Error>> {
    use scene_graphics::backend::vulkan::VulkanDevice;
    use scene_graphics::window::{self, Window};
    use winit::event_loop::EventLoop;

    let mut ctx = EngineContext::new(args.config())?;
    let config = ctx.config().clone();

    let event_loop = EventLoop::new()?;
    let window = Window::new(&event_loop, &config.title, config.width, config.height)?;
    let size = window.dimensions();
    let device = VulkanDevice::new(window.window(), size.x, size.y, config.vsync)?;
    let mut system = GraphicsSystem::init(&ctx, &window, device)?;
    system.set_scene(build_scene()?)?;

    let max_frames = args.max_frames;
    window::run(event_loop, window, move |window| {
        let dt = ctx.clock_mut().tick();
        let result = system
            .process_events(window)
            .and_then(|_| system.run(dt));
        if let Err(e) = result {
            log::error!("Frame failed: {}", e);
            return false;
        }
        log_frame(&system);

        let frame = ctx.clock().frame_number();
        if frame % 120 == 0 && dt > 0.0 {
            window.set_title(&format!("{} - {:.0} fps", config.title, 1.0 / dt));
        }
        let keep_running = !system.should_close() && max_frames.map_or(true, |max| frame < max);
        if !keep_running {
            if let Err(e) = system.shutdown() {
                log::error!("Shutdown failed: {}", e);
            }
        }
        keep_running
    })?;
    Ok(())
}

fn main() {
    scene_graphics::init_logging();
    let args = Args::parse();
    log::info!("Starting scene demo with {:?} backend", args.backend);

    let result = match args.backend {
        CliBackend::Headless => run_headless(&args),
        CliBackend::Vulkan => run_vulkan(&args),
    };
    if let Err(e) = result {
        log::error!("Scene demo failed: {}", e);
        std::process::exit(1);
    }
}
