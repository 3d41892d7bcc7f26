//! Common utilities for frame pipeline integration tests.
//!
//! Everything runs on the headless backend, so no GPU is required.

use std::sync::Arc;

use glam::{Vec3, Vec4};
use scene_graphics::backend::HeadlessDevice;
use scene_graphics::render::{GraphicsSystem, PassMask};
use scene_graphics::resources::{BlendMode, Material, Mesh, Shader, VertexFormat};
use scene_graphics::scene::{GeometryNode, Node, Transform};
use scene_graphics::{BackendType, EngineConfig, EngineContext, HeadlessWindow, PlatformWindow};

pub const WIDTH: u32 = 800;
pub const HEIGHT: u32 = 600;

/// Headless graphics system with a window of the default test size
pub fn headless_system(frames_in_flight: usize) -> (GraphicsSystem<HeadlessDevice>, HeadlessWindow) {
    let config = EngineConfig::default()
        .with_backend(BackendType::Headless)
        .with_size(WIDTH, HEIGHT)
        .with_frames_in_flight(frames_in_flight);
    let ctx = EngineContext::new(config).expect("valid config");
    let window = HeadlessWindow::new(WIDTH, HEIGHT);
    let size = window.dimensions();
    let system = GraphicsSystem::init(&ctx, &window, HeadlessDevice::new(size.x, size.y))
        .expect("graphics system init");
    (system, window)
}

pub fn material(name: &str, color: Vec4, blend_mode: BlendMode) -> Arc<Material> {
    let shader = Arc::new(Shader::basic().expect("basic shader compiles"));
    Arc::new(
        Material::new(name, shader)
            .with_param("base_color", color)
            .with_blend_mode(blend_mode),
    )
}

/// Cube geometry node at `position`, drawn in `passes`
pub fn cube(name: &str, position: Vec3, passes: PassMask) -> Node {
    let format = Arc::new(VertexFormat::position_normal_uv());
    let geometry = GeometryNode::new(
        Mesh::cube().to_geometry(format),
        material(name, Vec4::new(0.8, 0.2, 0.2, 1.0), BlendMode::Opaque),
    )
    .with_passes(passes);
    Node::geometry(name, geometry).with_transform(Transform::from_position(position))
}
