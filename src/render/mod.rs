//! Frame rendering pipeline
//!
//! A [`GraphicsSystem`] owns the main camera, the [`RenderQueue`], the root
//! [`ScenePass`] and a [`SceneRenderer`]. Every frame the scene graph is
//! traversed into the queue, the passes upload per-object uniforms and
//! record draws, and the renderer submits and presents the result.

mod cache;
mod frame;
mod pass;
mod queue;
mod renderer;
mod system;

pub use cache::*;
pub use frame::*;
pub use pass::*;
pub use queue::*;
pub use renderer::*;
pub use system::*;

use crate::backend::BackendError;
use crate::resources::{ResourceId, ResourceKind};
use crate::scene::Camera;
use crate::ConfigError;

/// Errors raised while preparing or rendering a frame
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("{kind} {id} is not bound")]
    NotBound { kind: ResourceKind, id: ResourceId },
    #[error("frame lifecycle violated: expected {expected}, found {found}")]
    FrameOrder {
        expected: FrameState,
        found: FrameState,
    },
    #[error("{0} pass drawn outside of its begin and end hooks")]
    PassNotBegun(PassType),
    #[error("no scene has been set")]
    NoScene,
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

pub type RenderResult<T> = Result<T, RenderError>;

/// Pass-facing capability of a renderer.
///
/// [`ScenePass::render`] brackets the draws of each pass with `begin_pass`
/// and `end_pass`; [`ScenePass::update`] calls `update_object` for the same
/// renderables before any of them is drawn.
pub trait Renderer {
    /// Bind the pass target and start recording the pass
    fn begin_pass(&mut self, pass: &ScenePass, image_index: u32) -> RenderResult<()>;

    fn end_pass(&mut self, pass: &ScenePass, image_index: u32) -> RenderResult<()>;

    /// Record the draw of one renderable
    fn draw(&mut self, pass: &ScenePass, renderable: &Renderable) -> RenderResult<()>;

    /// Upload the per-object uniforms one renderable is drawn with in `pass`.
    /// Must not record any command.
    fn update_object(
        &mut self,
        pass: &ScenePass,
        renderable: &Renderable,
        camera: &Camera,
        time: f32,
    ) -> RenderResult<()>;
}
