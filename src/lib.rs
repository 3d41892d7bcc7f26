//! Scene Graphics - A scene-graph frame rendering pipeline
//!
//! Turns a scene graph into ordered draw and uniform-update commands every
//! frame, synchronized against swapchain presentation.
//!
//! # Features
//! - Scene graph of group, geometry, light and camera nodes walked by visitors
//! - Render queue bucketing renderables by how they are drawn
//! - Scene passes (offscreen, shadows, standard, composite) evaluated in a fixed order
//! - GPU resource caches keyed by API-independent resources
//! - Vulkan backend via ash (native only) and a headless backend for tests

pub mod backend;
pub mod context;
pub mod render;
pub mod resources;
pub mod scene;
pub mod variant;
pub mod window;

pub use context::{EngineContext, FrameClock};
pub use render::{GraphicsSystem, RenderError, RenderResult, RendererConfig, SceneRenderer};
pub use window::{HeadlessWindow, PlatformWindow, Window, WindowEvent};

use scene::ClipSpace;

/// Backend selection for the graphics engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendType {
    /// Vulkan backend via ash (native only)
    #[default]
    Vulkan,
    /// No GPU; commands are recorded for inspection
    Headless,
}

/// Invalid engine configuration
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("window extent {width}x{height} is empty")]
    ZeroExtent { width: u32, height: u32 },
    #[error("at least one frame must be in flight")]
    NoFramesInFlight,
    #[error("field of view must be positive")]
    InvalidFov,
    #[error("invalid depth range: near {near}, far {far}")]
    InvalidDepthRange { near: f32, far: f32 },
}

/// Configuration for initializing the graphics engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Window title
    pub title: String,
    /// Initial window width
    pub width: u32,
    /// Initial window height
    pub height: u32,
    /// Which backend to use
    pub backend: BackendType,
    /// Enable vsync
    pub vsync: bool,
    /// Frames the CPU may record ahead of the GPU
    pub frames_in_flight: usize,
    /// Clip-space convention of the projection matrices
    pub clip_space: ClipSpace,
    /// Vertical field of view of the main camera
    pub fov_degrees: u32,
    pub near: f32,
    pub far: f32,
    /// Clear color of the default standard pass
    pub clear_color: [f32; 4],
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            title: "Scene Graphics".to_string(),
            width: 1280,
            height: 720,
            backend: BackendType::Vulkan,
            vsync: true,
            frames_in_flight: 2,
            clip_space: ClipSpace::VULKAN,
            fov_degrees: 45,
            near: 0.1,
            far: 1000.0,
            clear_color: [0.1, 0.1, 0.12, 1.0],
        }
    }
}

impl EngineConfig {
    pub fn with_title(mut self, title: &str) -> Self {
        self.title = title.to_string();
        self
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_backend(mut self, backend: BackendType) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    pub fn with_clip_space(mut self, clip_space: ClipSpace) -> Self {
        self.clip_space = clip_space;
        self
    }

    pub fn with_perspective(mut self, fov_degrees: u32, near: f32, far: f32) -> Self {
        self.fov_degrees = fov_degrees;
        self.near = near;
        self.far = far;
        self
    }

    pub fn with_clear_color(mut self, clear_color: [f32; 4]) -> Self {
        self.clear_color = clear_color;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::ZeroExtent {
                width: self.width,
                height: self.height,
            });
        }
        if self.frames_in_flight == 0 {
            return Err(ConfigError::NoFramesInFlight);
        }
        if self.fov_degrees == 0 {
            return Err(ConfigError::InvalidFov);
        }
        if !(self.near > 0.0 && self.far > 0.0 && self.near < self.far) {
            return Err(ConfigError::InvalidDepthRange {
                near: self.near,
                far: self.far,
            });
        }
        Ok(())
    }
}

/// Install the `env_logger` backend with an `info` default, overridable
/// through `RUST_LOG`. Later calls are ignored.
#[cfg(not(target_arch = "wasm32"))]
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.backend, BackendType::Vulkan);
        assert_eq!(config.frames_in_flight, 2);
    }

    #[rstest]
    #[case(EngineConfig::default().with_size(0, 720))]
    #[case(EngineConfig::default().with_frames_in_flight(0))]
    #[case(EngineConfig::default().with_perspective(0, 0.1, 100.0))]
    #[case(EngineConfig::default().with_perspective(45, 0.0, 100.0))]
    #[case(EngineConfig::default().with_perspective(45, 10.0, 1.0))]
    fn test_invalid_config(#[case] config: EngineConfig) {
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_renderer_config_from_engine() {
        let config = EngineConfig::default()
            .with_frames_in_flight(3)
            .with_vsync(false);
        let renderer = RendererConfig::from(&config);
        assert_eq!(renderer.frames_in_flight, 3);
        assert!(!renderer.vsync);
        assert_eq!(renderer.clear_color, config.clear_color);
    }

    #[test]
    fn test_init_logging_twice() {
        init_logging();
        init_logging();
    }
}
