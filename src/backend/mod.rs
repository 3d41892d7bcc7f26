//! Backend abstraction layer
//!
//! Provides the device trait and the descriptor types both the Vulkan and the
//! headless devices implement.

pub mod headless;
pub mod traits;
pub mod types;

// Vulkan backend is only available on native platforms
#[cfg(not(target_arch = "wasm32"))]
pub mod vulkan;

pub use headless::{HeadlessDevice, RecordedCommand};
pub use traits::*;
pub use types::*;
