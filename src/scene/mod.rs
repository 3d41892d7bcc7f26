//! Scene graph, camera and lights

mod camera;
mod camera_controller;
mod light;
mod node;
mod transform;
mod visitor;

pub use camera::*;
pub use camera_controller::*;
pub use light::*;
pub use node::*;
pub use transform::*;
pub use visitor::*;
