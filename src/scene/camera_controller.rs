//! FPS-style camera control
//!
//! Mouse motion turns the camera (yaw/pitch against a world up vector),
//! movement axes translate it along its own basis.

use glam::{Vec2, Vec3};

use super::Camera;

/// Input accumulated since the last frame
#[derive(Debug, Clone, Default)]
pub struct CameraInput {
    /// Mouse delta in pixels
    pub mouse_delta: Vec2,
    /// Movement along the camera basis: x = right, y = up, z = forward
    pub movement: Vec3,
    /// Scales the controller's move speed, 1.0 when idle
    pub speed_multiplier: f32,
}

impl CameraInput {
    pub fn new() -> Self {
        Self {
            speed_multiplier: 1.0,
            ..Default::default()
        }
    }

    /// Reset per-frame deltas, keeping held movement keys
    pub fn reset_deltas(&mut self) {
        self.mouse_delta = Vec2::ZERO;
    }
}

/// Mouse-look and keyboard-move controller
#[derive(Debug, Clone)]
pub struct FpsController {
    /// Horizontal angle in radians, measured from +X towards +Z
    pub yaw: f32,
    /// Vertical angle in radians
    pub pitch: f32,
    /// Movement speed in units per second
    pub move_speed: f32,
    /// Radians per pixel of mouse motion
    pub mouse_sensitivity: f32,
    /// Keep the pitch within +-90 degrees
    pub clamp_pitch: bool,
    pub world_up: Vec3,
}

impl Default for FpsController {
    fn default() -> Self {
        Self {
            yaw: -std::f32::consts::FRAC_PI_2,
            pitch: 0.0,
            move_speed: 5.0,
            mouse_sensitivity: 0.003,
            clamp_pitch: true,
            world_up: Vec3::Y,
        }
    }
}

impl FpsController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_speed(mut self, speed: f32) -> Self {
        self.move_speed = speed;
        self
    }

    pub fn with_sensitivity(mut self, sensitivity: f32) -> Self {
        self.mouse_sensitivity = sensitivity;
        self
    }

    /// Take yaw and pitch from the camera's current forward vector
    pub fn sync_with_camera(&mut self, camera: &Camera) {
        let forward = camera.forward();
        self.yaw = forward.z.atan2(forward.x);
        self.pitch = forward.y.clamp(-1.0, 1.0).asin();
    }

    /// View direction for the current yaw and pitch
    pub fn forward_direction(&self) -> Vec3 {
        Vec3::new(
            self.yaw.cos() * self.pitch.cos(),
            self.pitch.sin(),
            self.yaw.sin() * self.pitch.cos(),
        )
        .normalize()
    }

    /// Apply one frame of input to the camera.
    ///
    /// Only the camera's position and basis change; its matrices are left to
    /// the caller's `update_*` calls.
    pub fn update(&mut self, camera: &mut Camera, input: &CameraInput, dt: f32) {
        if input.mouse_delta != Vec2::ZERO {
            self.yaw += input.mouse_delta.x * self.mouse_sensitivity;
            self.pitch -= input.mouse_delta.y * self.mouse_sensitivity;
            if self.clamp_pitch {
                // Exactly vertical would make forward parallel to world up
                let max_pitch = std::f32::consts::FRAC_PI_2 - 1e-3;
                self.pitch = self.pitch.clamp(-max_pitch, max_pitch);
            }
            self.yaw %= std::f32::consts::TAU;
        }
        camera.set_orientation(self.forward_direction(), self.world_up);

        if input.movement != Vec3::ZERO {
            let direction = camera.right() * input.movement.x
                + camera.up() * input.movement.y
                + camera.forward() * input.movement.z;
            let speed = self.move_speed * input.speed_multiplier;
            camera.set_position(camera.position() + direction.normalize_or_zero() * speed * dt);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_looks_down_negative_z() {
        let controller = FpsController::new();
        assert!((controller.forward_direction() - Vec3::NEG_Z).length() < 1e-6);
    }

    #[test]
    fn test_move_forward() {
        let mut camera = Camera::default();
        camera.set_position(Vec3::ZERO);
        let mut controller = FpsController::new().with_speed(2.0);
        let input = CameraInput {
            movement: Vec3::Z,
            ..CameraInput::new()
        };
        controller.update(&mut camera, &input, 0.5);
        assert!((camera.position() - Vec3::new(0.0, 0.0, -1.0)).length() < 1e-5);
    }

    #[test]
    fn test_pitch_is_clamped() {
        let mut camera = Camera::default();
        let mut controller = FpsController::new().with_sensitivity(1.0);
        let input = CameraInput {
            mouse_delta: Vec2::new(0.0, -10.0),
            ..CameraInput::new()
        };
        controller.update(&mut camera, &input, 0.016);
        assert!(controller.pitch < std::f32::consts::FRAC_PI_2);
        assert!(camera.forward().y > 0.99);
        assert!(camera.right().is_finite());
    }

    #[test]
    fn test_sync_with_camera_round_trips() {
        let mut camera = Camera::default();
        camera.set_orientation(Vec3::new(1.0, 0.5, 0.0), Vec3::Y);
        let mut controller = FpsController::new();
        controller.sync_with_camera(&camera);
        assert!((controller.forward_direction() - camera.forward()).length() < 1e-5);
    }

    #[test]
    fn test_update_leaves_matrices_alone() {
        let mut camera = Camera::default();
        let view = camera.view();
        let mut controller = FpsController::new();
        let input = CameraInput {
            movement: Vec3::X,
            ..CameraInput::new()
        };
        controller.update(&mut camera, &input, 1.0);
        assert_eq!(camera.view(), view);
    }
}
