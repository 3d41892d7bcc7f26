//! Camera system
//!
//! The camera stores its parameters and the matrices derived from them.
//! Setters never touch the matrices: after changing the position, basis or
//! projection parameters the caller runs the matching `update_*` method.

use glam::{Mat4, Vec3, Vec4};

/// Handedness of view space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Handedness {
    #[default]
    Right,
    Left,
}

/// Depth range of clip space after the perspective divide
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DepthRange {
    /// Vulkan-style `[0, 1]` depth with Y pointing down
    #[default]
    ZeroToOne,
    /// OpenGL-style `[-1, 1]` depth with Y pointing up
    NegativeOneToOne,
}

/// Clip space convention the projection matrices are built for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClipSpace {
    pub handedness: Handedness,
    pub depth: DepthRange,
}

impl ClipSpace {
    pub const VULKAN: Self = Self {
        handedness: Handedness::Right,
        depth: DepthRange::ZeroToOne,
    };

    pub const OPENGL: Self = Self {
        handedness: Handedness::Right,
        depth: DepthRange::NegativeOneToOne,
    };

    pub fn new(handedness: Handedness, depth: DepthRange) -> Self {
        Self { handedness, depth }
    }

    /// Whether projections must negate the Y scale
    pub fn inverts_y(&self) -> bool {
        self.depth == DepthRange::ZeroToOne
    }
}

/// Smallest altitude used to scale the near and far planes
pub const MIN_CORRECTION_FACTOR: f32 = 1e-6;

/// Scale applied to the near and far planes for a camera at `altitude`.
///
/// Distance from the ground plane is `|altitude|`, floored to
/// [`MIN_CORRECTION_FACTOR`]. An altitude of exactly zero yields `1.0`.
pub fn perspective_projection_correction_factor(altitude: f32) -> f32 {
    let distance = altitude.abs();
    if distance <= 0.0 {
        1.0
    } else {
        distance.max(MIN_CORRECTION_FACTOR)
    }
}

// Maps a [0, 1] depth range to [-1, 1]
const DEPTH_ZERO_ONE_TO_GL: Mat4 = Mat4::from_cols(
    Vec4::new(1.0, 0.0, 0.0, 0.0),
    Vec4::new(0.0, 1.0, 0.0, 0.0),
    Vec4::new(0.0, 0.0, 2.0, 0.0),
    Vec4::new(0.0, 0.0, -1.0, 1.0),
);

/// View and projection state of the main camera
#[derive(Debug, Clone)]
pub struct Camera {
    position: Vec3,
    forward: Vec3,
    right: Vec3,
    up: Vec3,
    /// Vertical field of view in degrees
    fov: u32,
    aspect: f32,
    near: f32,
    far: f32,
    clip_space: ClipSpace,
    view: Mat4,
    projection: Mat4,
    projection_view: Mat4,
    /// Correction factor of the current perspective projection, `None`
    /// when the projection is orthographic
    correction: Option<f32>,
}

impl Default for Camera {
    fn default() -> Self {
        Self::new(ClipSpace::default())
    }
}

impl Camera {
    /// Camera at `(0, 0, 5)` looking down -Z with a 45 degree perspective
    pub fn new(clip_space: ClipSpace) -> Self {
        let mut camera = Self {
            position: Vec3::new(0.0, 0.0, 5.0),
            forward: Vec3::NEG_Z,
            right: Vec3::X,
            up: Vec3::Y,
            fov: 45,
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 1000.0,
            clip_space,
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
            projection_view: Mat4::IDENTITY,
            correction: None,
        };
        camera.set_orientation(Vec3::NEG_Z, Vec3::Y);
        camera.update_view_matrix();
        camera.update_perspective_projection_matrix_current();
        camera
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
    }

    pub fn forward(&self) -> Vec3 {
        self.forward
    }

    pub fn right(&self) -> Vec3 {
        self.right
    }

    pub fn up(&self) -> Vec3 {
        self.up
    }

    /// Set the basis from a view direction and an approximate up vector.
    ///
    /// The stored basis is orthonormal in the configured handedness.
    pub fn set_orientation(&mut self, forward: Vec3, world_up: Vec3) {
        let forward = forward.normalize();
        let right = match self.clip_space.handedness {
            Handedness::Right => forward.cross(world_up),
            Handedness::Left => world_up.cross(forward),
        }
        .normalize();
        let up = match self.clip_space.handedness {
            Handedness::Right => right.cross(forward),
            Handedness::Left => forward.cross(right),
        };
        self.forward = forward;
        self.right = right;
        self.up = up;
    }

    /// Point the camera at `target`, keeping `world_up` as the up hint
    pub fn look_at(&mut self, target: Vec3, world_up: Vec3) {
        self.set_orientation(target - self.position, world_up);
    }

    pub fn fov(&self) -> u32 {
        self.fov
    }

    pub fn set_fov(&mut self, fov: u32) {
        self.fov = fov;
    }

    pub fn aspect(&self) -> f32 {
        self.aspect
    }

    pub fn set_aspect(&mut self, aspect: f32) {
        self.aspect = aspect;
    }

    pub fn near(&self) -> f32 {
        self.near
    }

    pub fn set_near(&mut self, near: f32) {
        self.near = near;
    }

    pub fn far(&self) -> f32 {
        self.far
    }

    pub fn set_far(&mut self, far: f32) {
        self.far = far;
    }

    pub fn clip_space(&self) -> ClipSpace {
        self.clip_space
    }

    pub fn set_clip_space(&mut self, clip_space: ClipSpace) {
        self.clip_space = clip_space;
    }

    pub fn view(&self) -> Mat4 {
        self.view
    }

    pub fn projection(&self) -> Mat4 {
        self.projection
    }

    pub fn projection_view(&self) -> Mat4 {
        self.projection_view
    }

    /// Recompute the view matrix and the projection-view product
    pub fn update_view_matrix(&mut self) {
        let center = self.position + self.forward;
        self.view = match self.clip_space.handedness {
            Handedness::Right => Mat4::look_at_rh(self.position, center, self.up),
            Handedness::Left => Mat4::look_at_lh(self.position, center, self.up),
        };
        self.projection_view = self.projection * self.view;
    }

    /// Store the perspective parameters and rebuild the projection.
    ///
    /// # Panics
    ///
    /// Panics if any argument is not strictly positive.
    pub fn update_perspective_projection_matrix(
        &mut self,
        fov: u32,
        aspect: f32,
        near: f32,
        far: f32,
    ) {
        assert!(fov > 0, "field of view must be positive");
        assert!(aspect > 0.0, "aspect ratio must be positive, got {}", aspect);
        assert!(near > 0.0, "near plane must be positive, got {}", near);
        assert!(far > 0.0, "far plane must be positive, got {}", far);
        self.fov = fov;
        self.aspect = aspect;
        self.near = near;
        self.far = far;
        self.update_perspective_projection_matrix_current();
    }

    /// Rebuild the perspective projection from the stored parameters.
    ///
    /// Near and far are scaled by the altitude correction factor.
    ///
    /// # Panics
    ///
    /// Panics if a stored parameter is not strictly positive.
    pub fn update_perspective_projection_matrix_current(&mut self) {
        assert!(self.fov > 0, "field of view must be positive");
        assert!(self.aspect > 0.0, "aspect ratio must be positive, got {}", self.aspect);
        assert!(self.near > 0.0, "near plane must be positive, got {}", self.near);
        assert!(self.far > 0.0, "far plane must be positive, got {}", self.far);

        let factor = perspective_projection_correction_factor(self.position.y);
        self.correction = Some(factor);
        let near = self.near * factor;
        let far = self.far * factor;
        let fov_y = (self.fov as f32).to_radians();

        let projection = match (self.clip_space.handedness, self.clip_space.depth) {
            (Handedness::Right, DepthRange::ZeroToOne) => {
                Mat4::perspective_rh(fov_y, self.aspect, near, far)
            }
            (Handedness::Right, DepthRange::NegativeOneToOne) => {
                Mat4::perspective_rh_gl(fov_y, self.aspect, near, far)
            }
            (Handedness::Left, DepthRange::ZeroToOne) => {
                Mat4::perspective_lh(fov_y, self.aspect, near, far)
            }
            (Handedness::Left, DepthRange::NegativeOneToOne) => {
                DEPTH_ZERO_ONE_TO_GL * Mat4::perspective_lh(fov_y, self.aspect, near, far)
            }
        };
        self.set_projection(projection);
    }

    /// Rebuild the projection as an orthographic box. The FOV is untouched.
    ///
    /// # Panics
    ///
    /// Panics if `near` or `far` is not strictly positive.
    pub fn update_orthographic_projection_matrix(
        &mut self,
        left: f32,
        right: f32,
        bottom: f32,
        top: f32,
        near: f32,
        far: f32,
    ) {
        assert!(near > 0.0, "near plane must be positive, got {}", near);
        assert!(far > 0.0, "far plane must be positive, got {}", far);
        self.near = near;
        self.far = far;
        self.correction = None;

        let projection = match (self.clip_space.handedness, self.clip_space.depth) {
            (Handedness::Right, DepthRange::ZeroToOne) => {
                Mat4::orthographic_rh(left, right, bottom, top, near, far)
            }
            (Handedness::Right, DepthRange::NegativeOneToOne) => {
                Mat4::orthographic_rh_gl(left, right, bottom, top, near, far)
            }
            (Handedness::Left, DepthRange::ZeroToOne) => {
                Mat4::orthographic_lh(left, right, bottom, top, near, far)
            }
            (Handedness::Left, DepthRange::NegativeOneToOne) => {
                DEPTH_ZERO_ONE_TO_GL * Mat4::orthographic_lh(left, right, bottom, top, near, far)
            }
        };
        self.set_projection(projection);
    }

    /// Rebuild a perspective projection built at a different altitude
    /// correction than the current position gives. Returns whether the
    /// projection changed.
    pub fn refresh_altitude_correction(&mut self) -> bool {
        match self.correction {
            Some(factor) if factor != perspective_projection_correction_factor(self.position.y) => {
                self.update_perspective_projection_matrix_current();
                true
            }
            _ => false,
        }
    }

    fn set_projection(&mut self, mut projection: Mat4) {
        if self.clip_space.inverts_y() {
            projection.y_axis.y = -projection.y_axis.y;
        }
        self.projection = projection;
        self.projection_view = self.projection * self.view;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0.0, 1.0)]
    #[case(5.0, 5.0)]
    #[case(-5.0, 5.0)]
    #[case(1e-9, 0.000001)]
    fn test_correction_factor(#[case] altitude: f32, #[case] expected: f32) {
        assert_eq!(perspective_projection_correction_factor(altitude), expected);
    }

    #[rstest]
    #[case(ClipSpace::new(Handedness::Right, DepthRange::ZeroToOne), true)]
    #[case(ClipSpace::new(Handedness::Left, DepthRange::ZeroToOne), true)]
    #[case(ClipSpace::new(Handedness::Right, DepthRange::NegativeOneToOne), false)]
    #[case(ClipSpace::new(Handedness::Left, DepthRange::NegativeOneToOne), false)]
    fn test_perspective_y_sign(#[case] clip_space: ClipSpace, #[case] negated: bool) {
        let mut camera = Camera::new(clip_space);
        for (fov, aspect, near, far) in [(45, 1.5, 0.1, 100.0), (90, 0.5, 1.0, 2.0), (1, 4.0, 0.01, 1e5)] {
            camera.update_perspective_projection_matrix(fov, aspect, near, far);
            assert_eq!(camera.projection().y_axis.y < 0.0, negated);
        }
    }

    #[rstest]
    #[case(ClipSpace::VULKAN, true)]
    #[case(ClipSpace::OPENGL, false)]
    fn test_orthographic_y_sign(#[case] clip_space: ClipSpace, #[case] negated: bool) {
        let mut camera = Camera::new(clip_space);
        camera.set_fov(60);
        camera.update_orthographic_projection_matrix(-1.0, 1.0, -1.0, 1.0, 0.1, 10.0);
        assert_eq!(camera.projection().y_axis.y < 0.0, negated);
        assert_eq!(camera.fov(), 60);
    }

    #[test]
    fn test_update_view_matrix_is_idempotent() {
        let mut camera = Camera::default();
        camera.set_position(Vec3::new(1.0, 2.0, 3.0));
        camera.look_at(Vec3::ZERO, Vec3::Y);
        camera.update_view_matrix();
        let view = camera.view().to_cols_array();
        let projection_view = camera.projection_view().to_cols_array();
        camera.update_view_matrix();
        assert_eq!(camera.view().to_cols_array(), view);
        assert_eq!(camera.projection_view().to_cols_array(), projection_view);
    }

    #[test]
    fn test_setters_do_not_recompute() {
        let mut camera = Camera::default();
        let view = camera.view();
        let projection = camera.projection();
        camera.set_position(Vec3::new(10.0, 0.0, 0.0));
        camera.set_fov(90);
        camera.set_aspect(1.0);
        assert_eq!(camera.view(), view);
        assert_eq!(camera.projection(), projection);
    }

    #[test]
    fn test_projection_view_is_product() {
        let mut camera = Camera::default();
        camera.set_position(Vec3::new(0.0, 3.0, 5.0));
        camera.update_view_matrix();
        camera.update_perspective_projection_matrix(60, 1.0, 0.5, 50.0);
        let expected = camera.projection() * camera.view();
        assert!(camera.projection_view().abs_diff_eq(expected, 1e-6));
    }

    #[test]
    fn test_view_matrix_looks_down_forward() {
        let mut camera = Camera::default();
        camera.set_position(Vec3::ZERO);
        camera.set_orientation(Vec3::NEG_Z, Vec3::Y);
        camera.update_view_matrix();
        let p = camera.view().transform_point3(Vec3::new(0.0, 0.0, -4.0));
        assert!((p - Vec3::new(0.0, 0.0, -4.0)).length() < 1e-6);
    }

    #[rstest]
    #[case(Handedness::Right)]
    #[case(Handedness::Left)]
    fn test_basis_is_orthonormal(#[case] handedness: Handedness) {
        let mut camera = Camera::new(ClipSpace::new(handedness, DepthRange::ZeroToOne));
        camera.set_orientation(Vec3::new(1.0, -0.5, 0.3), Vec3::Y);
        assert!((camera.forward().length() - 1.0).abs() < 1e-6);
        assert!((camera.right().length() - 1.0).abs() < 1e-6);
        assert!((camera.up().length() - 1.0).abs() < 1e-6);
        assert!(camera.forward().dot(camera.right()).abs() < 1e-6);
        assert!(camera.forward().dot(camera.up()).abs() < 1e-6);
        assert!(camera.up().y > 0.0);
    }

    #[test]
    fn test_left_handed_gl_depth_range() {
        let mut camera = Camera::new(ClipSpace::new(Handedness::Left, DepthRange::NegativeOneToOne));
        camera.set_position(Vec3::ZERO);
        camera.update_perspective_projection_matrix(90, 1.0, 1.0, 10.0);
        let near = camera.projection().project_point3(Vec3::new(0.0, 0.0, 1.0));
        let far = camera.projection().project_point3(Vec3::new(0.0, 0.0, 10.0));
        assert!((near.z + 1.0).abs() < 1e-5);
        assert!((far.z - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_altitude_scales_planes() {
        let mut camera = Camera::new(ClipSpace::VULKAN);
        camera.set_position(Vec3::new(0.0, 10.0, 0.0));
        camera.update_perspective_projection_matrix(90, 1.0, 1.0, 100.0);
        // Depth 0 lands on the scaled near plane
        let p = camera.projection().project_point3(Vec3::new(0.0, 0.0, -10.0));
        assert!(p.z.abs() < 1e-5);
        assert_eq!(camera.near(), 1.0);
    }

    #[test]
    fn test_refresh_altitude_correction() {
        let mut camera = Camera::new(ClipSpace::VULKAN);
        camera.set_position(Vec3::new(0.0, 2.0, 0.0));
        camera.update_perspective_projection_matrix(90, 1.0, 1.0, 100.0);
        assert!(!camera.refresh_altitude_correction());

        camera.set_position(Vec3::new(0.0, 10.0, 0.0));
        assert!(camera.refresh_altitude_correction());
        let p = camera.projection().project_point3(Vec3::new(0.0, 0.0, -10.0));
        assert!(p.z.abs() < 1e-5);

        // Orthographic projections carry no correction
        camera.update_orthographic_projection_matrix(-1.0, 1.0, -1.0, 1.0, 0.1, 10.0);
        camera.set_position(Vec3::new(0.0, 3.0, 0.0));
        assert!(!camera.refresh_altitude_correction());
    }

    #[test]
    #[should_panic(expected = "near plane must be positive")]
    fn test_perspective_rejects_zero_near() {
        let mut camera = Camera::default();
        camera.update_perspective_projection_matrix(45, 1.0, 0.0, 10.0);
    }

    #[test]
    #[should_panic(expected = "aspect ratio must be positive")]
    fn test_perspective_rejects_negative_aspect() {
        let mut camera = Camera::default();
        camera.update_perspective_projection_matrix(45, -1.0, 0.1, 10.0);
    }

    #[test]
    #[should_panic(expected = "field of view must be positive")]
    fn test_perspective_rejects_zero_fov() {
        let mut camera = Camera::default();
        camera.update_perspective_projection_matrix(0, 1.0, 0.1, 10.0);
    }

    #[test]
    #[should_panic(expected = "far plane must be positive")]
    fn test_orthographic_rejects_zero_far() {
        let mut camera = Camera::default();
        camera.update_orthographic_projection_matrix(-1.0, 1.0, -1.0, 1.0, 0.1, 0.0);
    }
}
