//! Light types carried by light nodes

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

/// Point light, positioned by its node's world transform
#[derive(Debug, Clone, PartialEq)]
pub struct PointLight {
    pub color: Vec3,
    pub intensity: f32,
    pub radius: f32,
}

impl Default for PointLight {
    fn default() -> Self {
        Self {
            color: Vec3::ONE,
            intensity: 1.0,
            radius: 10.0,
        }
    }
}

/// Directional light (like the sun), oriented by its node's world transform
#[derive(Debug, Clone, PartialEq)]
pub struct DirectionalLight {
    /// Direction in the node's local space
    pub direction: Vec3,
    pub color: Vec3,
    pub intensity: f32,
}

impl Default for DirectionalLight {
    fn default() -> Self {
        Self {
            direction: Vec3::new(-0.5, -1.0, -0.5).normalize(),
            color: Vec3::ONE,
            intensity: 1.0,
        }
    }
}

impl DirectionalLight {
    pub fn new(direction: Vec3, color: Vec3, intensity: f32) -> Self {
        Self {
            direction: direction.normalize(),
            color,
            intensity,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Light {
    Point(PointLight),
    Directional(DirectionalLight),
}

impl Light {
    /// GPU representation of this light placed by `world`
    pub fn to_gpu_data(&self, world: &Mat4) -> GpuLightData {
        match self {
            Light::Point(light) => GpuLightData {
                position_or_direction: world.transform_point3(Vec3::ZERO).extend(1.0),
                color_intensity: light.color.extend(light.intensity),
                radius: Vec4::new(light.radius, 0.0, 0.0, 0.0),
            },
            Light::Directional(light) => GpuLightData {
                position_or_direction: world
                    .transform_vector3(light.direction)
                    .normalize_or_zero()
                    .extend(0.0),
                color_intensity: light.color.extend(light.intensity),
                radius: Vec4::ZERO,
            },
        }
    }
}

/// GPU-friendly light data
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuLightData {
    /// xyz = position (w = 1) or direction (w = 0)
    pub position_or_direction: Vec4,
    /// xyz = color, w = intensity
    pub color_intensity: Vec4,
    /// x = radius of a point light
    pub radius: Vec4,
}

impl Default for GpuLightData {
    /// A dim white light shining straight down
    fn default() -> Self {
        Self {
            position_or_direction: Vec4::new(0.0, -1.0, 0.0, 0.0),
            color_intensity: Vec4::new(1.0, 1.0, 1.0, 0.5),
            radius: Vec4::ZERO,
        }
    }
}
