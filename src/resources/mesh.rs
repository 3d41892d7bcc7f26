//! Mesh generation and drawable geometry

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};

use super::{IndexBuffer, VertexBuffer, VertexFormat};

/// Vertex matching [`VertexFormat::position_normal_uv`]
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub uv: Vec2,
}

/// Vertex and index buffers drawn together
#[derive(Debug, Clone)]
pub struct Geometry {
    vertex_buffer: Arc<VertexBuffer>,
    index_buffer: Option<Arc<IndexBuffer>>,
    /// Local-space center, used for distance sorting
    center: Vec3,
}

impl Geometry {
    pub fn new(vertex_buffer: Arc<VertexBuffer>, index_buffer: Option<Arc<IndexBuffer>>) -> Self {
        Self {
            vertex_buffer,
            index_buffer,
            center: Vec3::ZERO,
        }
    }

    pub fn with_center(mut self, center: Vec3) -> Self {
        self.center = center;
        self
    }

    pub fn vertex_buffer(&self) -> &Arc<VertexBuffer> {
        &self.vertex_buffer
    }

    pub fn index_buffer(&self) -> Option<&Arc<IndexBuffer>> {
        self.index_buffer.as_ref()
    }

    pub fn vertex_format(&self) -> &Arc<VertexFormat> {
        self.vertex_buffer.format()
    }

    pub fn center(&self) -> Vec3 {
        self.center
    }
}

/// CPU-side mesh data
#[derive(Debug, Clone)]
pub struct Mesh {
    pub name: String,
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl Mesh {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            vertices: Vec::new(),
            indices: Vec::new(),
        }
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Upload-ready geometry in `format`, which must be `position_normal_uv`-shaped
    pub fn to_geometry(&self, format: Arc<VertexFormat>) -> Geometry {
        let center = if self.vertices.is_empty() {
            Vec3::ZERO
        } else {
            self.vertices.iter().map(|v| v.position).sum::<Vec3>() / self.vertices.len() as f32
        };
        Geometry::new(
            Arc::new(VertexBuffer::new(format, &self.vertices)),
            Some(Arc::new(IndexBuffer::from_u32(&self.indices))),
        )
        .with_center(center)
    }

    fn push_quad(&mut self, corners: [Vec3; 4], normal: Vec3) {
        let base = self.vertices.len() as u32;
        let uvs = [
            Vec2::new(0.0, 1.0),
            Vec2::new(1.0, 1.0),
            Vec2::new(1.0, 0.0),
            Vec2::new(0.0, 0.0),
        ];
        for (position, uv) in corners.into_iter().zip(uvs) {
            self.vertices.push(Vertex {
                position,
                normal,
                uv,
            });
        }
        self.indices
            .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }

    /// Unit cube centered at the origin, counter-clockwise faces
    pub fn cube() -> Self {
        let mut mesh = Mesh::new("cube");
        let faces = [Vec3::Z, Vec3::NEG_Z, Vec3::X, Vec3::NEG_X, Vec3::Y, Vec3::NEG_Y];
        for normal in faces {
            // Two axes spanning the face, oriented so (u, v, normal) is right-handed
            let u = if normal.y.abs() > 0.5 {
                Vec3::X
            } else {
                Vec3::Y.cross(normal)
            };
            let v = normal.cross(u);
            let center = normal * 0.5;
            mesh.push_quad(
                [
                    center - u * 0.5 - v * 0.5,
                    center + u * 0.5 - v * 0.5,
                    center + u * 0.5 + v * 0.5,
                    center - u * 0.5 + v * 0.5,
                ],
                normal,
            );
        }
        mesh
    }

    /// UV sphere of diameter 1
    pub fn sphere(segments: u32, rings: u32) -> Self {
        assert!(segments >= 3 && rings >= 2, "sphere needs at least 3 segments and 2 rings");
        let mut mesh = Mesh::new("sphere");
        let segment_angle = std::f32::consts::TAU / segments as f32;
        let ring_angle = std::f32::consts::PI / rings as f32;

        for ring in 0..=rings {
            let phi = ring as f32 * ring_angle;
            for segment in 0..=segments {
                let theta = segment as f32 * segment_angle;
                let normal = Vec3::new(phi.sin() * theta.cos(), phi.cos(), phi.sin() * theta.sin());
                mesh.vertices.push(Vertex {
                    position: normal * 0.5,
                    normal,
                    uv: Vec2::new(
                        segment as f32 / segments as f32,
                        ring as f32 / rings as f32,
                    ),
                });
            }
        }

        for ring in 0..rings {
            for segment in 0..segments {
                let current = ring * (segments + 1) + segment;
                let next = current + segments + 1;
                mesh.indices.extend_from_slice(&[
                    current,
                    current + 1,
                    next,
                    current + 1,
                    next + 1,
                    next,
                ]);
            }
        }
        mesh
    }

    /// Plane on the XZ axis facing +Y
    pub fn plane(width: f32, depth: f32) -> Self {
        let mut mesh = Mesh::new("plane");
        let (hw, hd) = (width / 2.0, depth / 2.0);
        mesh.push_quad(
            [
                Vec3::new(-hw, 0.0, hd),
                Vec3::new(hw, 0.0, hd),
                Vec3::new(hw, 0.0, -hd),
                Vec3::new(-hw, 0.0, -hd),
            ],
            Vec3::Y,
        );
        mesh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn winding_matches_normal(mesh: &Mesh) -> bool {
        mesh.indices.chunks(3).all(|tri| {
            let [a, b, c] = [tri[0], tri[1], tri[2]].map(|i| mesh.vertices[i as usize]);
            let face = (b.position - a.position).cross(c.position - a.position);
            face.length() < 1e-7 || face.dot(a.normal + b.normal + c.normal) > 0.0
        })
    }

    #[test]
    fn test_cube() {
        let cube = Mesh::cube();
        assert_eq!(cube.vertices.len(), 24);
        assert_eq!(cube.triangle_count(), 12);
        assert!(winding_matches_normal(&cube));
        assert!(cube
            .vertices
            .iter()
            .all(|v| v.position.abs().max_element() <= 0.5 + 1e-6));
    }

    #[test]
    fn test_sphere() {
        let sphere = Mesh::sphere(16, 8);
        assert_eq!(sphere.vertices.len(), 17 * 9);
        assert_eq!(sphere.triangle_count(), 16 * 8 * 2);
        assert!(winding_matches_normal(&sphere));
    }

    #[test]
    fn test_plane() {
        let plane = Mesh::plane(2.0, 4.0);
        assert_eq!(plane.triangle_count(), 2);
        assert!(winding_matches_normal(&plane));
    }

    #[test]
    fn test_to_geometry() {
        let format = Arc::new(VertexFormat::position_normal_uv());
        let geometry = Mesh::cube().to_geometry(format);
        assert_eq!(geometry.vertex_buffer().vertex_count(), 24);
        assert_eq!(geometry.index_buffer().map(|b| b.index_count()), Some(36));
        assert!(geometry.center().length() < 1e-6);
    }
}
