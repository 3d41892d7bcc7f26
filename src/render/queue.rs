//! Per-frame render queue

use std::sync::Arc;

use glam::{Mat4, Vec3};

use super::{PassMask, VisualEffect};
use crate::resources::{BlendMode, Geometry, Material, UniformBuffer};
use crate::scene::{traverse, Camera, GeometryNode, GpuLightData, Light, Node, NodeId, NodeVisitor};

/// Classification bucket of a renderable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RenderableType {
    Background,
    Occluder,
    ShadowCaster,
    Opaque,
    Translucent,
    Screen,
    Debug,
}

impl RenderableType {
    pub const COUNT: usize = 7;

    pub const ALL: [RenderableType; Self::COUNT] = [
        RenderableType::Background,
        RenderableType::Occluder,
        RenderableType::ShadowCaster,
        RenderableType::Opaque,
        RenderableType::Translucent,
        RenderableType::Screen,
        RenderableType::Debug,
    ];

    fn index(&self) -> usize {
        *self as usize
    }
}

/// A geometry node queued for drawing this frame
#[derive(Debug, Clone)]
pub struct Renderable {
    pub node: NodeId,
    pub geometry: Geometry,
    pub material: Arc<Material>,
    pub uniforms: Arc<UniformBuffer>,
    pub passes: PassMask,
    /// Overrides the effect of the pass drawing it
    pub effect: Option<VisualEffect>,
    pub world: Mat4,
    /// Distance from the camera to the geometry center
    pub distance: f32,
}

impl Renderable {
    /// Effect to draw with in a pass whose own effect is `pass_effect`
    pub fn effect_in<'a>(&'a self, pass_effect: &'a VisualEffect) -> &'a VisualEffect {
        self.effect.as_ref().unwrap_or(pass_effect)
    }
}

/// Renderables of one frame sorted into buckets
#[derive(Debug, Default)]
pub struct RenderQueue {
    camera_position: Vec3,
    buckets: [Vec<Renderable>; RenderableType::COUNT],
    lights: Vec<GpuLightData>,
}

impl RenderQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Camera the following pushes measure distances from
    pub fn set_camera(&mut self, camera: &Camera) {
        self.camera_position = camera.position();
    }

    pub fn camera_position(&self) -> Vec3 {
        self.camera_position
    }

    /// Remove every renderable and light
    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.lights.clear();
    }

    /// Queue a geometry node placed at `world`, returning its bucket
    pub fn push(&mut self, node: &Node, geometry: &GeometryNode, world: &Mat4) -> RenderableType {
        let renderable_type = match geometry.material().blend_mode() {
            BlendMode::Opaque => RenderableType::Opaque,
            BlendMode::Translucent => RenderableType::Translucent,
        };
        let center = world.transform_point3(geometry.geometry().center());
        self.buckets[renderable_type.index()].push(Renderable {
            node: node.id(),
            geometry: geometry.geometry().clone(),
            material: geometry.material().clone(),
            uniforms: geometry.uniforms().clone(),
            passes: geometry.passes(),
            effect: geometry.effect().cloned(),
            world: *world,
            distance: center.distance(self.camera_position),
        });
        renderable_type
    }

    pub fn push_light(&mut self, light: GpuLightData) {
        self.lights.push(light);
    }

    /// Renderables of a bucket in push order
    pub fn get_renderables(&self, renderable_type: RenderableType) -> &[Renderable] {
        &self.buckets[renderable_type.index()]
    }

    pub fn for_each<F: FnMut(&Renderable)>(&self, renderable_type: RenderableType, f: F) {
        self.get_renderables(renderable_type).iter().for_each(f);
    }

    pub fn lights(&self) -> &[GpuLightData] {
        &self.lights
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(Vec::is_empty)
    }

    /// Order translucent renderables back to front
    pub fn sort_translucent(&mut self) {
        self.buckets[RenderableType::Translucent.index()]
            .sort_by(|a, b| b.distance.total_cmp(&a.distance));
    }

    /// Clear the queue and fill it from the scene under `root`
    pub fn populate(&mut self, root: &Node, camera: &Camera) {
        self.clear();
        self.set_camera(camera);
        traverse(root, &mut QueueBuilder { queue: self });
        self.sort_translucent();
        log::trace!(
            "Render queue populated: {} renderables, {} lights",
            self.len(),
            self.lights.len()
        );
    }
}

/// Visitor pushing geometry and lights into a queue
pub struct QueueBuilder<'a> {
    pub queue: &'a mut RenderQueue,
}

impl NodeVisitor for QueueBuilder<'_> {
    fn visit_geometry(&mut self, node: &Node, geometry: &GeometryNode, world: &Mat4) {
        self.queue.push(node, geometry, world);
    }

    fn visit_light(&mut self, _node: &Node, light: &Light, world: &Mat4) {
        self.queue.push_light(light.to_gpu_data(world));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{Mesh, Shader, ShaderEntry, VertexFormat};
    use crate::scene::{ClipSpace, DirectionalLight, Transform};

    fn material(blend_mode: BlendMode) -> Arc<Material> {
        let entry = ShaderEntry {
            spirv: vec![0x0723_0203],
            entry_point: "main".to_string(),
        };
        let shader = Arc::new(Shader::from_spirv("test", entry.clone(), entry, Vec::new()));
        Arc::new(Material::new("test", shader).with_blend_mode(blend_mode))
    }

    fn mesh_node(name: &str, blend_mode: BlendMode, z: f32) -> Node {
        let format = Arc::new(VertexFormat::position_normal_uv());
        let geometry = GeometryNode::new(Mesh::cube().to_geometry(format), material(blend_mode));
        Node::geometry(name, geometry).with_transform(Transform::from_position(Vec3::new(0.0, 0.0, z)))
    }

    fn camera() -> Camera {
        let mut camera = Camera::new(ClipSpace::VULKAN);
        camera.set_position(Vec3::new(0.0, 0.0, 10.0));
        camera
    }

    #[test]
    fn test_traversal_order_is_kept() {
        let mut root = Node::group("root");
        for i in 0..5 {
            root.add_child(mesh_node(&format!("mesh{}", i), BlendMode::Opaque, i as f32));
        }
        let mut queue = RenderQueue::new();
        queue.populate(&root, &camera());

        let opaque = queue.get_renderables(RenderableType::Opaque);
        assert_eq!(opaque.len(), 5);
        let expected: Vec<_> = root.children().iter().map(Node::id).collect();
        let actual: Vec<_> = opaque.iter().map(|r| r.node).collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_empty_bucket() {
        let queue = RenderQueue::new();
        assert!(queue.get_renderables(RenderableType::ShadowCaster).is_empty());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_translucent_sorted_back_to_front() {
        let root = Node::group("root")
            .with_child(mesh_node("near", BlendMode::Translucent, 5.0))
            .with_child(mesh_node("far", BlendMode::Translucent, -20.0))
            .with_child(mesh_node("middle", BlendMode::Translucent, 0.0))
            .with_child(mesh_node("solid", BlendMode::Opaque, 0.0));
        let mut queue = RenderQueue::new();
        queue.populate(&root, &camera());

        let distances: Vec<_> = queue
            .get_renderables(RenderableType::Translucent)
            .iter()
            .map(|r| r.distance)
            .collect();
        assert_eq!(distances, [30.0, 10.0, 5.0]);
        assert_eq!(queue.get_renderables(RenderableType::Opaque).len(), 1);
    }

    #[test]
    fn test_populate_clears_previous_frame() {
        let root = Node::group("root")
            .with_child(mesh_node("a", BlendMode::Opaque, 0.0))
            .with_child(Node::light("sun", Light::Directional(DirectionalLight::default())));
        let mut queue = RenderQueue::new();
        queue.populate(&root, &camera());
        queue.populate(&root, &camera());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.lights().len(), 1);
    }

    #[test]
    fn test_for_each_visits_in_order() {
        let root = Node::group("root")
            .with_child(mesh_node("a", BlendMode::Opaque, 1.0))
            .with_child(mesh_node("b", BlendMode::Opaque, 2.0));
        let mut queue = RenderQueue::new();
        queue.populate(&root, &camera());

        let mut seen = Vec::new();
        queue.for_each(RenderableType::Opaque, |r| seen.push(r.world.w_axis.z));
        assert_eq!(seen, [1.0, 2.0]);
    }
}
