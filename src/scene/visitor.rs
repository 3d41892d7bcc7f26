//! Depth-first scene graph traversal

use glam::Mat4;

use super::{GeometryNode, Light, Node, NodeKind};

/// Callbacks invoked by [`traverse`], one per node kind.
///
/// Every method defaults to doing nothing, so a visitor only implements the
/// kinds it cares about. `world` is the node's transform composed with all
/// of its ancestors.
pub trait NodeVisitor {
    fn visit_generic(&mut self, _node: &Node, _world: &Mat4) {}

    /// Called before the group's children
    fn visit_group(&mut self, _node: &Node, _world: &Mat4) {}

    fn visit_geometry(&mut self, _node: &Node, _geometry: &GeometryNode, _world: &Mat4) {}

    fn visit_light(&mut self, _node: &Node, _light: &Light, _world: &Mat4) {}

    fn visit_camera(&mut self, _node: &Node, _world: &Mat4) {}
}

/// Visit `root` and its descendants depth-first, children in attachment order
pub fn traverse<V: NodeVisitor + ?Sized>(root: &Node, visitor: &mut V) {
    visit(root, Mat4::IDENTITY, visitor);
}

fn visit<V: NodeVisitor + ?Sized>(node: &Node, parent: Mat4, visitor: &mut V) {
    let world = parent * node.transform.matrix();
    match node.kind() {
        NodeKind::Generic => visitor.visit_generic(node, &world),
        NodeKind::Group(children) => {
            visitor.visit_group(node, &world);
            for child in children {
                visit(child, world, visitor);
            }
        }
        NodeKind::Geometry(geometry) => visitor.visit_geometry(node, geometry, &world),
        NodeKind::Light(light) => visitor.visit_light(node, light, &world),
        NodeKind::Camera => visitor.visit_camera(node, &world),
    }
}

/// Node counts of a scene
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SceneSummary {
    pub nodes: usize,
    pub groups: usize,
    pub geometries: usize,
    pub lights: usize,
    pub cameras: usize,
    pub triangles: usize,
}

impl SceneSummary {
    pub fn of(root: &Node) -> Self {
        let mut summary = Self::default();
        traverse(root, &mut summary);
        summary
    }
}

impl NodeVisitor for SceneSummary {
    fn visit_generic(&mut self, _node: &Node, _world: &Mat4) {
        self.nodes += 1;
    }

    fn visit_group(&mut self, _node: &Node, _world: &Mat4) {
        self.nodes += 1;
        self.groups += 1;
    }

    fn visit_geometry(&mut self, _node: &Node, geometry: &GeometryNode, _world: &Mat4) {
        self.nodes += 1;
        self.geometries += 1;
        let geometry = geometry.geometry();
        self.triangles += match geometry.index_buffer() {
            Some(indices) => indices.index_count() as usize / 3,
            None => geometry.vertex_buffer().vertex_count() as usize / 3,
        };
    }

    fn visit_light(&mut self, _node: &Node, _light: &Light, _world: &Mat4) {
        self.nodes += 1;
        self.lights += 1;
    }

    fn visit_camera(&mut self, _node: &Node, _world: &Mat4) {
        self.nodes += 1;
        self.cameras += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{DirectionalLight, Transform};
    use glam::Vec3;

    #[derive(Default)]
    struct Recorder {
        visited: Vec<String>,
        positions: Vec<Vec3>,
    }

    impl NodeVisitor for Recorder {
        fn visit_generic(&mut self, node: &Node, world: &Mat4) {
            self.visited.push(node.name().to_string());
            self.positions.push(world.transform_point3(Vec3::ZERO));
        }

        fn visit_group(&mut self, node: &Node, _world: &Mat4) {
            self.visited.push(node.name().to_string());
        }

        fn visit_camera(&mut self, node: &Node, _world: &Mat4) {
            self.visited.push(node.name().to_string());
        }
    }

    fn scene() -> Node {
        Node::group("root")
            .with_transform(Transform::from_position(Vec3::new(1.0, 0.0, 0.0)))
            .with_child(
                Node::group("a")
                    .with_transform(Transform::from_position(Vec3::new(0.0, 2.0, 0.0)))
                    .with_child(Node::generic("a1"))
                    .with_child(Node::camera("a2")),
            )
            .with_child(Node::light("sun", Light::Directional(DirectionalLight::default())))
            .with_child(Node::generic("b"))
    }

    #[test]
    fn test_depth_first_attachment_order() {
        let mut recorder = Recorder::default();
        traverse(&scene(), &mut recorder);
        // The light uses the default no-op callback
        assert_eq!(recorder.visited, ["root", "a", "a1", "a2", "b"]);
    }

    #[test]
    fn test_world_transforms_compose() {
        let mut recorder = Recorder::default();
        traverse(&scene(), &mut recorder);
        assert_eq!(recorder.positions[0], Vec3::new(1.0, 2.0, 0.0));
        assert_eq!(recorder.positions[1], Vec3::new(1.0, 0.0, 0.0));
    }

    #[test]
    fn test_traversal_is_deterministic() {
        let scene = scene();
        let mut first = Recorder::default();
        let mut second = Recorder::default();
        traverse(&scene, &mut first);
        traverse(&scene, &mut second);
        assert_eq!(first.visited, second.visited);
    }

    #[test]
    fn test_summary() {
        let summary = SceneSummary::of(&scene());
        assert_eq!(summary.nodes, 6);
        assert_eq!(summary.groups, 2);
        assert_eq!(summary.lights, 1);
        assert_eq!(summary.cameras, 1);
        assert_eq!(summary.geometries, 0);
    }
}
