//! Scene graph nodes
//!
//! A scene is a tree of [`Node`]s. Every node carries a local transform
//! relative to its parent; only group nodes have children.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{Light, Transform};
use crate::render::{PassMask, VisualEffect};
use crate::resources::{Geometry, Material, ObjectUniforms, UniformBuffer};

/// Unique identity of a scene node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Drawable content of a geometry node
#[derive(Debug)]
pub struct GeometryNode {
    geometry: Geometry,
    material: Arc<Material>,
    uniforms: Arc<UniformBuffer>,
    passes: PassMask,
    effect: Option<VisualEffect>,
}

// Each node owns its uniforms, a clone gets a fresh buffer
impl Clone for GeometryNode {
    fn clone(&self) -> Self {
        Self {
            geometry: self.geometry.clone(),
            material: self.material.clone(),
            uniforms: Arc::new(UniformBuffer::per_frame("object", ObjectUniforms::SIZE)),
            passes: self.passes,
            effect: self.effect.clone(),
        }
    }
}

impl GeometryNode {
    /// Drawn in the standard pass only, with the pass's visual effect
    pub fn new(geometry: Geometry, material: Arc<Material>) -> Self {
        Self {
            geometry,
            material,
            uniforms: Arc::new(UniformBuffer::per_frame("object", ObjectUniforms::SIZE)),
            passes: PassMask::default(),
            effect: None,
        }
    }

    /// Passes this node is drawn in
    #[must_use]
    pub fn with_passes(mut self, passes: PassMask) -> Self {
        self.passes = passes;
        self
    }

    /// Effect used instead of the one of the pass drawing this node
    #[must_use]
    pub fn with_effect(mut self, effect: VisualEffect) -> Self {
        self.effect = Some(effect);
        self
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn material(&self) -> &Arc<Material> {
        &self.material
    }

    pub fn set_material(&mut self, material: Arc<Material>) {
        self.material = material;
    }

    /// Per-object uniforms the renderer fills every frame
    pub fn uniforms(&self) -> &Arc<UniformBuffer> {
        &self.uniforms
    }

    pub fn passes(&self) -> PassMask {
        self.passes
    }

    pub fn set_passes(&mut self, passes: PassMask) {
        self.passes = passes;
    }

    pub fn effect(&self) -> Option<&VisualEffect> {
        self.effect.as_ref()
    }
}

/// What a node is
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Plain node, only contributes its transform
    Generic,
    /// Container whose children are visited in attachment order
    Group(Vec<Node>),
    Geometry(GeometryNode),
    Light(Light),
    /// Placement of a camera
    Camera,
}

/// A node in the scene graph
#[derive(Debug)]
pub struct Node {
    id: NodeId,
    name: String,
    pub transform: Transform,
    kind: NodeKind,
}

// Copies are new nodes
impl Clone for Node {
    fn clone(&self) -> Self {
        Self {
            id: NodeId::next(),
            name: self.name.clone(),
            transform: self.transform,
            kind: self.kind.clone(),
        }
    }
}

impl Node {
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: NodeId::next(),
            name: name.into(),
            transform: Transform::IDENTITY,
            kind,
        }
    }

    pub fn generic(name: impl Into<String>) -> Self {
        Self::new(name, NodeKind::Generic)
    }

    pub fn group(name: impl Into<String>) -> Self {
        Self::new(name, NodeKind::Group(Vec::new()))
    }

    pub fn geometry(name: impl Into<String>, geometry: GeometryNode) -> Self {
        Self::new(name, NodeKind::Geometry(geometry))
    }

    pub fn light(name: impl Into<String>, light: Light) -> Self {
        Self::new(name, NodeKind::Light(light))
    }

    pub fn camera(name: impl Into<String>) -> Self {
        Self::new(name, NodeKind::Camera)
    }

    #[must_use]
    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    /// Attach `child` after the existing children.
    ///
    /// # Panics
    ///
    /// Panics if this isn't a group node.
    #[must_use]
    pub fn with_child(mut self, child: Node) -> Self {
        self.add_child(child);
        self
    }

    /// Attach `child` after the existing children.
    ///
    /// # Panics
    ///
    /// Panics if this isn't a group node.
    pub fn add_child(&mut self, child: Node) {
        match &mut self.kind {
            NodeKind::Group(children) => children.push(child),
            _ => panic!("children can only be attached to group nodes ('{}')", self.name),
        }
    }

    /// Detach the child with the given id, searching only direct children
    pub fn remove_child(&mut self, id: NodeId) -> Option<Node> {
        match &mut self.kind {
            NodeKind::Group(children) => {
                let index = children.iter().position(|child| child.id == id)?;
                Some(children.remove(index))
            }
            _ => None,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn kind_mut(&mut self) -> &mut NodeKind {
        &mut self.kind
    }

    /// Children in attachment order, empty for anything but a group
    pub fn children(&self) -> &[Node] {
        match &self.kind {
            NodeKind::Group(children) => children,
            _ => &[],
        }
    }

    pub fn as_geometry(&self) -> Option<&GeometryNode> {
        match &self.kind {
            NodeKind::Geometry(geometry) => Some(geometry),
            _ => None,
        }
    }

    pub fn as_geometry_mut(&mut self) -> Option<&mut GeometryNode> {
        match &mut self.kind {
            NodeKind::Geometry(geometry) => Some(geometry),
            _ => None,
        }
    }

    /// Depth-first search by name, including this node
    pub fn find(&self, name: &str) -> Option<&Node> {
        if self.name == name {
            return Some(self);
        }
        self.children().iter().find_map(|child| child.find(name))
    }

    /// Depth-first search by name, including this node
    pub fn find_mut(&mut self, name: &str) -> Option<&mut Node> {
        if self.name == name {
            return Some(self);
        }
        match &mut self.kind {
            NodeKind::Group(children) => children.iter_mut().find_map(|child| child.find_mut(name)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{Mesh, Shader, ShaderEntry, VertexFormat};

    fn test_geometry_node() -> GeometryNode {
        let entry = ShaderEntry {
            spirv: vec![0x0723_0203],
            entry_point: "main".to_string(),
        };
        let shader = Arc::new(Shader::from_spirv("test", entry.clone(), entry, Vec::new()));
        let format = Arc::new(VertexFormat::position_normal_uv());
        GeometryNode::new(
            Mesh::plane(1.0, 1.0).to_geometry(format),
            Arc::new(Material::new("test", shader)),
        )
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Node::generic("a");
        let b = Node::generic("a");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_children_keep_attachment_order() {
        let root = Node::group("root")
            .with_child(Node::generic("first"))
            .with_child(Node::camera("second"))
            .with_child(Node::generic("third"));
        let names: Vec<_> = root.children().iter().map(Node::name).collect();
        assert_eq!(names, ["first", "second", "third"]);
    }

    #[test]
    #[should_panic(expected = "group nodes")]
    fn test_child_on_leaf_panics() {
        let _ = Node::generic("leaf").with_child(Node::generic("child"));
    }

    #[test]
    fn test_find_and_remove() {
        let mut root = Node::group("root").with_child(
            Node::group("inner").with_child(Node::geometry("mesh", test_geometry_node())),
        );
        assert!(root.find("mesh").and_then(Node::as_geometry).is_some());

        let inner = root.find_mut("inner").unwrap();
        let mesh_id = inner.children()[0].id();
        assert!(inner.remove_child(mesh_id).is_some());
        assert!(root.find("mesh").is_none());
    }

    #[test]
    fn test_geometry_defaults_to_standard_pass() {
        let node = test_geometry_node();
        assert_eq!(node.passes(), PassMask::STANDARD);
        assert!(node.effect().is_none());
        assert_eq!(node.uniforms().size(), ObjectUniforms::SIZE);
    }

    #[test]
    fn test_clone_gets_own_uniforms() {
        let node = test_geometry_node();
        let copy = node.clone();
        assert_ne!(node.uniforms().id(), copy.uniforms().id());
        assert!(Arc::ptr_eq(node.material(), copy.material()));
    }
}
