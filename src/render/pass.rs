//! Scene passes
//!
//! A frame is rendered by a fixed set of passes visited in ascending
//! [`PassType`] order. A composite pass owns child passes keyed by type and
//! visits them by the same rule.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use glam::Mat4;

use super::{RenderQueue, Renderable, RenderableType, RenderResult, Renderer};
use crate::backend::{CullMode, Viewport};
use crate::resources::FrameBuffer;
use crate::scene::Camera;

/// Stage of frame rendering, ordered by evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum PassType {
    Offscreen = 0,
    Shadows = 1,
    Standard = 2,
    Composite = 3,
}

impl PassType {
    /// Number of pass types
    pub const COUNT: usize = 4;

    pub const ALL: [PassType; Self::COUNT] = [
        PassType::Offscreen,
        PassType::Shadows,
        PassType::Standard,
        PassType::Composite,
    ];

    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Pass type with the given evaluation index
    pub fn from_index(index: usize) -> Option<Self> {
        let pass_type = Self::ALL.get(index).copied();
        if pass_type.is_none() {
            log::error!("Unknown pass type index {}", index);
        }
        pass_type
    }

    pub fn name(&self) -> &'static str {
        match self {
            PassType::Offscreen => "offscreen",
            PassType::Shadows => "shadows",
            PassType::Standard => "standard",
            PassType::Composite => "composite",
        }
    }
}

impl fmt::Display for PassType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of passes a node is drawn in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PassMask(u8);

impl PassMask {
    pub const NONE: Self = Self(0);
    pub const OFFSCREEN: Self = Self(1 << 0);
    pub const SHADOWS: Self = Self(1 << 1);
    pub const STANDARD: Self = Self(1 << 2);
    pub const COMPOSITE: Self = Self(1 << 3);
    pub const ALL: Self = Self(0b1111);

    pub fn contains(&self, pass_type: PassType) -> bool {
        self.0 & Self::from(pass_type).0 != 0
    }

    pub fn insert(&mut self, pass_type: PassType) {
        self.0 |= Self::from(pass_type).0;
    }

    pub fn remove(&mut self, pass_type: PassType) {
        self.0 &= !Self::from(pass_type).0;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl Default for PassMask {
    /// Nodes are drawn in the standard pass unless they opt into others
    fn default() -> Self {
        Self::STANDARD
    }
}

impl From<PassType> for PassMask {
    fn from(pass_type: PassType) -> Self {
        Self(1 << pass_type.index())
    }
}

impl std::ops::BitOr for PassMask {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOr<PassType> for PassMask {
    type Output = Self;
    fn bitor(self, rhs: PassType) -> Self::Output {
        self | Self::from(rhs)
    }
}

/// Rendering state a pass applies to everything it draws
#[derive(Debug, Clone, PartialEq)]
pub struct VisualEffect {
    pub cull_mode: CullMode,
    /// A disabled effect draws with back-face culling and no extra transform
    pub enabled: bool,
    /// Applied on top of each renderable's world transform
    pub transform: Mat4,
}

impl Default for VisualEffect {
    fn default() -> Self {
        Self {
            cull_mode: CullMode::Back,
            enabled: true,
            transform: Mat4::IDENTITY,
        }
    }
}

impl VisualEffect {
    pub fn with_cull_mode(mut self, cull_mode: CullMode) -> Self {
        self.cull_mode = cull_mode;
        self
    }

    pub fn with_transform(mut self, transform: Mat4) -> Self {
        self.transform = transform;
        self
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Cull mode and model matrix for a renderable placed at `world`
    pub fn apply(&self, world: &Mat4) -> (CullMode, Mat4) {
        if self.enabled {
            (self.cull_mode, self.transform * *world)
        } else {
            (CullMode::Back, *world)
        }
    }
}

/// Target and clear state of a pass
#[derive(Debug, Clone)]
pub struct PassData {
    /// Viewport in pixels, the whole target when `None`
    pub viewport: Option<Viewport>,
    /// `None` keeps the previous color contents
    pub clear_color: Option<[f32; 4]>,
    /// `None` keeps the previous depth contents
    pub clear_depth: Option<f32>,
    pub clear_stencil: u32,
    /// Offscreen attachments, the acquired swapchain image when `None`
    pub target: Option<Arc<FrameBuffer>>,
}

impl Default for PassData {
    fn default() -> Self {
        Self {
            viewport: None,
            clear_color: Some([0.0, 0.0, 0.0, 1.0]),
            clear_depth: Some(1.0),
            clear_stencil: 0,
            target: None,
        }
    }
}

/// How a pass renders
#[derive(Debug, Clone)]
pub enum PassKind {
    /// Draws the renderables of the queue
    Scene,
    /// Visits its children in ascending pass type order
    Composite(BTreeMap<PassType, ScenePass>),
}

/// One stage of the frame
#[derive(Debug, Clone)]
pub struct ScenePass {
    pass_type: PassType,
    pub data: PassData,
    pub effect: VisualEffect,
    buckets: Vec<RenderableType>,
    kind: PassKind,
}

impl ScenePass {
    /// Pass drawing the opaque and translucent buckets
    pub fn new(pass_type: PassType) -> Self {
        Self {
            pass_type,
            data: PassData::default(),
            effect: VisualEffect::default(),
            buckets: vec![RenderableType::Opaque, RenderableType::Translucent],
            kind: PassKind::Scene,
        }
    }

    /// Empty container pass
    pub fn composite() -> Self {
        Self {
            kind: PassKind::Composite(BTreeMap::new()),
            ..Self::new(PassType::Composite)
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: PassData) -> Self {
        self.data = data;
        self
    }

    #[must_use]
    pub fn with_effect(mut self, effect: VisualEffect) -> Self {
        self.effect = effect;
        self
    }

    /// Queue buckets drawn by this pass, in drawing order
    #[must_use]
    pub fn with_buckets(mut self, buckets: Vec<RenderableType>) -> Self {
        self.buckets = buckets;
        self
    }

    /// Register `child`, replacing the child of the same type.
    ///
    /// # Panics
    ///
    /// Panics if this isn't a composite pass.
    #[must_use]
    pub fn with_child(mut self, child: ScenePass) -> Self {
        self.add_child(child);
        self
    }

    /// Register `child`, replacing and returning the child of the same type.
    ///
    /// # Panics
    ///
    /// Panics if this isn't a composite pass.
    pub fn add_child(&mut self, child: ScenePass) -> Option<ScenePass> {
        match &mut self.kind {
            PassKind::Composite(children) => {
                let replaced = children.insert(child.pass_type, child);
                if let Some(replaced) = &replaced {
                    log::warn!("Replaced {} pass in composite", replaced.pass_type);
                }
                replaced
            }
            PassKind::Scene => panic!("passes can only be added to a composite pass"),
        }
    }

    pub fn remove_child(&mut self, pass_type: PassType) -> Option<ScenePass> {
        match &mut self.kind {
            PassKind::Composite(children) => children.remove(&pass_type),
            PassKind::Scene => None,
        }
    }

    pub fn child(&self, pass_type: PassType) -> Option<&ScenePass> {
        match &self.kind {
            PassKind::Composite(children) => children.get(&pass_type),
            PassKind::Scene => None,
        }
    }

    pub fn child_mut(&mut self, pass_type: PassType) -> Option<&mut ScenePass> {
        match &mut self.kind {
            PassKind::Composite(children) => children.get_mut(&pass_type),
            PassKind::Scene => None,
        }
    }

    pub fn pass_type(&self) -> PassType {
        self.pass_type
    }

    pub fn kind(&self) -> &PassKind {
        &self.kind
    }

    pub fn buckets(&self) -> &[RenderableType] {
        &self.buckets
    }

    /// Call `f` for every drawing pass, composites expanded in ascending
    /// pass type order
    pub fn visit<F>(&self, f: &mut F) -> RenderResult<()>
    where
        F: FnMut(&ScenePass) -> RenderResult<()>,
    {
        match &self.kind {
            PassKind::Scene => f(self),
            PassKind::Composite(children) => {
                for child in children.values() {
                    child.visit(f)?;
                }
                Ok(())
            }
        }
    }

    /// Renderables of `queue` this pass draws, in drawing order
    pub fn eligible<'q>(&'q self, queue: &'q RenderQueue) -> impl Iterator<Item = &'q Renderable> {
        self.buckets
            .iter()
            .flat_map(move |bucket| queue.get_renderables(*bucket))
            .filter(move |renderable| renderable.passes.contains(self.pass_type))
    }

    /// Record every drawing pass into the frame targeting swapchain image
    /// `image_index`, bracketed by the renderer's begin and end hooks
    pub fn render<R: Renderer + ?Sized>(
        &self,
        renderer: &mut R,
        queue: &RenderQueue,
        image_index: u32,
    ) -> RenderResult<()> {
        self.visit(&mut |pass| {
            renderer.begin_pass(pass, image_index)?;
            for renderable in pass.eligible(queue) {
                renderer.draw(pass, renderable)?;
            }
            renderer.end_pass(pass, image_index)
        })
    }

    /// Upload per-object uniforms for everything `render` will draw
    pub fn update<R: Renderer + ?Sized>(
        &self,
        renderer: &mut R,
        queue: &RenderQueue,
        camera: &Camera,
        time: f32,
    ) -> RenderResult<()> {
        self.visit(&mut |pass| {
            for renderable in pass.eligible(queue) {
                renderer.update_object(pass, renderable, camera, time)?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn test_pass_type_order() {
        assert!(PassType::Offscreen < PassType::Shadows);
        assert!(PassType::Shadows < PassType::Standard);
        assert!(PassType::Standard < PassType::Composite);
        for (index, pass_type) in PassType::ALL.iter().enumerate() {
            assert_eq!(pass_type.index(), index);
        }
    }

    #[test]
    fn test_unknown_pass_index() {
        assert_eq!(PassType::from_index(2), Some(PassType::Standard));
        assert_eq!(PassType::from_index(PassType::COUNT), None);
    }

    #[test]
    fn test_pass_mask() {
        let mut mask = PassMask::STANDARD | PassType::Shadows;
        assert!(mask.contains(PassType::Standard));
        assert!(mask.contains(PassType::Shadows));
        assert!(!mask.contains(PassType::Offscreen));
        mask.remove(PassType::Standard);
        mask.remove(PassType::Shadows);
        assert!(mask.is_empty());
        mask.insert(PassType::Composite);
        assert_eq!(mask, PassMask::COMPOSITE);
    }

    #[test]
    fn test_composite_visits_in_type_order() {
        let root = ScenePass::composite()
            .with_child(ScenePass::new(PassType::Standard))
            .with_child(ScenePass::new(PassType::Offscreen))
            .with_child(ScenePass::new(PassType::Shadows));
        let mut order = Vec::new();
        root.visit(&mut |pass| {
            order.push(pass.pass_type());
            Ok(())
        })
        .unwrap();
        assert_eq!(
            order,
            [PassType::Offscreen, PassType::Shadows, PassType::Standard]
        );
    }

    #[test]
    fn test_add_child_replaces_same_type() {
        let mut root = ScenePass::composite();
        assert!(root.add_child(ScenePass::new(PassType::Standard)).is_none());
        let replaced = root.add_child(
            ScenePass::new(PassType::Standard).with_effect(VisualEffect::disabled()),
        );
        assert!(replaced.is_some());
        assert!(!root.child(PassType::Standard).unwrap().effect.enabled);
    }

    #[test]
    #[should_panic(expected = "composite pass")]
    fn test_add_child_to_scene_pass_panics() {
        let _ = ScenePass::new(PassType::Standard).with_child(ScenePass::new(PassType::Shadows));
    }

    #[test]
    fn test_visual_effect_apply() {
        let world = Mat4::from_translation(Vec3::X);
        let mirror = Mat4::from_scale(Vec3::new(1.0, -1.0, 1.0));
        let effect = VisualEffect::default()
            .with_cull_mode(CullMode::Front)
            .with_transform(mirror);

        let (cull, model) = effect.apply(&world);
        assert_eq!(cull, CullMode::Front);
        assert_eq!(model, mirror * world);

        let (cull, model) = VisualEffect { enabled: false, ..effect }.apply(&world);
        assert_eq!(cull, CullMode::Back);
        assert_eq!(model, world);
    }
}
