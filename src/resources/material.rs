//! Materials: a shader plus its parameters and textures

use std::sync::Arc;

use super::{ResourceId, Shader, Texture, UniformBuffer, MATERIAL_UNIFORM_BINDING};
use crate::variant::{pack_uniform_block, Variant};

/// How a material combines with what is already rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlendMode {
    #[default]
    Opaque,
    /// Alpha blended, drawn after opaque geometry back to front
    Translucent,
}

/// Texture sampled at a shader binding
#[derive(Debug, Clone)]
pub struct MaterialTexture {
    pub binding: u32,
    pub texture: Arc<Texture>,
}

#[derive(Debug)]
pub struct Material {
    id: ResourceId,
    name: String,
    shader: Arc<Shader>,
    params: Vec<(String, Variant)>,
    textures: Vec<MaterialTexture>,
    blend_mode: BlendMode,
    uniforms: Option<Arc<UniformBuffer>>,
}

impl Material {
    pub fn new(name: &str, shader: Arc<Shader>) -> Self {
        Self {
            id: ResourceId::next(),
            name: name.to_string(),
            shader,
            params: Vec::new(),
            textures: Vec::new(),
            blend_mode: BlendMode::Opaque,
            uniforms: None,
        }
    }

    /// Append a parameter to the material uniform block.
    ///
    /// Parameters are packed in the order they are added. Setting an existing
    /// name replaces its value in place.
    pub fn with_param(mut self, name: &str, value: impl Into<Variant>) -> Self {
        let value = value.into();
        match self.params.iter_mut().find(|(n, _)| n == name) {
            Some((_, existing)) => *existing = value,
            None => self.params.push((name.to_string(), value)),
        }
        self.rebuild_uniforms();
        self
    }

    pub fn with_texture(mut self, binding: u32, texture: Arc<Texture>) -> Self {
        self.textures.retain(|t| t.binding != binding);
        self.textures.push(MaterialTexture { binding, texture });
        self
    }

    pub fn with_blend_mode(mut self, blend_mode: BlendMode) -> Self {
        self.blend_mode = blend_mode;
        self
    }

    fn rebuild_uniforms(&mut self) {
        let block = pack_uniform_block(self.params.iter().map(|(_, value)| value));
        self.uniforms = if block.is_empty() {
            None
        } else {
            Some(Arc::new(UniformBuffer::with_contents(
                &format!("{} material", self.name),
                block,
            )))
        };
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shader(&self) -> &Arc<Shader> {
        &self.shader
    }

    pub fn param(&self, name: &str) -> Option<&Variant> {
        self.params.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn params(&self) -> &[(String, Variant)] {
        &self.params
    }

    pub fn textures(&self) -> &[MaterialTexture] {
        &self.textures
    }

    pub fn blend_mode(&self) -> BlendMode {
        self.blend_mode
    }

    /// Packed parameters, bound at the material uniform binding
    pub fn uniform_buffer(&self) -> Option<&Arc<UniformBuffer>> {
        self.uniforms.as_ref()
    }

    pub fn uniform_binding(&self) -> u32 {
        MATERIAL_UNIFORM_BINDING
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ShaderEntry;
    use glam::Vec4;

    fn shader() -> Arc<Shader> {
        let entry = ShaderEntry {
            spirv: vec![0x0723_0203],
            entry_point: "main".to_string(),
        };
        Arc::new(Shader::from_spirv("test", entry.clone(), entry, Vec::new()))
    }

    #[test]
    fn test_params_pack_in_order() {
        let material = Material::new("red", shader())
            .with_param("base_color", Vec4::new(1.0, 0.0, 0.0, 1.0))
            .with_param("roughness", 0.5f32);
        let uniforms = material.uniform_buffer().unwrap();
        assert_eq!(uniforms.size(), 32);
        assert_eq!(&uniforms.contents()[16..20], &0.5f32.to_ne_bytes());
    }

    #[test]
    fn test_param_replaced_in_place() {
        let material = Material::new("m", shader())
            .with_param("a", 1.0f32)
            .with_param("b", 2.0f32)
            .with_param("a", 3.0f32);
        assert_eq!(material.params().len(), 2);
        assert_eq!(material.param("a"), Some(&Variant::Float32(3.0)));
        assert_eq!(material.params()[0].0, "a");
    }

    #[test]
    fn test_no_params_no_uniforms() {
        let material = Material::new("plain", shader());
        assert!(material.uniform_buffer().is_none());
        assert_eq!(material.blend_mode(), BlendMode::Opaque);
    }

    #[test]
    fn test_texture_binding_replaced() {
        let texture = Arc::new(Texture::solid_color([255; 4], "white"));
        let material = Material::new("m", shader())
            .with_texture(2, texture.clone())
            .with_texture(2, texture);
        assert_eq!(material.textures().len(), 1);
    }
}
