//! Shader programs
//!
//! A shader is SPIR-V for a vertex and a fragment stage plus the binding
//! table both stages share. WGSL sources are compiled with naga.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};

use super::{ResourceError, ResourceId};
use crate::backend::{BindingKind, BindingLayoutEntry, ShaderStages};

/// Compiled code of one stage
#[derive(Debug, Clone)]
pub struct ShaderEntry {
    pub spirv: Vec<u32>,
    pub entry_point: String,
}

/// A vertex + fragment program
#[derive(Debug)]
pub struct Shader {
    id: ResourceId,
    label: String,
    vertex: ShaderEntry,
    fragment: ShaderEntry,
    bindings: Vec<BindingLayoutEntry>,
}

/// Per-object uniforms, filled by the renderer
pub const OBJECT_UNIFORM_BINDING: u32 = 0;
/// Material parameters
pub const MATERIAL_UNIFORM_BINDING: u32 = 1;

/// Per-object uniform block written by the renderer at
/// [`OBJECT_UNIFORM_BINDING`] once per frame and pass
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ObjectUniforms {
    pub model: Mat4,
    pub normal_matrix: Mat4,
    pub view_proj: Mat4,
    /// xyz = camera position, w = time in seconds
    pub camera_position: Vec4,
    /// xyz = direction the light travels in
    pub light_direction: Vec4,
    /// xyz = color, w = intensity
    pub light_color: Vec4,
}

impl ObjectUniforms {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;
}

const BASIC_SHADER: &str = r#"
struct ObjectUniforms {
    model: mat4x4<f32>,
    normal_matrix: mat4x4<f32>,
    view_proj: mat4x4<f32>,
    camera_position: vec4<f32>,
    light_direction: vec4<f32>,
    light_color: vec4<f32>,
}

struct MaterialUniforms {
    base_color: vec4<f32>,
}

@group(0) @binding(0) var<uniform> object_data: ObjectUniforms;
@group(0) @binding(1) var<uniform> material_data: MaterialUniforms;

struct VertexInput {
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
}

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) world_normal: vec3<f32>,
    @location(1) uv: vec2<f32>,
}

@vertex
fn vs_main(v_in: VertexInput) -> VertexOutput {
    var out: VertexOutput;
    let world = object_data.model * vec4<f32>(v_in.position, 1.0);
    out.clip_position = object_data.view_proj * world;
    out.world_normal = (object_data.normal_matrix * vec4<f32>(v_in.normal, 0.0)).xyz;
    out.uv = v_in.uv;
    return out;
}

@fragment
fn fs_main(f_in: VertexOutput) -> @location(0) vec4<f32> {
    let n = normalize(f_in.world_normal);
    let l = normalize(-object_data.light_direction.xyz);
    let diffuse = max(dot(n, l), 0.0) * object_data.light_color.rgb * object_data.light_color.a;
    let lit = material_data.base_color.rgb * (vec3<f32>(0.1) + diffuse);
    return vec4<f32>(lit, material_data.base_color.a);
}
"#;

fn compile_stage(
    module: &naga::Module,
    info: &naga::valid::ModuleInfo,
    stage: naga::ShaderStage,
    entry_point: &str,
) -> Result<Vec<u32>, ResourceError> {
    if !module
        .entry_points
        .iter()
        .any(|ep| ep.name == entry_point && ep.stage == stage)
    {
        return Err(ResourceError::MissingEntryPoint {
            stage: match stage {
                naga::ShaderStage::Vertex => "vertex",
                naga::ShaderStage::Fragment => "fragment",
                _ => "compute",
            },
            name: entry_point.to_string(),
        });
    }

    // The projection matrix already flips Y for Vulkan
    let mut options = naga::back::spv::Options::default();
    options
        .flags
        .remove(naga::back::spv::WriterFlags::ADJUST_COORDINATE_SPACE);
    let pipeline_options = naga::back::spv::PipelineOptions {
        shader_stage: stage,
        entry_point: entry_point.to_string(),
    };
    naga::back::spv::write_vec(module, info, &options, Some(&pipeline_options))
        .map_err(|e| ResourceError::ShaderGeneration(e.to_string()))
}

impl Shader {
    pub fn from_spirv(
        label: &str,
        vertex: ShaderEntry,
        fragment: ShaderEntry,
        bindings: Vec<BindingLayoutEntry>,
    ) -> Self {
        Self {
            id: ResourceId::next(),
            label: label.to_string(),
            vertex,
            fragment,
            bindings,
        }
    }

    /// Compile a WGSL module with a vertex and a fragment entry point.
    ///
    /// Bindings are declared by the caller and must match the module's
    /// `@group(0)` resources.
    pub fn from_wgsl(
        label: &str,
        source: &str,
        vertex_entry: &str,
        fragment_entry: &str,
        bindings: Vec<BindingLayoutEntry>,
    ) -> Result<Self, ResourceError> {
        let module = naga::front::wgsl::parse_str(source)
            .map_err(|e| ResourceError::ShaderParse(e.emit_to_string(source)))?;
        let mut validator = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        );
        let info = validator
            .validate(&module)
            .map_err(|e| ResourceError::ShaderValidation(e.to_string()))?;

        let vertex = compile_stage(&module, &info, naga::ShaderStage::Vertex, vertex_entry)?;
        let fragment = compile_stage(&module, &info, naga::ShaderStage::Fragment, fragment_entry)?;
        log::debug!(
            "Compiled shader '{}' ({} + {} words)",
            label,
            vertex.len(),
            fragment.len()
        );

        Ok(Self::from_spirv(
            label,
            ShaderEntry {
                spirv: vertex,
                entry_point: vertex_entry.to_string(),
            },
            ShaderEntry {
                spirv: fragment,
                entry_point: fragment_entry.to_string(),
            },
            bindings,
        ))
    }

    /// Lit, untextured shader for `position_normal_uv` vertices.
    ///
    /// Reads the object uniforms at binding 0 and a `base_color: vec4`
    /// material block at binding 1.
    pub fn basic() -> Result<Self, ResourceError> {
        Self::from_wgsl(
            "basic",
            BASIC_SHADER,
            "vs_main",
            "fs_main",
            vec![
                BindingLayoutEntry {
                    binding: OBJECT_UNIFORM_BINDING,
                    kind: BindingKind::UniformBuffer,
                    stages: ShaderStages::VERTEX_FRAGMENT,
                },
                BindingLayoutEntry {
                    binding: MATERIAL_UNIFORM_BINDING,
                    kind: BindingKind::UniformBuffer,
                    stages: ShaderStages::FRAGMENT,
                },
            ],
        )
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn vertex(&self) -> &ShaderEntry {
        &self.vertex
    }

    pub fn fragment(&self) -> &ShaderEntry {
        &self.fragment
    }

    pub fn bindings(&self) -> &[BindingLayoutEntry] {
        &self.bindings
    }

    pub fn declares(&self, binding: u32, kind: BindingKind) -> bool {
        self.bindings
            .iter()
            .any(|entry| entry.binding == binding && entry.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_shader_compiles() {
        let shader = Shader::basic().unwrap();
        // SPIR-V magic number
        assert_eq!(shader.vertex().spirv[0], 0x0723_0203);
        assert_eq!(shader.fragment().spirv[0], 0x0723_0203);
        assert!(shader.declares(OBJECT_UNIFORM_BINDING, BindingKind::UniformBuffer));
        assert!(shader.declares(MATERIAL_UNIFORM_BINDING, BindingKind::UniformBuffer));
    }

    #[test]
    fn test_object_uniforms_layout() {
        // Three mat4x4 and three vec4, no padding
        assert_eq!(ObjectUniforms::SIZE, 240);
    }

    #[test]
    fn test_missing_entry_point() {
        let result = Shader::from_wgsl("broken", BASIC_SHADER, "vs_main", "nope", Vec::new());
        assert!(matches!(
            result,
            Err(ResourceError::MissingEntryPoint { stage: "fragment", .. })
        ));
    }

    #[test]
    fn test_parse_error() {
        let result = Shader::from_wgsl("broken", "fn (", "vs_main", "fs_main", Vec::new());
        assert!(matches!(result, Err(ResourceError::ShaderParse(_))));
    }
}
