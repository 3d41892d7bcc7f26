//! Tagged values for material parameters
//!
//! [`Variant`] is a closed set of the scalar, vector and matrix types a
//! shader parameter can hold. [`pack_uniform_block`] lays a list of them out
//! with the WGSL uniform address space rules.

use glam::{Mat2, Mat3, Mat4, Vec2, Vec3, Vec4};

/// Discriminant of a [`Variant`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariantType {
    Bool,
    Int32,
    Int64,
    UInt32,
    UInt64,
    Float32,
    Float64,
    String,
    Vec2,
    Vec3,
    Vec4,
    Mat2,
    Mat3,
    Mat4,
}

impl VariantType {
    pub const ALL: [VariantType; 14] = [
        VariantType::Bool,
        VariantType::Int32,
        VariantType::Int64,
        VariantType::UInt32,
        VariantType::UInt64,
        VariantType::Float32,
        VariantType::Float64,
        VariantType::String,
        VariantType::Vec2,
        VariantType::Vec3,
        VariantType::Vec4,
        VariantType::Mat2,
        VariantType::Mat3,
        VariantType::Mat4,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            VariantType::Bool => "bool",
            VariantType::Int32 => "i32",
            VariantType::Int64 => "i64",
            VariantType::UInt32 => "u32",
            VariantType::UInt64 => "u64",
            VariantType::Float32 => "f32",
            VariantType::Float64 => "f64",
            VariantType::String => "string",
            VariantType::Vec2 => "vec2",
            VariantType::Vec3 => "vec3",
            VariantType::Vec4 => "vec4",
            VariantType::Mat2 => "mat2",
            VariantType::Mat3 => "mat3",
            VariantType::Mat4 => "mat4",
        }
    }

    /// Look a type up by its name. Unknown names are logged and yield `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        let found = Self::ALL.iter().copied().find(|t| t.name() == name);
        if found.is_none() {
            log::error!("Unknown variant type '{}'", name);
        }
        found
    }

    /// Alignment and size in a uniform block, `None` if the type can't live there
    pub fn uniform_layout(&self) -> Option<(usize, usize)> {
        match self {
            VariantType::Bool
            | VariantType::Int32
            | VariantType::UInt32
            | VariantType::Float32 => Some((4, 4)),
            VariantType::Int64 | VariantType::UInt64 | VariantType::Float64 => Some((8, 8)),
            VariantType::Vec2 => Some((8, 8)),
            VariantType::Vec3 => Some((16, 12)),
            VariantType::Vec4 => Some((16, 16)),
            VariantType::Mat2 => Some((8, 16)),
            VariantType::Mat3 => Some((16, 48)),
            VariantType::Mat4 => Some((16, 64)),
            VariantType::String => None,
        }
    }
}

/// A dynamically typed value
#[derive(Debug, Clone, PartialEq)]
pub enum Variant {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    String(String),
    Vec2(Vec2),
    Vec3(Vec3),
    Vec4(Vec4),
    Mat2(Mat2),
    Mat3(Mat3),
    Mat4(Mat4),
}

macro_rules! variant_accessor {
    ($name:ident, $variant:ident, $ty:ty) => {
        pub fn $name(&self) -> Option<$ty> {
            match self {
                Variant::$variant(value) => Some(*value),
                _ => None,
            }
        }
    };
}

macro_rules! variant_from {
    ($variant:ident, $ty:ty) => {
        impl From<$ty> for Variant {
            fn from(value: $ty) -> Self {
                Variant::$variant(value)
            }
        }
    };
}

impl Variant {
    pub fn variant_type(&self) -> VariantType {
        match self {
            Variant::Bool(_) => VariantType::Bool,
            Variant::Int32(_) => VariantType::Int32,
            Variant::Int64(_) => VariantType::Int64,
            Variant::UInt32(_) => VariantType::UInt32,
            Variant::UInt64(_) => VariantType::UInt64,
            Variant::Float32(_) => VariantType::Float32,
            Variant::Float64(_) => VariantType::Float64,
            Variant::String(_) => VariantType::String,
            Variant::Vec2(_) => VariantType::Vec2,
            Variant::Vec3(_) => VariantType::Vec3,
            Variant::Vec4(_) => VariantType::Vec4,
            Variant::Mat2(_) => VariantType::Mat2,
            Variant::Mat3(_) => VariantType::Mat3,
            Variant::Mat4(_) => VariantType::Mat4,
        }
    }

    variant_accessor!(as_bool, Bool, bool);
    variant_accessor!(as_i32, Int32, i32);
    variant_accessor!(as_i64, Int64, i64);
    variant_accessor!(as_u32, UInt32, u32);
    variant_accessor!(as_u64, UInt64, u64);
    variant_accessor!(as_f32, Float32, f32);
    variant_accessor!(as_f64, Float64, f64);
    variant_accessor!(as_vec2, Vec2, Vec2);
    variant_accessor!(as_vec3, Vec3, Vec3);
    variant_accessor!(as_vec4, Vec4, Vec4);
    variant_accessor!(as_mat2, Mat2, Mat2);
    variant_accessor!(as_mat3, Mat3, Mat3);
    variant_accessor!(as_mat4, Mat4, Mat4);

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Variant::String(value) => Some(value),
            _ => None,
        }
    }

    /// Bytes of this value in a uniform block, without padding
    fn uniform_bytes(&self, out: &mut Vec<u8>) {
        match self {
            Variant::Bool(v) => out.extend_from_slice(&u32::from(*v).to_ne_bytes()),
            Variant::Int32(v) => out.extend_from_slice(&v.to_ne_bytes()),
            Variant::Int64(v) => out.extend_from_slice(&v.to_ne_bytes()),
            Variant::UInt32(v) => out.extend_from_slice(&v.to_ne_bytes()),
            Variant::UInt64(v) => out.extend_from_slice(&v.to_ne_bytes()),
            Variant::Float32(v) => out.extend_from_slice(&v.to_ne_bytes()),
            Variant::Float64(v) => out.extend_from_slice(&v.to_ne_bytes()),
            Variant::Vec2(v) => out.extend_from_slice(bytemuck::bytes_of(v)),
            Variant::Vec3(v) => out.extend_from_slice(bytemuck::bytes_of(v)),
            Variant::Vec4(v) => out.extend_from_slice(bytemuck::bytes_of(v)),
            Variant::Mat2(v) => out.extend_from_slice(bytemuck::bytes_of(v)),
            Variant::Mat3(v) => {
                // Columns are padded to vec4
                for column in [v.x_axis, v.y_axis, v.z_axis] {
                    out.extend_from_slice(bytemuck::bytes_of(&column.extend(0.0)));
                }
            }
            Variant::Mat4(v) => out.extend_from_slice(bytemuck::bytes_of(v)),
            Variant::String(_) => {}
        }
    }
}

variant_from!(Bool, bool);
variant_from!(Int32, i32);
variant_from!(Int64, i64);
variant_from!(UInt32, u32);
variant_from!(UInt64, u64);
variant_from!(Float32, f32);
variant_from!(Float64, f64);
variant_from!(String, String);
variant_from!(Vec2, Vec2);
variant_from!(Vec3, Vec3);
variant_from!(Vec4, Vec4);
variant_from!(Mat2, Mat2);
variant_from!(Mat3, Mat3);
variant_from!(Mat4, Mat4);

impl From<&str> for Variant {
    fn from(value: &str) -> Self {
        Variant::String(value.to_string())
    }
}

fn align_to(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

/// Pack values into a uniform block in declaration order.
///
/// Every member is aligned to its own alignment and the block size is a
/// multiple of 16. Values that can't live in a uniform block are skipped
/// with a warning.
pub fn pack_uniform_block<'a>(values: impl IntoIterator<Item = &'a Variant>) -> Vec<u8> {
    let mut out = Vec::new();
    for value in values {
        let Some((alignment, size)) = value.variant_type().uniform_layout() else {
            log::warn!(
                "Skipping {} value in uniform block",
                value.variant_type().name()
            );
            continue;
        };
        out.resize(align_to(out.len(), alignment), 0);
        let start = out.len();
        value.uniform_bytes(&mut out);
        debug_assert_eq!(out.len() - start, size);
    }
    out.resize(align_to(out.len(), 16), 0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_at(bytes: &[u8], offset: usize) -> f32 {
        f32::from_ne_bytes(bytes[offset..offset + 4].try_into().unwrap())
    }

    #[test]
    fn test_accessors_match_type() {
        let v = Variant::from(3.5f32);
        assert_eq!(v.variant_type(), VariantType::Float32);
        assert_eq!(v.as_f32(), Some(3.5));
        assert_eq!(v.as_i32(), None);
        assert_eq!(Variant::from("albedo").as_str(), Some("albedo"));
        assert_eq!(Variant::from(Vec3::ONE).as_vec3(), Some(Vec3::ONE));
    }

    #[test]
    fn test_type_names_round_trip() {
        for ty in VariantType::ALL {
            assert_eq!(VariantType::from_name(ty.name()), Some(ty));
        }
    }

    #[test]
    fn test_unknown_type_name() {
        assert_eq!(VariantType::from_name("quaternion"), None);
    }

    #[test]
    fn test_vec3_aligns_to_16() {
        let block = pack_uniform_block(&[Variant::Float32(1.0), Variant::Vec3(Vec3::splat(2.0))]);
        assert_eq!(block.len(), 32);
        assert_eq!(f32_at(&block, 0), 1.0);
        assert_eq!(f32_at(&block, 16), 2.0);
        assert_eq!(f32_at(&block, 24), 2.0);
    }

    #[test]
    fn test_scalar_packs_after_vec3() {
        let block = pack_uniform_block(&[Variant::Vec3(Vec3::ONE), Variant::Float32(7.0)]);
        assert_eq!(block.len(), 16);
        assert_eq!(f32_at(&block, 12), 7.0);
    }

    #[test]
    fn test_mat3_columns_are_padded() {
        let block = pack_uniform_block(&[Variant::Mat3(Mat3::from_diagonal(Vec3::new(
            1.0, 2.0, 3.0,
        )))]);
        assert_eq!(block.len(), 48);
        assert_eq!(f32_at(&block, 0), 1.0);
        assert_eq!(f32_at(&block, 20), 2.0);
        assert_eq!(f32_at(&block, 40), 3.0);
    }

    #[test]
    fn test_strings_are_skipped() {
        let block = pack_uniform_block(&[
            Variant::from("name"),
            Variant::Bool(true),
            Variant::Vec4(Vec4::ONE),
        ]);
        assert_eq!(block.len(), 32);
        assert_eq!(u32::from_ne_bytes(block[0..4].try_into().unwrap()), 1);
        assert_eq!(f32_at(&block, 16), 1.0);
    }

    #[test]
    fn test_empty_block() {
        assert!(pack_uniform_block(std::iter::empty()).is_empty());
    }
}
