//! Attribute reflection for externally defined types
//!
//! A type described by another runtime exposes its declared fields through
//! [`ReflectedType`]. [`reflect_attributes`] walks those fields once per
//! type, maps each field type to a [`VariantType`] through a fixed table and
//! installs an accessor pair, so the registry's generic attribute code can
//! read and write the field without knowing its concrete type.
//!
//! Field types without a mapping (nested references, raw pointers, anything
//! unknown) are skipped silently.

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::attribute::{AttributeAccessor, AttributeInfo, AttributeMode};
use crate::hash::{StringHash, TypeId};
use crate::object::Object;
use crate::registry::TypeRegistry;
use crate::variant::{Variant, VariantType};

// ============================================================================
// Field model
// ============================================================================

/// Width and signedness of an integer field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntegerKind {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
}

/// Declared type of a reflected field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Bool,
    Integer(IntegerKind),
    F32,
    F64,
    Vector2,
    Vector3,
    Vector4,
    Quaternion,
    Color,
    IntVector2,
    Matrix3,
    Matrix4,
    String,
    Buffer,
    /// Enumeration stored as its underlying integer; `names` in value order
    Enum {
        underlying: IntegerKind,
        names: Vec<String>,
    },
    /// Reference to another managed object
    Reference(String),
    /// Raw pointer or pointer-sized handle
    Pointer,
    /// Any other declared type
    Unsupported(String),
}

/// Field value in its native representation
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Vector2([f32; 2]),
    Vector3([f32; 3]),
    Vector4([f32; 4]),
    Quaternion([f32; 4]),
    Color([f32; 4]),
    IntVector2([i32; 2]),
    Matrix3([f32; 9]),
    Matrix4([f32; 16]),
    String(String),
    Buffer(Vec<u8>),
}

bitflags! {
    /// Per-field reflection markers
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct FieldFlags: u32 {
        /// Never reflected
        const NON_SERIALIZED = 0x1;
        /// Reflect a non-public field
        const SERIALIZE_FIELD = 0x2;
        /// Reflected but hidden from editors
        const HIDE_IN_EDITOR = 0x4;
    }
}

/// Declared field of a reflected type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub name: String,
    pub field_type: FieldType,
    pub is_public: bool,
    #[serde(default)]
    pub flags: FieldFlags,
}

impl FieldInfo {
    pub fn public(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            is_public: true,
            flags: FieldFlags::empty(),
        }
    }

    pub fn private(name: &str, field_type: FieldType) -> Self {
        Self {
            is_public: false,
            ..Self::public(name, field_type)
        }
    }

    pub fn with_flags(mut self, flags: FieldFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Whether the field passes the serialization policy
    pub fn is_reflectable(&self) -> bool {
        if self.flags.contains(FieldFlags::NON_SERIALIZED) {
            return false;
        }
        self.is_public || self.flags.contains(FieldFlags::SERIALIZE_FIELD)
    }

    fn attribute_mode(&self) -> AttributeMode {
        if self.flags.contains(FieldFlags::HIDE_IN_EDITOR) {
            AttributeMode::DEFAULT | AttributeMode::NO_EDIT
        } else {
            AttributeMode::DEFAULT
        }
    }
}

/// Type described by another runtime
pub trait ReflectedType: Send + Sync {
    /// Registered type name
    fn type_name(&self) -> &str;

    /// Identifier under which attributes are registered
    fn reflected_id(&self) -> TypeId {
        StringHash::new(self.type_name())
    }

    /// Declared fields, in declaration order
    fn fields(&self) -> &[FieldInfo];

    /// Read field `index` of `object`
    fn get_field(&self, object: &dyn Object, index: usize) -> Option<FieldValue>;

    /// Write field `index` of `object`; returns whether the value was stored
    fn set_field(&self, object: &dyn Object, index: usize, value: FieldValue) -> bool;
}

// ============================================================================
// Mapping table
// ============================================================================

/// Conversion between one native field representation and a variant tag
pub struct FieldMapping {
    pub variant_type: VariantType,
    pub to_variant: fn(FieldValue) -> Option<Variant>,
    pub from_variant: fn(&Variant) -> Option<FieldValue>,
}

impl fmt::Debug for FieldMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldMapping")
            .field("variant_type", &self.variant_type)
            .finish_non_exhaustive()
    }
}

macro_rules! int_mapping {
    ($name:ident, $field:ident, $ty:ty, Int) => {
        static $name: FieldMapping = FieldMapping {
            variant_type: VariantType::Int,
            to_variant: |value| match value {
                FieldValue::$field(v) => Some(Variant::Int(i32::from(v))),
                _ => None,
            },
            from_variant: |variant| {
                variant
                    .as_i64()
                    .and_then(|v| <$ty>::try_from(v).ok())
                    .map(FieldValue::$field)
            },
        };
    };
    ($name:ident, $field:ident, $ty:ty, Int64) => {
        static $name: FieldMapping = FieldMapping {
            variant_type: VariantType::Int64,
            to_variant: |value| match value {
                FieldValue::$field(v) => Some(Variant::Int64(i64::from(v))),
                _ => None,
            },
            from_variant: |variant| {
                variant
                    .as_i64()
                    .and_then(|v| <$ty>::try_from(v).ok())
                    .map(FieldValue::$field)
            },
        };
    };
}

macro_rules! same_shape {
    ($name:ident, $field:ident, $variant:ident) => {
        static $name: FieldMapping = FieldMapping {
            variant_type: VariantType::$variant,
            to_variant: |value| match value {
                FieldValue::$field(v) => Some(Variant::$variant(v)),
                _ => None,
            },
            from_variant: |variant| match variant {
                Variant::$variant(v) => Some(FieldValue::$field(v.clone())),
                _ => None,
            },
        };
    };
}

int_mapping!(I8_MAPPING, I8, i8, Int);
int_mapping!(U8_MAPPING, U8, u8, Int);
int_mapping!(I16_MAPPING, I16, i16, Int);
int_mapping!(U16_MAPPING, U16, u16, Int);
int_mapping!(U32_MAPPING, U32, u32, Int64);
int_mapping!(I64_MAPPING, I64, i64, Int64);

static I32_MAPPING: FieldMapping = FieldMapping {
    variant_type: VariantType::Int,
    to_variant: |value| match value {
        FieldValue::I32(v) => Some(Variant::Int(v)),
        _ => None,
    },
    from_variant: |variant| variant.as_i32().map(FieldValue::I32),
};

// Stored bit-for-bit in a signed 64-bit variant.
static U64_MAPPING: FieldMapping = FieldMapping {
    variant_type: VariantType::Int64,
    to_variant: |value| match value {
        FieldValue::U64(v) => Some(Variant::Int64(v as i64)),
        _ => None,
    },
    from_variant: |variant| variant.as_i64().map(|v| FieldValue::U64(v as u64)),
};

static F32_MAPPING: FieldMapping = FieldMapping {
    variant_type: VariantType::Float,
    to_variant: |value| match value {
        FieldValue::F32(v) => Some(Variant::Float(v)),
        _ => None,
    },
    from_variant: |variant| variant.as_f32().map(FieldValue::F32),
};

static F64_MAPPING: FieldMapping = FieldMapping {
    variant_type: VariantType::Double,
    to_variant: |value| match value {
        FieldValue::F64(v) => Some(Variant::Double(v)),
        _ => None,
    },
    from_variant: |variant| variant.as_f64().map(FieldValue::F64),
};

same_shape!(BOOL_MAPPING, Bool, Bool);
same_shape!(VECTOR2_MAPPING, Vector2, Vector2);
same_shape!(VECTOR3_MAPPING, Vector3, Vector3);
same_shape!(VECTOR4_MAPPING, Vector4, Vector4);
same_shape!(QUATERNION_MAPPING, Quaternion, Quaternion);
same_shape!(COLOR_MAPPING, Color, Color);
same_shape!(INT_VECTOR2_MAPPING, IntVector2, IntVector2);
same_shape!(MATRIX3_MAPPING, Matrix3, Matrix3);
same_shape!(MATRIX4_MAPPING, Matrix4, Matrix4);
same_shape!(STRING_MAPPING, String, String);
same_shape!(BUFFER_MAPPING, Buffer, Buffer);

fn integer_mapping(kind: IntegerKind) -> &'static FieldMapping {
    match kind {
        IntegerKind::I8 => &I8_MAPPING,
        IntegerKind::U8 => &U8_MAPPING,
        IntegerKind::I16 => &I16_MAPPING,
        IntegerKind::U16 => &U16_MAPPING,
        IntegerKind::I32 => &I32_MAPPING,
        IntegerKind::U32 => &U32_MAPPING,
        IntegerKind::I64 => &I64_MAPPING,
        IntegerKind::U64 => &U64_MAPPING,
    }
}

/// Conversion for a declared field type, or `None` when it cannot be reflected
pub fn mapping_for(field_type: &FieldType) -> Option<&'static FieldMapping> {
    let mapping = match field_type {
        FieldType::Bool => &BOOL_MAPPING,
        FieldType::Integer(kind) => integer_mapping(*kind),
        FieldType::Enum { underlying, .. } => integer_mapping(*underlying),
        FieldType::F32 => &F32_MAPPING,
        FieldType::F64 => &F64_MAPPING,
        FieldType::Vector2 => &VECTOR2_MAPPING,
        FieldType::Vector3 => &VECTOR3_MAPPING,
        FieldType::Vector4 => &VECTOR4_MAPPING,
        FieldType::Quaternion => &QUATERNION_MAPPING,
        FieldType::Color => &COLOR_MAPPING,
        FieldType::IntVector2 => &INT_VECTOR2_MAPPING,
        FieldType::Matrix3 => &MATRIX3_MAPPING,
        FieldType::Matrix4 => &MATRIX4_MAPPING,
        FieldType::String => &STRING_MAPPING,
        FieldType::Buffer => &BUFFER_MAPPING,
        FieldType::Reference(_) | FieldType::Pointer | FieldType::Unsupported(_) => return None,
    };
    Some(mapping)
}

// ============================================================================
// Registration
// ============================================================================

/// Accessor reading and writing one field of a reflected type
pub struct ReflectedAccessor {
    reflected: Arc<dyn ReflectedType>,
    index: usize,
    mapping: &'static FieldMapping,
}

impl AttributeAccessor for ReflectedAccessor {
    fn get(&self, object: &dyn Object) -> Variant {
        self.reflected
            .get_field(object, self.index)
            .and_then(self.mapping.to_variant)
            .unwrap_or_default()
    }

    fn set(&self, object: &dyn Object, value: &Variant) {
        match (self.mapping.from_variant)(value) {
            Some(field) => {
                self.reflected.set_field(object, self.index, field);
            }
            None => trace!(
                type_name = self.reflected.type_name(),
                index = self.index,
                actual = %value.variant_type(),
                "Ignoring value that does not fit the field"
            ),
        }
    }
}

/// Register attribute descriptors for every reflectable field of a type
///
/// Runs at most once per type: if the type already has attributes nothing
/// is done. `instance` supplies the default values. Returns how many
/// descriptors were registered.
pub fn reflect_attributes(
    registry: &TypeRegistry,
    reflected: &Arc<dyn ReflectedType>,
    instance: &dyn Object,
) -> usize {
    let type_id = reflected.reflected_id();
    if registry.has_attributes(type_id) {
        return 0;
    }

    let mut attributes = Vec::new();
    for (index, field) in reflected.fields().iter().enumerate() {
        if !field.is_reflectable() {
            continue;
        }
        let Some(mapping) = mapping_for(&field.field_type) else {
            trace!(type_name = reflected.type_name(), field = %field.name, "Field type not reflectable");
            continue;
        };

        let accessor = ReflectedAccessor {
            reflected: reflected.clone(),
            index,
            mapping,
        };
        let default_value = accessor.get(instance);
        let mut info = AttributeInfo::new(mapping.variant_type, &field.name, Arc::new(accessor), default_value)
            .with_mode(field.attribute_mode());
        if let FieldType::Enum { names, .. } = &field.field_type {
            info = info.with_enum_names(names.iter().cloned());
        }
        attributes.push(info);
    }

    let count = attributes.len();
    if !registry.register_attributes_once(type_id, attributes) {
        return 0;
    }
    debug!(type_name = reflected.type_name(), type_id = %type_id, count, "Reflected attributes");
    count
}
