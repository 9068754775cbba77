//! Tagged values exchanged through attributes and events

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::hash::StringHash;

/// Variant type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum VariantType {
    None = 0,
    Bool,
    Int,
    Int64,
    Float,
    Double,
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
}

impl fmt::Display for VariantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Dynamically typed value
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Variant {
    #[default]
    None,
    Bool(bool),
    Int(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    Vector2([f32; 2]),
    Vector3([f32; 3]),
    Vector4([f32; 4]),
    /// w, x, y, z
    Quaternion([f32; 4]),
    /// r, g, b, a
    Color([f32; 4]),
    IntVector2([i32; 2]),
    /// Row-major
    Matrix3([f32; 9]),
    /// Row-major
    Matrix4([f32; 16]),
    String(String),
    Buffer(Vec<u8>),
}

impl Variant {
    /// Tag of the held value
    pub fn variant_type(&self) -> VariantType {
        match self {
            Variant::None => VariantType::None,
            Variant::Bool(_) => VariantType::Bool,
            Variant::Int(_) => VariantType::Int,
            Variant::Int64(_) => VariantType::Int64,
            Variant::Float(_) => VariantType::Float,
            Variant::Double(_) => VariantType::Double,
            Variant::Vector2(_) => VariantType::Vector2,
            Variant::Vector3(_) => VariantType::Vector3,
            Variant::Vector4(_) => VariantType::Vector4,
            Variant::Quaternion(_) => VariantType::Quaternion,
            Variant::Color(_) => VariantType::Color,
            Variant::IntVector2(_) => VariantType::IntVector2,
            Variant::Matrix3(_) => VariantType::Matrix3,
            Variant::Matrix4(_) => VariantType::Matrix4,
            Variant::String(_) => VariantType::String,
            Variant::Buffer(_) => VariantType::Buffer,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Variant::None)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Variant::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer value, widening `Int` and narrowing `Int64` when it fits
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Variant::Int(v) => Some(i64::from(*v)),
            Variant::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        self.as_i64().and_then(|v| i32::try_from(v).ok())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Variant::Float(v) => Some(f64::from(*v)),
            Variant::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        self.as_f64().map(|v| v as f32)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Variant::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_buffer(&self) -> Option<&[u8]> {
        match self {
            Variant::Buffer(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for Variant {
    fn from(v: bool) -> Self {
        Variant::Bool(v)
    }
}

impl From<i32> for Variant {
    fn from(v: i32) -> Self {
        Variant::Int(v)
    }
}

impl From<i64> for Variant {
    fn from(v: i64) -> Self {
        Variant::Int64(v)
    }
}

impl From<f32> for Variant {
    fn from(v: f32) -> Self {
        Variant::Float(v)
    }
}

impl From<f64> for Variant {
    fn from(v: f64) -> Self {
        Variant::Double(v)
    }
}

impl From<&str> for Variant {
    fn from(v: &str) -> Self {
        Variant::String(v.to_string())
    }
}

impl From<String> for Variant {
    fn from(v: String) -> Self {
        Variant::String(v)
    }
}

impl From<Vec<u8>> for Variant {
    fn from(v: Vec<u8>) -> Self {
        Variant::Buffer(v)
    }
}

/// Event payload and generic key/value bag
pub type VariantMap = HashMap<StringHash, Variant>;
