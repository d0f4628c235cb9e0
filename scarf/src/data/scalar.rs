use crate::backend::ScalarType;

use std::fmt::{Display, Formatter};

/// A single value of any supported element type.
#[derive(Debug, Clone, PartialEq)]
pub enum DynScalar {
    Bool(bool),
    I64(i64),
    U32(u32),
    F32(f32),
    F64(f64),
    String(String),
}

impl DynScalar {
    pub fn dtype(&self) -> ScalarType {
        match self {
            DynScalar::Bool(_) => ScalarType::Bool,
            DynScalar::I64(_) => ScalarType::I64,
            DynScalar::U32(_) => ScalarType::U32,
            DynScalar::F32(_) => ScalarType::F32,
            DynScalar::F64(_) => ScalarType::F64,
            DynScalar::String(_) => ScalarType::String,
        }
    }

    /// The value used for rows that a partial insertion does not cover.
    pub fn default_fill(dtype: ScalarType) -> Self {
        match dtype {
            ScalarType::Bool => DynScalar::Bool(false),
            ScalarType::I64 => DynScalar::I64(0),
            ScalarType::U32 => DynScalar::U32(0),
            ScalarType::F32 => DynScalar::F32(f32::NAN),
            ScalarType::F64 => DynScalar::F64(f64::NAN),
            ScalarType::String => DynScalar::String("NA".to_string()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DynScalar::Bool(x) => Some(if *x { 1.0 } else { 0.0 }),
            DynScalar::I64(x) => Some(*x as f64),
            DynScalar::U32(x) => Some(*x as f64),
            DynScalar::F32(x) => Some(*x as f64),
            DynScalar::F64(x) => Some(*x),
            DynScalar::String(_) => None,
        }
    }
}

impl Display for DynScalar {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DynScalar::Bool(x) => write!(f, "{}", x),
            DynScalar::I64(x) => write!(f, "{}", x),
            DynScalar::U32(x) => write!(f, "{}", x),
            DynScalar::F32(x) => write!(f, "{}", x),
            DynScalar::F64(x) => write!(f, "{}", x),
            DynScalar::String(x) => write!(f, "{}", x),
        }
    }
}

impl From<bool> for DynScalar {
    fn from(x: bool) -> Self {
        DynScalar::Bool(x)
    }
}

impl From<i64> for DynScalar {
    fn from(x: i64) -> Self {
        DynScalar::I64(x)
    }
}

impl From<u32> for DynScalar {
    fn from(x: u32) -> Self {
        DynScalar::U32(x)
    }
}

impl From<f32> for DynScalar {
    fn from(x: f32) -> Self {
        DynScalar::F32(x)
    }
}

impl From<f64> for DynScalar {
    fn from(x: f64) -> Self {
        DynScalar::F64(x)
    }
}

impl From<String> for DynScalar {
    fn from(x: String) -> Self {
        DynScalar::String(x)
    }
}

impl From<&str> for DynScalar {
    fn from(x: &str) -> Self {
        DynScalar::String(x.to_string())
    }
}
