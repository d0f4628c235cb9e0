use crate::data::{Column, DynArray, DynArrayView, DynScalar};

use anyhow::{bail, Result};
use core::fmt::{Display, Formatter};
use ndarray::{ArrayD, ArrayViewD};
use std::str::FromStr;

/// All scalar types that can be stored in a scarf store.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ScalarType {
    Bool,
    I64,
    U32,
    F32,
    F64,
    String,
}

impl ScalarType {
    pub fn is_numeric(&self) -> bool {
        !matches!(self, ScalarType::Bool | ScalarType::String)
    }
}

impl Display for ScalarType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ScalarType::Bool => write!(f, "bool"),
            ScalarType::I64 => write!(f, "i64"),
            ScalarType::U32 => write!(f, "u32"),
            ScalarType::F32 => write!(f, "f32"),
            ScalarType::F64 => write!(f, "f64"),
            ScalarType::String => write!(f, "string"),
        }
    }
}

impl FromStr for ScalarType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let ty = match s {
            "bool" => ScalarType::Bool,
            "i64" => ScalarType::I64,
            "u32" => ScalarType::U32,
            "f32" => ScalarType::F32,
            "f64" => ScalarType::F64,
            "string" => ScalarType::String,
            x => bail!("Unsupported scalar type '{}'", x),
        };
        Ok(ty)
    }
}

pub trait BackendData: Send + Sync + Clone + 'static {
    const DTYPE: ScalarType;
    fn into_dyn(&self) -> DynScalar;
    fn from_dyn(x: DynScalar) -> Result<Self>;
    fn into_dyn_arr(arr: ArrayViewD<'_, Self>) -> DynArrayView<'_>;
    fn from_dyn_arr(x: DynArray) -> Result<ArrayD<Self>>;
    fn into_column(x: Vec<Self>) -> Column;
    fn from_column(x: Column) -> Result<Vec<Self>>;
}

macro_rules! impl_backend_data {
    ($ty:ty, $variant:ident, $from_scalar:expr) => {
        impl BackendData for $ty {
            const DTYPE: ScalarType = ScalarType::$variant;

            fn into_dyn(&self) -> DynScalar {
                DynScalar::$variant(self.clone())
            }

            fn from_dyn(x: DynScalar) -> Result<Self> {
                let convert: fn(DynScalar) -> Option<$ty> = $from_scalar;
                match convert(x.clone()) {
                    Some(v) => Ok(v),
                    None => bail!("Expecting {}, found {}", ScalarType::$variant, x.dtype()),
                }
            }

            fn into_dyn_arr(arr: ArrayViewD<'_, Self>) -> DynArrayView<'_> {
                DynArrayView::$variant(arr)
            }

            fn from_dyn_arr(x: DynArray) -> Result<ArrayD<Self>> {
                if let DynArray::$variant(x) = x {
                    Ok(x)
                } else {
                    bail!("Expecting {} array, found {}", ScalarType::$variant, x.dtype())
                }
            }

            fn into_column(x: Vec<Self>) -> Column {
                Column::$variant(x)
            }

            fn from_column(x: Column) -> Result<Vec<Self>> {
                if let Column::$variant(x) = x {
                    Ok(x)
                } else {
                    bail!("Expecting {} column, found {}", ScalarType::$variant, x.dtype())
                }
            }
        }
    };
}

impl_backend_data!(bool, Bool, |x| match x {
    DynScalar::Bool(v) => Some(v),
    _ => None,
});
impl_backend_data!(i64, I64, |x| match x {
    DynScalar::String(_) | DynScalar::Bool(_) => None,
    x => x.as_f64().map(|v| v as i64),
});
impl_backend_data!(u32, U32, |x| match x {
    DynScalar::String(_) | DynScalar::Bool(_) => None,
    x => x.as_f64().map(|v| v as u32),
});
impl_backend_data!(f32, F32, |x| match x {
    DynScalar::String(_) | DynScalar::Bool(_) => None,
    x => x.as_f64().map(|v| v as f32),
});
impl_backend_data!(f64, F64, |x| match x {
    DynScalar::String(_) | DynScalar::Bool(_) => None,
    x => x.as_f64(),
});
impl_backend_data!(String, String, |x| match x {
    DynScalar::String(v) => Some(v),
    _ => None,
});
