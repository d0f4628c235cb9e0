use crate::backend::ScalarType;

use ndarray::{ArrayD, ArrayViewD};

/// An n-dimensional array whose element type is only known at runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum DynArray {
    Bool(ArrayD<bool>),
    I64(ArrayD<i64>),
    U32(ArrayD<u32>),
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
    String(ArrayD<String>),
}

/// Borrowed counterpart of [`DynArray`], used when handing data to a backend.
#[derive(Debug, Clone)]
pub enum DynArrayView<'a> {
    Bool(ArrayViewD<'a, bool>),
    I64(ArrayViewD<'a, i64>),
    U32(ArrayViewD<'a, u32>),
    F32(ArrayViewD<'a, f32>),
    F64(ArrayViewD<'a, f64>),
    String(ArrayViewD<'a, String>),
}

impl DynArray {
    pub fn dtype(&self) -> ScalarType {
        match self {
            DynArray::Bool(_) => ScalarType::Bool,
            DynArray::I64(_) => ScalarType::I64,
            DynArray::U32(_) => ScalarType::U32,
            DynArray::F32(_) => ScalarType::F32,
            DynArray::F64(_) => ScalarType::F64,
            DynArray::String(_) => ScalarType::String,
        }
    }
}

macro_rules! impl_from_array {
    ($variant:ident, $ty:ty) => {
        impl From<ArrayD<$ty>> for DynArray {
            fn from(arr: ArrayD<$ty>) -> Self {
                DynArray::$variant(arr)
            }
        }

        impl<'a> From<ArrayViewD<'a, $ty>> for DynArrayView<'a> {
            fn from(arr: ArrayViewD<'a, $ty>) -> Self {
                DynArrayView::$variant(arr)
            }
        }
    };
}

impl_from_array!(Bool, bool);
impl_from_array!(I64, i64);
impl_from_array!(U32, u32);
impl_from_array!(F32, f32);
impl_from_array!(F64, f64);
impl_from_array!(String, String);
