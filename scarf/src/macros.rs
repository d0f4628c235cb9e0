macro_rules! dyn_match {
    ($scalar:expr, $enum:ident, $inner_macro:ident) => {
        match $scalar {
            $enum::Bool => $inner_macro!(bool),
            $enum::I64 => $inner_macro!(i64),
            $enum::U32 => $inner_macro!(u32),
            $enum::F32 => $inner_macro!(f32),
            $enum::F64 => $inner_macro!(f64),
            $enum::String => $inner_macro!(String),
        }
    };
}

macro_rules! dyn_map {
    ($value:expr, $enum:ident, $inner_macro:ident) => {
        match $value {
            $enum::Bool(_val) => $inner_macro!(Bool, bool, _val),
            $enum::I64(_val) => $inner_macro!(I64, i64, _val),
            $enum::U32(_val) => $inner_macro!(U32, u32, _val),
            $enum::F32(_val) => $inner_macro!(F32, f32, _val),
            $enum::F64(_val) => $inner_macro!(F64, f64, _val),
            $enum::String(_val) => $inner_macro!(String, String, _val),
        }
    };
}

macro_rules! dyn_map_fun {
    ($value:expr, $enum:ident, $fun:ident $(, $arg:expr)*) => {
        match $value {
            $enum::Bool(_val) => _val.$fun($($arg),*),
            $enum::I64(_val) => _val.$fun($($arg),*),
            $enum::U32(_val) => _val.$fun($($arg),*),
            $enum::F32(_val) => _val.$fun($($arg),*),
            $enum::F64(_val) => _val.$fun($($arg),*),
            $enum::String(_val) => _val.$fun($($arg),*),
        }
    };
}

pub(crate) use {dyn_map, dyn_map_fun, dyn_match};
