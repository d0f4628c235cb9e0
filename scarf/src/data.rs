mod array;
mod column;
mod scalar;
mod shape;

pub use array::{DynArray, DynArrayView};
pub use column::Column;
pub use scalar::DynScalar;
pub use shape::Shape;
