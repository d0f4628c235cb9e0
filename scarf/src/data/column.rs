use crate::backend::{BackendData, ScalarType};
use crate::data::{DynArray, DynScalar};

use anyhow::{bail, ensure, Result};
use ndarray::Ix1;
use polars::prelude::{DataType, NamedFrom, Series};

/// A single column of an attribute table.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Bool(Vec<bool>),
    I64(Vec<i64>),
    U32(Vec<u32>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    String(Vec<String>),
}

impl<T: BackendData> From<Vec<T>> for Column {
    fn from(x: Vec<T>) -> Self {
        T::into_column(x)
    }
}

impl Column {
    pub fn dtype(&self) -> ScalarType {
        match self {
            Column::Bool(_) => ScalarType::Bool,
            Column::I64(_) => ScalarType::I64,
            Column::U32(_) => ScalarType::U32,
            Column::F32(_) => ScalarType::F32,
            Column::F64(_) => ScalarType::F64,
            Column::String(_) => ScalarType::String,
        }
    }

    pub fn len(&self) -> usize {
        crate::macros::dyn_map_fun!(self, Column, len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, i: usize) -> Option<DynScalar> {
        macro_rules! fun {
            ($variant:ident, $ty:ty, $value:expr) => {
                $value.get(i).map(|x| x.into_dyn())
            };
        }
        crate::macros::dyn_map!(self, Column, fun)
    }

    pub fn into_vec<T: BackendData>(self) -> Result<Vec<T>> {
        T::from_column(self)
    }

    /// A column of length `n` holding `fill` everywhere.
    pub fn filled(dtype: ScalarType, n: usize, fill: DynScalar) -> Result<Self> {
        macro_rules! fun {
            ($ty:ty) => {{
                let fill = <$ty>::from_dyn(fill)?;
                Column::from(vec![fill; n])
            }};
        }
        Ok(crate::macros::dyn_match!(dtype, ScalarType, fun))
    }

    /// Rows at the given positions, in the given order.
    pub fn take(&self, index: &[usize]) -> Self {
        macro_rules! fun {
            ($variant:ident, $ty:ty, $value:expr) => {
                Column::$variant(index.iter().map(|&i| $value[i].clone()).collect())
            };
        }
        crate::macros::dyn_map!(self, Column, fun)
    }

    /// Spread the values of this column over a column of length `n`, placing the
    /// k-th value at row `index[k]`. Other rows receive `fill`.
    pub fn scatter(&self, n: usize, index: &[usize], fill: DynScalar) -> Result<Self> {
        ensure!(
            index.len() == self.len(),
            "cannot scatter {} values into {} positions",
            self.len(),
            index.len()
        );
        macro_rules! fun {
            ($variant:ident, $ty:ty, $value:expr) => {{
                let fill = <$ty>::from_dyn(fill)?;
                let mut out: Vec<$ty> = vec![fill; n];
                for (&i, v) in index.iter().zip($value.iter()) {
                    ensure!(i < n, "index {} out of bounds for length {}", i, n);
                    out[i] = v.clone();
                }
                Column::$variant(out)
            }};
        }
        Ok(crate::macros::dyn_map!(self, Column, fun))
    }

    /// Concatenate columns of the same type.
    pub fn concat<I: IntoIterator<Item = Column>>(columns: I) -> Result<Self> {
        let mut iter = columns.into_iter();
        let mut acc = match iter.next() {
            Some(x) => x,
            None => bail!("cannot concatenate an empty list of columns"),
        };
        for col in iter {
            macro_rules! fun {
                ($variant:ident, $ty:ty, $value:expr) => {{
                    let other = <$ty>::from_column(col)?;
                    $value.extend(other);
                }};
            }
            crate::macros::dyn_map!(&mut acc, Column, fun)
        }
        Ok(acc)
    }

    pub fn to_f64(&self) -> Result<Vec<f64>> {
        let values = match self {
            Column::Bool(x) => x.iter().map(|&v| if v { 1.0 } else { 0.0 }).collect(),
            Column::I64(x) => x.iter().map(|&v| v as f64).collect(),
            Column::U32(x) => x.iter().map(|&v| v as f64).collect(),
            Column::F32(x) => x.iter().map(|&v| v as f64).collect(),
            Column::F64(x) => x.clone(),
            Column::String(_) => bail!("cannot convert a string column to numbers"),
        };
        Ok(values)
    }

    pub fn to_series(&self, name: &str) -> Series {
        match self {
            Column::Bool(x) => Series::new(name, x.as_slice()),
            Column::I64(x) => Series::new(name, x.as_slice()),
            Column::U32(x) => Series::new(name, x.as_slice()),
            Column::F32(x) => Series::new(name, x.as_slice()),
            Column::F64(x) => Series::new(name, x.as_slice()),
            Column::String(x) => Series::new(name, x.as_slice()),
        }
    }
}

impl TryFrom<DynArray> for Column {
    type Error = anyhow::Error;

    fn try_from(arr: DynArray) -> Result<Self> {
        macro_rules! fun {
            ($variant:ident, $ty:ty, $value:expr) => {
                Column::$variant($value.into_dimensionality::<Ix1>()?.to_vec())
            };
        }
        Ok(crate::macros::dyn_map!(arr, DynArray, fun))
    }
}

/// Missing values are replaced by the default fill of the column type.
impl TryFrom<&Series> for Column {
    type Error = anyhow::Error;

    fn try_from(series: &Series) -> Result<Self> {
        let column = match series.dtype() {
            DataType::Boolean => {
                Column::Bool(series.bool()?.into_iter().map(|x| x.unwrap_or(false)).collect())
            }
            DataType::UInt32 => {
                Column::U32(series.u32()?.into_iter().map(|x| x.unwrap_or(0)).collect())
            }
            DataType::Float32 => Column::F32(
                series
                    .f32()?
                    .into_iter()
                    .map(|x| x.unwrap_or(f32::NAN))
                    .collect(),
            ),
            DataType::Float64 => Column::F64(
                series
                    .f64()?
                    .into_iter()
                    .map(|x| x.unwrap_or(f64::NAN))
                    .collect(),
            ),
            DataType::String => Column::String(
                series
                    .str()?
                    .into_iter()
                    .map(|x| x.unwrap_or("NA").to_string())
                    .collect(),
            ),
            DataType::Categorical(_, _) => {
                let series = series.cast(&DataType::String)?;
                Column::try_from(&series)?
            }
            dtype if dtype.is_integer() => {
                let series = series.cast(&DataType::Int64)?;
                Column::I64(series.i64()?.into_iter().map(|x| x.unwrap_or(0)).collect())
            }
            dtype => bail!("Unsupported column type '{}'", dtype),
        };
        Ok(column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scatter() {
        let col = Column::from(vec![1.0f64, 2.0]);
        let out = col.scatter(4, &[3, 1], DynScalar::F64(-1.0)).unwrap();
        assert_eq!(out, Column::F64(vec![-1.0, 2.0, -1.0, 1.0]));

        assert!(col.scatter(4, &[0], DynScalar::F64(0.0)).is_err());
        assert!(col.scatter(4, &[0, 7], DynScalar::F64(0.0)).is_err());
        assert!(col
            .scatter(4, &[0, 1], DynScalar::String("x".to_string()))
            .is_err());
    }

    #[test]
    fn test_concat() {
        let a = Column::from(vec!["a".to_string()]);
        let b = Column::from(vec!["b".to_string(), "c".to_string()]);
        assert_eq!(
            Column::concat([a.clone(), b]).unwrap(),
            Column::String(vec!["a".into(), "b".into(), "c".into()])
        );
        assert!(Column::concat([a, Column::from(vec![true])]).is_err());
        assert!(Column::concat(Vec::new()).is_err());
    }

    #[test]
    fn test_take_and_filled() {
        let col = Column::from(vec![10i64, 20, 30]);
        assert_eq!(col.take(&[2, 0, 2]), Column::I64(vec![30, 10, 30]));
        let filled = Column::filled(ScalarType::F64, 2, DynScalar::I64(3)).unwrap();
        assert_eq!(filled, Column::F64(vec![3.0, 3.0]));
    }

    #[test]
    fn test_series() {
        let col = Column::from(vec![true, false]);
        let series = col.to_series("flag");
        assert_eq!(series.name(), "flag");
        assert_eq!(Column::try_from(&series).unwrap(), col);

        let ints = Series::new("x", &[1i32, 2, 3]);
        assert_eq!(Column::try_from(&ints).unwrap(), Column::I64(vec![1, 2, 3]));
    }
}
