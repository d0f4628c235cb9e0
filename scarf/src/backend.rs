mod datatype;
pub use datatype::{BackendData, ScalarType};

use crate::data::{Column, DynArray, Shape};

use anyhow::{bail, Result};
use ndarray::{ArrayD, ArrayView, ArrayViewD, Dimension};
use std::ops::Range;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct WriteConfig {
    /// Compression level, `None` disables compression.
    pub compression: Option<u8>,
    pub block_size: Option<Shape>,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            compression: Some(1),
            block_size: None,
        }
    }
}

impl WriteConfig {
    /// The chunk shape used for an array of the given shape.
    pub fn chunk_shape(&self, shape: &Shape) -> Shape {
        let chunks: Shape = match &self.block_size {
            Some(s) => s.clone(),
            None if shape.ndim() == 1 => shape[0].min(10000).into(),
            None => shape.as_ref().iter().map(|&x| x.min(1000)).collect(),
        };
        chunks.as_ref().iter().map(|&x| x.max(1)).collect()
    }
}

/// Attribute values attached to groups and datasets.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Str(String),
    StrList(Vec<String>),
}

pub trait Backend: 'static {
    /// The name of the backend.
    const NAME: &'static str;

    /// Data store, the root group of the hierarchy.
    type Store: StoreOp<Self> + GroupOp<Self> + AttributeOp<Self> + Send + Sync;

    /// Groups work like directories and can contain groups or datasets.
    type Group: GroupOp<Self> + AttributeOp<Self> + Send + Sync;

    /// Datasets store multi-dimensional arrays.
    type Dataset: DatasetOp<Self> + AttributeOp<Self> + Send + Sync;

    /// Create a new store at the given path. The path must not exist.
    fn create<P: AsRef<Path>>(path: P) -> Result<Self::Store>;

    /// Opens an existing store.
    fn open<P: AsRef<Path>>(path: P) -> Result<Self::Store>;

    /// Check whether a store exists at the given path.
    fn exists<P: AsRef<Path>>(path: P) -> bool;

    /// Remove the store at the given path and everything in it.
    fn remove<P: AsRef<Path>>(path: P) -> Result<()>;
}

pub trait StoreOp<B: Backend + ?Sized> {
    /// Returns the store path.
    fn filename(&self) -> PathBuf;
}

pub trait GroupOp<B: Backend + ?Sized> {
    /// List all groups and datasets in this group.
    fn list(&self) -> Result<Vec<String>>;

    /// Create a new group.
    fn create_group(&self, name: &str) -> Result<B::Group>;

    /// Open an existing group.
    fn open_group(&self, name: &str) -> Result<B::Group>;

    /// Create an empty dataset. Unwritten elements read as the fill value.
    fn new_dataset<T: BackendData>(
        &self,
        name: &str,
        shape: &Shape,
        config: WriteConfig,
    ) -> Result<B::Dataset>;

    fn open_dataset(&self, name: &str) -> Result<B::Dataset>;

    /// Delete a group or dataset.
    fn delete(&self, name: &str) -> Result<()>;

    /// Check if a group or dataset exists.
    fn exists(&self, name: &str) -> Result<bool>;

    /// Check if `name` is a group.
    fn is_group(&self, name: &str) -> Result<bool>;

    fn new_array_dataset<T, D>(
        &self,
        name: &str,
        arr: ArrayView<'_, T, D>,
        config: WriteConfig,
    ) -> Result<B::Dataset>
    where
        T: BackendData,
        D: Dimension,
    {
        let shape: Shape = arr.shape().into();
        let compression = if arr.len() > 100 {
            config.compression
        } else {
            None
        };
        let new_config = WriteConfig {
            compression,
            block_size: Some(config.chunk_shape(&shape)),
        };
        let dataset = self.new_dataset::<T>(name, &shape, new_config)?;
        dataset.write_array(arr.into_dyn())?;
        Ok(dataset)
    }

    /// Write a column as a one-dimensional dataset, replacing any existing one.
    fn write_column(&self, name: &str, column: &Column, config: WriteConfig) -> Result<B::Dataset> {
        if self.exists(name)? {
            self.delete(name)?;
        }
        macro_rules! fun {
            ($variant:ident, $ty:ty, $value:expr) => {
                self.new_array_dataset(name, ndarray::ArrayView1::from($value.as_slice()), config)
            };
        }
        crate::macros::dyn_map!(column, Column, fun)
    }

    fn read_column(&self, name: &str) -> Result<Column> {
        self.open_dataset(name)?.read_dyn_array()?.try_into()
    }
}

pub trait AttributeOp<B: Backend + ?Sized> {
    /// Returns the path of the location relative to the store root.
    fn path(&self) -> PathBuf;

    /// Write an attribute, replacing any existing value.
    fn write_attr(&self, name: &str, value: AttrValue) -> Result<()>;

    /// Read an attribute, `None` if it is absent.
    fn read_attr(&self, name: &str) -> Result<Option<AttrValue>>;

    fn write_str_attr(&self, name: &str, value: &str) -> Result<()> {
        self.write_attr(name, AttrValue::Str(value.to_string()))
    }

    fn read_str_attr(&self, name: &str) -> Result<String> {
        match self.read_attr(name)? {
            Some(AttrValue::Str(x)) => Ok(x),
            Some(x) => bail!("attribute '{}' is not a string: {:?}", name, x),
            None => bail!("attribute '{}' not found in '{}'", name, self.path().display()),
        }
    }

    fn write_str_list_attr(&self, name: &str, value: &[String]) -> Result<()> {
        self.write_attr(name, AttrValue::StrList(value.to_vec()))
    }

    fn read_str_list_attr(&self, name: &str) -> Result<Vec<String>> {
        match self.read_attr(name)? {
            Some(AttrValue::StrList(x)) => Ok(x),
            Some(x) => bail!("attribute '{}' is not a list of strings: {:?}", name, x),
            None => bail!("attribute '{}' not found in '{}'", name, self.path().display()),
        }
    }

    /// Missing boolean attributes read as `false`.
    fn read_bool_attr(&self, name: &str) -> Result<bool> {
        match self.read_attr(name)? {
            Some(AttrValue::Bool(x)) => Ok(x),
            Some(x) => bail!("attribute '{}' is not a boolean: {:?}", name, x),
            None => Ok(false),
        }
    }
}

pub trait DatasetOp<B: Backend + ?Sized> {
    fn dtype(&self) -> Result<ScalarType>;
    fn shape(&self) -> Shape;
    fn chunk_shape(&self) -> Shape;

    /// Read the elements covered by one range per axis.
    fn read_dyn_array_slice(&self, selection: &[Range<usize>]) -> Result<DynArray>;

    /// Write `arr` with its first element placed at `offset`.
    fn write_array_slice<T: BackendData>(
        &self,
        arr: ArrayViewD<'_, T>,
        offset: &[usize],
    ) -> Result<()>;

    fn read_array_slice<T: BackendData>(&self, selection: &[Range<usize>]) -> Result<ArrayD<T>> {
        T::from_dyn_arr(self.read_dyn_array_slice(selection)?)
    }

    fn read_array<T: BackendData>(&self) -> Result<ArrayD<T>> {
        self.read_array_slice(&self.shape().full_selection())
    }

    fn read_dyn_array(&self) -> Result<DynArray> {
        self.read_dyn_array_slice(&self.shape().full_selection())
    }

    fn write_array<T: BackendData>(&self, arr: ArrayViewD<'_, T>) -> Result<()> {
        let offset = vec![0; arr.ndim()];
        self.write_array_slice(arr, &offset)
    }

    /// Read rows `range` of a two-dimensional dataset.
    fn read_rows<T: BackendData>(&self, range: Range<usize>) -> Result<ArrayD<T>> {
        let shape = self.shape();
        if shape.ndim() != 2 {
            bail!("expecting a 2-dimensional dataset, found shape {}", shape);
        }
        let selection = [range, 0..shape[1]];
        self.read_array_slice(&selection)
    }
}

/// Validate a group or dataset name.
pub fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.starts_with('.') {
        bail!("invalid name '{}': names must be non-empty, without '/' and not start with '.'", name);
    }
    Ok(())
}

