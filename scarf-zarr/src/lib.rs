use scarf::backend::*;
use scarf::data::{DynArray, DynArrayView, Shape};

use anyhow::{anyhow, bail, ensure, Result};
use log::debug;
use ndarray::{ArrayD, ArrayViewD, IxDyn};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zarrs::array::chunk_grid::RegularChunkGrid;
use zarrs::array::codec::{BytesToBytesCodecTraits, GzipCodec};
use zarrs::array::{Array, ArrayBuilder, ChunkGrid, ChunkShape, DataType, Element, ElementOwned, FillValue};
use zarrs::array_subset::ArraySubset;
use zarrs::filesystem::FilesystemStore;
use zarrs::group::{Group, GroupBuilder};
use zarrs::storage::{ListableStorageTraits, StorePrefix, WritableStorageTraits};

/// Metadata document of every group and array.
const NODE_META: &str = "zarr.json";

/// Attribute updates rewrite the whole node metadata document.
static ATTR_LOCK: Mutex<()> = Mutex::new(());

/// The Zarr backend, storing the hierarchy as nested directories.
pub struct Zarr;

pub struct ZarrStore(ZarrGroup);

pub struct ZarrGroup(Node);

pub struct ZarrDataset {
    node: Node,
    dataset: Array<FilesystemStore>,
}

/// A group or array in a filesystem store. `path` is relative to the root,
/// empty for the root itself.
#[derive(Clone)]
struct Node {
    store: Arc<FilesystemStore>,
    root: Arc<PathBuf>,
    path: String,
}

impl Node {
    fn new(root: &Path) -> Result<Self> {
        Ok(Self {
            store: Arc::new(FilesystemStore::new(root)?),
            root: Arc::new(root.to_path_buf()),
            path: String::new(),
        })
    }

    /// The absolute node path used by `zarrs`.
    fn node_path(&self) -> String {
        format!("/{}", self.path)
    }

    fn prefix(&self) -> Result<StorePrefix> {
        if self.path.is_empty() {
            Ok(StorePrefix::root())
        } else {
            Ok(StorePrefix::new(format!("{}/", self.path))?)
        }
    }

    fn child(&self, name: &str) -> Result<Node> {
        check_name(name)?;
        let path = if self.path.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.path, name)
        };
        Ok(Node {
            store: self.store.clone(),
            root: self.root.clone(),
            path,
        })
    }

    fn exists(&self) -> bool {
        self.root.join(&self.path).join(NODE_META).is_file()
    }

    fn is_array(&self) -> bool {
        self.exists() && Array::open(self.store.clone(), &self.node_path()).is_ok()
    }

    fn is_group(&self) -> bool {
        self.exists() && !self.is_array()
    }

    fn open_group(&self) -> Result<Group<FilesystemStore>> {
        Ok(Group::open(self.store.clone(), &self.node_path())?)
    }

    fn open_array(&self) -> Result<Array<FilesystemStore>> {
        Ok(Array::open(self.store.clone(), &self.node_path())?)
    }

    fn display(&self) -> String {
        self.node_path()
    }
}

impl Backend for Zarr {
    const NAME: &'static str = "zarr";

    type Store = ZarrStore;

    type Group = ZarrGroup;

    type Dataset = ZarrDataset;

    fn create<P: AsRef<Path>>(path: P) -> Result<Self::Store> {
        let path = path.as_ref();
        ensure!(!path.exists(), "'{}' already exists", path.display());
        fs::create_dir_all(path)?;
        let node = Node::new(path)?;
        GroupBuilder::new()
            .build(node.store.clone(), &node.node_path())?
            .store_metadata()?;
        debug!("created Zarr store at '{}'", path.display());
        Ok(ZarrStore(ZarrGroup(node)))
    }

    fn open<P: AsRef<Path>>(path: P) -> Result<Self::Store> {
        let path = path.as_ref();
        ensure!(
            path.join(NODE_META).is_file(),
            "'{}' is not a Zarr store",
            path.display()
        );
        let node = Node::new(path)?;
        ensure!(node.is_group(), "'{}' is not a Zarr group", path.display());
        Ok(ZarrStore(ZarrGroup(node)))
    }

    fn exists<P: AsRef<Path>>(path: P) -> bool {
        path.as_ref().exists()
    }

    fn remove<P: AsRef<Path>>(path: P) -> Result<()> {
        let path = path.as_ref();
        if path.is_dir() {
            debug!("removing Zarr store at '{}'", path.display());
            fs::remove_dir_all(path)?;
        } else if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

impl StoreOp<Zarr> for ZarrStore {
    fn filename(&self) -> PathBuf {
        self.0 .0.root.as_ref().clone()
    }
}

impl GroupOp<Zarr> for ZarrStore {
    fn list(&self) -> Result<Vec<String>> {
        self.0.list()
    }
    fn create_group(&self, name: &str) -> Result<ZarrGroup> {
        self.0.create_group(name)
    }
    fn open_group(&self, name: &str) -> Result<ZarrGroup> {
        self.0.open_group(name)
    }
    fn new_dataset<T: BackendData>(
        &self,
        name: &str,
        shape: &Shape,
        config: WriteConfig,
    ) -> Result<ZarrDataset> {
        self.0.new_dataset::<T>(name, shape, config)
    }
    fn open_dataset(&self, name: &str) -> Result<ZarrDataset> {
        self.0.open_dataset(name)
    }
    fn delete(&self, name: &str) -> Result<()> {
        self.0.delete(name)
    }
    fn exists(&self, name: &str) -> Result<bool> {
        self.0.exists(name)
    }
    fn is_group(&self, name: &str) -> Result<bool> {
        self.0.is_group(name)
    }
}

impl AttributeOp<Zarr> for ZarrStore {
    fn path(&self) -> PathBuf {
        self.0.path()
    }
    fn write_attr(&self, name: &str, value: AttrValue) -> Result<()> {
        self.0.write_attr(name, value)
    }
    fn read_attr(&self, name: &str) -> Result<Option<AttrValue>> {
        self.0.read_attr(name)
    }
}

impl GroupOp<Zarr> for ZarrGroup {
    fn list(&self) -> Result<Vec<String>> {
        let listing = self.0.store.list_dir(&self.0.prefix()?)?;
        let mut names = Vec::new();
        for prefix in listing.prefixes() {
            let name = prefix
                .as_str()
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or_default();
            if name.is_empty() || name.starts_with('.') {
                continue;
            }
            if self.0.child(name)?.exists() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn create_group(&self, name: &str) -> Result<ZarrGroup> {
        let node = self.0.child(name)?;
        ensure!(
            !node.exists(),
            "cannot create group '{}': it already exists",
            node.display()
        );
        GroupBuilder::new()
            .build(node.store.clone(), &node.node_path())?
            .store_metadata()?;
        Ok(ZarrGroup(node))
    }

    fn open_group(&self, name: &str) -> Result<ZarrGroup> {
        let node = self.0.child(name)?;
        ensure!(node.is_group(), "group '{}' does not exist", node.display());
        Ok(ZarrGroup(node))
    }

    fn new_dataset<T: BackendData>(
        &self,
        name: &str,
        shape: &Shape,
        config: WriteConfig,
    ) -> Result<ZarrDataset> {
        let node = self.0.child(name)?;
        ensure!(
            !node.exists(),
            "cannot create dataset '{}': it already exists",
            node.display()
        );
        let chunks = config.chunk_shape(shape);
        ensure!(
            chunks.ndim() == shape.ndim(),
            "chunk shape {} does not match array shape {}",
            chunks,
            shape
        );
        let chunk_shape: ChunkShape = chunks
            .as_ref()
            .iter()
            .map(|&x| x as u64)
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow!("invalid chunk shape {}", chunks))?;
        let chunk_grid = ChunkGrid::new(RegularChunkGrid::new(chunk_shape));
        let (data_type, fill) = data_type_of(T::DTYPE);

        let mut builder = ArrayBuilder::new(
            shape.as_ref().iter().map(|&x| x as u64).collect(),
            data_type,
            chunk_grid,
            fill,
        );
        if let Some(level) = config.compression {
            let gzip: Arc<dyn BytesToBytesCodecTraits> =
                Arc::new(GzipCodec::new(level.min(9) as u32)?);
            builder.bytes_to_bytes_codecs(vec![gzip]);
        }
        let dataset = builder.build(node.store.clone(), &node.node_path())?;
        dataset.store_metadata()?;
        Ok(ZarrDataset { node, dataset })
    }

    fn open_dataset(&self, name: &str) -> Result<ZarrDataset> {
        let node = self.0.child(name)?;
        ensure!(node.exists(), "dataset '{}' does not exist", node.display());
        let dataset = node.open_array()?;
        Ok(ZarrDataset { node, dataset })
    }

    fn delete(&self, name: &str) -> Result<()> {
        let node = self.0.child(name)?;
        ensure!(
            node.exists(),
            "cannot delete '{}': no such group or dataset",
            node.display()
        );
        debug!("deleting '{}'", node.display());
        node.store.erase_prefix(&node.prefix()?)?;
        Ok(())
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.0.child(name)?.exists())
    }

    fn is_group(&self, name: &str) -> Result<bool> {
        Ok(self.0.child(name)?.is_group())
    }
}

impl AttributeOp<Zarr> for ZarrGroup {
    fn path(&self) -> PathBuf {
        PathBuf::from(self.0.node_path())
    }

    fn write_attr(&self, name: &str, value: AttrValue) -> Result<()> {
        let _guard = ATTR_LOCK.lock();
        let mut group = self.0.open_group()?;
        group.attributes_mut().insert(name.to_string(), attr_to_json(value));
        group.store_metadata()?;
        Ok(())
    }

    fn read_attr(&self, name: &str) -> Result<Option<AttrValue>> {
        let _guard = ATTR_LOCK.lock();
        let group = self.0.open_group()?;
        group
            .attributes()
            .get(name)
            .map(|v| attr_from_json(name, v))
            .transpose()
    }
}

impl AttributeOp<Zarr> for ZarrDataset {
    fn path(&self) -> PathBuf {
        PathBuf::from(self.node.node_path())
    }

    fn write_attr(&self, name: &str, value: AttrValue) -> Result<()> {
        let _guard = ATTR_LOCK.lock();
        let mut array = self.node.open_array()?;
        array.attributes_mut().insert(name.to_string(), attr_to_json(value));
        array.store_metadata()?;
        Ok(())
    }

    fn read_attr(&self, name: &str) -> Result<Option<AttrValue>> {
        let _guard = ATTR_LOCK.lock();
        let array = self.node.open_array()?;
        array
            .attributes()
            .get(name)
            .map(|v| attr_from_json(name, v))
            .transpose()
    }
}

fn attr_to_json(value: AttrValue) -> Value {
    match value {
        AttrValue::Bool(x) => json!(x),
        AttrValue::Int(x) => json!(x),
        AttrValue::Str(x) => json!(x),
        AttrValue::StrList(x) => json!(x),
    }
}

fn attr_from_json(name: &str, value: &Value) -> Result<AttrValue> {
    let attr = match value {
        Value::Bool(x) => AttrValue::Bool(*x),
        Value::Number(x) => match x.as_i64() {
            Some(i) => AttrValue::Int(i),
            None => bail!("attribute '{}' is not an integer", name),
        },
        Value::String(x) => AttrValue::Str(x.clone()),
        Value::Array(xs) => AttrValue::StrList(
            xs.iter()
                .map(|x| match x {
                    Value::String(s) => Ok(s.clone()),
                    other => bail!("attribute '{}' holds a non-string item: {}", name, other),
                })
                .collect::<Result<_>>()?,
        ),
        other => bail!("unsupported attribute '{}': {}", name, other),
    };
    Ok(attr)
}

/// Zarr data type and fill value of each element type.
fn data_type_of(ty: ScalarType) -> (DataType, FillValue) {
    match ty {
        ScalarType::Bool => (DataType::Bool, FillValue::from(false)),
        ScalarType::I64 => (DataType::Int64, FillValue::from(0i64)),
        ScalarType::U32 => (DataType::UInt32, FillValue::from(0u32)),
        ScalarType::F32 => (DataType::Float32, FillValue::from(0.0f32)),
        ScalarType::F64 => (DataType::Float64, FillValue::from(0.0f64)),
        ScalarType::String => (DataType::String, FillValue::new(Vec::new())),
    }
}

fn scalar_type_of(data_type: &DataType) -> Result<ScalarType> {
    let ty = match data_type {
        DataType::Bool => ScalarType::Bool,
        DataType::Int64 => ScalarType::I64,
        DataType::UInt32 => ScalarType::U32,
        DataType::Float32 => ScalarType::F32,
        DataType::Float64 => ScalarType::F64,
        DataType::String => ScalarType::String,
        other => bail!("unsupported Zarr data type {:?}", other),
    };
    Ok(ty)
}

fn to_subset(selection: &[Range<usize>]) -> ArraySubset {
    let ranges: Vec<Range<u64>> = selection
        .iter()
        .map(|r| r.start as u64..r.end as u64)
        .collect();
    ArraySubset::new_with_ranges(&ranges)
}

impl ZarrDataset {
    fn check_selection(&self, selection: &[Range<usize>]) -> Result<()> {
        let shape = self.dataset.shape();
        ensure!(
            selection.len() == shape.len(),
            "selection has {} dimensions but dataset '{}' has {}",
            selection.len(),
            self.node.display(),
            shape.len()
        );
        for (r, &n) in selection.iter().zip(shape.iter()) {
            ensure!(
                r.start <= r.end && r.end as u64 <= n,
                "selection {:?} out of bounds for axis of length {}",
                r,
                n
            );
        }
        Ok(())
    }

    fn read_typed<T>(&self, selection: &[Range<usize>]) -> Result<ArrayD<T>>
    where
        T: ElementOwned + Clone,
    {
        let out_shape: Vec<usize> = selection.iter().map(|r| r.len()).collect();
        let values = if out_shape.iter().product::<usize>() == 0 {
            Vec::new()
        } else {
            self.dataset
                .retrieve_array_subset_elements::<T>(&to_subset(selection))?
        };
        Ok(ArrayD::from_shape_vec(IxDyn(&out_shape), values)?)
    }

    fn write_typed<T>(&self, arr: ArrayViewD<'_, T>, offset: &[usize]) -> Result<()>
    where
        T: Element + Clone,
    {
        let selection: Vec<Range<usize>> = offset
            .iter()
            .zip(arr.shape())
            .map(|(&o, &n)| o..o + n)
            .collect();
        self.check_selection(&selection)?;
        if arr.is_empty() {
            return Ok(());
        }
        let values: Vec<T> = arr.iter().cloned().collect();
        self.dataset
            .store_array_subset_elements::<T>(&to_subset(&selection), &values)?;
        Ok(())
    }
}

impl DatasetOp<Zarr> for ZarrDataset {
    fn dtype(&self) -> Result<ScalarType> {
        scalar_type_of(self.dataset.data_type())
    }

    fn shape(&self) -> Shape {
        self.dataset
            .shape()
            .iter()
            .map(|&x| x as usize)
            .collect::<Vec<_>>()
            .into()
    }

    fn chunk_shape(&self) -> Shape {
        let origin = vec![0; self.dataset.dimensionality()];
        match self.dataset.chunk_shape(&origin) {
            Ok(chunks) => chunks
                .to_array_shape()
                .iter()
                .map(|&x| x as usize)
                .collect::<Vec<_>>()
                .into(),
            Err(_) => self.shape(),
        }
    }

    fn read_dyn_array_slice(&self, selection: &[Range<usize>]) -> Result<DynArray> {
        self.check_selection(selection)?;
        let arr = match self.dtype()? {
            ScalarType::Bool => self.read_typed::<bool>(selection)?.into(),
            ScalarType::I64 => self.read_typed::<i64>(selection)?.into(),
            ScalarType::U32 => self.read_typed::<u32>(selection)?.into(),
            ScalarType::F32 => self.read_typed::<f32>(selection)?.into(),
            ScalarType::F64 => self.read_typed::<f64>(selection)?.into(),
            ScalarType::String => self.read_typed::<String>(selection)?.into(),
        };
        Ok(arr)
    }

    fn write_array_slice<T: BackendData>(
        &self,
        arr: ArrayViewD<'_, T>,
        offset: &[usize],
    ) -> Result<()> {
        let dtype = self.dtype()?;
        ensure!(
            T::DTYPE == dtype,
            "cannot write {} data into {} dataset '{}'",
            T::DTYPE,
            dtype,
            self.node.display()
        );
        match T::into_dyn_arr(arr) {
            DynArrayView::Bool(x) => self.write_typed(x, offset),
            DynArrayView::I64(x) => self.write_typed(x, offset),
            DynArrayView::U32(x) => self.write_typed(x, offset),
            DynArrayView::F32(x) => self.write_typed(x, offset),
            DynArrayView::F64(x) => self.write_typed(x, offset),
            DynArrayView::String(x) => self.write_typed(x, offset),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{s, Array, Array1, Array2};
    use tempfile::tempdir;

    fn node_metadata(path: &Path) -> Result<Value> {
        Ok(serde_json::from_slice(&fs::read(path.join(NODE_META))?)?)
    }

    #[test]
    fn test_group_and_attrs() -> Result<()> {
        let dir = tempdir()?;
        let store = Zarr::create(dir.path().join("test.zarr"))?;
        let group = store.create_group("cellData")?;
        assert!(store.create_group("cellData").is_err());
        assert!(store.is_group("cellData")?);
        assert!(store.open_group("missing").is_err());
        assert!(store.create_group("bad/name").is_err());
        assert_eq!(group.path(), PathBuf::from("/cellData"));

        group.write_str_attr("name", "cells")?;
        group.write_str_list_attr("column-order", &["I".to_string(), "ids".to_string()])?;
        group.write_attr("is_assay", AttrValue::Bool(true))?;
        let group = store.open_group("cellData")?;
        assert_eq!(group.read_str_attr("name")?, "cells");
        assert_eq!(group.read_str_list_attr("column-order")?, vec!["I", "ids"]);
        assert!(group.read_bool_attr("is_assay")?);
        assert!(!group.read_bool_attr("missing")?);
        assert!(group.read_str_attr("missing").is_err());

        let sub = group.create_group("nested")?;
        sub.new_array_dataset("x", Array1::from(vec![1u32, 2]).view(), WriteConfig::default())?;
        assert_eq!(group.list()?, vec!["nested"]);
        assert_eq!(sub.list()?, vec!["x"]);
        assert!(!sub.is_group("x")?);

        store.delete("cellData")?;
        assert!(!store.exists("cellData")?);
        assert!(store.list()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_reopen_store() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test.zarr");
        assert!(Zarr::open(&path).is_err());
        {
            let store = Zarr::create(&path)?;
            store.write_str_attr("defaultAssay", "RNA")?;
            store.create_group("RNA")?;
        }
        assert!(Zarr::create(&path).is_err());
        let store = Zarr::open(&path)?;
        assert_eq!(store.read_str_attr("defaultAssay")?, "RNA");
        assert_eq!(store.list()?, vec!["RNA"]);
        assert_eq!(store.filename(), path);
        Zarr::remove(&path)?;
        assert!(!Zarr::exists(&path));
        Ok(())
    }

    #[test]
    fn test_chunked_io() -> Result<()> {
        let dir = tempdir()?;
        let store = Zarr::create(dir.path().join("test.zarr"))?;
        let arr = Array::from_shape_fn((23, 17), |(i, j)| (i * 100 + j) as u32);
        let config = WriteConfig {
            compression: Some(1),
            block_size: Some(vec![5, 4].into()),
        };
        store.new_array_dataset("counts", arr.view(), config)?;

        let dataset = store.open_dataset("counts")?;
        assert_eq!(dataset.shape(), Shape::from(vec![23, 17]));
        assert_eq!(dataset.chunk_shape(), Shape::from(vec![5, 4]));
        assert_eq!(dataset.dtype()?, ScalarType::U32);

        let full: Array2<u32> = dataset.read_array::<u32>()?.into_dimensionality()?;
        assert_eq!(full, arr);

        let part = dataset.read_array_slice::<u32>(&[3..19, 2..11])?;
        assert_eq!(part, arr.slice(s![3..19, 2..11]).into_dyn());
        assert!(dataset.read_array_slice::<u32>(&[4..4, 0..17])?.is_empty());

        let patch = Array2::<u32>::zeros((4, 6));
        dataset.write_array_slice(patch.view().into_dyn(), &[9, 7])?;
        let mut expected = arr.clone();
        expected.slice_mut(s![9..13, 7..13]).fill(0);
        assert_eq!(dataset.read_array::<u32>()?, expected.into_dyn());

        assert!(dataset.read_array_slice::<u32>(&[0..24, 0..1]).is_err());
        assert!(dataset.read_array_slice::<f64>(&[0..1, 0..1]).is_err());
        assert!(dataset.write_array(Array1::from(vec![1.0f64]).view().into_dyn()).is_err());

        let meta = node_metadata(&dir.path().join("test.zarr").join("counts"))?;
        assert_eq!(meta["node_type"], "array");
        assert!(meta["codecs"]
            .as_array()
            .map_or(false, |codecs| codecs.iter().any(|c| c["name"] == "gzip")));
        Ok(())
    }

    #[test]
    fn test_string_and_bool_columns() -> Result<()> {
        let dir = tempdir()?;
        let store = Zarr::create(dir.path().join("test.zarr"))?;
        let names: Vec<String> = (0..25).map(|i| format!("cell-{}-é", i)).collect();
        let config = WriteConfig {
            compression: None,
            block_size: Some(Shape::from(7usize)),
        };
        store.new_array_dataset("names", Array1::from(names.clone()).view(), config.clone())?;
        let flags: Vec<bool> = (0..25).map(|i| i % 3 == 0).collect();
        store.new_array_dataset("I", Array1::from(flags.clone()).view(), config)?;

        let names_in = store.open_dataset("names")?.read_array::<String>()?;
        assert_eq!(names_in.into_raw_vec(), names);
        let flags_in = store.open_dataset("I")?.read_array::<bool>()?;
        assert_eq!(flags_in.into_raw_vec(), flags);
        assert_eq!(store.open_dataset("names")?.dtype()?, ScalarType::String);
        Ok(())
    }

    #[test]
    fn test_unwritten_chunks_read_as_fill() -> Result<()> {
        let dir = tempdir()?;
        let store = Zarr::create(dir.path().join("test.zarr"))?;
        let dataset = store.new_dataset::<f64>("x", &vec![10, 3].into(), WriteConfig::default())?;
        let arr = dataset.read_array::<f64>()?;
        assert!(arr.iter().all(|&x| x == 0.0));
        Ok(())
    }

    #[test]
    fn test_concurrent_attribute_writes() -> Result<()> {
        let dir = tempdir()?;
        let store = Zarr::create(dir.path().join("test.zarr"))?;
        let group = store.create_group("t")?;
        std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|t| {
                    let group = &group;
                    s.spawn(move || -> Result<()> {
                        for k in 0..10 {
                            group.write_attr(&format!("a{}_{}", t, k), AttrValue::Int(k))?;
                        }
                        Ok(())
                    })
                })
                .collect();
            handles.into_iter().try_for_each(|h| h.join().unwrap())
        })?;
        for t in 0..8 {
            for k in 0..10 {
                assert_eq!(
                    group.read_attr(&format!("a{}_{}", t, k))?,
                    Some(AttrValue::Int(k))
                );
            }
        }
        Ok(())
    }
}
