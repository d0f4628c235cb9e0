use scarf::backend::{DatasetOp, GroupOp};
use scarf::data::{Column, Shape};
use scarf::*;

use anyhow::Result;
use flate2::{write::GzEncoder, Compression};
use itertools::Itertools;
use ndarray::{Array, Array2};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use proptest::prelude::*;
use std::fs::File;
use std::io::Write;
use std::ops::Range;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

pub fn with_tmp_dir<T, F: FnMut(PathBuf) -> T>(mut func: F) -> T {
    let dir = tempdir().unwrap();
    let path = dir.path().to_path_buf();
    func(path)
}

/// Store config for small test data: tiny blocks and no automatic filtering.
pub fn test_config() -> StoreConfig {
    StoreConfig {
        nthreads: 2,
        min_features_per_cell: 0,
        chunk_rows: 3,
        ..StoreConfig::default()
    }
}

/// An assay to be written by [`create_store`].
#[derive(Debug, Clone)]
pub struct AssayData {
    pub name: String,
    pub kind: AssayKind,
    pub feature_ids: Vec<String>,
    pub feature_names: Vec<String>,
    /// Cells x features.
    pub counts: Array2<u32>,
}

impl AssayData {
    pub fn new(name: &str, kind: AssayKind, feature_names: &[&str], counts: Array2<u32>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            feature_ids: feature_names.iter().map(|x| format!("id-{}", x)).collect(),
            feature_names: feature_names.iter().map(|x| x.to_string()).collect(),
            counts,
        }
    }
}

pub fn cell_ids(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("cell{}", i)).collect()
}

/// Write a store holding the given cells and assays directly through the backend.
pub fn create_store<B: Backend>(path: &Path, cells: &[String], assays: &[AssayData]) -> Result<()> {
    let store = B::create(path)?;
    MetaData::<B>::new(store.create_group(CELL_DATA)?, cells.to_vec(), cells.to_vec())?;
    for assay in assays {
        let config = WriteConfig {
            compression: Some(1),
            block_size: Some(Shape::from((4, 3))),
        };
        let counts = Assay::<B>::create(
            &store,
            &assay.name,
            assay.kind,
            assay.feature_ids.clone(),
            assay.feature_names.clone(),
            cells.len(),
            config,
        )?;
        counts.write_array(assay.counts.view().into_dyn())?;
    }
    Ok(())
}

/// A 10x Genomics matrix directory.
#[derive(Debug, Clone)]
pub struct TenxData {
    pub barcodes: Vec<String>,
    /// Id, name and feature type.
    pub features: Vec<(String, String, String)>,
    /// Features x cells.
    pub counts: Array2<u32>,
}

impl TenxData {
    /// Write `matrix.mtx`, `barcodes.tsv` and `features.tsv`, gzipped when `gz`.
    pub fn write(&self, dir: &Path, gz: bool) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let nnz = self.counts.iter().filter(|x| **x > 0).count();
        let mut mtx = format!(
            "%%MatrixMarket matrix coordinate integer general\n%\n{} {} {}\n",
            self.counts.nrows(),
            self.counts.ncols(),
            nnz
        );
        self.counts
            .indexed_iter()
            .filter(|(_, v)| **v > 0)
            .for_each(|((i, j), v)| mtx.push_str(&format!("{} {} {}\n", i + 1, j + 1, v)));
        let barcodes = self.barcodes.iter().map(|x| format!("{}\n", x)).join("");
        let features = self
            .features
            .iter()
            .map(|(id, name, ty)| format!("{}\t{}\t{}\n", id, name, ty))
            .join("");

        for (name, content) in [
            ("matrix.mtx", mtx),
            ("barcodes.tsv", barcodes),
            ("features.tsv", features),
        ] {
            if gz {
                let file = File::create(dir.join(format!("{}.gz", name)))?;
                let mut encoder = GzEncoder::new(file, Compression::default());
                encoder.write_all(content.as_bytes())?;
                encoder.finish()?;
            } else {
                File::create(dir.join(name))?.write_all(content.as_bytes())?;
            }
        }
        Ok(())
    }
}

/// Random counts with roughly half of the entries zero.
pub fn rand_counts(n_rows: usize, n_cols: usize, high: u32) -> Array2<u32> {
    let values = Array::random((n_rows, n_cols), Uniform::new(0, high.max(1)));
    let mask = Array::random((n_rows, n_cols), Uniform::new(0.0, 1.0));
    ndarray::Zip::from(&values)
        .and(&mask)
        .map_collect(|&v, &m: &f64| if m < 0.5 { 0 } else { v })
}

pub fn column_eq(a: &Column, b: &Column) -> bool {
    match (a, b) {
        (Column::F64(x), Column::F64(y)) => x
            .iter()
            .zip(y.iter())
            .all(|(x, y)| (x.is_nan() && y.is_nan()) || x == y),
        _ => a == b,
    }
}

////////////////////////////////////////////////////////////////////////////////
/// Strategies
////////////////////////////////////////////////////////////////////////////////

pub fn counts_strat(n_rows: usize, n_cols: usize) -> impl Strategy<Value = Array2<u32>> {
    proptest::collection::vec(0u32..20, n_rows * n_cols)
        .prop_map(move |v| Array2::from_shape_vec((n_rows, n_cols), v).unwrap())
}

/// A possibly empty range within `0..n`.
pub fn range_strat(n: usize) -> impl Strategy<Value = Range<usize>> {
    (0..=n).prop_flat_map(move |start| (start..=n).prop_map(move |end| start..end))
}

pub fn column_strat(n: usize) -> BoxedStrategy<Column> {
    prop_oneof![
        proptest::collection::vec(any::<bool>(), n).prop_map(Column::Bool),
        proptest::collection::vec(any::<i64>(), n).prop_map(Column::I64),
        proptest::collection::vec(any::<u32>(), n).prop_map(Column::U32),
        proptest::collection::vec(-1e6f64..1e6, n).prop_map(Column::F64),
        proptest::collection::vec("[a-zA-Z0-9 _-]{0,12}", n).prop_map(Column::String),
    ]
    .boxed()
}

/// A subset of `0..n` as a mask.
pub fn mask_strat(n: usize) -> impl Strategy<Value = Vec<bool>> {
    proptest::collection::vec(any::<bool>(), n)
}
