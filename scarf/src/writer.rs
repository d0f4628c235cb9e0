use crate::assay::{Assay, AssayKind};
use crate::backend::{Backend, DatasetOp, GroupOp, WriteConfig};
use crate::data::Shape;
use crate::datastore::CELL_DATA;
use crate::metadata::MetaData;
use crate::reader::CrReader;

use anyhow::{bail, ensure, Result};
use log::info;
use std::path::{Path, PathBuf};

/// Writes the contents of a [`CrReader`] into a new store.
pub struct CrToZarr {
    reader: CrReader,
    out: PathBuf,
    chunk_size: (usize, usize),
    overwrite: bool,
    config: WriteConfig,
}

impl CrToZarr {
    pub fn new<P: AsRef<Path>>(reader: CrReader, out: P) -> Self {
        Self {
            reader,
            out: out.as_ref().to_path_buf(),
            chunk_size: (1000, 1000),
            overwrite: false,
            config: WriteConfig::default(),
        }
    }

    /// Chunk shape (cells, features) of the counts arrays.
    pub fn chunk_size(mut self, cells: usize, features: usize) -> Self {
        self.chunk_size = (cells.max(1), features.max(1));
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn compression(mut self, level: Option<u8>) -> Self {
        self.config.compression = level;
        self
    }

    /// Write the store and return its path.
    pub fn write<B: Backend>(self) -> Result<PathBuf> {
        let assays = self.reader.assay_names();
        ensure!(!assays.is_empty(), "no features to write");
        if B::exists(&self.out) {
            if self.overwrite {
                B::remove(&self.out)?;
            } else {
                bail!(
                    "'{}' already exists, set `overwrite` to replace it",
                    self.out.display()
                );
            }
        }
        let store = B::create(&self.out)?;
        let barcodes = self.reader.barcodes().to_vec();
        MetaData::<B>::new(store.create_group(CELL_DATA)?, barcodes.clone(), barcodes)?;

        let n_cells = self.reader.n_cells();
        for assay in assays {
            let index = self.reader.feature_index(&assay);
            let ids = index
                .iter()
                .map(|&j| self.reader.feature_ids()[j].clone())
                .collect();
            let names = index
                .iter()
                .map(|&j| self.reader.feature_names()[j].clone())
                .collect();
            let config = WriteConfig {
                compression: self.config.compression,
                block_size: Some(Shape::from(self.chunk_size)),
            };
            let kind = AssayKind::from_assay_name(&assay);
            let counts = Assay::<B>::create(&store, &assay, kind, ids, names, n_cells, config)?;
            let step = self.chunk_size.0;
            for start in (0..n_cells).step_by(step) {
                let end = (start + step).min(n_cells);
                let block = self.reader.dense_rows(start..end, &index);
                counts.write_array_slice(block.view().into_dyn(), &[start, 0])?;
            }
            info!(
                "wrote {} assay '{}' with {} features",
                kind,
                assay,
                index.len()
            );
        }
        Ok(self.out)
    }
}
