pub mod assay;
pub mod backend;
pub mod bio_data;
pub mod data;
mod datastore;
pub mod downloader;
pub mod merge;
mod metadata;
pub mod reader;
pub mod writer;
mod macros;

pub use assay::{Assay, AssayKind, CellStats, HvgConfig};
pub use backend::{Backend, WriteConfig};
pub use datastore::{cell_cycle_phase, DataStore, StoreConfig, CELL_DATA};
pub use downloader::{fetch_dataset, Catalog, DatasetFormat};
pub use merge::{merge, JoinType, MergeConfig};
pub use metadata::{MetaData, PROTECTED_COLUMNS};
pub use reader::CrReader;
pub use writer::CrToZarr;
