use crate::backend::{check_name, Backend};
use crate::reader::CrReader;
use crate::writer::CrToZarr;

use anyhow::{bail, ensure, Context, Result};
use indexmap::IndexMap;
use log::info;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Layout of a fetched dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetFormat {
    /// A 10x Genomics matrix directory, readable by [`CrReader::from_dir`].
    TenX,
    /// The 10x files converted into a store.
    Zarr,
}

impl FromStr for DatasetFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "10x" | "tenx" => Ok(DatasetFormat::TenX),
            "zarr" => Ok(DatasetFormat::Zarr),
            _ => bail!("unknown dataset format '{}', expecting '10x' or 'zarr'", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    /// Name of the file once saved.
    pub file_name: String,
    /// An `http(s)://` or `file://` URL, or a path.
    pub source: String,
}

/// Named datasets and the files that make up each of them.
///
/// The text form has one tab-separated `name file source` row per file.
/// Empty lines and lines starting with `#` are skipped. Relative source
/// paths are resolved against the catalog's directory.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    datasets: IndexMap<String, Vec<RemoteFile>>,
    base_dir: Option<PathBuf>,
}

impl Catalog {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("cannot open catalog '{}'", path.display()))?;
        let mut catalog = Self::from_reader(BufReader::new(file))?;
        catalog.base_dir = path.parent().map(|p| p.to_path_buf());
        Ok(catalog)
    }

    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        let mut datasets: IndexMap<String, Vec<RemoteFile>> = IndexMap::new();
        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').map(|x| x.trim()).collect();
            ensure!(
                fields.len() == 3 && fields.iter().all(|x| !x.is_empty()),
                "catalog line {}: expecting 'name<TAB>file<TAB>source'",
                i + 1
            );
            check_name(fields[0])?;
            check_name(fields[1])?;
            datasets.entry(fields[0].to_string()).or_default().push(RemoteFile {
                file_name: fields[1].to_string(),
                source: fields[2].to_string(),
            });
        }
        Ok(Self {
            datasets,
            base_dir: None,
        })
    }

    pub fn names(&self) -> Vec<String> {
        self.datasets.keys().cloned().collect()
    }

    pub fn files(&self, name: &str) -> Result<&[RemoteFile]> {
        match self.datasets.get(name) {
            Some(x) => Ok(x.as_slice()),
            None => bail!(
                "dataset '{}' not found, available: '{}'",
                name,
                self.names().join("', '")
            ),
        }
    }

    fn resolve(&self, source: &str) -> PathBuf {
        let path = PathBuf::from(source.strip_prefix("file://").unwrap_or(source));
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path,
        }
    }
}

/// Fetch the dataset `name` into `<save_path>/<name>` and return the location
/// of the requested format: the `data` directory of 10x files, or the
/// `data.zarr` store converted from it. Files already present are kept.
pub fn fetch_dataset<B: Backend, P: AsRef<Path>>(
    catalog: &Catalog,
    name: &str,
    save_path: P,
    format: DatasetFormat,
) -> Result<PathBuf> {
    let files = catalog.files(name)?;
    let dataset_dir = save_path.as_ref().join(name);
    let data_dir = dataset_dir.join("data");
    let zarr_path = dataset_dir.join("data.zarr");
    if format == DatasetFormat::Zarr && B::exists(&zarr_path) {
        info!("using existing store '{}'", zarr_path.display());
        return Ok(zarr_path);
    }

    fs::create_dir_all(&data_dir)?;
    for file in files {
        let target = data_dir.join(&file.file_name);
        if target.exists() {
            continue;
        }
        download(catalog, &file.source, &target)
            .with_context(|| format!("cannot fetch '{}'", file.source))?;
    }

    match format {
        DatasetFormat::TenX => Ok(data_dir),
        DatasetFormat::Zarr => {
            let reader = CrReader::from_dir(&data_dir)?;
            CrToZarr::new(reader, &zarr_path).write::<B>()
        }
    }
}

/// Copy `source` to `target` through a temporary file, so that an interrupted
/// transfer never leaves a partial `target`.
fn download(catalog: &Catalog, source: &str, target: &Path) -> Result<()> {
    let mut partial = target.as_os_str().to_owned();
    partial.push(".part");
    let partial = PathBuf::from(partial);
    let result = copy_source(catalog, source, &partial);
    match result {
        Ok(()) => Ok(fs::rename(&partial, target)?),
        Err(e) => {
            let _ = fs::remove_file(&partial);
            Err(e)
        }
    }
}

fn copy_source(catalog: &Catalog, source: &str, out: &Path) -> Result<()> {
    if source.starts_with("http://") || source.starts_with("https://") {
        info!("downloading '{}'", source);
        let mut response = reqwest::blocking::get(source)?.error_for_status()?;
        response.copy_to(&mut File::create(out)?)?;
    } else {
        let path = catalog.resolve(source);
        info!("copying '{}'", path.display());
        let mut input = File::open(&path)?;
        io::copy(&mut input, &mut File::create(out)?)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_catalog() {
        let text = "# name\tfile\tsource\n\
            pbmc\tmatrix.mtx.gz\thttps://example.org/m.gz\n\
            \n\
            pbmc\tbarcodes.tsv.gz\tfile:///data/b.gz\n\
            brain\tfeatures.tsv\tlocal/f.tsv\n";
        let catalog = Catalog::from_reader(Cursor::new(text)).unwrap();
        assert_eq!(catalog.names(), vec!["pbmc", "brain"]);
        assert_eq!(catalog.files("pbmc").unwrap().len(), 2);
        assert_eq!(catalog.files("brain").unwrap()[0].source, "local/f.tsv");
        assert!(catalog.files("missing").is_err());
        assert_eq!(catalog.resolve("file:///data/b.gz"), PathBuf::from("/data/b.gz"));

        assert!(Catalog::from_reader(Cursor::new("pbmc\tmatrix.mtx\n")).is_err());
        assert!(Catalog::from_reader(Cursor::new("a/b\tmatrix.mtx\tx\n")).is_err());
    }

    #[test]
    fn test_dataset_format() {
        assert_eq!("10x".parse::<DatasetFormat>().unwrap(), DatasetFormat::TenX);
        assert_eq!("Zarr".parse::<DatasetFormat>().unwrap(), DatasetFormat::Zarr);
        assert!("h5ad".parse::<DatasetFormat>().is_err());
    }
}
