use anyhow::{bail, ensure, Context, Result};
use flate2::read::MultiGzDecoder;
use indexmap::IndexSet;
use nalgebra_sparse::{coo::CooMatrix, csr::CsrMatrix};
use ndarray::Array2;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::{error::Error, fmt, io};

/// Reader of a 10x Genomics feature-barcode matrix directory.
#[derive(Debug, Clone)]
pub struct CrReader {
    barcodes: Vec<String>,
    feature_ids: Vec<String>,
    feature_names: Vec<String>,
    feature_types: Vec<String>,
    /// Cells x features.
    counts: CsrMatrix<u32>,
}

impl CrReader {
    /// Read `matrix.mtx`, `barcodes.tsv` and `features.tsv` (or `genes.tsv`)
    /// from `dir`. Each file may be gzipped with a `.gz` suffix.
    pub fn from_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let matrix = find_file(dir, &["matrix.mtx"])?;
        let barcodes = find_file(dir, &["barcodes.tsv"])?;
        let features = find_file(dir, &["features.tsv", "genes.tsv"])?;
        Self::from_files(matrix, barcodes, features)
    }

    pub fn from_files<P1, P2, P3>(matrix: P1, barcodes: P2, features: P3) -> Result<Self>
    where
        P1: AsRef<Path>,
        P2: AsRef<Path>,
        P3: AsRef<Path>,
    {
        let barcodes = read_barcodes(open_file(barcodes)?)?;
        let (feature_ids, feature_names, feature_types) = read_features(open_file(features)?)?;
        let counts = read_matrix_market(&mut open_file(&matrix)?)
            .with_context(|| format!("cannot parse '{}'", matrix.as_ref().display()))?;
        Self::new(barcodes, feature_ids, feature_names, feature_types, counts)
    }

    /// `counts` is features x cells, the orientation of the matrix file.
    pub fn new(
        barcodes: Vec<String>,
        feature_ids: Vec<String>,
        feature_names: Vec<String>,
        feature_types: Vec<String>,
        counts: CsrMatrix<u32>,
    ) -> Result<Self> {
        ensure!(
            feature_names.len() == feature_ids.len() && feature_types.len() == feature_ids.len(),
            "found {} feature ids, {} names and {} types",
            feature_ids.len(),
            feature_names.len(),
            feature_types.len()
        );
        if counts.nrows() != feature_ids.len() || counts.ncols() != barcodes.len() {
            bail!(
                "matrix is {} x {}, expecting {} features x {} barcodes",
                counts.nrows(),
                counts.ncols(),
                feature_ids.len(),
                barcodes.len()
            );
        }
        Ok(Self {
            barcodes,
            feature_ids,
            feature_names,
            feature_types,
            counts: counts.transpose(),
        })
    }

    pub fn n_cells(&self) -> usize {
        self.barcodes.len()
    }

    pub fn n_features(&self) -> usize {
        self.feature_ids.len()
    }

    pub fn barcodes(&self) -> &[String] {
        &self.barcodes
    }

    pub fn feature_ids(&self) -> &[String] {
        &self.feature_ids
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    /// Cells x features.
    pub fn counts(&self) -> &CsrMatrix<u32> {
        &self.counts
    }

    /// Assay names in order of first appearance.
    pub fn assay_names(&self) -> Vec<String> {
        self.feature_types
            .iter()
            .map(|x| assay_name(x))
            .collect::<IndexSet<_>>()
            .into_iter()
            .collect()
    }

    /// Positions of the features belonging to `assay`.
    pub fn feature_index(&self, assay: &str) -> Vec<usize> {
        self.feature_types
            .iter()
            .enumerate()
            .filter(|(_, x)| assay_name(x) == assay)
            .map(|(i, _)| i)
            .collect()
    }

    /// Dense counts of cells `rows` restricted to the features at `feature_index`.
    pub fn dense_rows(&self, rows: Range<usize>, feature_index: &[usize]) -> Array2<u32> {
        let mut local = vec![None; self.n_features()];
        feature_index
            .iter()
            .enumerate()
            .for_each(|(k, &j)| local[j] = Some(k));
        let mut out = Array2::zeros((rows.len(), feature_index.len()));
        for (i, r) in rows.enumerate() {
            let row = self.counts.row(r);
            for (j, v) in row.col_indices().iter().zip(row.values()) {
                if let Some(k) = local[*j] {
                    out[[i, k]] = *v;
                }
            }
        }
        out
    }
}

/// Assay receiving the features of a 10x feature type.
pub fn assay_name(feature_type: &str) -> String {
    match feature_type {
        "Gene Expression" => "RNA".to_string(),
        "Antibody Capture" => "ADT".to_string(),
        "Peaks" => "ATAC".to_string(),
        x => x.split_whitespace().collect(),
    }
}

fn find_file(dir: &Path, candidates: &[&str]) -> Result<PathBuf> {
    for name in candidates {
        for file in [dir.join(name), dir.join(format!("{}.gz", name))] {
            if file.exists() {
                return Ok(file);
            }
        }
    }
    bail!(
        "none of '{}' found in '{}'",
        candidates.join("', '"),
        dir.display()
    )
}

fn open_file<P: AsRef<Path>>(file: P) -> Result<Box<dyn BufRead>> {
    fn is_gzipped<P: AsRef<Path>>(file: P) -> Result<bool> {
        let mut magic = [0u8; 2];
        let n = File::open(file)?.read(&mut magic)?;
        Ok(n == 2 && magic == [0x1f, 0x8b])
    }

    let path = file.as_ref();
    let reader: Box<dyn BufRead> = if is_gzipped(path)? {
        Box::new(BufReader::new(MultiGzDecoder::new(File::open(path)?)))
    } else {
        Box::new(BufReader::new(
            File::open(path).with_context(|| format!("cannot open '{}'", path.display()))?,
        ))
    };
    Ok(reader)
}

fn read_barcodes<R: BufRead>(reader: R) -> Result<Vec<String>> {
    reader
        .lines()
        .filter(|line| !matches!(line, Ok(x) if x.trim().is_empty()))
        .map(|line| {
            let line = line?;
            Ok(line.split('\t').next().unwrap_or_default().trim().to_string())
        })
        .collect()
}

/// Ids, names and types of the features. A missing type column means gene
/// expression; a missing name column repeats the id.
fn read_features<R: BufRead>(reader: R) -> Result<(Vec<String>, Vec<String>, Vec<String>)> {
    let mut ids = Vec::new();
    let mut names = Vec::new();
    let mut types = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.split('\t').map(|x| x.trim());
        let id = match fields.next() {
            Some(x) if !x.is_empty() => x.to_string(),
            _ => bail!("feature line without id: '{}'", line),
        };
        names.push(fields.next().map_or_else(|| id.clone(), |x| x.to_string()));
        types.push(fields.next().unwrap_or("Gene Expression").to_string());
        ids.push(id);
    }
    Ok((ids, names, types))
}

#[derive(Debug)]
pub enum IoError {
    Io(io::Error),
    BadMatrixMarketFile,
    UnsupportedMatrixMarketFormat,
}

use self::IoError::*;

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Io(ref err) => err.fmt(f),
            Self::BadMatrixMarketFile => write!(f, "Bad matrix market file."),
            Self::UnsupportedMatrixMarketFormat => {
                write!(f, "Unsupported matrix market format, expecting a general coordinate matrix.")
            }
        }
    }
}

impl Error for IoError {}

impl From<io::Error> for IoError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// Parse a `coordinate integer|real general` Matrix Market file. Real values
/// must be non-negative whole numbers.
pub fn read_matrix_market<R: BufRead>(reader: &mut R) -> Result<CsrMatrix<u32>, IoError> {
    // MatrixMarket format specifies lines of at most 1024 chars
    let mut line = String::with_capacity(1024);
    reader.read_line(&mut line)?;
    let header = line.to_lowercase();
    if !header.starts_with("%%matrixmarket matrix coordinate") {
        return Err(BadMatrixMarketFile);
    }
    if !(header.contains("integer") || header.contains("real")) || !header.contains("general") {
        return Err(UnsupportedMatrixMarketFormat);
    }

    // The header is followed by any number of comment or empty lines
    loop {
        line.clear();
        let len = reader.read_line(&mut line)?;
        if len == 0 {
            return Err(BadMatrixMarketFile);
        }
        if line.starts_with('%') || line.trim().is_empty() {
            continue;
        }
        break;
    }
    let (rows, cols, entries) = {
        let mut infos = line.split_whitespace().map(|s| s.parse::<usize>());
        let mut next = || match infos.next() {
            Some(Ok(x)) => Ok(x),
            _ => Err(BadMatrixMarketFile),
        };
        let shape = (next()?, next()?, next()?);
        if infos.next().is_some() {
            return Err(BadMatrixMarketFile);
        }
        shape
    };

    match rows.checked_mul(cols) {
        Some(n) if entries <= n => {}
        _ => return Err(BadMatrixMarketFile),
    }
    // The header is untrusted, so preallocation is bounded
    let capacity = entries.min(1 << 20);
    let mut row_inds = Vec::with_capacity(capacity);
    let mut col_inds = Vec::with_capacity(capacity);
    let mut data = Vec::with_capacity(capacity);
    while data.len() < entries {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(BadMatrixMarketFile);
        }
        let mut entry = line.split_whitespace();
        let row = match entry.next() {
            Some(x) => x.parse::<usize>().or(Err(BadMatrixMarketFile))?,
            None => continue,
        };
        let col = entry
            .next()
            .ok_or(BadMatrixMarketFile)
            .and_then(|s| s.parse::<usize>().or(Err(BadMatrixMarketFile)))?;
        let val = entry
            .next()
            .ok_or(BadMatrixMarketFile)
            .and_then(|s| s.parse::<f64>().or(Err(BadMatrixMarketFile)))?;
        if entry.next().is_some() || val < 0.0 || val.fract() != 0.0 || val > u32::MAX as f64 {
            return Err(BadMatrixMarketFile);
        }
        // MatrixMarket indices are 1-based
        row_inds.push(row.checked_sub(1).ok_or(BadMatrixMarketFile)?);
        col_inds.push(col.checked_sub(1).ok_or(BadMatrixMarketFile)?);
        data.push(val as u32);
    }

    let coo = CooMatrix::try_from_triplets(rows, cols, row_inds, col_inds, data)
        .map_err(|_| BadMatrixMarketFile)?;
    Ok(CsrMatrix::from(&coo))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const MTX: &str = "%%MatrixMarket matrix coordinate integer general\n\
        %metadata\n\
        3 2 4\n\
        1 1 5\n\
        3 1 1\n\
        \n\
        2 2 7\n\
        1 1 2\n";

    #[test]
    fn test_read_matrix_market() {
        let csr = read_matrix_market(&mut Cursor::new(MTX)).unwrap();
        assert_eq!((csr.nrows(), csr.ncols()), (3, 2));
        // duplicate entries are summed
        assert_eq!(csr.row(0).values(), &[7]);
        assert_eq!(csr.row(1).col_indices(), &[1]);
        assert_eq!(csr.row(2).values(), &[1]);
    }

    #[test]
    fn test_bad_matrix_market() {
        let bad = [
            "%%MatrixMarket matrix array real general\n1 1\n1\n",
            "%%MatrixMarket matrix coordinate integer general\n2 2 1\n3 1 1\n",
            "%%MatrixMarket matrix coordinate integer general\n2 2 2\n1 1 1\n",
            "%%MatrixMarket matrix coordinate real general\n2 2 1\n1 1 0.5\n",
            "%%MatrixMarket matrix coordinate integer general\n2 2 1\n0 1 1\n",
            "%%MatrixMarket matrix coordinate integer general\n2 x 1\n1 1 1\n",
            "%%MatrixMarket matrix coordinate integer general\n2 2 18446744073709551615\n1 1 1\n",
            "%%MatrixMarket matrix coordinate integer general\n2 2 5\n1 1 1\n",
            "%%MatrixMarket matrix coordinate integer general\n\
             18446744073709551615 18446744073709551615 1\n1 1 1\n",
        ];
        for x in bad {
            assert!(matches!(
                read_matrix_market(&mut Cursor::new(x)),
                Err(BadMatrixMarketFile)
            ));
        }
        let symmetric = "%%MatrixMarket matrix coordinate integer symmetric\n1 1 1\n1 1 1\n";
        assert!(matches!(
            read_matrix_market(&mut Cursor::new(symmetric)),
            Err(UnsupportedMatrixMarketFormat)
        ));
    }

    #[test]
    fn test_features() {
        let text = "g1\tA\tGene Expression\ng2\tB\tAntibody Capture\n\np1\tC\tCustom Type\n";
        let (ids, names, types) = read_features(Cursor::new(text)).unwrap();
        assert_eq!(ids, vec!["g1", "g2", "p1"]);
        assert_eq!(names, vec!["A", "B", "C"]);
        let assays: Vec<String> = types.iter().map(|x| assay_name(x)).collect();
        assert_eq!(assays, vec!["RNA", "ADT", "CustomType"]);

        let (_, names, types) = read_features(Cursor::new("g1\n")).unwrap();
        assert_eq!(names, vec!["g1"]);
        assert_eq!(assay_name(&types[0]), "RNA");
    }

    #[test]
    fn test_reader_orientation() {
        let counts = read_matrix_market(&mut Cursor::new(MTX)).unwrap();
        let reader = CrReader::new(
            vec!["c1".into(), "c2".into()],
            vec!["g1".into(), "g2".into(), "a1".into()],
            vec!["G1".into(), "G2".into(), "A1".into()],
            vec!["Gene Expression".into(), "Gene Expression".into(), "Antibody Capture".into()],
            counts,
        )
        .unwrap();
        assert_eq!(reader.assay_names(), vec!["RNA", "ADT"]);
        let rna = reader.feature_index("RNA");
        assert_eq!(rna, vec![0, 1]);
        assert_eq!(reader.dense_rows(0..2, &rna), ndarray::array![[7, 0], [0, 7]]);
        assert_eq!(
            reader.dense_rows(0..2, &reader.feature_index("ADT")),
            ndarray::array![[1], [0]]
        );
    }

    #[test]
    fn test_reader_feature_lengths() {
        let counts = || read_matrix_market(&mut Cursor::new(MTX)).unwrap();
        let barcodes = || vec!["c1".to_string(), "c2".to_string()];
        let ids = || vec!["g1".to_string(), "g2".to_string(), "a1".to_string()];
        let types = || vec!["Gene Expression".to_string(); 3];

        let no_types = CrReader::new(barcodes(), ids(), ids(), Vec::new(), counts());
        assert!(no_types.is_err());
        let short_names = CrReader::new(barcodes(), ids(), vec!["G1".to_string()], types(), counts());
        assert!(short_names.is_err());
        assert!(CrReader::new(barcodes(), ids(), ids(), types(), counts()).is_ok());
    }
}
