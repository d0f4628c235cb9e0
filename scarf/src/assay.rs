mod normalize;
pub use normalize::{lib_size, Normalizer};

use crate::backend::{AttrValue, AttributeOp, Backend, DatasetOp, GroupOp, WriteConfig};
use crate::data::{Column, Shape};
use crate::metadata::MetaData;

use anyhow::{bail, ensure, Context, Result};
use itertools::Itertools;
use log::{debug, info};
use ndarray::{Array1, Array2, ArrayView2, Axis, Ix2};
use rayon::prelude::*;
use rayon::ThreadPool;
use std::ops::Range;
use std::str::FromStr;
use std::sync::Arc;

/// Default library size used by RNA normalization.
pub const DEFAULT_SCALE_FACTOR: f64 = 1000.0;

/// The modality of an assay. It decides how counts are normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssayKind {
    Rna,
    Adt,
    Atac,
    Generic,
}

impl AssayKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssayKind::Rna => "RNA",
            AssayKind::Adt => "ADT",
            AssayKind::Atac => "ATAC",
            AssayKind::Generic => "Generic",
        }
    }

    /// The kind conventionally used for an assay name.
    pub fn from_assay_name(name: &str) -> Self {
        name.parse().unwrap_or(AssayKind::Generic)
    }
}

impl std::fmt::Display for AssayKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssayKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "RNA" | "RNAASSAY" => Ok(AssayKind::Rna),
            "ADT" | "ADTASSAY" => Ok(AssayKind::Adt),
            "ATAC" | "ATACASSAY" => Ok(AssayKind::Atac),
            "GENERIC" | "ASSAY" => Ok(AssayKind::Generic),
            _ => bail!("unknown assay kind '{}'", s),
        }
    }
}

/// Options for highly variable feature selection.
#[derive(Debug, Clone)]
pub struct HvgConfig {
    /// Number of features to mark.
    pub top_n: usize,
    /// Minimum number of cells in which a feature must be detected.
    pub min_cells: usize,
    pub min_mean: f64,
    pub max_mean: f64,
    /// Number of mean bins within which dispersions are z-scored.
    pub n_bins: usize,
}

impl Default for HvgConfig {
    fn default() -> Self {
        Self {
            top_n: 500,
            min_cells: 20,
            min_mean: f64::NEG_INFINITY,
            max_mean: f64::INFINITY,
            n_bins: 200,
        }
    }
}

/// Per-cell statistics computed from raw counts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CellStats {
    pub n_counts: Vec<i64>,
    pub n_features: Vec<i64>,
    /// Only present for RNA assays.
    pub percent_mito: Option<Vec<f64>>,
    pub percent_ribo: Option<Vec<f64>>,
}

/// A named counts matrix (cells x features) together with its feature table.
pub struct Assay<B: Backend> {
    name: String,
    kind: AssayKind,
    group: B::Group,
    counts: B::Dataset,
    feats: MetaData<B>,
    pool: Arc<ThreadPool>,
    chunk_rows: usize,
    scale_factor: f64,
}

impl<B: Backend> std::fmt::Display for Assay<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} assay '{}' with {} cells and {} features",
            self.kind,
            self.name,
            self.n_cells(),
            self.n_features()
        )
    }
}

impl<B: Backend> Assay<B> {
    /// Lay out a new assay group under `location`: attributes, feature table and
    /// an empty counts dataset, which is returned for the caller to fill.
    pub fn create<G: GroupOp<B>>(
        location: &G,
        name: &str,
        kind: AssayKind,
        feature_ids: Vec<String>,
        feature_names: Vec<String>,
        n_cells: usize,
        config: WriteConfig,
    ) -> Result<B::Dataset> {
        crate::backend::check_name(name)?;
        if location.exists(name)? {
            bail!("'{}' already exists", name);
        }
        let n_features = feature_ids.len();
        let group = location.create_group(name)?;
        group.write_attr("is_assay", AttrValue::Bool(true))?;
        group.write_str_attr("assay_type", kind.as_str())?;
        MetaData::<B>::new(group.create_group("featureData")?, feature_ids, feature_names)
            .with_context(|| format!("cannot create the feature table of '{}'", name))?;
        let shape = Shape::from((n_cells, n_features));
        group.new_dataset::<u32>("counts", &shape, config)
    }

    pub fn open(name: &str, group: B::Group, pool: Arc<ThreadPool>, chunk_rows: usize) -> Result<Self> {
        let kind = match group.read_attr("assay_type")? {
            Some(AttrValue::Str(x)) => x.parse()?,
            _ => AssayKind::from_assay_name(name),
        };
        let counts = group.open_dataset("counts")?;
        let shape = counts.shape();
        ensure!(
            shape.ndim() == 2,
            "counts of '{}' must be 2-dimensional, found shape {}",
            name,
            shape
        );
        let feats = MetaData::open(group.open_group("featureData")?)?;
        ensure!(
            feats.n_rows() == shape[1],
            "'{}' has {} features in its table but {} columns in counts",
            name,
            feats.n_rows(),
            shape[1]
        );
        Ok(Self {
            name: name.to_string(),
            kind,
            group,
            counts,
            feats,
            pool,
            chunk_rows: chunk_rows.max(1),
            scale_factor: DEFAULT_SCALE_FACTOR,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> AssayKind {
        self.kind
    }

    pub fn group(&self) -> &B::Group {
        &self.group
    }

    pub fn counts(&self) -> &B::Dataset {
        &self.counts
    }

    pub fn feats(&self) -> &MetaData<B> {
        &self.feats
    }

    pub fn n_cells(&self) -> usize {
        self.counts.shape()[0]
    }

    pub fn n_features(&self) -> usize {
        self.counts.shape()[1]
    }

    pub fn chunk_rows(&self) -> usize {
        self.chunk_rows
    }

    pub fn scale_factor(&self) -> f64 {
        self.scale_factor
    }

    pub fn set_scale_factor(&mut self, scale_factor: f64) {
        self.scale_factor = scale_factor;
    }

    /// Raw counts of the given cells, in the order given.
    pub fn read_counts(&self, rows: &[usize]) -> Result<Array2<u32>> {
        let n_cells = self.n_cells();
        if let Some(r) = rows.iter().find(|&&r| r >= n_cells) {
            bail!("cell index {} out of bounds ({} cells)", r, n_cells);
        }
        // consecutive rows falling into the same block are read together
        let mut runs: Vec<(usize, Vec<usize>)> = Vec::new();
        for &r in rows {
            let block = r / self.chunk_rows;
            match runs.last_mut() {
                Some((b, v)) if *b == block => v.push(r),
                _ => runs.push((block, vec![r])),
            }
        }
        let parts = self.pool.install(|| {
            runs.par_iter()
                .map(|(_, rs)| {
                    let (lo, hi) = match rs.iter().minmax().into_option() {
                        Some((&lo, &hi)) => (lo, hi + 1),
                        None => (0, 0),
                    };
                    let arr = self.read_range(lo..hi)?;
                    let local: Vec<usize> = rs.iter().map(|r| r - lo).collect();
                    Ok(arr.select(Axis(0), &local))
                })
                .collect::<Result<Vec<_>>>()
        })?;
        if parts.is_empty() {
            return Ok(Array2::zeros((0, self.n_features())));
        }
        let views: Vec<ArrayView2<'_, u32>> = parts.iter().map(|x| x.view()).collect();
        Ok(ndarray::concatenate(Axis(0), &views)?)
    }

    /// Raw counts of the given cells, `chunk` rows at a time.
    pub fn iter_count_chunks<'a>(
        &'a self,
        rows: &'a [usize],
        chunk: usize,
    ) -> impl Iterator<Item = Result<Array2<u32>>> + 'a {
        rows.chunks(chunk.max(1)).map(move |x| self.read_counts(x))
    }

    /// Fit the normalizer of this assay's kind on the given cells.
    pub fn normalizer(&self, rows: &[usize]) -> Result<Normalizer> {
        Normalizer::fit(
            self.kind,
            self.scale_factor,
            self.n_features(),
            self.iter_count_chunks(rows, self.chunk_rows),
        )
    }

    /// Normalized values of the given cells and features.
    pub fn normed_rows(&self, rows: &[usize], feat_index: &[usize]) -> Result<Array2<f64>> {
        let normalizer = self.normalizer(rows)?;
        let counts = self.read_counts(rows)?;
        Ok(normalizer.apply(counts.view()).select(Axis(1), feat_index))
    }

    /// Normalized values of the cells active in `cell_key` of `cells` and the
    /// features active in `feat_key`.
    pub fn normed(&self, cells: &MetaData<B>, cell_key: &str, feat_key: &str) -> Result<Array2<f64>> {
        self.check_cells(cells)?;
        let rows = cells.active_index(cell_key)?;
        let feat_index = self.feats.active_index(feat_key)?;
        self.normed_rows(&rows, &feat_index)
    }

    /// Totals and detected features per cell. For RNA assays also the percent
    /// of counts from features whose names start with `mito_prefix` or one of
    /// `ribo_prefixes`, compared case-insensitively.
    pub fn cell_stats(&self, mito_prefix: &str, ribo_prefixes: &[&str]) -> Result<CellStats> {
        let is_rna = self.kind == AssayKind::Rna;
        let (mito, ribo) = if is_rna {
            let names: Vec<String> = self
                .feats
                .names()?
                .into_iter()
                .map(|x| x.to_uppercase())
                .collect();
            let mito_prefix = mito_prefix.to_uppercase();
            let ribo_prefixes: Vec<String> = ribo_prefixes.iter().map(|x| x.to_uppercase()).collect();
            let mito: Vec<usize> = names
                .iter()
                .positions(|x| x.starts_with(mito_prefix.as_str()))
                .collect();
            let ribo: Vec<usize> = names
                .iter()
                .positions(|x| ribo_prefixes.iter().any(|p| x.starts_with(p.as_str())))
                .collect();
            debug!(
                "'{}': {} mitochondrial and {} ribosomal features",
                self.name,
                mito.len(),
                ribo.len()
            );
            (mito, ribo)
        } else {
            (Vec::new(), Vec::new())
        };

        let blocks: Vec<Range<usize>> = self.blocks().collect();
        let parts = self.pool.install(|| {
            blocks
                .par_iter()
                .map(|range| {
                    let arr = self.read_range(range.clone())?;
                    let rows = arr
                        .outer_iter()
                        .map(|row| {
                            let total: u64 = row.iter().map(|&x| x as u64).sum();
                            let detected = row.iter().filter(|&&x| x > 0).count() as i64;
                            let mt: u64 = mito.iter().map(|&j| row[j] as u64).sum();
                            let rb: u64 = ribo.iter().map(|&j| row[j] as u64).sum();
                            (total, detected, percent(mt, total), percent(rb, total))
                        })
                        .collect::<Vec<_>>();
                    Ok(rows)
                })
                .collect::<Result<Vec<_>>>()
        })?;

        let mut stats = CellStats::default();
        let mut mito_pct = Vec::with_capacity(self.n_cells());
        let mut ribo_pct = Vec::with_capacity(self.n_cells());
        for (total, detected, mt, rb) in parts.into_iter().flatten() {
            stats.n_counts.push(total as i64);
            stats.n_features.push(detected);
            mito_pct.push(mt);
            ribo_pct.push(rb);
        }
        if is_rna {
            stats.percent_mito = Some(mito_pct);
            stats.percent_ribo = Some(ribo_pct);
        }
        Ok(stats)
    }

    /// Store per-feature statistics of the cells active in `cell_key`:
    /// number of cells with non-zero counts, mean and standard deviation of
    /// normalized values.
    pub fn set_summary_stats(&self, cells: &MetaData<B>, cell_key: &str) -> Result<()> {
        self.check_cells(cells)?;
        let rows = cells.active_index(cell_key)?;
        if rows.is_empty() {
            bail!("no cells selected by '{}'", cell_key);
        }
        let n_features = self.n_features();
        let normalizer = self.normalizer(&rows)?;
        let mut n_cells = Array1::<i64>::zeros(n_features);
        let mut sum = Array1::<f64>::zeros(n_features);
        let mut sum_sq = Array1::<f64>::zeros(n_features);
        for chunk in self.iter_count_chunks(&rows, self.chunk_rows) {
            let chunk = chunk?;
            n_cells += &chunk.mapv(|x| (x > 0) as i64).sum_axis(Axis(0));
            let normed = normalizer.apply(chunk.view());
            sum += &normed.sum_axis(Axis(0));
            sum_sq += &normed.mapv(|x| x * x).sum_axis(Axis(0));
        }
        let n = rows.len() as f64;
        let avg = sum.mapv(|x| x / n);
        let sigmas: Vec<f64> = avg
            .iter()
            .zip(sum_sq.iter())
            .map(|(&m, &s)| (s / n - m * m).max(0.0).sqrt())
            .collect();

        self.feats
            .insert(&format!("{}__nCells", cell_key), n_cells.to_vec(), "I", true)?;
        self.feats
            .insert(&format!("{}__avg", cell_key), avg.to_vec(), "I", true)?;
        self.feats
            .insert(&format!("{}__sigmas", cell_key), sigmas, "I", true)?;
        debug!("summary statistics of '{}' for '{}' written", self.name, cell_key);
        Ok(())
    }

    /// Mark highly variable features in `<cell_key>__hvgs`. Returns the number
    /// of features marked.
    pub fn mark_hvgs(&self, cells: &MetaData<B>, cell_key: &str, config: &HvgConfig) -> Result<usize> {
        let avg_col = format!("{}__avg", cell_key);
        if !self.feats.contains(&avg_col) {
            self.set_summary_stats(cells, cell_key)?;
        }
        let avg = self.feats.fetch_all(&avg_col)?.to_f64()?;
        let sigmas = self
            .feats
            .fetch_all(&format!("{}__sigmas", cell_key))?
            .to_f64()?;
        let n_cells = self
            .feats
            .fetch_all(&format!("{}__nCells", cell_key))?
            .to_f64()?;
        let active: Vec<bool> = self.feats.fetch_all("I")?.into_vec()?;

        let mut candidates: Vec<(usize, f64, f64)> = (0..self.n_features())
            .filter(|&j| {
                active[j]
                    && n_cells[j] >= config.min_cells as f64
                    && avg[j] > 0.0
                    && sigmas[j] > 0.0
                    && avg[j] >= config.min_mean
                    && avg[j] <= config.max_mean
            })
            .map(|j| (j, avg[j], (sigmas[j] * sigmas[j] / avg[j]).ln()))
            .collect();
        candidates.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

        let n_bins = config.n_bins.max(1);
        let n_cand = candidates.len();
        let mut scored: Vec<(usize, f64)> = Vec::with_capacity(n_cand);
        let mut bins: Vec<Vec<&(usize, f64, f64)>> = vec![Vec::new(); n_bins];
        for (rank, x) in candidates.iter().enumerate() {
            bins[rank * n_bins / n_cand].push(x);
        }
        for bin in bins.into_iter().filter(|x| !x.is_empty()) {
            let k = bin.len() as f64;
            let mean = bin.iter().map(|x| x.2).sum::<f64>() / k;
            let sd = (bin.iter().map(|x| (x.2 - mean).powi(2)).sum::<f64>() / k).sqrt();
            scored.extend(bin.iter().map(|x| {
                let z = if sd > 0.0 { (x.2 - mean) / sd } else { 0.0 };
                (x.0, z)
            }));
        }
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut hvgs = vec![false; self.n_features()];
        scored
            .iter()
            .take(config.top_n)
            .for_each(|(j, _)| hvgs[*j] = true);
        let n_marked = hvgs.iter().filter(|x| **x).count();
        self.feats
            .insert(&format!("{}__hvgs", cell_key), Column::Bool(hvgs), "I", true)?;
        info!(
            "{} highly variable features marked in '{}' out of {} candidates",
            n_marked, self.name, n_cand
        );
        Ok(n_marked)
    }

    fn read_range(&self, range: Range<usize>) -> Result<Array2<u32>> {
        Ok(self
            .counts
            .read_rows::<u32>(range)?
            .into_dimensionality::<Ix2>()?)
    }

    fn blocks(&self) -> impl Iterator<Item = Range<usize>> {
        let n = self.n_cells();
        let step = self.chunk_rows;
        (0..n).step_by(step).map(move |i| i..(i + step).min(n))
    }

    fn check_cells(&self, cells: &MetaData<B>) -> Result<()> {
        ensure!(
            cells.n_rows() == self.n_cells(),
            "cell table has {} rows but '{}' has {} cells",
            cells.n_rows(),
            self.name,
            self.n_cells()
        );
        Ok(())
    }
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        100.0 * part as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assay_kind() {
        assert_eq!("rna".parse::<AssayKind>().unwrap(), AssayKind::Rna);
        assert_eq!("ADTassay".parse::<AssayKind>().unwrap(), AssayKind::Adt);
        assert_eq!(AssayKind::from_assay_name("HTO"), AssayKind::Generic);
        assert!("HTO".parse::<AssayKind>().is_err());
        assert_eq!(AssayKind::Atac.to_string(), "ATAC");
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 0), 0.0);
        assert_eq!(percent(1, 4), 25.0);
    }
}
