use crate::assay::{Assay, HvgConfig};
use crate::backend::{AttrValue, AttributeOp, Backend, GroupOp, StoreOp};
use crate::bio_data::{G2M_PHASE_GENES, S_PHASE_GENES};
use crate::data::Column;
use crate::metadata::MetaData;

use anyhow::{bail, ensure, Context, Result};
use indexmap::IndexMap;
use itertools::Itertools;
use log::{info, warn};
use ndarray::Axis;
use rayon::ThreadPool;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Name of the group holding the cell table.
pub const CELL_DATA: &str = "cellData";

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Number of threads used for chunk-parallel work.
    pub nthreads: usize,
    /// Assay used when none is named. Must exist in the store.
    pub default_assay: Option<String>,
    /// Cells of the default assay with fewer detected features are excluded
    /// when its cell statistics are first computed.
    pub min_features_per_cell: usize,
    pub mito_pattern: String,
    pub ribo_pattern: Vec<String>,
    /// Number of cells read per block.
    pub chunk_rows: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            nthreads: 2,
            default_assay: None,
            min_features_per_cell: 10,
            mito_pattern: "MT-".to_string(),
            ribo_pattern: vec!["RPS".to_string(), "RPL".to_string()],
            chunk_rows: 1000,
        }
    }
}

/// An opened store: the shared cell table and every assay in it.
pub struct DataStore<B: Backend> {
    file: B::Store,
    cells: MetaData<B>,
    assays: IndexMap<String, Assay<B>>,
    default_assay: String,
    pool: Arc<ThreadPool>,
    config: StoreConfig,
}

impl<B: Backend> std::fmt::Debug for DataStore<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

impl<B: Backend> std::fmt::Display for DataStore<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "DataStore with {} cells backed at '{}'",
            self.cells.n_rows(),
            self.file.filename().display()
        )?;
        write!(f, "\n    default assay: '{}'", self.default_assay)?;
        for assay in self.assays.values() {
            write!(f, "\n    {}", assay)?;
        }
        write!(f, "\n    cell columns: '{}'", self.cells.columns().join("', '"))
    }
}

impl<B: Backend> DataStore<B> {
    pub fn open<P: AsRef<Path>>(path: P, config: StoreConfig) -> Result<Self> {
        let file = B::open(path.as_ref())
            .with_context(|| format!("cannot open store '{}'", path.as_ref().display()))?;
        Self::from_store(file, config)
    }

    pub fn from_store(file: B::Store, config: StoreConfig) -> Result<Self> {
        let pool = Arc::new(
            rayon::ThreadPoolBuilder::new()
                .num_threads(config.nthreads.max(1))
                .build()?,
        );
        let cells = MetaData::open(file.open_group(CELL_DATA)?)
            .with_context(|| format!("cannot open '{}'", CELL_DATA))?;

        let mut assays = IndexMap::new();
        for name in file.list()? {
            if !file.is_group(&name)? || name == CELL_DATA {
                continue;
            }
            let group = file.open_group(&name)?;
            if !group.read_bool_attr("is_assay")? {
                continue;
            }
            let assay = Assay::open(&name, group, pool.clone(), config.chunk_rows)
                .with_context(|| format!("cannot open assay '{}'", name))?;
            ensure!(
                assay.n_cells() == cells.n_rows(),
                "assay '{}' has {} cells, the cell table has {}",
                name,
                assay.n_cells(),
                cells.n_rows()
            );
            assays.insert(name, assay);
        }
        if assays.is_empty() {
            bail!("no assay found in '{}'", file.filename().display());
        }

        let default_assay = resolve_default_assay(&file, &assays, config.default_assay.as_deref())?;
        file.write_str_attr("defaultAssay", &default_assay)?;

        let store = Self {
            file,
            cells,
            assays,
            default_assay,
            pool,
            config,
        };
        store.init_cell_stats()?;
        info!("{}", store);
        Ok(store)
    }

    pub fn filename(&self) -> PathBuf {
        self.file.filename()
    }

    pub fn store(&self) -> &B::Store {
        &self.file
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ThreadPool> {
        &self.pool
    }

    pub fn cells(&self) -> &MetaData<B> {
        &self.cells
    }

    pub fn assay_names(&self) -> Vec<String> {
        self.assays.keys().cloned().collect()
    }

    pub fn assay(&self, name: &str) -> Result<&Assay<B>> {
        match self.assays.get(name) {
            Some(x) => Ok(x),
            None => bail!(
                "assay '{}' not found, available: '{}'",
                name,
                self.assays.keys().join("', '")
            ),
        }
    }

    pub fn assay_mut(&mut self, name: &str) -> Result<&mut Assay<B>> {
        let available = self.assays.keys().join("', '");
        match self.assays.get_mut(name) {
            Some(x) => Ok(x),
            None => bail!("assay '{}' not found, available: '{}'", name, available),
        }
    }

    pub fn default_assay_name(&self) -> &str {
        &self.default_assay
    }

    pub fn default_assay(&self) -> Result<&Assay<B>> {
        self.assay(&self.default_assay)
    }

    /// Restrict `I` to the cells whose value of each attribute lies within
    /// the matching bounds. `None` bounds are open.
    pub fn filter_cells(
        &self,
        attrs: &[&str],
        lows: &[Option<f64>],
        highs: &[Option<f64>],
        reset_previous: bool,
    ) -> Result<()> {
        ensure!(
            attrs.len() == lows.len() && attrs.len() == highs.len(),
            "expecting one lower and one upper bound per attribute"
        );
        if reset_previous {
            self.cells.reset_key("I")?;
        }
        for ((attr, low), high) in attrs.iter().zip(lows).zip(highs) {
            let mask = self.cells.sift(attr, *low, *high)?;
            let before = self.cells.active_index("I")?.len();
            self.cells.update_key(&mask, "I")?;
            let after = self.cells.active_index("I")?.len();
            info!(
                "{} cells flagged for filtering out using attribute '{}'",
                before - after,
                attr
            );
        }
        Ok(())
    }

    /// Like [`DataStore::filter_cells`], with bounds taken at the `min_p` and
    /// `max_p` percentiles of each attribute across the included cells.
    pub fn auto_filter_cells(&self, attrs: &[&str], min_p: f64, max_p: f64) -> Result<()> {
        ensure!(
            min_p <= max_p,
            "lower percentile {} exceeds upper percentile {}",
            min_p,
            max_p
        );
        let mut lows = Vec::with_capacity(attrs.len());
        let mut highs = Vec::with_capacity(attrs.len());
        for attr in attrs {
            let mut values: Vec<f64> = self
                .cells
                .fetch(attr, "I")?
                .to_f64()?
                .into_iter()
                .filter(|x| !x.is_nan())
                .collect();
            values.sort_by(|a, b| a.total_cmp(b));
            lows.push(percentile(&values, min_p));
            highs.push(percentile(&values, max_p));
        }
        self.filter_cells(attrs, &lows, &highs, false)
    }

    pub fn mark_hvgs(&self, assay: &str, cell_key: &str, config: &HvgConfig) -> Result<usize> {
        self.assay(assay)?.mark_hvgs(&self.cells, cell_key, config)
    }

    /// Score the cells active in `cell_key` for the S and G2/M phases: the mean
    /// normalized expression of the phase genes minus the mean over every
    /// active feature. Default gene lists are used when `None`.
    pub fn score_cell_cycle(
        &self,
        assay: &str,
        cell_key: &str,
        s_genes: Option<&[&str]>,
        g2m_genes: Option<&[&str]>,
    ) -> Result<()> {
        let assay = self.assay(assay)?;
        let rows = self.cells.active_index(cell_key)?;
        let feat_index = assay.feats().active_index("I")?;
        let names: Vec<String> = assay.feats().names()?;

        let locate = |genes: &[&str], phase: &str| -> Result<Vec<usize>> {
            let genes: Vec<String> = genes.iter().map(|x| x.to_uppercase()).collect();
            let found: Vec<usize> = feat_index
                .iter()
                .enumerate()
                .filter(|(_, j)| genes.contains(&names[**j].to_uppercase()))
                .map(|(k, _)| k)
                .collect();
            ensure!(
                !found.is_empty(),
                "none of the {} phase genes found among the active features of '{}'",
                phase,
                assay.name()
            );
            Ok(found)
        };
        let s_idx = locate(s_genes.unwrap_or(S_PHASE_GENES), "S")?;
        let g2m_idx = locate(g2m_genes.unwrap_or(G2M_PHASE_GENES), "G2M")?;

        let normalizer = assay.normalizer(&rows)?;
        let mut s_scores = Vec::with_capacity(rows.len());
        let mut g2m_scores = Vec::with_capacity(rows.len());
        for chunk in assay.iter_count_chunks(&rows, assay.chunk_rows()) {
            let normed = normalizer.apply(chunk?.view()).select(Axis(1), &feat_index);
            for row in normed.outer_iter() {
                let background = row.mean().unwrap_or(0.0);
                let s = s_idx.iter().map(|&k| row[k]).sum::<f64>() / s_idx.len() as f64;
                let g2m = g2m_idx.iter().map(|&k| row[k]).sum::<f64>() / g2m_idx.len() as f64;
                s_scores.push(s - background);
                g2m_scores.push(g2m - background);
            }
        }
        let phases: Vec<String> = s_scores
            .iter()
            .zip(g2m_scores.iter())
            .map(|(&s, &g2m)| cell_cycle_phase(s, g2m).to_string())
            .collect();

        self.cells
            .insert(&format!("{}__S_score", cell_key), s_scores, cell_key, true)?;
        self.cells
            .insert(&format!("{}__G2M_score", cell_key), g2m_scores, cell_key, true)?;
        self.cells
            .insert(&format!("{}__phase", cell_key), Column::String(phases), cell_key, true)?;
        Ok(())
    }

    fn init_cell_stats(&self) -> Result<()> {
        let ribo: Vec<&str> = self.config.ribo_pattern.iter().map(|x| x.as_str()).collect();
        for (name, assay) in self.assays.iter() {
            let n_counts = format!("{}_nCounts", name);
            if self.cells.contains(&n_counts) {
                continue;
            }
            info!("computing cell statistics of assay '{}'", name);
            let stats = assay.cell_stats(&self.config.mito_pattern, &ribo)?;
            let n_features = stats.n_features.clone();
            self.cells.insert(&n_counts, stats.n_counts, "I", true)?;
            self.cells
                .insert(&format!("{}_nFeatures", name), stats.n_features, "I", true)?;
            if let Some(x) = stats.percent_mito {
                self.cells
                    .insert(&format!("{}_percentMito", name), x, "I", true)?;
            }
            if let Some(x) = stats.percent_ribo {
                self.cells
                    .insert(&format!("{}_percentRibo", name), x, "I", true)?;
            }
            if *name == self.default_assay {
                let min = self.config.min_features_per_cell as i64;
                let mask: Vec<bool> = n_features.iter().map(|&x| x >= min).collect();
                let n_removed = mask.iter().filter(|x| !**x).count();
                self.cells.update_key(&mask, "I")?;
                if n_removed > 0 {
                    info!(
                        "{} cells with fewer than {} features flagged for filtering out",
                        n_removed, min
                    );
                }
            }
        }
        Ok(())
    }
}

fn resolve_default_assay<B: Backend>(
    file: &B::Store,
    assays: &IndexMap<String, Assay<B>>,
    requested: Option<&str>,
) -> Result<String> {
    if let Some(name) = requested {
        ensure!(
            assays.contains_key(name),
            "default assay '{}' not found, available: '{}'",
            name,
            assays.keys().join("', '")
        );
        return Ok(name.to_string());
    }
    if let Some(AttrValue::Str(name)) = file.read_attr("defaultAssay")? {
        if assays.contains_key(&name) {
            return Ok(name);
        }
        warn!("persisted default assay '{}' is not in the store", name);
    }
    if assays.contains_key("RNA") {
        return Ok("RNA".to_string());
    }
    match assays.keys().next() {
        Some(name) => {
            warn!("no default assay given, using '{}'", name);
            Ok(name.clone())
        }
        None => bail!("no assay found"),
    }
}

/// `G1` when both scores are negative, else the phase with the larger score.
pub fn cell_cycle_phase(s_score: f64, g2m_score: f64) -> &'static str {
    if s_score < 0.0 && g2m_score < 0.0 {
        "G1"
    } else if s_score >= g2m_score {
        "S"
    } else {
        "G2M"
    }
}

/// Linearly interpolated percentile of sorted values, `None` when empty.
fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = num::clamp(p, 0.0, 100.0) / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&values, 0.0), Some(1.0));
        assert_eq!(percentile(&values, 100.0), Some(5.0));
        assert_eq!(percentile(&values, 50.0), Some(3.0));
        assert_eq!(percentile(&values, 12.5), Some(1.5));
        assert_eq!(percentile(&values, 150.0), Some(5.0));
        assert_eq!(percentile(&[], 50.0), None);
    }

    #[test]
    fn test_cell_cycle_phase() {
        assert_eq!(cell_cycle_phase(-0.1, -0.2), "G1");
        assert_eq!(cell_cycle_phase(0.3, 0.1), "S");
        assert_eq!(cell_cycle_phase(-0.3, 0.1), "G2M");
    }
}
