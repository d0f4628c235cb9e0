use crate::assay::Assay;
use crate::backend::{Backend, DatasetOp, GroupOp, ScalarType, WriteConfig};
use crate::data::{Column, DynScalar};
use crate::datastore::{DataStore, CELL_DATA};
use crate::metadata::{MetaData, PROTECTED_COLUMNS};

use anyhow::{bail, ensure, Context, Result};
use indexmap::{IndexMap, IndexSet};
use itertools::Itertools;
use log::{info, warn};
use ndarray::Array2;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinType {
    /// Features present in every input.
    Inner,
    /// Features present in any input.
    #[default]
    Outer,
}

#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Delete an existing output store instead of adding the assay to it.
    pub overwrite: bool,
    pub join: JoinType,
    /// Separates the input name from the original cell id.
    pub delimiter: String,
    /// Prefix of the carried over cell columns.
    pub prepend_text: String,
    /// Set `I` to all `true` in the output. Otherwise `I` of the inputs is kept.
    pub reset_cell_filter: bool,
    /// Cell column recording the input each cell comes from.
    pub label: String,
    /// Number of cells copied at a time.
    pub chunk_rows: usize,
    pub write_config: WriteConfig,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            overwrite: false,
            join: JoinType::Outer,
            delimiter: "__".to_string(),
            prepend_text: "orig".to_string(),
            reset_cell_filter: true,
            label: "sample_id".to_string(),
            chunk_rows: 1000,
            write_config: WriteConfig::default(),
        }
    }
}

/// Merge one assay of each input store into the assay `merge_assay_name` of
/// the store at `out`. Cell ids are prefixed with the input names. Derived
/// data (normalization, statistics, feature columns) is not carried over.
///
/// When `out` exists and `config.overwrite` is unset, the assay is added to it.
/// This requires its cells to be exactly the merged cells, in order.
pub fn merge<B, P>(
    inputs: &[(&DataStore<B>, &str)],
    names: &[&str],
    out: P,
    merge_assay_name: &str,
    config: &MergeConfig,
) -> Result<()>
where
    B: Backend,
    P: AsRef<Path>,
{
    let out = out.as_ref();
    check_names(inputs.len(), names, &config.delimiter)?;
    let assays = inputs
        .iter()
        .map(|(ds, name)| ds.assay(name))
        .collect::<Result<Vec<_>>>()?;

    let kind = assays[0].kind();
    assays
        .iter()
        .zip(names)
        .filter(|(a, _)| a.kind() != kind)
        .for_each(|(a, n)| {
            warn!(
                "assay '{}' of '{}' is {}, the merged assay will be {}",
                a.name(),
                n,
                a.kind(),
                kind
            )
        });

    let (cell_ids, cell_names) = merged_cells(inputs, names, &config.delimiter)?;
    let features = merged_features(&assays, config.join)?;
    ensure!(!features.is_empty(), "the inputs share no features");
    info!(
        "merging {} inputs into {} cells and {} features",
        inputs.len(),
        cell_ids.len(),
        features.len()
    );

    let store = if B::exists(out) {
        if config.overwrite {
            B::remove(out)?;
            B::create(out)?
        } else {
            let store = B::open(out)?;
            let cells = MetaData::<B>::open(store.open_group(CELL_DATA)?)?;
            ensure!(
                cells.ids()? == cell_ids,
                "cells of '{}' differ from the merged cells, set `overwrite` to replace the store",
                out.display()
            );
            ensure!(
                !store.exists(merge_assay_name)?,
                "assay '{}' already exists in '{}'",
                merge_assay_name,
                out.display()
            );
            info!("adding assay '{}' to '{}'", merge_assay_name, out.display());
            store
        }
    } else {
        B::create(out)?
    };

    if !store.exists(CELL_DATA)? {
        let cells = MetaData::<B>::new(store.create_group(CELL_DATA)?, cell_ids, cell_names)?;
        write_cell_columns(&cells, inputs, names, config)?;
    }

    let (feat_ids, feat_names): (Vec<String>, Vec<String>) = features.into_iter().unzip();
    let feat_index: IndexSet<&String> = feat_ids.iter().collect();
    let n_cells: usize = assays.iter().map(|a| a.n_cells()).sum();
    let n_features = feat_ids.len();
    let targets = assays
        .iter()
        .map(|a| {
            Ok(a.feats()
                .ids()?
                .iter()
                .map(|id| feat_index.get_index_of(id))
                .collect::<Vec<_>>())
        })
        .collect::<Result<Vec<_>>>()?;
    let counts = Assay::<B>::create(
        &store,
        merge_assay_name,
        kind,
        feat_ids.clone(),
        feat_names,
        n_cells,
        config.write_config.clone(),
    )?;

    let mut offset = 0;
    for ((assay, target), name) in assays.iter().zip(targets.iter()).zip(names) {
        let rows: Vec<usize> = (0..assay.n_cells()).collect();
        for chunk in assay.iter_count_chunks(&rows, config.chunk_rows) {
            let chunk = chunk?;
            let mut remapped = Array2::<u32>::zeros((chunk.nrows(), n_features));
            for (j, t) in target.iter().enumerate() {
                if let Some(t) = t {
                    remapped.column_mut(*t).assign(&chunk.column(j));
                }
            }
            counts.write_array_slice(remapped.view().into_dyn(), &[offset, 0])?;
            offset += chunk.nrows();
        }
        info!("copied {} cells of '{}'", assay.n_cells(), name);
    }
    Ok(())
}

fn check_names(n_inputs: usize, names: &[&str], delimiter: &str) -> Result<()> {
    ensure!(n_inputs > 0, "nothing to merge");
    ensure!(
        names.len() == n_inputs,
        "expecting {} names, found {}",
        n_inputs,
        names.len()
    );
    ensure!(names.iter().all_unique(), "names must be unique");
    if let Some(x) = names.iter().find(|x| x.is_empty() || x.contains(delimiter)) {
        bail!("invalid name '{}': must be non-empty and not contain '{}'", x, delimiter);
    }
    Ok(())
}

fn merged_cells<B: Backend>(
    inputs: &[(&DataStore<B>, &str)],
    names: &[&str],
    delimiter: &str,
) -> Result<(Vec<String>, Vec<String>)> {
    let mut ids = Vec::new();
    let mut cell_names = Vec::new();
    for ((ds, _), name) in inputs.iter().zip(names) {
        let prefix = |x: String| format!("{}{}{}", name, delimiter, x);
        ids.extend(ds.cells().ids()?.into_iter().map(prefix));
        cell_names.extend(ds.cells().names()?.into_iter().map(prefix));
    }
    Ok((ids, cell_names))
}

/// Ordered feature ids mapped to their names, taken from the first input that
/// carries each id.
fn merged_features<B: Backend>(
    assays: &[&Assay<B>],
    join: JoinType,
) -> Result<IndexMap<String, String>> {
    let tables = assays
        .iter()
        .map(|a| {
            let ids = a.feats().ids()?;
            let names = a.feats().names()?;
            Ok(ids.into_iter().zip(names).collect::<IndexMap<_, _>>())
        })
        .collect::<Result<Vec<_>>>()?;
    let mut merged = IndexMap::new();
    match join {
        JoinType::Outer => tables.iter().for_each(|t| {
            t.iter().for_each(|(id, name)| {
                merged.entry(id.clone()).or_insert_with(|| name.clone());
            })
        }),
        JoinType::Inner => {
            if let Some((first, rest)) = tables.split_first() {
                first
                    .iter()
                    .filter(|(id, _)| rest.iter().all(|t| t.contains_key(*id)))
                    .for_each(|(id, name)| {
                        merged.insert(id.clone(), name.clone());
                    });
            }
        }
    }
    Ok(merged)
}

/// Carry the cell columns of the inputs over as `<prepend_text>_<column>` and
/// record the input names in the label column.
fn write_cell_columns<B: Backend>(
    cells: &MetaData<B>,
    inputs: &[(&DataStore<B>, &str)],
    names: &[&str],
    config: &MergeConfig,
) -> Result<()> {
    let columns: IndexSet<String> = inputs
        .iter()
        .flat_map(|(ds, _)| ds.cells().columns())
        .filter(|x| x != "ids" && x != "names")
        .collect();
    for column in columns.iter() {
        let dtypes = inputs
            .iter()
            .filter(|(ds, _)| ds.cells().contains(column))
            .map(|(ds, _)| ds.cells().dtype(column))
            .collect::<Result<IndexSet<_>>>()?;
        let dtype = match dtypes.len() {
            1 => dtypes[0],
            _ if dtypes.iter().all(|x| x.is_numeric()) => ScalarType::F64,
            _ => {
                warn!("cell column '{}' has mixed types and is not merged", column);
                continue;
            }
        };
        let fill = DynScalar::default_fill(dtype);
        let parts = inputs
            .iter()
            .map(|(ds, _)| {
                let n = ds.cells().n_rows();
                if !ds.cells().contains(column) {
                    return Column::filled(dtype, n, fill.clone());
                }
                let values = ds.cells().fetch_all(column)?;
                if values.dtype() == dtype {
                    Ok(values)
                } else {
                    Ok(Column::F64(values.to_f64()?))
                }
            })
            .collect::<Result<Vec<_>>>()?;
        let merged = Column::concat(parts)?;
        let name = format!("{}_{}", config.prepend_text, column);
        if !config.reset_cell_filter && column == "I" {
            let flags: Vec<bool> = merged.clone().into_vec()?;
            cells.update_key(&flags, "I")?;
        }
        cells
            .insert(&name, merged, "I", true)
            .with_context(|| format!("cannot write cell column '{}'", name))?;
    }

    ensure!(
        !PROTECTED_COLUMNS.contains(&config.label.as_str()),
        "'{}' cannot be used as the label column",
        config.label
    );
    let labels: Vec<String> = inputs
        .iter()
        .zip(names)
        .flat_map(|((ds, _), name)| std::iter::repeat(name.to_string()).take(ds.cells().n_rows()))
        .collect();
    cells.insert(&config.label, labels, "I", true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_names() {
        assert!(check_names(2, &["a", "b"], "__").is_ok());
        assert!(check_names(2, &["a"], "__").is_err());
        assert!(check_names(2, &["a", "a"], "__").is_err());
        assert!(check_names(2, &["a", "b__c"], "__").is_err());
        assert!(check_names(1, &[""], "__").is_err());
        assert!(check_names(0, &[], "__").is_err());
    }
}
