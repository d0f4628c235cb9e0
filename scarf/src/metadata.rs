use crate::backend::{
    check_name, AttributeOp, Backend, DatasetOp, GroupOp, ScalarType, WriteConfig,
};
use crate::data::{Column, DynScalar};

use anyhow::{bail, ensure, Context, Result};
use indexmap::IndexSet;
use itertools::Itertools;
use log::debug;
use parking_lot::Mutex;
use polars::prelude::DataFrame;

/// Columns every table carries. They cannot be removed and only `I` may change.
pub const PROTECTED_COLUMNS: [&str; 3] = ["I", "ids", "names"];

/// An attribute table stored column by column inside a group. One row per cell
/// (the cell table) or per feature (an assay's feature table).
pub struct MetaData<B: Backend> {
    group: B::Group,
    n_rows: usize,
    columns: Mutex<IndexSet<String>>,
}

impl<B: Backend> std::fmt::Debug for MetaData<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

impl<B: Backend> std::fmt::Display for MetaData<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MetaData table with {} rows", self.n_rows)?;
        let columns = self.columns.lock();
        if !columns.is_empty() {
            write!(f, "\n    columns: '{}'", columns.iter().join("', '"))?;
        }
        Ok(())
    }
}

impl<B: Backend> MetaData<B> {
    /// Create a table in an empty group. `I` starts all `true`.
    pub fn new(group: B::Group, ids: Vec<String>, names: Vec<String>) -> Result<Self> {
        ensure!(
            ids.len() == names.len(),
            "ids ({}) and names ({}) differ in length",
            ids.len(),
            names.len()
        );
        let unique: IndexSet<&String> = ids.iter().collect();
        ensure!(unique.len() == ids.len(), "ids must be unique");

        let n_rows = ids.len();
        let table = Self {
            group,
            n_rows,
            columns: Mutex::new(IndexSet::new()),
        };
        table.write("I", &Column::Bool(vec![true; n_rows]))?;
        table.write("ids", &Column::String(ids))?;
        table.write("names", &Column::String(names))?;
        Ok(table)
    }

    /// Open a table previously written with [`MetaData::new`].
    pub fn open(group: B::Group) -> Result<Self> {
        let columns: IndexSet<String> = group
            .read_str_list_attr("column-order")?
            .into_iter()
            .collect();
        for name in PROTECTED_COLUMNS {
            ensure!(
                columns.contains(name),
                "table at '{}' has no '{}' column",
                group.path().display(),
                name
            );
        }
        let n_rows = group.open_dataset("ids")?.shape()[0];
        Ok(Self {
            group,
            n_rows,
            columns: Mutex::new(columns),
        })
    }

    pub fn group(&self) -> &B::Group {
        &self.group
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn columns(&self) -> Vec<String> {
        self.columns.lock().iter().cloned().collect()
    }

    pub fn contains(&self, column: &str) -> bool {
        self.columns.lock().contains(column)
    }

    pub fn dtype(&self, column: &str) -> Result<ScalarType> {
        self.check_exists(column)?;
        self.group.open_dataset(column)?.dtype()
    }

    /// Values of `column` for every row.
    pub fn fetch_all(&self, column: &str) -> Result<Column> {
        self.check_exists(column)?;
        self.group
            .read_column(column)
            .with_context(|| format!("cannot read column '{}'", column))
    }

    /// Values of `column` for the rows where `key` is `true`.
    pub fn fetch(&self, column: &str, key: &str) -> Result<Column> {
        let index = self.active_index(key)?;
        Ok(self.fetch_all(column)?.take(&index))
    }

    /// Positions of the rows where the boolean column `key` is `true`.
    pub fn active_index(&self, key: &str) -> Result<Vec<usize>> {
        let mask = self.bool_column(key)?;
        Ok(mask
            .into_iter()
            .enumerate()
            .filter_map(|(i, x)| if x { Some(i) } else { None })
            .collect())
    }

    pub fn ids(&self) -> Result<Vec<String>> {
        self.fetch_all("ids")?.into_vec()
    }

    pub fn names(&self) -> Result<Vec<String>> {
        self.fetch_all("names")?.into_vec()
    }

    /// Insert a column. `values` either covers every row, or only the rows
    /// selected by `key`, in which case the remaining rows get the default fill
    /// of the column type.
    pub fn insert<C: Into<Column>>(
        &self,
        column: &str,
        values: C,
        key: &str,
        overwrite: bool,
    ) -> Result<()> {
        let values = values.into();
        let fill = DynScalar::default_fill(values.dtype());
        self.insert_with_fill(column, values, key, overwrite, fill)
    }

    pub fn insert_with_fill(
        &self,
        column: &str,
        values: Column,
        key: &str,
        overwrite: bool,
        fill: DynScalar,
    ) -> Result<()> {
        check_name(column)?;
        if PROTECTED_COLUMNS.contains(&column) {
            bail!("'{}' is a protected column and cannot be inserted", column);
        }
        if self.contains(column) && !overwrite {
            bail!(
                "column '{}' already exists, set `overwrite` to replace it",
                column
            );
        }
        let values = if values.len() == self.n_rows {
            values
        } else {
            let index = self.active_index(key)?;
            ensure!(
                values.len() == index.len(),
                "column '{}' has {} values, expecting {} (all rows) or {} (rows in '{}')",
                column,
                values.len(),
                self.n_rows,
                index.len(),
                key
            );
            values.scatter(self.n_rows, &index, fill)?
        };
        self.write(column, &values)
    }

    /// Insert every column of a dataframe whose height matches the table.
    pub fn insert_dataframe(&self, df: &DataFrame, key: &str, overwrite: bool) -> Result<()> {
        df.get_columns().iter().try_for_each(|series| {
            let column = Column::try_from(series)?;
            self.insert(series.name(), column, key, overwrite)
        })
    }

    /// Combine `key` with `values` by logical AND. A missing `key` is created
    /// from `values`.
    pub fn update_key(&self, values: &[bool], key: &str) -> Result<()> {
        ensure!(
            values.len() == self.n_rows,
            "expecting {} values to update '{}', found {}",
            self.n_rows,
            key,
            values.len()
        );
        let updated: Vec<bool> = if self.contains(key) {
            self.bool_column(key)?
                .into_iter()
                .zip(values.iter())
                .map(|(a, &b)| a && b)
                .collect()
        } else {
            check_name(key)?;
            values.to_vec()
        };
        let n_active = updated.iter().filter(|x| **x).count();
        debug!("'{}' now selects {} of {} rows", key, n_active, self.n_rows);
        self.write(key, &Column::Bool(updated))
    }

    /// Set every row of `key` to `true`.
    pub fn reset_key(&self, key: &str) -> Result<()> {
        self.bool_column(key)?;
        self.write(key, &Column::Bool(vec![true; self.n_rows]))
    }

    pub fn remove(&self, column: &str) -> Result<()> {
        if PROTECTED_COLUMNS.contains(&column) {
            bail!("'{}' is a protected column and cannot be removed", column);
        }
        self.check_exists(column)?;
        let mut columns = self.columns.lock();
        self.group.delete(column)?;
        columns.shift_remove(column);
        let order: Vec<String> = columns.iter().cloned().collect();
        self.group.write_str_list_attr("column-order", &order)
    }

    /// A mask of the rows whose numeric value in `column` lies in `[min, max]`.
    /// Open bounds are `None`; NaN never passes.
    pub fn sift(&self, column: &str, min: Option<f64>, max: Option<f64>) -> Result<Vec<bool>> {
        let values = self.fetch_all(column)?.to_f64()?;
        let lo = min.unwrap_or(f64::NEG_INFINITY);
        let hi = max.unwrap_or(f64::INFINITY);
        Ok(values.into_iter().map(|x| x >= lo && x <= hi).collect())
    }

    /// Fetch columns as a dataframe. All columns when `columns` is `None`, all
    /// rows when `key` is `None`. `ids` always comes first.
    pub fn to_dataframe(&self, columns: Option<&[&str]>, key: Option<&str>) -> Result<DataFrame> {
        let mut names: IndexSet<String> = IndexSet::new();
        names.insert("ids".to_string());
        match columns {
            Some(cols) => names.extend(cols.iter().map(|x| x.to_string())),
            None => names.extend(self.columns()),
        }
        let index = key.map(|k| self.active_index(k)).transpose()?;
        let series = names
            .iter()
            .map(|name| {
                let column = self.fetch_all(name)?;
                let column = match &index {
                    Some(i) => column.take(i),
                    None => column,
                };
                Ok(column.to_series(name))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(DataFrame::new(series)?)
    }

    /// The first `n` rows of every column.
    pub fn head(&self, n: usize) -> Result<DataFrame> {
        let df = self.to_dataframe(None, None)?;
        Ok(df.head(Some(n)))
    }

    fn bool_column(&self, key: &str) -> Result<Vec<bool>> {
        match self.fetch_all(key)? {
            Column::Bool(x) => Ok(x),
            other => bail!("'{}' is a {} column, expecting bool", key, other.dtype()),
        }
    }

    fn check_exists(&self, column: &str) -> Result<()> {
        ensure!(
            self.contains(column),
            "column '{}' not found in table '{}'",
            column,
            self.group.path().display()
        );
        Ok(())
    }

    fn write(&self, column: &str, values: &Column) -> Result<()> {
        ensure!(
            values.len() == self.n_rows,
            "column '{}' has {} values, expecting {}",
            column,
            values.len(),
            self.n_rows
        );
        self.group
            .write_column(column, values, WriteConfig::default())?;
        // The guard is held until the column order is persisted
        let mut columns = self.columns.lock();
        columns.insert(column.to_string());
        let order: Vec<String> = columns.iter().cloned().collect();
        self.group.write_str_list_attr("column-order", &order)
    }
}
