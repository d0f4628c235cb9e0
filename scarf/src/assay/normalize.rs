use crate::assay::AssayKind;

use anyhow::{ensure, Result};
use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};

/// Per-assay normalization. Methods that look across cells (CLR, TF-IDF) are
/// fitted on the selected cells first, so chunks can be normalized independently.
#[derive(Debug, Clone)]
pub enum Normalizer {
    /// `x / row_total * scale_factor`.
    LibSize(f64),
    /// `log1p(x / f)` with `f` the per-feature geometric mean of `1 + x`.
    Clr(Array1<f64>),
    /// Term frequency times the per-feature inverse document frequency.
    TfIdf(Array1<f64>),
    Identity,
}

impl Normalizer {
    /// Fit the normalizer for `kind` on chunks of raw counts (cells x features).
    pub fn fit<I>(kind: AssayKind, scale_factor: f64, n_features: usize, chunks: I) -> Result<Self>
    where
        I: IntoIterator<Item = Result<Array2<u32>>>,
    {
        let normalizer = match kind {
            AssayKind::Rna => Normalizer::LibSize(scale_factor),
            AssayKind::Generic => Normalizer::Identity,
            AssayKind::Adt => {
                let mut log_sum = Array1::<f64>::zeros(n_features);
                let mut n = 0usize;
                for chunk in chunks {
                    let chunk = chunk?;
                    ensure!(chunk.ncols() == n_features, "chunk width mismatch");
                    n += chunk.nrows();
                    log_sum += &chunk.mapv(|x| (x as f64).ln_1p()).sum_axis(Axis(0));
                }
                let factors = if n == 0 {
                    Array1::ones(n_features)
                } else {
                    log_sum.mapv(|s| (s / n as f64).exp())
                };
                Normalizer::Clr(factors)
            }
            AssayKind::Atac => {
                let mut df = Array1::<f64>::zeros(n_features);
                let mut n = 0usize;
                for chunk in chunks {
                    let chunk = chunk?;
                    ensure!(chunk.ncols() == n_features, "chunk width mismatch");
                    n += chunk.nrows();
                    df += &chunk
                        .mapv(|x| if x > 0 { 1.0 } else { 0.0 })
                        .sum_axis(Axis(0));
                }
                Normalizer::TfIdf(df.mapv(|d| (n as f64 / (1.0 + d)).ln_1p()))
            }
        };
        Ok(normalizer)
    }

    pub fn apply(&self, counts: ArrayView2<'_, u32>) -> Array2<f64> {
        let counts = counts.mapv(|x| x as f64);
        match self {
            Normalizer::LibSize(sf) => lib_size(counts, *sf),
            Normalizer::Clr(factors) => {
                let mut out = counts;
                Zip::from(out.columns_mut())
                    .and(factors)
                    .for_each(|mut col, &f| col.mapv_inplace(|x| (x / f).ln_1p()));
                out
            }
            Normalizer::TfIdf(idf) => {
                let mut out = lib_size(counts, 1.0);
                Zip::from(out.columns_mut())
                    .and(idf)
                    .for_each(|mut col, &w| col.mapv_inplace(|x| x * w));
                out
            }
            Normalizer::Identity => counts,
        }
    }
}

/// Scale every row to sum to `scale_factor`. Empty rows stay zero.
pub fn lib_size(mut counts: Array2<f64>, scale_factor: f64) -> Array2<f64> {
    counts.rows_mut().into_iter().for_each(|mut row| {
        let total = row.sum();
        if total > 0.0 {
            row.mapv_inplace(|x| x / total * scale_factor);
        }
    });
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn assert_close(a: &Array2<f64>, b: &Array2<f64>) {
        assert_eq!(a.shape(), b.shape());
        a.iter()
            .zip(b.iter())
            .for_each(|(x, y)| assert!((x - y).abs() < 1e-9, "{} != {}", x, y));
    }

    #[test]
    fn test_lib_size() {
        let counts = array![[1u32, 3], [0, 0], [5, 5]];
        let norm = Normalizer::fit(AssayKind::Rna, 100.0, 2, Vec::new()).unwrap();
        assert_close(
            &norm.apply(counts.view()),
            &array![[25.0, 75.0], [0.0, 0.0], [50.0, 50.0]],
        );
    }

    #[test]
    fn test_clr() {
        let counts = array![[0u32, 3], [8, 1]];
        let norm = Normalizer::fit(AssayKind::Adt, 1.0, 2, vec![Ok(counts.clone())]).unwrap();
        // geometric means of (1 + x): sqrt(1 * 9) = 3 and sqrt(4 * 2)
        let f0 = 3.0f64;
        let f1 = 8.0f64.sqrt();
        let expected = array![
            [0.0, (3.0 / f1).ln_1p()],
            [(8.0 / f0).ln_1p(), (1.0 / f1).ln_1p()]
        ];
        assert_close(&norm.apply(counts.view()), &expected);
    }

    #[test]
    fn test_tfidf() {
        let counts = array![[1u32, 1], [2, 0]];
        let norm = Normalizer::fit(AssayKind::Atac, 1.0, 2, vec![Ok(counts.clone())]).unwrap();
        let idf0 = (2.0f64 / 3.0).ln_1p();
        let idf1 = (2.0f64 / 2.0).ln_1p();
        let expected = array![[0.5 * idf0, 0.5 * idf1], [idf0, 0.0]];
        assert_close(&norm.apply(counts.view()), &expected);
    }

    #[test]
    fn test_fit_checks_width() {
        let counts = array![[1u32, 1, 1]];
        assert!(Normalizer::fit(AssayKind::Adt, 1.0, 2, vec![Ok(counts)]).is_err());
    }
}
