use matrix_util::dmatrix_util::{pca_svd, PcaOut};
use matrix_util::ndarray_stat::RunningStatistics;
use matrix_util::ndarray_util::dmatrix_to_array2;
use matrix_util::traits::{ConvertMatOps, MatOps};
use matrix_util::utils::{generate_minibatch_intervals, sample_indices};
use morph_beans::annotated::{AnnotatedMatrix, MatrixStore};
use morph_beans::annotations::PcaResult;

use log::info;
use nalgebra::DMatrix;
use ndarray::parallel::prelude::*;
use ndarray::{Array1, Array2, ArrayViewMut2, Axis};

/// Layer holding principal component scores
pub const X_PCA: &str = "X_pca";

/// Rows read and written at a time when scaling a disk-backed `X`
pub const SCALE_BLOCK_ROWS: usize = 10000;

/// Default cap on the number of principal components
pub const DEFAULT_MAX_COMPS: usize = 50;

fn standardize_rows(mut x: ArrayViewMut2<f32>, mu: &Array1<f64>, sd: &Array1<f64>) {
    x.axis_iter_mut(Axis(0)).into_par_iter().for_each(|mut row| {
        for (v, (&m, &s)) in row.iter_mut().zip(mu.iter().zip(sd.iter())) {
            *v = ((*v as f64 - m) / s) as f32;
        }
    });
}

/// z-score each feature of `X` in place with the unbiased standard
/// deviation over finite values. Constant features are only centred.
/// A disk-backed `X` is rewritten block by block.
pub fn scale(matrix: &mut AnnotatedMatrix) -> anyhow::Result<()> {
    let (nrows, ncols) = matrix.shape();
    let blocks = generate_minibatch_intervals(nrows, SCALE_BLOCK_ROWS);

    let mut stat = RunningStatistics::new(ncols);
    for &(lb, ub) in blocks.iter() {
        let block = matrix.x().read_rows(lb..ub)?;
        stat.add_rows(&block.view());
    }
    let mu = stat.mean();
    let sd = stat
        .std(1.0)
        .mapv(|s| if s.is_finite() && s > 0.0 { s } else { 1.0 });

    let store = matrix.x_store_mut();
    if store.is_backed() {
        for &(lb, ub) in blocks.iter() {
            let mut block = store.read_rows(lb..ub)?;
            standardize_rows(block.view_mut(), &mu, &sd);
            store.write_rows(lb, &block)?;
        }
    } else if let MatrixStore::Dense(x) = store {
        standardize_rows(x.view_mut(), &mu, &sd);
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct PcaOptions {
    /// number of components; by default `min(n_obs, n_vars) - 1`,
    /// capped at 50
    pub n_comps: Option<usize>,
}

/// Dimensionality reduction of a column-centred matrix (rows =
/// observations)
pub trait DimReduction {
    fn fit(&self, xx: &DMatrix<f64>, n_comps: usize) -> anyhow::Result<PcaOut>;
}

/// PCA by a thin SVD
pub struct SvdPca;

impl DimReduction for SvdPca {
    fn fit(&self, xx: &DMatrix<f64>, n_comps: usize) -> anyhow::Result<PcaOut> {
        pca_svd(xx, n_comps)
    }
}

/// PCA of `X`; scores go to the `X_pca` layer and the variance
/// explained and axes to `uns.pca`
pub fn pca(matrix: &mut AnnotatedMatrix, opts: &PcaOptions) -> anyhow::Result<()> {
    pca_with(matrix, opts, &SvdPca)
}

/// [`pca`] with another decomposition
pub fn pca_with<D: DimReduction + ?Sized>(
    matrix: &mut AnnotatedMatrix,
    opts: &PcaOptions,
    method: &D,
) -> anyhow::Result<()> {
    let (nobs, nvars) = matrix.shape();
    let min_dim = nobs.min(nvars);
    let n_comps = opts
        .n_comps
        .unwrap_or(if min_dim <= DEFAULT_MAX_COMPS {
            min_dim.saturating_sub(1)
        } else {
            DEFAULT_MAX_COMPS
        })
        .max(1);

    let xx = matrix.dense(None)?.centre_columns().to_dmatrix();
    let out = method.fit(&xx, n_comps)?;
    info!(
        "PCA: {} components explain {:.3} of the variance",
        out.variance.len(),
        out.variance_ratio.sum()
    );

    let (kk, dd) = out.components.shape();
    let result = PcaResult {
        variance: Array1::from_iter(out.variance.iter().copied()),
        variance_ratio: Array1::from_iter(out.variance_ratio.iter().copied()),
        components: Array2::from_shape_fn((kk, dd), |(k, j)| out.components[(k, j)]),
    };

    matrix.set_layer(X_PCA, dmatrix_to_array2(&out.scores))?;
    matrix.uns_mut().pca = Some(result);
    Ok(())
}

/// Drop features, then observations, whose fraction of non-finite
/// values exceeds the given threshold. Returns the number of dropped
/// `(features, observations)`.
///
/// * `feature_threshold` - tolerated fraction per feature
/// * `cell_threshold` - tolerated fraction per observation, counted
///   over the remaining features
pub fn drop_na(
    matrix: &mut AnnotatedMatrix,
    feature_threshold: f64,
    cell_threshold: f64,
) -> anyhow::Result<(usize, usize)> {
    anyhow::ensure!(
        (0.0..=1.0).contains(&feature_threshold) && (0.0..=1.0).contains(&cell_threshold),
        "thresholds must be between 0 and 1"
    );
    let (nobs, nvars) = matrix.shape();
    if nobs == 0 || nvars == 0 {
        return Ok((0, 0));
    }

    let missing = matrix
        .dense(None)?
        .mapv(|v| if v.is_finite() { 0.0_f64 } else { 1.0 });

    let col_frac = missing.sum_axis(Axis(0)) / nobs as f64;
    let keep_vars: Vec<usize> = (0..nvars)
        .filter(|&j| col_frac[j] <= feature_threshold)
        .collect();

    let keep_obs: Vec<usize> = if keep_vars.is_empty() {
        (0..nobs).collect()
    } else {
        let row_frac = missing.select(Axis(1), &keep_vars).sum_axis(Axis(1)) / keep_vars.len() as f64;
        (0..nobs).filter(|&i| row_frac[i] <= cell_threshold).collect()
    };

    let ndrop_vars = nvars - keep_vars.len();
    let ndrop_obs = nobs - keep_obs.len();
    if ndrop_vars > 0 {
        matrix.subset_vars(&keep_vars)?;
    }
    if ndrop_obs > 0 {
        matrix.subset_obs(&keep_obs)?;
    }
    if ndrop_vars + ndrop_obs > 0 {
        info!(
            "dropped {} features and {} observations with missing values",
            ndrop_vars, ndrop_obs
        );
    }
    Ok((ndrop_vars, ndrop_obs))
}

/// How many observations to keep
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleSize {
    Fraction(f64),
    Count(usize),
}

/// Sorted random observation indices
pub fn subsample_indices(nobs: usize, size: SampleSize, seed: Option<u64>) -> anyhow::Result<Vec<usize>> {
    let ntarget = match size {
        SampleSize::Fraction(f) => {
            anyhow::ensure!(f > 0.0 && f <= 1.0, "fraction must be in (0, 1], got {}", f);
            (f * nobs as f64).floor() as usize
        }
        SampleSize::Count(n) => {
            anyhow::ensure!(n <= nobs, "cannot sample {} of {} observations", n, nobs);
            n
        }
    };
    Ok(sample_indices(nobs, ntarget, seed))
}

/// Keep a random subset of observations in place
pub fn subsample(matrix: &mut AnnotatedMatrix, size: SampleSize, seed: Option<u64>) -> anyhow::Result<()> {
    let keep = subsample_indices(matrix.n_obs(), size, seed)?;
    matrix.subset_obs(&keep)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use morph_beans::annotated::assemble;
    use morph_beans::meta_table::MetaTable;

    fn toy(x: Array2<f32>) -> anyhow::Result<AnnotatedMatrix> {
        let names = (0..x.ncols()).map(|j| format!("f{}", j).into_boxed_str()).collect();
        assemble(MetaTable::empty(x.nrows()), x, names, "_")
    }

    #[test]
    fn scale_gives_unit_sd() -> anyhow::Result<()> {
        let mut m = toy(ndarray::array![[1.0, 5.0], [2.0, 5.0], [3.0, 5.0]])?;
        scale(&mut m)?;
        let x = m.dense(None)?;
        assert_abs_diff_eq!(x[(0, 0)], -1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(x[(2, 0)], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(x[(1, 1)], 0.0, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn pca_fills_layer_and_uns() -> anyhow::Result<()> {
        let mut m = toy(ndarray::array![[1.0, 2.0, 0.0], [2.0, 4.1, 1.0], [3.0, 6.0, 0.0], [4.0, 8.2, 1.0]])?;
        pca(&mut m, &PcaOptions::default())?;
        let scores = m.layer(X_PCA).ok_or(anyhow::anyhow!("no scores"))?;
        assert_eq!(scores.dim(), (4, 2));
        let res = m.uns().pca.as_ref().ok_or(anyhow::anyhow!("no pca"))?;
        assert!(res.variance_ratio[0] > 0.9);
        assert!(res.variance_ratio.sum() <= 1.0 + 1e-9);
        Ok(())
    }

    #[test]
    fn drop_na_features_then_cells() -> anyhow::Result<()> {
        let nan = f32::NAN;
        let mut m = toy(ndarray::array![[1.0, nan, 1.0], [2.0, nan, nan], [3.0, 1.0, 1.0]])?;
        let dropped = drop_na(&mut m, 0.5, 0.0)?;
        assert_eq!(dropped, (1, 1));
        assert_eq!(m.shape(), (2, 2));
        Ok(())
    }

    #[test]
    fn subsample_is_seeded() -> anyhow::Result<()> {
        let a = subsample_indices(100, SampleSize::Fraction(0.1), Some(7))?;
        let b = subsample_indices(100, SampleSize::Fraction(0.1), Some(7))?;
        assert_eq!(a.len(), 10);
        assert_eq!(a, b);
        assert!(subsample_indices(5, SampleSize::Count(6), None).is_err());
        Ok(())
    }
}
