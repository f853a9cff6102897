pub use nalgebra::{DMatrix, DVector};

/// Sample covariance of `xx` (rows = observations, columns =
/// variables) with `n - 1` in the denominator. Every entry is `NaN`
/// if there are fewer than two rows.
pub fn covariance(xx: &DMatrix<f64>) -> DMatrix<f64> {
    let (nn, dd) = xx.shape();
    if nn < 2 {
        return DMatrix::from_element(dd, dd, f64::NAN);
    }
    let mu = xx.row_mean();
    let mut centred = xx.clone();
    for mut row in centred.row_iter_mut() {
        row -= &mu;
    }
    (centred.transpose() * &centred) / ((nn - 1) as f64)
}

/// Column means of `xx` as a column vector
pub fn column_means(xx: &DMatrix<f64>) -> DVector<f64> {
    xx.row_mean().transpose()
}

/// Invert a covariance matrix, returning `None` if it contains
/// non-finite values or is numerically singular (reciprocal
/// condition number below `dim * EPSILON`)
pub fn try_inverse_covariance(cov: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    if cov.nrows() == 0 || cov.iter().any(|x| !x.is_finite()) {
        return None;
    }
    let sv = cov.singular_values();
    let smax = sv.max();
    let smin = sv.min();
    let tol = (cov.nrows() as f64) * f64::EPSILON;
    if smax <= 0.0 || smin / smax < tol {
        return None;
    }
    cov.clone().try_inverse()
}

/// Mahalanobis distance `sqrt((u - v)' VI (u - v))`
pub fn mahalanobis(uu: &DVector<f64>, vv: &DVector<f64>, vi: &DMatrix<f64>) -> f64 {
    let delta = uu - vv;
    let quad = (delta.transpose() * vi * &delta)[(0, 0)];
    quad.max(0.0).sqrt()
}

/// Principal components of a centred matrix
pub struct PcaOut {
    /// `n x k` coordinates of the observations
    pub scores: DMatrix<f64>,
    /// `k x p` principal axes
    pub components: DMatrix<f64>,
    /// variance explained by each component
    pub variance: DVector<f64>,
    /// fraction of the total variance explained by each component
    pub variance_ratio: DVector<f64>,
}

/// PCA by a thin SVD of `xx` (rows = observations). `xx` is
/// expected to be column-centred already. Components are sorted by
/// decreasing variance and at most `max_comps` are kept.
pub fn pca_svd(xx: &DMatrix<f64>, max_comps: usize) -> anyhow::Result<PcaOut> {
    let (nn, dd) = xx.shape();
    anyhow::ensure!(nn > 1, "PCA needs at least two observations, got {}", nn);
    anyhow::ensure!(dd > 0, "PCA needs at least one variable");
    anyhow::ensure!(
        xx.iter().all(|x| x.is_finite()),
        "PCA input contains non-finite values"
    );

    let svd = xx.clone().svd(true, true);
    let uu = svd.u.ok_or(anyhow::anyhow!("SVD failed to return U"))?;
    let vt = svd.v_t.ok_or(anyhow::anyhow!("SVD failed to return V'"))?;
    let sv = svd.singular_values;

    let mut order: Vec<usize> = (0..sv.len()).collect();
    order.sort_by(|&a, &b| sv[b].total_cmp(&sv[a]));

    let denom = (nn - 1) as f64;
    let total: f64 = sv.iter().map(|s| s * s / denom).sum();
    let kk = max_comps.min(sv.len()).max(1);

    let mut scores = DMatrix::<f64>::zeros(nn, kk);
    let mut components = DMatrix::<f64>::zeros(kk, dd);
    let mut variance = DVector::<f64>::zeros(kk);

    for (k, &r) in order.iter().take(kk).enumerate() {
        let s = sv[r];
        scores.set_column(k, &(uu.column(r) * s));
        components.set_row(k, &vt.row(r));
        variance[k] = s * s / denom;
    }

    let variance_ratio = if total > 0.0 {
        &variance / total
    } else {
        DVector::from_element(kk, f64::NAN)
    };

    Ok(PcaOut {
        scores,
        components,
        variance,
        variance_ratio,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn covariance_of_two_columns() {
        let xx = DMatrix::from_row_slice(3, 2, &[1.0, 2.0, 2.0, 4.0, 3.0, 6.0]);
        let cov = covariance(&xx);
        assert_abs_diff_eq!(cov[(0, 0)], 1.0);
        assert_abs_diff_eq!(cov[(1, 1)], 4.0);
        assert_abs_diff_eq!(cov[(0, 1)], 2.0);
        // perfectly collinear
        assert!(try_inverse_covariance(&cov).is_none());
    }

    #[test]
    fn single_row_covariance_is_not_invertible() {
        let xx = DMatrix::from_row_slice(1, 2, &[1.0, 2.0]);
        assert!(try_inverse_covariance(&covariance(&xx)).is_none());
    }

    #[test]
    fn mahalanobis_with_identity_is_euclidean() {
        let u = DVector::from_vec(vec![0.0, 0.0]);
        let v = DVector::from_vec(vec![3.0, 4.0]);
        let vi = DMatrix::<f64>::identity(2, 2);
        assert_abs_diff_eq!(mahalanobis(&u, &v, &vi), 5.0);
    }

    #[test]
    fn pca_ratios_sum_to_one() -> anyhow::Result<()> {
        let mut xx = DMatrix::from_row_slice(
            4,
            3,
            &[1.0, 0.5, 2.0, 2.0, 1.0, 1.0, 3.0, 2.5, 0.0, 4.0, 3.0, 5.0],
        );
        let mu = xx.row_mean();
        for mut row in xx.row_iter_mut() {
            row -= &mu;
        }
        let out = pca_svd(&xx, 10)?;
        assert_eq!(out.scores.ncols(), 3);
        assert_abs_diff_eq!(out.variance_ratio.sum(), 1.0, epsilon = 1e-10);
        assert!(out.variance[0] >= out.variance[1]);
        Ok(())
    }
}
