use matrix_util::ndarray_stat::{mean, variance};
use statrs::distribution::{ContinuousCDF, StudentsT};

/// Two-sided Welch's t-test of `mean(a) - mean(b)` with
/// Welch–Satterthwaite degrees of freedom. Returns `(t, p)`; any
/// `NaN` input, or fewer than two values on a side, gives `NaN`.
pub fn welch_ttest(a: &[f64], b: &[f64]) -> (f64, f64) {
    if a.iter().chain(b.iter()).any(|x| x.is_nan()) {
        return (f64::NAN, f64::NAN);
    }
    let (na, nb) = (a.len() as f64, b.len() as f64);
    let va = variance(a, 1) / na;
    let vb = variance(b, 1) / nb;
    let se2 = va + vb;

    let t = (mean(a) - mean(b)) / se2.sqrt();
    let df = se2 * se2 / (va * va / (na - 1.0) + vb * vb / (nb - 1.0));

    if t.is_nan() || !df.is_finite() {
        return (t, f64::NAN);
    }
    if t.is_infinite() {
        return (t, 0.0);
    }

    let p = match StudentsT::new(0.0, 1.0, df) {
        Ok(dist) => (2.0 * dist.sf(t.abs())).min(1.0),
        Err(_) => f64::NAN,
    };
    (t, p)
}

/// Benjamini–Hochberg q-values. `NaN` p-values stay `NaN` and do not
/// count towards the number of tests.
pub fn fdr_bh(pvalues: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..pvalues.len())
        .filter(|&i| !pvalues[i].is_nan())
        .collect();
    order.sort_by(|&a, &b| pvalues[a].total_cmp(&pvalues[b]));

    let m = order.len() as f64;
    let mut ret = vec![f64::NAN; pvalues.len()];
    let mut running = 1.0_f64;
    for (rank, &i) in order.iter().enumerate().rev() {
        let q = pvalues[i] * m / (rank + 1) as f64;
        running = running.min(q);
        ret[i] = running;
    }
    ret
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn welch_matches_reference() {
        // scipy.stats.ttest_ind(a, b, equal_var=False)
        let a = [1.0, 2.0, 3.0, 4.0, 5.0];
        let b = [2.0, 4.0, 6.0, 8.0, 10.0, 12.0];
        let (t, p) = welch_ttest(&a, &b);
        assert_abs_diff_eq!(t, -2.3763541, epsilon = 1e-6);
        assert_abs_diff_eq!(p, 0.049284, epsilon = 1e-4);
    }

    #[test]
    fn bh_is_monotone_and_keeps_nan() {
        let q = fdr_bh(&[0.01, f64::NAN, 0.04, 0.03]);
        assert_abs_diff_eq!(q[0], 0.03, epsilon = 1e-12);
        assert!(q[1].is_nan());
        assert_abs_diff_eq!(q[2], 0.04, epsilon = 1e-12);
        assert_abs_diff_eq!(q[3], 0.04, epsilon = 1e-12);
    }
}
