use ndarray::{Array1, ArrayView2, Axis};

/// A container to keep track of column-wise sufficient statistics
/// while visiting a matrix block by block (rows = observations)
///
/// Non-finite values are skipped, so `mean` and `variance` are
/// computed over the finite entries of each column.
#[derive(Clone)]
pub struct RunningStatistics {
    s0: Array1<f64>,
    s1: Array1<f64>,
    s2: Array1<f64>,
}

impl RunningStatistics {
    /// Create a new RunningStatistics object
    ///
    /// # Arguments
    ///
    /// * `ncols` - number of columns to keep track of
    ///
    /// # Examples
    ///
    /// ```
    /// use matrix_util::ndarray_stat::RunningStatistics;
    /// let stat = RunningStatistics::new(10);
    /// assert_eq!(stat.ncols(), 10);
    /// ```
    ///
    pub fn new(ncols: usize) -> Self {
        RunningStatistics {
            s0: Array1::zeros(ncols),
            s1: Array1::zeros(ncols),
            s2: Array1::zeros(ncols),
        }
    }

    /// Accumulate a block of rows
    pub fn add_rows(&mut self, block: &ArrayView2<f32>) {
        debug_assert_eq!(block.ncols(), self.ncols());
        for row in block.axis_iter(Axis(0)) {
            for (j, &x) in row.iter().enumerate() {
                if x.is_finite() {
                    let x = x as f64;
                    self.s0[j] += 1.0;
                    self.s1[j] += x;
                    self.s2[j] += x * x;
                }
            }
        }
    }

    pub fn ncols(&self) -> usize {
        self.s0.len()
    }

    /// Number of finite values per column
    pub fn count_finite(&self) -> Array1<f64> {
        self.s0.clone()
    }

    /// Average statistic
    pub fn mean(&self) -> Array1<f64> {
        &self.s1 / &self.s0.mapv(|n| n.max(1.0))
    }

    /// Variance with `ddof` delta degrees of freedom
    pub fn variance(&self, ddof: f64) -> Array1<f64> {
        let mean = self.mean();
        let mut ret = Array1::zeros(self.ncols());
        for j in 0..self.ncols() {
            let n = self.s0[j];
            if n - ddof > 0.0 {
                let ss = (self.s2[j] - n * mean[j] * mean[j]).max(0.0);
                ret[j] = ss / (n - ddof);
            } else {
                ret[j] = f64::NAN;
            }
        }
        ret
    }

    /// Standard deviation with `ddof` delta degrees of freedom
    pub fn std(&self, ddof: f64) -> Array1<f64> {
        self.variance(ddof).mapv(f64::sqrt)
    }
}

/////////////////////////////////////////////
// order statistics over a mutable buffer  //
/////////////////////////////////////////////

/// Median of the values; reorders `xx`. `NaN` if empty or if any
/// value is `NaN`.
pub fn median_inplace(xx: &mut [f64]) -> f64 {
    let n = xx.len();
    if n == 0 || xx.iter().any(|x| x.is_nan()) {
        return f64::NAN;
    }
    let mid = n / 2;
    let (_, upper, _) = xx.select_nth_unstable_by(mid, f64::total_cmp);
    let upper = *upper;
    if n % 2 == 1 {
        upper
    } else {
        let lower = xx[..mid]
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        0.5 * (lower + upper)
    }
}

/// Median absolute deviation `median(|x - median(x)|)`, unscaled;
/// overwrites `xx` with the absolute deviations
pub fn mad_inplace(xx: &mut [f64]) -> f64 {
    let med = median_inplace(xx);
    if med.is_nan() {
        return f64::NAN;
    }
    xx.iter_mut().for_each(|x| *x = (*x - med).abs());
    median_inplace(xx)
}

/// Arithmetic mean; `NaN` for an empty slice
pub fn mean(xx: &[f64]) -> f64 {
    if xx.is_empty() {
        return f64::NAN;
    }
    xx.iter().sum::<f64>() / xx.len() as f64
}

/// Two-pass variance with `ddof` delta degrees of freedom; `NaN` if
/// there are not more than `ddof` values
pub fn variance(xx: &[f64], ddof: usize) -> f64 {
    let n = xx.len();
    if n <= ddof {
        return f64::NAN;
    }
    let mu = mean(xx);
    xx.iter().map(|x| (x - mu) * (x - mu)).sum::<f64>() / (n - ddof) as f64
}
