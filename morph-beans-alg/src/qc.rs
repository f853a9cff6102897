use crate::preprocess::{subsample_indices, SampleSize};

use matrix_util::utils::{generate_minibatch_intervals, partition_by_membership};
use morph_beans::annotated::AnnotatedMatrix;
use morph_beans::errors::MorphError;
use morph_beans::meta_table::MetaColumn;

use fnv::FnvHashMap as HashMap;
use log::{info, warn};
use ndarray::{Array2, ArrayView1, Axis};

/// Rows scored at a time by [`filter_outliers`]
pub const OUTLIER_CHUNK_ROWS: usize = 10000;

/// `obs` column flagging outliers (1) and inliers (0)
pub const OUTLIER_COLUMN: &str = "outlier";

/// `obs` column of the image QC table holding the labels
pub const QC_LABEL: &str = "label";

/// `obs` column receiving the assigned image QC label
pub const IMAGE_QC_COLUMN: &str = "image_qc";

/// Supervised model over rows of features
pub trait Classifier {
    fn fit(&mut self, x: &Array2<f32>, labels: &[Box<str>]) -> anyhow::Result<()>;
    fn predict(&self, x: &Array2<f32>) -> anyhow::Result<Vec<Box<str>>>;
}

/// Unsupervised outlier model over rows of features
pub trait OutlierDetector {
    /// * `contamination` - expected fraction of outliers
    fn fit(&mut self, x: &Array2<f32>, contamination: f64) -> anyhow::Result<()>;

    /// `true` for outlying rows
    fn predict(&self, x: &Array2<f32>) -> anyhow::Result<Vec<bool>>;
}

/// Assigns each row the label of the closest class mean (Euclidean,
/// over finite features)
#[derive(Debug, Clone, Default)]
pub struct NearestCentroid {
    labels: Vec<Box<str>>,
    centroids: Vec<Vec<f64>>,
}

fn finite_mean<'a>(values: impl Iterator<Item = &'a f32>) -> f64 {
    let (s, n) = values
        .filter(|x| x.is_finite())
        .fold((0.0, 0_usize), |(s, n), &x| (s + x as f64, n + 1));
    if n > 0 {
        s / n as f64
    } else {
        f64::NAN
    }
}

impl Classifier for NearestCentroid {
    fn fit(&mut self, x: &Array2<f32>, labels: &[Box<str>]) -> anyhow::Result<()> {
        if x.nrows() != labels.len() {
            return Err(MorphError::shape_mismatch("training labels", x.nrows(), labels.len()).into());
        }
        anyhow::ensure!(!labels.is_empty(), "no training rows");

        self.labels.clear();
        self.centroids.clear();
        for (label, rows) in partition_by_membership(labels) {
            let block = x.select(Axis(0), &rows);
            let centroid = block.axis_iter(Axis(1)).map(|c| finite_mean(c.iter())).collect();
            self.labels.push(label);
            self.centroids.push(centroid);
        }
        Ok(())
    }

    fn predict(&self, x: &Array2<f32>) -> anyhow::Result<Vec<Box<str>>> {
        anyhow::ensure!(!self.centroids.is_empty(), "classifier is not fitted");
        let dist = |row: &ArrayView1<f32>, centroid: &[f64]| -> f64 {
            row.iter()
                .zip(centroid.iter())
                .filter(|(v, c)| v.is_finite() && c.is_finite())
                .map(|(&v, c)| (v as f64 - c).powi(2))
                .sum::<f64>()
        };
        Ok(x.axis_iter(Axis(0))
            .map(|row| {
                let best = self
                    .centroids
                    .iter()
                    .map(|c| dist(&row, c))
                    .enumerate()
                    .min_by(|a, b| a.1.total_cmp(&b.1))
                    .map(|(k, _)| k)
                    .unwrap_or(0);
                self.labels[best].clone()
            })
            .collect())
    }
}

/// Outlier scores from empirical tail probabilities of each feature:
/// the larger of the summed negative log left-tail, right-tail and
/// skewness-selected tail probabilities. Rows scoring above the
/// `1 - contamination` quantile of the training scores are outliers.
#[derive(Debug, Clone, Default)]
pub struct Ecod {
    sorted: Vec<Vec<f64>>,
    left_skewed: Vec<bool>,
    threshold: f64,
}

impl Ecod {
    fn score(&self, row: ArrayView1<f32>) -> f64 {
        let (mut left, mut right, mut auto) = (0.0, 0.0, 0.0);
        for ((&x, sorted), &left_skewed) in row.iter().zip(self.sorted.iter()).zip(self.left_skewed.iter()) {
            if !x.is_finite() || sorted.is_empty() {
                continue;
            }
            let x = x as f64;
            let n = sorted.len() as f64;
            let below = sorted.partition_point(|&v| v <= x) as f64;
            let above = n - sorted.partition_point(|&v| v < x) as f64;
            let l = -((below + 1.0) / (n + 1.0)).ln();
            let r = -((above + 1.0) / (n + 1.0)).ln();
            left += l;
            right += r;
            auto += if left_skewed { l } else { r };
        }
        left.max(right).max(auto)
    }
}

fn quantile(mut xs: Vec<f64>, q: f64) -> f64 {
    if xs.is_empty() {
        return f64::NAN;
    }
    xs.sort_by(f64::total_cmp);
    let pos = q.clamp(0.0, 1.0) * (xs.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    xs[lo] + (xs[hi] - xs[lo]) * (pos - lo as f64)
}

impl OutlierDetector for Ecod {
    fn fit(&mut self, x: &Array2<f32>, contamination: f64) -> anyhow::Result<()> {
        anyhow::ensure!(
            contamination > 0.0 && contamination < 0.5,
            "contamination must be in (0, 0.5), got {}",
            contamination
        );
        anyhow::ensure!(x.nrows() > 0, "no training rows");

        self.sorted.clear();
        self.left_skewed.clear();
        for col in x.axis_iter(Axis(1)) {
            let mut v: Vec<f64> = col.iter().filter(|x| x.is_finite()).map(|&x| x as f64).collect();
            v.sort_by(f64::total_cmp);
            let n = v.len().max(1) as f64;
            let mu = v.iter().sum::<f64>() / n;
            let m3 = v.iter().map(|x| (x - mu).powi(3)).sum::<f64>() / n;
            self.left_skewed.push(m3 < 0.0);
            self.sorted.push(v);
        }

        let scores: Vec<f64> = x.axis_iter(Axis(0)).map(|row| self.score(row)).collect();
        self.threshold = quantile(scores, 1.0 - contamination);
        Ok(())
    }

    fn predict(&self, x: &Array2<f32>) -> anyhow::Result<Vec<bool>> {
        anyhow::ensure!(!self.sorted.is_empty(), "outlier detector is not fitted");
        Ok(x.axis_iter(Axis(0))
            .map(|row| self.score(row) > self.threshold)
            .collect())
    }
}

/// Flag outlying observations in `obs["outlier"]` and, unless
/// `detect_only`, remove them. Returns the number of outliers.
///
/// * `detector` - fitted on `sample` (or all observations) and
///   applied in chunks of 10000 rows
/// * `outliers` - expected fraction of outliers
/// * `sample` - subsample used for fitting
/// * `seed` - seed for the subsample
pub fn filter_outliers<D: OutlierDetector + ?Sized>(
    matrix: &mut AnnotatedMatrix,
    detector: &mut D,
    outliers: f64,
    sample: Option<SampleSize>,
    seed: Option<u64>,
    detect_only: bool,
) -> anyhow::Result<usize> {
    let nobs = matrix.n_obs();
    let train = match sample {
        Some(size) => matrix.read_rows_indexed(&subsample_indices(nobs, size, seed)?, None)?,
        None => matrix.x().to_dense()?,
    };
    detector.fit(&train, outliers)?;
    drop(train);

    let mut flags = Vec::with_capacity(nobs);
    for (lb, ub) in generate_minibatch_intervals(nobs, OUTLIER_CHUNK_ROWS) {
        let chunk = matrix.x().read_rows(lb..ub)?;
        let pred = detector.predict(&chunk)?;
        if pred.len() != chunk.nrows() {
            return Err(MorphError::shape_mismatch("outlier predictions", chunk.nrows(), pred.len()).into());
        }
        flags.extend(pred);
    }

    let noutliers = flags.iter().filter(|&&x| x).count();
    info!("{} of {} observations are outliers", noutliers, nobs);

    let column = MetaColumn::Numeric(flags.iter().map(|&x| if x { 1.0 } else { 0.0 }).collect());
    matrix.obs_mut().insert(OUTLIER_COLUMN, column)?;

    if !detect_only && noutliers > 0 {
        let keep: Vec<usize> = (0..nobs).filter(|&i| !flags[i]).collect();
        matrix.subset_obs(&keep)?;
    }
    Ok(noutliers)
}

/// Label each observation with its image's QC label and keep those
/// labelled `passing_label`. Returns the number removed.
///
/// Images are matched on all `obs` columns shared with `qc` (other
/// than `label`). Images without a label get one predicted by
/// `classifier` (by default [`NearestCentroid`]) fitted on the
/// labelled images. The assigned labels go to `obs["image_qc"]`.
pub fn qc_images(
    matrix: &mut AnnotatedMatrix,
    qc: &AnnotatedMatrix,
    classifier: Option<&mut dyn Classifier>,
    passing_label: &str,
) -> anyhow::Result<usize> {
    let labels = qc
        .obs()
        .column(QC_LABEL)
        .ok_or(anyhow::anyhow!("QC data must have a `{}` column", QC_LABEL))?
        .to_text();

    let shared: Vec<Box<str>> = matrix
        .obs()
        .column_names()
        .iter()
        .filter(|x| x.as_ref() != QC_LABEL && qc.obs().position(x).is_some())
        .cloned()
        .collect();
    anyhow::ensure!(!shared.is_empty(), "no metadata columns shared with the QC data");
    info!("matching images on {}", shared.join(", "));

    let left: Vec<usize> = shared.iter().filter_map(|x| matrix.obs().position(x)).collect();
    let right: Vec<usize> = shared.iter().filter_map(|x| qc.obs().position(x)).collect();

    let mut lookup: HashMap<Vec<Box<str>>, usize> = HashMap::default();
    for i in 0..qc.n_obs() {
        lookup.insert(qc.obs().row_key(&right, i), i);
    }
    let matched: Vec<Option<usize>> = (0..matrix.n_obs())
        .map(|i| lookup.get(&matrix.obs().row_key(&left, i)).copied())
        .collect();
    let nmissing = matched.iter().filter(|x| x.is_none()).count();
    anyhow::ensure!(
        nmissing == 0,
        "{} observations do not have corresponding QC data. Did you import the correct QC data?",
        nmissing
    );

    let (pred_rows, train_rows): (Vec<usize>, Vec<usize>) = (0..qc.n_obs()).partition(|&i| labels[i].is_empty());

    let assigned = if pred_rows.is_empty() {
        warn!("All images have QC labels. No inference will be performed.");
        labels
    } else {
        anyhow::ensure!(!train_rows.is_empty(), "no labelled images to train on");
        let mut default = NearestCentroid::default();
        let clf: &mut dyn Classifier = match classifier {
            Some(c) => c,
            None => &mut default,
        };

        let train_labels: Vec<Box<str>> = train_rows.iter().map(|&i| labels[i].clone()).collect();
        clf.fit(&qc.read_rows_indexed(&train_rows, None)?, &train_labels)?;
        let predicted = clf.predict(&qc.read_rows_indexed(&pred_rows, None)?)?;
        if predicted.len() != pred_rows.len() {
            return Err(MorphError::shape_mismatch("QC predictions", pred_rows.len(), predicted.len()).into());
        }
        info!("predicted QC labels of {} images", pred_rows.len());

        let mut assigned = labels;
        for (&i, p) in pred_rows.iter().zip(predicted) {
            assigned[i] = p;
        }
        assigned
    };

    let image_qc: Vec<Box<str>> = matched
        .iter()
        .flatten()
        .map(|&r| assigned[r].clone())
        .collect();
    let keep: Vec<usize> = (0..image_qc.len())
        .filter(|&i| image_qc[i].as_ref() == passing_label)
        .collect();
    let nremoved = image_qc.len() - keep.len();

    matrix.obs_mut().insert(IMAGE_QC_COLUMN, MetaColumn::from_cells(image_qc))?;
    matrix.subset_obs(&keep)?;
    info!("removed {} observations failing image QC", nremoved);
    Ok(nremoved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_centroid_separates_classes() -> anyhow::Result<()> {
        let x = ndarray::array![[0.0_f32, 0.0], [0.1, 0.2], [5.0, 5.0], [5.2, 4.9]];
        let y: Vec<Box<str>> = vec!["0".into(), "0".into(), "1".into(), "1".into()];
        let mut clf = NearestCentroid::default();
        clf.fit(&x, &y)?;
        let pred = clf.predict(&ndarray::array![[4.0_f32, 4.0], [0.5, -0.1]])?;
        assert_eq!(pred, vec![Box::<str>::from("1"), "0".into()]);
        Ok(())
    }

    #[test]
    fn ecod_flags_extreme_rows() -> anyhow::Result<()> {
        let mut x = Array2::<f32>::zeros((100, 2));
        for i in 0..100 {
            x[(i, 0)] = (i % 10) as f32;
            x[(i, 1)] = (i % 7) as f32;
        }
        let mut det = Ecod::default();
        det.fit(&x, 0.05)?;
        let pred = det.predict(&ndarray::array![[100.0_f32, 100.0], [4.0, 3.0]])?;
        assert_eq!(pred, vec![true, false]);
        Ok(())
    }
}
