use crate::cache::{get_grouped_op, GroupedOpArgs};
use crate::grouped_op::{group_indices, resolve_key, KeyKind, Statistic};
use crate::hypothesis::{fdr_bh, welch_ttest};
use crate::preprocess::{drop_na, pca, scale, PcaOptions, X_PCA};

use matrix_util::dmatrix_util::{column_means, covariance, mahalanobis, try_inverse_covariance};
use matrix_util::ndarray_stat::median_inplace;
use matrix_util::traits::ConvertMatOps;
use morph_beans::annotated::AnnotatedMatrix;
use morph_beans::errors::MorphError;
use morph_beans::misc::new_progress_bar;

use fnv::FnvHashSet as HashSet;
use log::{info, warn};
use nalgebra::{DMatrix, DVector};
use ndarray::{s, Array2, Axis};
use rayon::prelude::*;
use std::collections::BTreeMap;

pub const DEFAULT_CONTROL: &str = "DMSO";
pub const DEFAULT_CUM_VAR_EXPLAINED: f64 = 0.9;

/// Named values indexed by text labels
#[derive(Debug, Clone, PartialEq)]
pub struct LabelledSeries {
    pub name: Box<str>,
    pub labels: Vec<Box<str>>,
    pub values: Vec<f64>,
}

impl LabelledSeries {
    pub fn new(name: &str, labels: Vec<Box<str>>, values: Vec<f64>) -> Self {
        debug_assert_eq!(labels.len(), values.len());
        Self {
            name: name.into(),
            labels,
            values,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value of the first entry labelled `label`
    pub fn get(&self, label: &str) -> Option<f64> {
        self.labels
            .iter()
            .position(|x| x.as_ref() == label)
            .map(|i| self.values[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Box<str>, &f64)> {
        self.labels.iter().zip(self.values.iter())
    }

    /// Average entries sharing a label, skipping `NaN`; labels come
    /// out sorted
    pub fn mean_by_label(&self) -> Self {
        let mut acc: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
        for (label, &v) in self.iter() {
            let e = acc.entry(label.as_ref()).or_insert((0.0, 0));
            if !v.is_nan() {
                e.0 += v;
                e.1 += 1;
            }
        }
        let (labels, values) = acc
            .into_iter()
            .map(|(k, (s, n))| (Box::from(k), if n > 0 { s / n as f64 } else { f64::NAN }))
            .unzip();
        Self {
            name: self.name.clone(),
            labels,
            values,
        }
    }
}

////////////////////////
// shared bookkeeping //
////////////////////////

fn obs_labels(matrix: &AnnotatedMatrix, key: &str) -> anyhow::Result<Vec<Box<str>>> {
    let col = matrix.obs().column(key).ok_or_else(|| {
        let valid: Vec<&str> = matrix.obs().column_names().iter().map(|x| x.as_ref()).collect();
        anyhow::Error::from(MorphError::unsupported("treatment key", key, &valid))
    })?;
    Ok(col.to_text())
}

/// Rows of the control treatment and of everything else
fn split_control(labels: &[Box<str>], control: &str, treatment: &str) -> anyhow::Result<(Vec<usize>, Vec<usize>)> {
    let (ctrl, drug): (Vec<usize>, Vec<usize>) = (0..labels.len()).partition(|&i| labels[i].as_ref() == control);
    anyhow::ensure!(
        !ctrl.is_empty(),
        "control `{}` not found in column `{}`",
        control,
        treatment
    );
    Ok((ctrl, drug))
}

fn unique_in_order<'a>(labels: impl Iterator<Item = &'a Box<str>>) -> Vec<Box<str>> {
    let mut seen: HashSet<&'a str> = HashSet::default();
    let mut ret = vec![];
    for x in labels {
        if seen.insert(&**x) {
            ret.push(x.clone());
        }
    }
    ret
}

fn column_medians(x: &Array2<f32>, rows: &[usize]) -> DVector<f64> {
    let mut buf = Vec::with_capacity(rows.len());
    DVector::from_iterator(
        x.ncols(),
        (0..x.ncols()).map(|j| {
            buf.clear();
            buf.extend(rows.iter().map(|&i| x[(i, j)] as f64));
            median_inplace(&mut buf)
        }),
    )
}

/// Number of leading components before the one whose cumulative
/// variance ratio first exceeds `target`, or all of them. Zero when
/// the first component alone exceeds it.
pub fn pc_cutoff(variance_ratio: &[f64], target: f64) -> usize {
    let mut cum = 0.0;
    for (k, r) in variance_ratio.iter().enumerate() {
        cum += r;
        if cum > target {
            return k;
        }
    }
    variance_ratio.len()
}

/// Scale, then PCA; returns the retained scores and their variance
/// ratios as weights
fn pca_aggregate(matrix: &mut AnnotatedMatrix, cum_var_explained: f64) -> anyhow::Result<(Array2<f64>, Vec<f64>)> {
    scale(matrix)?;
    pca(matrix, &PcaOptions::default())?;

    let ratio = matrix
        .uns()
        .pca
        .as_ref()
        .map(|p| p.variance_ratio.to_vec())
        .ok_or(MorphError::missing_prerequisite("variance ratios", "pca"))?;
    anyhow::ensure!(!ratio.is_empty(), "no principal components");
    // at least one component even if the first alone passes the target
    let kk = pc_cutoff(&ratio, cum_var_explained).clamp(1, ratio.len());

    let scores = matrix
        .layer(X_PCA)
        .ok_or(MorphError::missing_prerequisite(X_PCA, "pca"))?
        .slice(s![.., ..kk])
        .mapv(|v| v as f64);
    Ok((scores, ratio[..kk].to_vec()))
}

/// Well-level profiles: `statistic` per well (plus further keys),
/// cached in `matrix`
///
/// * `well_key` - well column; inferred from the column names if `None`
/// * `group_keys` - further grouping columns, e.g. plate
pub fn aggregate<S: AsRef<str>>(
    matrix: &mut AnnotatedMatrix,
    well_key: Option<&str>,
    group_keys: &[S],
    statistic: Statistic,
    progress: bool,
) -> anyhow::Result<AnnotatedMatrix> {
    let well = resolve_key(matrix.obs(), well_key, KeyKind::Well)?;
    let mut keys = vec![well];
    keys.extend(group_keys.iter().map(|k| Box::from(k.as_ref())));
    info!("aggregating by {} with `{}`", keys.join(", "), statistic);

    let args = GroupedOpArgs {
        as_matrix: true,
        progress,
        ..Default::default()
    };
    get_grouped_op(matrix, &keys, &statistic, &args)?.into_matrix()
}

/////////////////////////////
// Mahalanobis to control  //
/////////////////////////////

#[derive(Debug, Clone)]
pub struct MahalanobisOptions {
    /// treatment column; inferred if `None`
    pub treatment_key: Option<Box<str>>,
    pub control: Box<str>,
    /// well column; inferred if `None`
    pub well_key: Option<Box<str>>,
    /// one PCA per treatment on its wells and the control wells
    pub per_treatment: bool,
    /// pool control and treatment covariances, each divided by its
    /// number of wells
    pub cov_include_treatment: bool,
    /// covariance of the control's single cells on the raw features,
    /// without PCA
    pub cov_from_single_cell: bool,
    pub progress: bool,
}

impl Default for MahalanobisOptions {
    fn default() -> Self {
        Self {
            treatment_key: None,
            control: DEFAULT_CONTROL.into(),
            well_key: None,
            per_treatment: false,
            cov_include_treatment: false,
            cov_from_single_cell: false,
            progress: false,
        }
    }
}

/// Mahalanobis distance of each non-control well to the control
/// centroid in PC space, averaged per treatment
fn pca_mahalanobis(
    joint: &mut AnnotatedMatrix,
    treatment: &str,
    control: &str,
    cov_include_treatment: bool,
) -> anyhow::Result<LabelledSeries> {
    drop_na(joint, 0.0, 1.0)?;
    let (scores, _) = pca_aggregate(joint, DEFAULT_CUM_VAR_EXPLAINED)?;

    let labels = obs_labels(joint, treatment)?;
    let (ctrl_rows, drug_rows) = split_control(&labels, control, treatment)?;
    let ctrl = scores.select(Axis(0), &ctrl_rows).to_dmatrix();
    let drug = scores.select(Axis(0), &drug_rows).to_dmatrix();
    let centroid = column_means(&ctrl);
    let kk = scores.ncols();

    let vi = if kk > 1 {
        let mut cov = covariance(&ctrl);
        if cov_include_treatment {
            if drug.nrows() < 2 {
                warn!(
                    "Not enough treatment replicates to compute a covariance; using the control covariance only. \
                     Disable `cov_include_treatment` when not all treatments have replicates."
                );
            } else {
                cov = cov / ctrl.nrows() as f64 + covariance(&drug) / drug.nrows() as f64;
            }
        }
        let vi = try_inverse_covariance(&cov);
        if vi.is_none() {
            warn!(
                "{}; distances are missing",
                MorphError::SingularCovariance(format!("{} wells of `{}` in {} components", ctrl.nrows(), control, kk))
            );
        }
        vi
    } else {
        Some(DMatrix::identity(1, 1))
    };

    let values = (0..drug.nrows())
        .map(|r| match &vi {
            Some(vi) => mahalanobis(&centroid, &drug.row(r).transpose(), vi),
            None => f64::NAN,
        })
        .collect();
    let drug_labels = drug_rows.iter().map(|&i| labels[i].clone()).collect();

    Ok(LabelledSeries::new("mahalanobis", drug_labels, values).mean_by_label())
}

/// Inverse covariance of the control's single cells, or `None` (with
/// a warning) if it cannot be inverted
fn single_cell_inverse_covariance(
    matrix: &AnnotatedMatrix,
    treatment: &str,
    control: &str,
) -> anyhow::Result<Option<DMatrix<f64>>> {
    let labels = obs_labels(matrix, treatment)?;
    let (rows, _) = split_control(&labels, control, treatment)?;

    let vi = if rows.len() < 2 {
        None
    } else {
        let x = matrix.read_rows_indexed(&rows, None)?.to_dmatrix();
        try_inverse_covariance(&covariance(&x))
    };

    if vi.is_none() {
        warn!(
            "{}. This is likely because there are very few cells. \
             Falling back to estimating the covariance matrix from aggregate data.",
            MorphError::SingularCovariance(format!("{} single cells of `{}`", rows.len(), control))
        );
    }
    Ok(vi)
}

/// Mahalanobis distance of each treatment to the control.
///
/// Cells are first aggregated to per-well medians. By default one
/// PCA covers all wells and the control wells' covariance is used;
/// distances of a treatment's wells are averaged. See
/// [`MahalanobisOptions`] for the variants. A single-cell covariance
/// that cannot be inverted falls back to the per-treatment PCA path.
pub fn aggregate_mahalanobis(
    matrix: &mut AnnotatedMatrix,
    opts: &MahalanobisOptions,
) -> anyhow::Result<LabelledSeries> {
    let treatment = resolve_key(matrix.obs(), opts.treatment_key.as_deref(), KeyKind::Treatment)?;
    let well = resolve_key(matrix.obs(), opts.well_key.as_deref(), KeyKind::Well)?;
    let control = opts.control.as_ref();

    let args = GroupedOpArgs {
        as_matrix: true,
        store: false,
        progress: opts.progress,
        ..Default::default()
    };
    let keys = [treatment.clone(), well];
    let mut agg = get_grouped_op(matrix, &keys, &Statistic::Median, &args)?.into_matrix()?;

    if !opts.per_treatment && !opts.cov_from_single_cell {
        return pca_mahalanobis(&mut agg, &treatment, control, opts.cov_include_treatment);
    }

    let labels = obs_labels(&agg, &treatment)?;
    let (ctrl_rows, drug_rows) = split_control(&labels, control, &treatment)?;
    let treatments = unique_in_order(drug_rows.iter().map(|&i| &labels[i]));
    let rows_of = |t: &str| -> Vec<usize> {
        drug_rows
            .iter()
            .copied()
            .filter(|&i| labels[i].as_ref() == t)
            .collect()
    };

    if opts.cov_from_single_cell {
        if let Some(vi) = single_cell_inverse_covariance(matrix, &treatment, control)? {
            let x = agg.dense(None)?;
            let centroid = column_medians(&x, &ctrl_rows);
            let values = treatments
                .iter()
                .map(|t| mahalanobis(&centroid, &column_medians(&x, &rows_of(t)), &vi))
                .collect();
            return Ok(LabelledSeries::new("mahalanobis", treatments, values));
        }
    }

    let pb = new_progress_bar(treatments.len(), "treatments", opts.progress);
    let mut values = Vec::with_capacity(treatments.len());
    for t in treatments.iter() {
        let mut rows = ctrl_rows.clone();
        rows.extend(rows_of(t));
        let mut joint = agg.view_obs(&rows).to_owned()?;
        let dist = pca_mahalanobis(&mut joint, &treatment, control, opts.cov_include_treatment)?;
        values.push(dist.get(t).unwrap_or(f64::NAN));
        pb.inc(1);
    }
    pb.finish_and_clear();

    Ok(LabelledSeries::new("mahalanobis", treatments, values))
}

/////////////////////////////
// weighted PC distance    //
/////////////////////////////

/// Distance of each treatment's median profile to the control in PC
/// space, `sqrt(sum_k w_k (x_k - control_k)^2)` with `w_k` the
/// variance ratio of component `k`. Components are kept until their
/// cumulative variance ratio exceeds `cum_var_explained`.
pub fn aggregate_pc(
    matrix: &mut AnnotatedMatrix,
    treatment_key: Option<&str>,
    control: &str,
    cum_var_explained: f64,
    progress: bool,
) -> anyhow::Result<LabelledSeries> {
    anyhow::ensure!(
        cum_var_explained > 0.0 && cum_var_explained <= 1.0,
        "cum_var_explained must be in (0, 1], got {}",
        cum_var_explained
    );
    let treatment = resolve_key(matrix.obs(), treatment_key, KeyKind::Treatment)?;

    let args = GroupedOpArgs {
        as_matrix: true,
        progress,
        ..Default::default()
    };
    let mut agg = get_grouped_op(matrix, &[treatment.clone()], &Statistic::Median, &args)?.into_matrix()?;
    drop_na(&mut agg, 0.0, 1.0)?;
    let (scores, weights) = pca_aggregate(&mut agg, cum_var_explained)?;

    let labels = obs_labels(&agg, &treatment)?;
    let (ctrl_rows, _) = split_control(&labels, control, &treatment)?;
    let reference = scores.row(ctrl_rows[0]);

    let values = scores
        .axis_iter(Axis(0))
        .map(|row| {
            row.iter()
                .zip(reference.iter())
                .zip(weights.iter())
                .map(|((x, c), w)| w * (x - c) * (x - c))
                .sum::<f64>()
                .sqrt()
        })
        .collect();

    Ok(LabelledSeries::new("pc_dist", labels, values))
}

/////////////////////////////
// t-statistic testing     //
/////////////////////////////

/// Per-feature Welch t-tests of the control against each group
#[derive(Debug, Clone)]
pub struct TTestResult {
    pub group_keys: Vec<Box<str>>,
    /// key values of each tested group
    pub groups: Vec<Vec<Box<str>>>,
    pub features: Vec<Box<str>>,
    /// `group x feature` t-statistics, `mean(control) - mean(group)`
    pub tstats: Array2<f64>,
    /// `group x feature` q-values, corrected over all entries jointly
    pub qvals: Array2<f64>,
}

impl TTestResult {
    /// Group key values joined by `_`
    pub fn group_labels(&self) -> Vec<Box<str>> {
        self.groups
            .iter()
            .map(|g| g.join("_").into_boxed_str())
            .collect()
    }
}

/// Welch's t-test per feature between the control's observations and
/// each other group's.
///
/// * `treatment_key` - treatment column; inferred if `None`
/// * `control` - control treatment
/// * `group_key` - optional second grouping column, e.g. plate
pub fn aggregate_ttest(
    matrix: &AnnotatedMatrix,
    treatment_key: Option<&str>,
    control: &str,
    group_key: Option<&str>,
) -> anyhow::Result<TTestResult> {
    let treatment = resolve_key(matrix.obs(), treatment_key, KeyKind::Treatment)?;
    let mut keys = vec![treatment.clone()];
    if let Some(g) = group_key {
        keys.push(g.into());
    }

    let labels = obs_labels(matrix, &treatment)?;
    let (ctrl_rows, _) = split_control(&labels, control, &treatment)?;
    let ctrl = matrix.read_rows_indexed(&ctrl_rows, None)?;
    let ctrl_cols: Vec<Vec<f64>> = ctrl
        .axis_iter(Axis(1))
        .map(|c| c.iter().map(|&x| x as f64).collect())
        .collect();

    let groups: Vec<(Vec<Box<str>>, Vec<usize>)> = group_indices(matrix.obs(), &keys)?
        .into_iter()
        .filter(|(_, rows)| labels[rows[0]].as_ref() != control)
        .collect();

    let nfeatures = matrix.n_vars();
    let mut tstats = Array2::<f64>::zeros((groups.len(), nfeatures));
    let mut pvals = Array2::<f64>::zeros((groups.len(), nfeatures));

    for (g, (_, rows)) in groups.iter().enumerate() {
        let block = matrix.read_rows_indexed(rows, None)?;
        let tests: Vec<(f64, f64)> = (0..nfeatures)
            .into_par_iter()
            .map(|j| {
                let drug: Vec<f64> = block.column(j).iter().map(|&x| x as f64).collect();
                welch_ttest(&ctrl_cols[j], &drug)
            })
            .collect();
        for (j, (t, p)) in tests.into_iter().enumerate() {
            tstats[(g, j)] = t;
            pvals[(g, j)] = p;
        }
    }

    let flat: Vec<f64> = pvals.iter().copied().collect();
    let qvals = Array2::from_shape_vec(pvals.dim(), fdr_bh(&flat))?;

    Ok(TTestResult {
        group_keys: keys,
        groups: groups.into_iter().map(|(k, _)| k).collect(),
        features: matrix.var_names().to_vec(),
        tstats,
        qvals,
    })
}

/// One distance per group, `sqrt(sum_j t_j^2)` over features with a
/// defined t-statistic
pub fn tstat_distance(res: &TTestResult) -> LabelledSeries {
    let values = res
        .tstats
        .axis_iter(Axis(0))
        .map(|row| {
            row.iter()
                .filter(|t| !t.is_nan())
                .map(|t| t * t)
                .sum::<f64>()
                .sqrt()
        })
        .collect();
    LabelledSeries::new("tstat_dist", res.group_labels(), values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cutoff_stops_before_crossing_component() {
        assert_eq!(pc_cutoff(&[0.5, 0.3, 0.15, 0.05], 0.9), 2);
        assert_eq!(pc_cutoff(&[0.5, 0.3, 0.15, 0.05], 0.7), 1);
        assert_eq!(pc_cutoff(&[0.95, 0.05], 0.9), 0);
        assert_eq!(pc_cutoff(&[0.4, 0.3], 0.9), 2);
    }

    #[test]
    fn duplicates_are_averaged() {
        let s = LabelledSeries::new(
            "d",
            vec!["b".into(), "a".into(), "b".into()],
            vec![1.0, 2.0, 3.0],
        )
        .mean_by_label();
        assert_eq!(s.labels, vec![Box::<str>::from("a"), "b".into()]);
        assert_eq!(s.values, vec![2.0, 2.0]);
    }
}
