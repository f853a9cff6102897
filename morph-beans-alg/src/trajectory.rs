use crate::preprocess::X_PCA;

use morph_beans::annotated::AnnotatedMatrix;
use morph_beans::annotations::TrajectoryFit;
use morph_beans::errors::MorphError;

use log::{error, info};
use ndarray::{s, Array2};

/// Default number of principal components handed to the runtime
pub const DEFAULT_TRAJECTORY_COMPS: usize = 10;

const COARSER_CLUSTERS_HINT: &str = "This is often caused by clusters that are too granular. \
     Try clustering with fewer clusters, refit the trajectory and try again.";

/// Curves and per-observation assignments returned by a runtime
#[derive(Debug, Clone)]
pub struct Lineages {
    /// `points x dims` curve coordinates
    pub curves: Array2<f64>,
    /// `observations x lineages`
    pub pseudotime: Array2<f64>,
    /// `observations x lineages` soft assignments
    pub weights: Array2<f64>,
}

/// Condition tests on a fitted trajectory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionTest {
    /// do all conditions share one trajectory
    CommonTrajectory,
    /// do conditions progress differently along each lineage
    DifferentialProgression,
    /// do conditions distribute differently across lineages
    DifferentialDifferentiation,
}

impl ConditionTest {
    pub fn name(&self) -> &'static str {
        match self {
            ConditionTest::CommonTrajectory => "test_common_trajectory",
            ConditionTest::DifferentialProgression => "test_differential_progression",
            ConditionTest::DifferentialDifferentiation => "test_differential_differentiation",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConditionTestOptions {
    /// test all pairs of conditions
    pub all_pairs: bool,
    /// pairwise comparisons of lineages
    pub pairwise: bool,
    /// test each lineage independently
    pub lineages: bool,
    pub parallel: bool,
}

impl Default for ConditionTestOptions {
    fn default() -> Self {
        Self {
            all_pairs: true,
            pairwise: true,
            lineages: true,
            parallel: true,
        }
    }
}

/// External trajectory inference and testing
pub trait TrajectoryRuntime {
    /// * `coords` - `observations x components`
    /// * `clusters` - cluster label per observation
    /// * `start`, `end` - optional start and end clusters
    fn fit(
        &mut self,
        coords: &Array2<f64>,
        clusters: &[Box<str>],
        start: Option<&str>,
        end: Option<&str>,
    ) -> anyhow::Result<Lineages>;

    fn test(
        &mut self,
        kind: ConditionTest,
        fit: &TrajectoryFit,
        conditions: &[Box<str>],
        opts: &ConditionTestOptions,
    ) -> anyhow::Result<serde_json::Value>;
}

fn obs_text(matrix: &AnnotatedMatrix, column: &str) -> anyhow::Result<Vec<Box<str>>> {
    matrix
        .obs()
        .column(column)
        .map(|c| c.to_text())
        .ok_or(anyhow::anyhow!("`{}` is not an observation metadata column", column))
}

/// Fit trajectories on the first `n_comps` principal components with
/// clusters from `obs[cluster_key]`; the fit goes to `uns.trajectory`
pub fn fit_trajectory<R: TrajectoryRuntime + ?Sized>(
    matrix: &mut AnnotatedMatrix,
    runtime: &mut R,
    cluster_key: &str,
    n_comps: usize,
    start: Option<&str>,
    end: Option<&str>,
) -> anyhow::Result<()> {
    let scores = matrix
        .layer(X_PCA)
        .ok_or(MorphError::missing_prerequisite(X_PCA, "pca"))?;
    let kk = n_comps.min(scores.ncols());
    anyhow::ensure!(kk > 0, "no principal components to fit on");
    let coords = scores.slice(s![.., ..kk]).mapv(|x| x as f64);
    let clusters = obs_text(matrix, cluster_key)?;

    info!("fitting trajectories on {} components", kk);
    let lineages = runtime
        .fit(&coords, &clusters, start, end)
        .map_err(|e| {
            error!("trajectory fit failed: {}\n{}", e, COARSER_CLUSTERS_HINT);
            e.context(format!("trajectory fit failed. {}", COARSER_CLUSTERS_HINT))
        })?;

    let nobs = matrix.n_obs();
    if lineages.pseudotime.nrows() != nobs {
        return Err(MorphError::shape_mismatch("pseudotime", nobs, lineages.pseudotime.nrows()).into());
    }
    if lineages.weights.nrows() != nobs {
        return Err(MorphError::shape_mismatch("lineage weights", nobs, lineages.weights.nrows()).into());
    }

    matrix.uns_mut().trajectory = Some(TrajectoryFit {
        cluster_key: cluster_key.into(),
        curves: lineages.curves,
        pseudotime: lineages.pseudotime,
        weights: lineages.weights,
    });
    Ok(())
}

fn run_condition_test<R: TrajectoryRuntime + ?Sized>(
    matrix: &mut AnnotatedMatrix,
    runtime: &mut R,
    kind: ConditionTest,
    conditions: &str,
    opts: &ConditionTestOptions,
) -> anyhow::Result<serde_json::Value> {
    let fit = matrix.uns().trajectory.as_ref().ok_or_else(|| {
        error!("no trajectory fit found; run `fit_trajectory` first");
        MorphError::missing_prerequisite("trajectory fit", "fit_trajectory")
    })?;
    let labels = obs_text(matrix, conditions)?;

    let result = runtime.test(kind, fit, &labels, opts).map_err(|e| {
        error!("`{}` failed: {}\n{}", kind.name(), e, COARSER_CLUSTERS_HINT);
        e.context(format!("`{}` failed. {}", kind.name(), COARSER_CLUSTERS_HINT))
    })?;

    matrix.uns_mut().extra.insert(kind.name().into(), result.clone());
    Ok(result)
}

/// Test whether all conditions share one trajectory; the result is
/// stored in `uns.extra["test_common_trajectory"]`
///
/// * `conditions` - observation metadata column with conditions
pub fn test_common_trajectory<R: TrajectoryRuntime + ?Sized>(
    matrix: &mut AnnotatedMatrix,
    runtime: &mut R,
    conditions: &str,
    parallel: bool,
) -> anyhow::Result<serde_json::Value> {
    info!("testing for a common trajectory");
    let opts = ConditionTestOptions {
        parallel,
        ..Default::default()
    };
    run_condition_test(matrix, runtime, ConditionTest::CommonTrajectory, conditions, &opts)
}

/// Test for differential progression along lineages; the result is
/// stored in `uns.extra["test_differential_progression"]`
pub fn test_differential_progression<R: TrajectoryRuntime + ?Sized>(
    matrix: &mut AnnotatedMatrix,
    runtime: &mut R,
    conditions: &str,
    all_pairs: bool,
    lineages: bool,
) -> anyhow::Result<serde_json::Value> {
    info!("testing differential progression");
    let opts = ConditionTestOptions {
        all_pairs,
        lineages,
        ..Default::default()
    };
    run_condition_test(
        matrix,
        runtime,
        ConditionTest::DifferentialProgression,
        conditions,
        &opts,
    )
}

/// Test for differential differentiation into lineages; the result
/// is stored in `uns.extra["test_differential_differentiation"]`
pub fn test_differential_differentiation<R: TrajectoryRuntime + ?Sized>(
    matrix: &mut AnnotatedMatrix,
    runtime: &mut R,
    conditions: &str,
    all_pairs: bool,
    pairwise: bool,
) -> anyhow::Result<serde_json::Value> {
    info!("testing differential differentiation");
    let opts = ConditionTestOptions {
        all_pairs,
        pairwise,
        ..Default::default()
    };
    run_condition_test(
        matrix,
        runtime,
        ConditionTest::DifferentialDifferentiation,
        conditions,
        &opts,
    )
}
