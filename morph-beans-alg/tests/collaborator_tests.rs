use morph_beans::annotated::{assemble, AnnotatedMatrix};
use morph_beans::annotations::TrajectoryFit;
use morph_beans::errors::MorphError;
use morph_beans::meta_table::{MetaColumn, MetaTable};
use morph_beans_alg::preprocess::{pca, PcaOptions, SampleSize};
use morph_beans_alg::qc::*;
use morph_beans_alg::trajectory::*;

use ndarray::{array, Array2, Axis};

fn profiles(meta: &[(&str, Vec<&str>)], x: Array2<f32>) -> anyhow::Result<AnnotatedMatrix> {
    let mut obs = MetaTable::empty(x.nrows());
    for (name, cells) in meta {
        let cells = cells.iter().map(|&c| Box::from(c)).collect();
        obs.insert(name, MetaColumn::from_cells(cells))?;
    }
    let names = (0..x.ncols())
        .map(|j| format!("Feature_{}", j).into_boxed_str())
        .collect();
    assemble(obs, x, names, "_")
}

fn is_missing_prerequisite(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<MorphError>(),
        Some(MorphError::MissingPrerequisite { .. })
    )
}

/////////////////////
// outlier removal //
/////////////////////

/// Rows whose first feature exceeds a fixed bound
struct Bound {
    fitted_rows: usize,
}

impl OutlierDetector for Bound {
    fn fit(&mut self, x: &Array2<f32>, _contamination: f64) -> anyhow::Result<()> {
        self.fitted_rows = x.nrows();
        Ok(())
    }

    fn predict(&self, x: &Array2<f32>) -> anyhow::Result<Vec<bool>> {
        Ok(x.axis_iter(Axis(0)).map(|r| r[0] > 100.0).collect())
    }
}

fn cells() -> anyhow::Result<AnnotatedMatrix> {
    profiles(
        &[("Metadata_Well", vec!["W1", "W1", "W1", "W2", "W2", "W2"])],
        array![[1.0, 0.0], [500.0, 0.0], [2.0, 1.0], [3.0, 1.0], [4.0, 0.0], [900.0, 1.0]],
    )
}

#[test]
fn outliers_are_flagged_without_removal() -> anyhow::Result<()> {
    let mut m = cells()?;
    let mut det = Bound { fitted_rows: 0 };
    let n = filter_outliers(&mut m, &mut det, 0.05, None, None, true)?;

    assert_eq!(n, 2);
    assert_eq!(det.fitted_rows, 6);
    assert_eq!(m.n_obs(), 6);
    let flags = m.obs().column(OUTLIER_COLUMN).ok_or(anyhow::anyhow!("no flags"))?;
    assert_eq!(flags.to_text(), ["0", "1", "0", "0", "0", "1"].map(Box::<str>::from).to_vec());
    Ok(())
}

#[test]
fn outliers_are_removed_after_fitting_on_a_sample() -> anyhow::Result<()> {
    let mut m = cells()?;
    let mut det = Bound { fitted_rows: 0 };
    let n = filter_outliers(&mut m, &mut det, 0.05, Some(SampleSize::Count(4)), Some(1), false)?;

    assert_eq!(n, 2);
    assert_eq!(det.fitted_rows, 4);
    assert_eq!(m.n_obs(), 4);
    assert!(m.dense(None)?.column(0).iter().all(|&v| v < 100.0));
    Ok(())
}

#[test]
fn default_detector_removes_extreme_cells() -> anyhow::Result<()> {
    let nobs = 200;
    let mut x = Array2::<f32>::zeros((nobs, 2));
    for i in 0..nobs {
        x[(i, 0)] = (i % 13) as f32;
        x[(i, 1)] = (i % 11) as f32;
    }
    x[(7, 0)] = 1e4;
    x[(7, 1)] = 1e4;
    let wells = vec!["W1"; nobs];
    let mut m = profiles(&[("Metadata_Well", wells)], x)?;

    filter_outliers(&mut m, &mut Ecod::default(), 0.05, None, None, true)?;
    let flags = m.obs().column(OUTLIER_COLUMN).ok_or(anyhow::anyhow!("no flags"))?;
    assert_eq!(flags.text_at(7).as_ref(), "1");
    Ok(())
}

//////////////
// image QC //
//////////////

/// Four images; 1 and 2 pass, 3 fails, 4 is unlabelled but looks like 3
fn image_qc() -> anyhow::Result<AnnotatedMatrix> {
    profiles(
        &[
            ("ImageNumber", vec!["1", "2", "3", "4"]),
            ("label", vec!["1", "1", "0", ""]),
        ],
        array![[0.1, 1.0], [0.2, 1.1], [5.0, 9.0], [5.5, 8.5]],
    )
}

fn cells_on_images() -> anyhow::Result<AnnotatedMatrix> {
    profiles(
        &[
            ("ImageNumber", vec!["1", "1", "2", "2", "3", "3", "4", "4"]),
            ("Metadata_Well", vec!["W1", "W1", "W1", "W1", "W2", "W2", "W2", "W2"]),
        ],
        Array2::zeros((8, 3)),
    )
}

/// Passes every image it is asked about
struct PassAll;

impl Classifier for PassAll {
    fn fit(&mut self, _x: &Array2<f32>, _labels: &[Box<str>]) -> anyhow::Result<()> {
        Ok(())
    }

    fn predict(&self, x: &Array2<f32>) -> anyhow::Result<Vec<Box<str>>> {
        Ok(vec!["1".into(); x.nrows()])
    }
}

#[test]
fn image_qc_predicts_missing_labels() -> anyhow::Result<()> {
    let mut m = cells_on_images()?;
    let removed = qc_images(&mut m, &image_qc()?, None, "1")?;

    assert_eq!(removed, 4);
    assert_eq!(m.n_obs(), 4);
    let qc = m.obs().column(IMAGE_QC_COLUMN).ok_or(anyhow::anyhow!("no image_qc"))?;
    assert!(qc.to_text().iter().all(|x| x.as_ref() == "1"));
    Ok(())
}

#[test]
fn image_qc_uses_the_given_classifier() -> anyhow::Result<()> {
    let mut m = cells_on_images()?;
    let mut clf = PassAll;
    let removed = qc_images(&mut m, &image_qc()?, Some(&mut clf), "1")?;

    assert_eq!(removed, 2);
    let images = m.obs().column("ImageNumber").ok_or(anyhow::anyhow!("no images"))?;
    assert_eq!(images.to_text(), ["1", "1", "2", "2", "4", "4"].map(Box::<str>::from).to_vec());
    Ok(())
}

#[test]
fn image_qc_requires_every_image() -> anyhow::Result<()> {
    let mut m = profiles(&[("ImageNumber", vec!["1", "5"])], Array2::zeros((2, 1)))?;
    let err = qc_images(&mut m, &image_qc()?, None, "1")
        .err()
        .ok_or(anyhow::anyhow!("expected an error"))?;
    assert!(err.to_string().contains("QC data"));
    assert_eq!(m.n_obs(), 2);
    Ok(())
}

////////////////////////
// trajectory testing //
////////////////////////

/// One lineage; pseudotime is the first coordinate
struct OneLineage {
    fail_tests: bool,
    dims: usize,
}

impl TrajectoryRuntime for OneLineage {
    fn fit(
        &mut self,
        coords: &Array2<f64>,
        clusters: &[Box<str>],
        _start: Option<&str>,
        _end: Option<&str>,
    ) -> anyhow::Result<Lineages> {
        anyhow::ensure!(coords.nrows() == clusters.len());
        self.dims = coords.ncols();
        let n = coords.nrows();
        Ok(Lineages {
            curves: coords.clone(),
            pseudotime: coords.column(0).to_owned().insert_axis(Axis(1)),
            weights: Array2::ones((n, 1)),
        })
    }

    fn test(
        &mut self,
        kind: ConditionTest,
        fit: &TrajectoryFit,
        conditions: &[Box<str>],
        _opts: &ConditionTestOptions,
    ) -> anyhow::Result<serde_json::Value> {
        anyhow::ensure!(!self.fail_tests, "lineages could not be matched across conditions");
        anyhow::ensure!(fit.weights.nrows() == conditions.len());
        Ok(serde_json::json!({ "test": kind.name(), "p_value": 0.5 }))
    }
}

fn clustered() -> anyhow::Result<AnnotatedMatrix> {
    profiles(
        &[
            ("leiden", vec!["0", "0", "1", "1", "2", "2"]),
            ("Metadata_Treatment", vec!["DMSO", "A", "DMSO", "A", "DMSO", "A"]),
        ],
        array![
            [0.0, 1.0, 0.5],
            [0.5, 1.5, 0.0],
            [2.0, 2.5, 1.0],
            [2.5, 3.5, 1.5],
            [4.0, 5.0, 2.5],
            [4.5, 5.0, 3.0]
        ],
    )
}

#[test]
fn trajectory_fit_needs_principal_components() -> anyhow::Result<()> {
    let mut m = clustered()?;
    let mut rt = OneLineage { fail_tests: false, dims: 0 };
    let err = fit_trajectory(&mut m, &mut rt, "leiden", DEFAULT_TRAJECTORY_COMPS, None, None)
        .err()
        .ok_or(anyhow::anyhow!("expected an error"))?;
    assert!(is_missing_prerequisite(&err));
    assert!(err.to_string().contains("pca"));
    Ok(())
}

#[test]
fn condition_tests_need_a_fit() -> anyhow::Result<()> {
    let mut m = clustered()?;
    let mut rt = OneLineage { fail_tests: false, dims: 0 };
    let err = test_differential_progression(&mut m, &mut rt, "Metadata_Treatment", true, true)
        .err()
        .ok_or(anyhow::anyhow!("expected an error"))?;
    assert!(is_missing_prerequisite(&err));
    assert!(err.to_string().contains("fit_trajectory"));
    Ok(())
}

#[test]
fn fit_then_test_stores_results() -> anyhow::Result<()> {
    let mut m = clustered()?;
    pca(&mut m, &PcaOptions::default())?;
    let mut rt = OneLineage { fail_tests: false, dims: 0 };

    fit_trajectory(&mut m, &mut rt, "leiden", DEFAULT_TRAJECTORY_COMPS, Some("0"), None)?;
    assert_eq!(rt.dims, 2);
    let fit = m.uns().trajectory.as_ref().ok_or(anyhow::anyhow!("no fit"))?;
    assert_eq!(fit.cluster_key.as_ref(), "leiden");
    assert_eq!(fit.pseudotime.dim(), (6, 1));

    let res = test_differential_differentiation(&mut m, &mut rt, "Metadata_Treatment", true, true)?;
    assert_eq!(res["p_value"], 0.5);
    assert!(m.uns().extra.contains_key("test_differential_differentiation"));

    test_common_trajectory(&mut m, &mut rt, "Metadata_Treatment", false)?;
    assert_eq!(m.uns().extra.len(), 2);
    Ok(())
}

#[test]
fn runtime_failures_suggest_coarser_clusters() -> anyhow::Result<()> {
    let mut m = clustered()?;
    pca(&mut m, &PcaOptions::default())?;
    let mut rt = OneLineage { fail_tests: true, dims: 0 };
    fit_trajectory(&mut m, &mut rt, "leiden", 2, None, None)?;

    let err = test_common_trajectory(&mut m, &mut rt, "Metadata_Treatment", true)
        .err()
        .ok_or(anyhow::anyhow!("expected an error"))?;
    assert!(err.to_string().contains("fewer clusters"));
    assert!(format!("{:#}", err).contains("could not be matched"));
    assert!(m.uns().extra.is_empty());
    Ok(())
}
