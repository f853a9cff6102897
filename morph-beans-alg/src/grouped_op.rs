use matrix_util::ndarray_stat::{mad_inplace, mean, median_inplace, variance};
use matrix_util::utils::partition_by_membership;
use morph_beans::annotated::{AnnotatedMatrix, MatrixStore};
use morph_beans::annotations::GroupedResult;
use morph_beans::errors::MorphError;
use morph_beans::meta_table::{MetaColumn, MetaTable};
use morph_beans::misc::new_progress_bar;

use log::warn;
use ndarray::{Array2, Axis};
use regex::{Regex, RegexBuilder};
use std::cmp::Ordering;
use std::str::FromStr;

/// Consistency constant of the MAD for normally distributed data
pub const MAD_NORMAL_SCALE: f64 = 1.482602218505602;

/// Added to the scaled MAD so constant groups stay finite
pub const MAD_EPSILON: f64 = 1e-18;

/// Per-group, per-feature summary statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Statistic {
    Mean,
    /// mean of `log1p(x)`, not the log of the mean
    LogMean,
    Median,
    /// population standard deviation
    Std,
    /// population variance
    Var,
    /// standard error of the mean with `n - 1` degrees of freedom
    Sem,
    /// unscaled median absolute deviation
    Mad,
    /// `median / (MAD_NORMAL_SCALE * mad + MAD_EPSILON)`
    MadScaled,
}

impl Statistic {
    pub const NAMES: [&'static str; 8] = [
        "mean",
        "logmean",
        "median",
        "std",
        "var",
        "sem",
        "mad",
        "mad_scaled",
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Statistic::Mean => "mean",
            Statistic::LogMean => "logmean",
            Statistic::Median => "median",
            Statistic::Std => "std",
            Statistic::Var => "var",
            Statistic::Sem => "sem",
            Statistic::Mad => "mad",
            Statistic::MadScaled => "mad_scaled",
        }
    }
}

impl FromStr for Statistic {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "mean" => Statistic::Mean,
            "logmean" => Statistic::LogMean,
            "median" => Statistic::Median,
            "std" => Statistic::Std,
            "var" => Statistic::Var,
            "sem" => Statistic::Sem,
            "mad" => Statistic::Mad,
            "mad_scaled" => Statistic::MadScaled,
            _ => return Err(MorphError::unsupported("statistic", s, &Self::NAMES).into()),
        })
    }
}

impl std::fmt::Display for Statistic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Reduce one feature's values within one group to a number
pub trait Reducer {
    /// Name used in cache keys
    fn name(&self) -> &str;

    /// May reorder or overwrite `values`
    fn reduce(&self, values: &mut [f64]) -> f64;

    /// Reduce and report whether the spread of `values` was zero
    fn reduce_flag_zero_spread(&self, values: &mut [f64]) -> (f64, bool) {
        (self.reduce(values), false)
    }
}

impl Reducer for Statistic {
    fn name(&self) -> &str {
        Statistic::name(self)
    }

    fn reduce(&self, values: &mut [f64]) -> f64 {
        self.reduce_flag_zero_spread(values).0
    }

    fn reduce_flag_zero_spread(&self, values: &mut [f64]) -> (f64, bool) {
        let n = values.len();
        match self {
            Statistic::Mean => (mean(values), false),
            Statistic::LogMean => {
                values.iter_mut().for_each(|x| *x = x.ln_1p());
                (mean(values), false)
            }
            Statistic::Median => (median_inplace(values), false),
            Statistic::Std => (variance(values, 0).sqrt(), false),
            Statistic::Var => (variance(values, 0), false),
            Statistic::Sem => ((variance(values, 1) / n as f64).sqrt(), false),
            Statistic::Mad => {
                let mad = mad_inplace(values);
                (mad, mad == 0.0)
            }
            Statistic::MadScaled => {
                let med = median_inplace(values);
                let mad = mad_inplace(values);
                (med / (MAD_NORMAL_SCALE * mad + MAD_EPSILON), mad == 0.0)
            }
        }
    }
}

/// Metadata columns used as group keys; an unknown key lists the
/// available columns
pub fn key_columns<'a, S: AsRef<str>>(obs: &'a MetaTable, group_keys: &[S]) -> anyhow::Result<Vec<&'a MetaColumn>> {
    anyhow::ensure!(!group_keys.is_empty(), "at least one group key is required");
    group_keys
        .iter()
        .map(|k| {
            obs.column(k.as_ref()).ok_or_else(|| {
                let valid: Vec<&str> = obs.column_names().iter().map(|x| x.as_ref()).collect();
                MorphError::unsupported("group key", k.as_ref(), &valid).into()
            })
        })
        .collect()
}

fn compare_rows(cols: &[&MetaColumn], a: usize, b: usize) -> Ordering {
    for c in cols {
        let ord = match c {
            MetaColumn::Numeric(v) => v[a].total_cmp(&v[b]),
            MetaColumn::Text(v) => v[a].cmp(&v[b]),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Distinct combinations of the key columns with their rows. Groups
/// are sorted key by key: numeric columns numerically, text columns
/// lexically. Rows keep their order within a group.
pub fn group_indices<S: AsRef<str>>(
    obs: &MetaTable,
    group_keys: &[S],
) -> anyhow::Result<Vec<(Vec<Box<str>>, Vec<usize>)>> {
    let cols = key_columns(obs, group_keys)?;
    let membership: Vec<Vec<Box<str>>> = (0..obs.nrows())
        .map(|i| cols.iter().map(|c| c.text_at(i)).collect())
        .collect();

    let mut ret = partition_by_membership(&membership);
    ret.sort_by(|(_, a), (_, b)| compare_rows(&cols, a[0], b[0]));
    Ok(ret)
}

/// Summarize each group of observations, feature by feature.
///
/// * `matrix` - observations to group
/// * `group_keys` - metadata columns forming a composite key
/// * `reducer` - statistic applied to each group and feature
/// * `layer` - alternate view to summarize instead of `X`
/// * `progress` - show a progress bar over groups
pub fn grouped_op<R, S>(
    matrix: &AnnotatedMatrix,
    group_keys: &[S],
    reducer: &R,
    layer: Option<&str>,
    progress: bool,
) -> anyhow::Result<GroupedResult>
where
    R: Reducer + ?Sized,
    S: AsRef<str>,
{
    let features = matrix.feature_names(layer)?;
    let groups = group_indices(matrix.obs(), group_keys)?;

    let ngroups = groups.len();
    let nfeatures = features.len();
    let mut values = Array2::<f64>::zeros((ngroups, nfeatures));
    let mut nzero_spread = 0_usize;

    let pb = new_progress_bar(ngroups, "groups", progress);
    let mut keys = Vec::with_capacity(ngroups);

    for (g, (key, rows)) in groups.into_iter().enumerate() {
        let block = matrix.read_rows_indexed(&rows, layer)?;
        let mut buf = Vec::with_capacity(rows.len());
        for (j, column) in block.axis_iter(Axis(1)).enumerate() {
            buf.clear();
            buf.extend(column.iter().map(|&x| x as f64));
            let (v, zero_spread) = reducer.reduce_flag_zero_spread(&mut buf);
            values[(g, j)] = v;
            if zero_spread {
                nzero_spread += 1;
            }
        }
        keys.push(key);
        pb.inc(1);
    }
    pb.finish_and_clear();

    if nzero_spread > 0 {
        warn!(
            "{} group/feature pairs have a median absolute deviation of 0; \
             `{}` values there are missing or very large. \
             Remove constant features beforehand, e.g. with `drop_na`.",
            nzero_spread,
            reducer.name()
        );
    }

    Ok(GroupedResult {
        group_keys: group_keys.iter().map(|k| Box::from(k.as_ref())).collect(),
        groups: keys,
        features,
        values,
    })
}

/// Apply `f` to each group's block of `X` and write the blocks back.
/// The matrix must be in memory. Every block is transformed before
/// any is written, so an error leaves `X` unchanged.
///
/// * `group_keys` - metadata columns forming a composite key
/// * `f` - transforms an `observation x feature` block in place
pub fn group_obs_fun_inplace<S, F>(matrix: &mut AnnotatedMatrix, group_keys: &[S], mut f: F) -> anyhow::Result<()>
where
    S: AsRef<str>,
    F: FnMut(&mut Array2<f32>) -> anyhow::Result<()>,
{
    let groups = group_indices(matrix.obs(), group_keys)?;
    let x = match matrix.x() {
        MatrixStore::Dense(x) => x,
        MatrixStore::Backed(x) => anyhow::bail!(
            "{} is disk-backed; call `to_memory` before modifying X",
            x.file_name()
        ),
    };

    let mut blocks = Vec::with_capacity(groups.len());
    for (_, rows) in groups {
        let mut block = x.select(Axis(0), &rows);
        f(&mut block)?;
        if block.nrows() != rows.len() {
            return Err(MorphError::shape_mismatch("rows of transformed block", rows.len(), block.nrows()).into());
        }
        if block.ncols() != x.ncols() {
            return Err(MorphError::shape_mismatch("columns of transformed block", x.ncols(), block.ncols()).into());
        }
        blocks.push((rows, block));
    }

    let x = matrix.x_mut()?;
    for (rows, block) in blocks {
        for (r, &i) in rows.iter().enumerate() {
            x.row_mut(i).assign(&block.row(r));
        }
    }
    Ok(())
}

////////////////////////////////////
// inferring key columns by name  //
////////////////////////////////////

/// Kinds of metadata columns that can be found by name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Batch,
    Well,
    Treatment,
    Site,
}

impl KeyKind {
    pub fn name(&self) -> &'static str {
        match self {
            KeyKind::Batch => "batch",
            KeyKind::Well => "well",
            KeyKind::Treatment => "treatment",
            KeyKind::Site => "site",
        }
    }

    fn pattern(&self) -> &'static str {
        match self {
            KeyKind::Batch => "batch|plate",
            KeyKind::Well => "well$",
            KeyKind::Treatment => "treatment",
            KeyKind::Site => "site$",
        }
    }

    /// Case-insensitive name rule
    pub fn rule(&self) -> anyhow::Result<Regex> {
        Ok(RegexBuilder::new(self.pattern())
            .case_insensitive(true)
            .build()?)
    }
}

/// First metadata column whose name looks like `kind`. Several
/// candidates are warned about.
pub fn infer_key_name<S: AsRef<str>>(kind: KeyKind, columns: &[S]) -> anyhow::Result<Box<str>> {
    let rule = kind.rule()?;
    let found: Vec<&str> = columns
        .iter()
        .map(|x| x.as_ref())
        .filter(|x| rule.is_match(x))
        .collect();

    match found.as_slice() {
        [] => anyhow::bail!(
            "no {} column found among: {}; specify it explicitly",
            kind.name(),
            columns.iter().map(|x| x.as_ref()).collect::<Vec<_>>().join(", ")
        ),
        [only] => Ok(Box::from(*only)),
        [first, ..] => {
            warn!(
                "Found multiple {} columns: {}. Using `{}`; name the {} column explicitly if that is not intended.",
                kind.name(),
                found.join(", "),
                first,
                kind.name()
            );
            Ok(Box::from(*first))
        }
    }
}

/// `key` if given, otherwise inferred from the metadata columns
pub fn resolve_key(obs: &MetaTable, key: Option<&str>, kind: KeyKind) -> anyhow::Result<Box<str>> {
    match key {
        Some(k) => Ok(Box::from(k)),
        None => infer_key_name(kind, obs.column_names()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn statistic_semantics() {
        let xs = [1.0, 2.0, 3.0, 4.0];
        let run = |s: Statistic| s.reduce(&mut xs.to_vec());
        assert_abs_diff_eq!(run(Statistic::Mean), 2.5);
        assert_abs_diff_eq!(run(Statistic::Median), 2.5);
        assert_abs_diff_eq!(run(Statistic::Var), 1.25);
        assert_abs_diff_eq!(run(Statistic::Std), 1.25_f64.sqrt());
        assert_abs_diff_eq!(run(Statistic::Sem), (5.0 / 3.0 / 4.0_f64).sqrt());
        assert_abs_diff_eq!(run(Statistic::Mad), 1.0);
        assert_abs_diff_eq!(
            run(Statistic::LogMean),
            xs.iter().map(|x: &f64| x.ln_1p()).sum::<f64>() / 4.0
        );
    }

    #[test]
    fn unknown_statistic_lists_choices() {
        let err = "mode".parse::<Statistic>().unwrap_err();
        assert!(err.to_string().contains("mad_scaled"));
    }

    #[test]
    fn infer_is_case_insensitive() -> anyhow::Result<()> {
        let cols = ["Metadata_Plate", "Metadata_Well", "Metadata_Treatment"];
        assert_eq!(infer_key_name(KeyKind::Well, &cols)?.as_ref(), "Metadata_Well");
        assert_eq!(infer_key_name(KeyKind::Batch, &cols)?.as_ref(), "Metadata_Plate");
        assert!(infer_key_name(KeyKind::Site, &cols).is_err());
        Ok(())
    }
}
