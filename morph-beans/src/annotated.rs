use crate::annotations::{Annotations, GroupedResult};
use crate::column_rules::{report_discarded, ColumnPlan};
use crate::columnar::{read_measurements, read_metadata, IngestOptions};
use crate::errors::MorphError;
use crate::hdf5_store::Hdf5Matrix;
use crate::header::parse_header;
use crate::meta_table::{MetaColumn, MetaTable};
use crate::misc::positional_names;

use fnv::FnvHashSet as HashSet;
use log::info;
use ndarray::{Array2, Axis};
use std::collections::HashMap;
use std::ops::Range;

/// Feature names with their positional parts, e.g.
/// `Nuclei_Intensity_MeanIntensity_DNA` -> `[Nuclei, Intensity,
/// MeanIntensity, DNA]`. Shorter splits are padded with `None` at the
/// end so every feature has the same number of parts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VarAnnotations {
    names: Vec<Box<str>>,
    parts: Vec<Vec<Option<Box<str>>>>,
}

impl VarAnnotations {
    /// Split each name on `delim`
    pub fn split(names: Vec<Box<str>>, delim: &str) -> Self {
        let mut parts: Vec<Vec<Option<Box<str>>>> = names
            .iter()
            .map(|x| {
                if delim.is_empty() {
                    vec![Some(x.clone())]
                } else {
                    x.split(delim).map(|p| Some(Box::from(p))).collect()
                }
            })
            .collect();

        let arity = parts.iter().map(|p| p.len()).max().unwrap_or(0);
        for p in parts.iter_mut() {
            p.resize(arity, None);
        }
        Self { names, parts }
    }

    /// Names without any parts
    pub fn plain(names: Vec<Box<str>>) -> Self {
        let parts = vec![vec![]; names.len()];
        Self { names, parts }
    }

    pub fn names(&self) -> &[Box<str>] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Number of parts per feature
    pub fn arity(&self) -> usize {
        self.parts.first().map(|p| p.len()).unwrap_or(0)
    }

    /// `k`-th part of feature `j`
    pub fn part(&self, j: usize, k: usize) -> Option<&str> {
        self.parts.get(j)?.get(k)?.as_deref()
    }

    /// `feature_0, feature_1, ...`
    pub fn part_names(&self) -> Vec<Box<str>> {
        (0..self.arity())
            .map(|k| format!("feature_{}", k).into_boxed_str())
            .collect()
    }

    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            names: indices.iter().map(|&j| self.names[j].clone()).collect(),
            parts: indices.iter().map(|&j| self.parts[j].clone()).collect(),
        }
    }

    /// Parts as a text table; missing parts are empty strings
    pub fn to_table(&self) -> MetaTable {
        let mut ret = MetaTable::empty(self.len());
        for (k, name) in self.part_names().iter().enumerate() {
            let col = (0..self.len())
                .map(|j| Box::from(self.part(j, k).unwrap_or("")))
                .collect();
            // lengths agree by construction
            let _ = ret.insert(name, MetaColumn::Text(col));
        }
        ret
    }

    /// Inverse of [`to_table`](Self::to_table); empty strings become
    /// missing parts
    pub fn from_table(names: Vec<Box<str>>, table: &MetaTable) -> Self {
        let cols: Vec<Vec<Box<str>>> = table.iter().map(|(_, c)| c.to_text()).collect();
        let parts = (0..names.len())
            .map(|j| {
                cols.iter()
                    .map(|c| c.get(j).filter(|x| !x.is_empty()).cloned())
                    .collect()
            })
            .collect();
        Self { names, parts }
    }
}

/// `X` kept in memory or on disk
#[derive(Debug)]
pub enum MatrixStore {
    Dense(Array2<f32>),
    Backed(Hdf5Matrix),
}

impl MatrixStore {
    pub fn shape(&self) -> (usize, usize) {
        match self {
            MatrixStore::Dense(x) => x.dim(),
            MatrixStore::Backed(x) => x.shape(),
        }
    }

    pub fn is_backed(&self) -> bool {
        matches!(self, MatrixStore::Backed(_))
    }

    pub fn read_rows(&self, rows: Range<usize>) -> anyhow::Result<Array2<f32>> {
        match self {
            MatrixStore::Dense(x) => {
                anyhow::ensure!(rows.end <= x.nrows(), "row range {:?} out of bounds", rows);
                Ok(x.slice(ndarray::s![rows, ..]).to_owned())
            }
            MatrixStore::Backed(x) => x.read_rows(rows),
        }
    }

    pub fn read_rows_indexed(&self, rows: &[usize]) -> anyhow::Result<Array2<f32>> {
        match self {
            MatrixStore::Dense(x) => {
                anyhow::ensure!(rows.iter().all(|&i| i < x.nrows()), "row index out of bounds");
                Ok(x.select(Axis(0), rows))
            }
            MatrixStore::Backed(x) => x.read_rows_indexed(rows),
        }
    }

    /// Overwrite rows `offset..offset + block.nrows()`
    pub fn write_rows(&mut self, offset: usize, block: &Array2<f32>) -> anyhow::Result<()> {
        match self {
            MatrixStore::Dense(x) => {
                let (nrows, ncols) = x.dim();
                if block.ncols() != ncols {
                    return Err(MorphError::shape_mismatch("columns of block", ncols, block.ncols()).into());
                }
                if offset + block.nrows() > nrows {
                    return Err(MorphError::shape_mismatch("rows of X", nrows, offset + block.nrows()).into());
                }
                x.slice_mut(ndarray::s![offset..offset + block.nrows(), ..])
                    .assign(block);
                Ok(())
            }
            MatrixStore::Backed(x) => x.write_rows(offset, &block.view()),
        }
    }

    pub fn to_dense(&self) -> anyhow::Result<Array2<f32>> {
        match self {
            MatrixStore::Dense(x) => Ok(x.clone()),
            MatrixStore::Backed(x) => x.read_all(),
        }
    }
}

/// Measurement matrix (rows = observations, columns = features) with
/// observation metadata, feature annotations, alternate layers and
/// derived artifacts
///
/// Any change to `X`, `obs`, the layers or the observation/feature
/// sets clears the grouped-operation cache in `uns`.
#[derive(Debug)]
pub struct AnnotatedMatrix {
    obs_names: Vec<Box<str>>,
    var: VarAnnotations,
    x: MatrixStore,
    obs: MetaTable,
    layers: HashMap<Box<str>, Array2<f32>>,
    uns: Annotations,
    generation: u64,
}

fn ensure_unique(names: &[Box<str>], what: &str) -> anyhow::Result<()> {
    let mut seen: HashSet<&str> = HashSet::default();
    if let Some(dup) = names.iter().find(|&x| !seen.insert(x.as_ref())) {
        anyhow::bail!("duplicated {} name `{}`", what, dup);
    }
    Ok(())
}

impl AnnotatedMatrix {
    /// * `obs_names` - unique observation names
    /// * `var` - unique feature names and their parts
    /// * `x` - `obs_names.len() x var.len()` matrix
    /// * `obs` - metadata with one row per observation
    pub fn new(
        obs_names: Vec<Box<str>>,
        var: VarAnnotations,
        x: MatrixStore,
        obs: MetaTable,
    ) -> anyhow::Result<Self> {
        let (nrows, ncols) = x.shape();
        if obs_names.len() != nrows {
            return Err(MorphError::shape_mismatch("observation names", nrows, obs_names.len()).into());
        }
        if obs.nrows() != nrows {
            return Err(MorphError::shape_mismatch("metadata rows", nrows, obs.nrows()).into());
        }
        if var.len() != ncols {
            return Err(MorphError::shape_mismatch("feature names", ncols, var.len()).into());
        }
        ensure_unique(&obs_names, "observation")?;
        ensure_unique(var.names(), "feature")?;

        Ok(Self {
            obs_names,
            var,
            x,
            obs,
            layers: HashMap::new(),
            uns: Annotations::default(),
            generation: 0,
        })
    }

    pub fn n_obs(&self) -> usize {
        self.obs_names.len()
    }

    pub fn n_vars(&self) -> usize {
        self.var.len()
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.n_obs(), self.n_vars())
    }

    pub fn obs_names(&self) -> &[Box<str>] {
        &self.obs_names
    }

    pub fn var(&self) -> &VarAnnotations {
        &self.var
    }

    pub fn var_names(&self) -> &[Box<str>] {
        self.var.names()
    }

    pub fn obs(&self) -> &MetaTable {
        &self.obs
    }

    pub fn x(&self) -> &MatrixStore {
        &self.x
    }

    pub fn uns(&self) -> &Annotations {
        &self.uns
    }

    pub fn uns_mut(&mut self) -> &mut Annotations {
        &mut self.uns
    }

    /// Bumped on every structural change
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn touch(&mut self) {
        self.generation += 1;
        self.uns.clear_cache();
    }

    pub fn obs_mut(&mut self) -> &mut MetaTable {
        self.touch();
        &mut self.obs
    }

    /// Mutable in-memory `X`; fails for a disk-backed matrix
    pub fn x_mut(&mut self) -> anyhow::Result<&mut Array2<f32>> {
        self.touch();
        match &mut self.x {
            MatrixStore::Dense(x) => Ok(x),
            MatrixStore::Backed(x) => anyhow::bail!(
                "{} is disk-backed; call `to_memory` before modifying X",
                x.file_name()
            ),
        }
    }

    /// Mutable `X` storage, in memory or on disk
    pub fn x_store_mut(&mut self) -> &mut MatrixStore {
        self.touch();
        &mut self.x
    }

    /// Replace `X` with a matrix of the same shape
    pub fn set_x(&mut self, x: MatrixStore) -> anyhow::Result<()> {
        if x.shape() != self.x.shape() {
            let (r, c) = x.shape();
            let (nr, nc) = self.x.shape();
            if r != nr {
                return Err(MorphError::shape_mismatch("rows of X", nr, r).into());
            }
            return Err(MorphError::shape_mismatch("columns of X", nc, c).into());
        }
        self.touch();
        self.x = x;
        Ok(())
    }

    /// Load a disk-backed `X` into memory
    pub fn to_memory(&mut self) -> anyhow::Result<()> {
        if let MatrixStore::Backed(x) = &self.x {
            info!("loading {} into memory", x.file_name());
            let dense = x.read_all()?;
            self.x = MatrixStore::Dense(dense);
        }
        Ok(())
    }

    pub fn layer_names(&self) -> Vec<Box<str>> {
        let mut ret: Vec<Box<str>> = self.layers.keys().cloned().collect();
        ret.sort();
        ret
    }

    pub fn layer(&self, name: &str) -> Option<&Array2<f32>> {
        self.layers.get(name)
    }

    fn unknown_layer(&self, name: &str) -> anyhow::Error {
        let valid = self.layer_names();
        let valid: Vec<&str> = valid.iter().map(|x| x.as_ref()).collect();
        MorphError::unsupported("layer", name, &valid).into()
    }

    /// Add or replace an alternate `observation x k` view
    pub fn set_layer(&mut self, name: &str, data: Array2<f32>) -> anyhow::Result<()> {
        if data.nrows() != self.n_obs() {
            return Err(MorphError::shape_mismatch(format!("rows of layer {}", name), self.n_obs(), data.nrows()).into());
        }
        self.touch();
        self.layers.insert(name.into(), data);
        Ok(())
    }

    /// Column names of `X` or of a layer
    pub fn feature_names(&self, layer: Option<&str>) -> anyhow::Result<Vec<Box<str>>> {
        match layer {
            None => Ok(self.var_names().to_vec()),
            Some(name) => {
                let data = self.layer(name).ok_or_else(|| self.unknown_layer(name))?;
                Ok((0..data.ncols())
                    .map(|k| format!("{}_{}", name, k).into_boxed_str())
                    .collect())
            }
        }
    }

    /// Rows of `X` (or of a layer) in the given order
    pub fn read_rows_indexed(&self, rows: &[usize], layer: Option<&str>) -> anyhow::Result<Array2<f32>> {
        match layer {
            None => self.x.read_rows_indexed(rows),
            Some(name) => {
                let data = self.layer(name).ok_or_else(|| self.unknown_layer(name))?;
                anyhow::ensure!(rows.iter().all(|&i| i < data.nrows()), "row index out of bounds");
                Ok(data.select(Axis(0), rows))
            }
        }
    }

    /// Full `X` or layer in memory
    pub fn dense(&self, layer: Option<&str>) -> anyhow::Result<Array2<f32>> {
        match layer {
            None => self.x.to_dense(),
            Some(name) => self
                .layer(name)
                .cloned()
                .ok_or_else(|| self.unknown_layer(name)),
        }
    }

    /// Keep the observations at `indices`, in that order. A
    /// disk-backed `X` is read into memory.
    pub fn subset_obs(&mut self, indices: &[usize]) -> anyhow::Result<()> {
        let x = self.x.read_rows_indexed(indices)?;
        self.x = MatrixStore::Dense(x);
        self.obs = self.obs.select_rows(indices);
        self.obs_names = indices.iter().map(|&i| self.obs_names[i].clone()).collect();
        for data in self.layers.values_mut() {
            *data = data.select(Axis(0), indices);
        }
        self.touch();
        Ok(())
    }

    /// Keep the features at `indices`, in that order
    pub fn subset_vars(&mut self, indices: &[usize]) -> anyhow::Result<()> {
        anyhow::ensure!(
            indices.iter().all(|&j| j < self.n_vars()),
            "feature index out of bounds"
        );
        let x = self.x.to_dense()?.select(Axis(1), indices);
        self.x = MatrixStore::Dense(x);
        self.var = self.var.select(indices);
        self.touch();
        Ok(())
    }

    /// Drop features by name; returns how many were dropped
    pub fn drop_vars<S: AsRef<str>>(&mut self, names: &[S]) -> anyhow::Result<usize> {
        let drop: HashSet<&str> = names.iter().map(|x| x.as_ref()).collect();
        let keep: Vec<usize> = (0..self.n_vars())
            .filter(|&j| !drop.contains(self.var_names()[j].as_ref()))
            .collect();
        let ndropped = self.n_vars() - keep.len();
        if ndropped > 0 {
            self.subset_vars(&keep)?;
        }
        Ok(ndropped)
    }

    /// Read-only view of some observations sharing this matrix's
    /// storage
    pub fn view_obs(&self, indices: &[usize]) -> ObsView<'_> {
        ObsView {
            parent: self,
            indices: indices.to_vec(),
        }
    }

    /// Flush and release a disk-backed store
    pub fn close(self) -> anyhow::Result<()> {
        if let MatrixStore::Backed(x) = self.x {
            x.close()?;
        }
        Ok(())
    }
}

/// Observations of an [`AnnotatedMatrix`] selected by index; nothing
/// is copied until rows are read
pub struct ObsView<'a> {
    parent: &'a AnnotatedMatrix,
    indices: Vec<usize>,
}

impl ObsView<'_> {
    pub fn n_obs(&self) -> usize {
        self.indices.len()
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn read(&self, layer: Option<&str>) -> anyhow::Result<Array2<f32>> {
        self.parent.read_rows_indexed(&self.indices, layer)
    }

    pub fn obs(&self) -> MetaTable {
        self.parent.obs.select_rows(&self.indices)
    }

    /// Independent in-memory copy
    pub fn to_owned(&self) -> anyhow::Result<AnnotatedMatrix> {
        let mut ret = AnnotatedMatrix::new(
            self.indices
                .iter()
                .map(|&i| self.parent.obs_names[i].clone())
                .collect(),
            self.parent.var.clone(),
            MatrixStore::Dense(self.read(None)?),
            self.obs(),
        )?;
        for (name, data) in self.parent.layers.iter() {
            ret.layers.insert(name.clone(), data.select(Axis(0), &self.indices));
        }
        Ok(ret)
    }
}

/// Combine metadata and measurements into an annotated matrix.
/// Observation names are positional.
///
/// * `meta` - one row per observation
/// * `x` - `observation x feature` measurements
/// * `var_names` - feature names, split on `feature_delim`
pub fn assemble(
    meta: MetaTable,
    x: Array2<f32>,
    var_names: Vec<Box<str>>,
    feature_delim: &str,
) -> anyhow::Result<AnnotatedMatrix> {
    if meta.nrows() != x.nrows() {
        return Err(MorphError::shape_mismatch("metadata vs. measurement rows", x.nrows(), meta.nrows()).into());
    }
    AnnotatedMatrix::new(
        positional_names(x.nrows()),
        VarAnnotations::split(var_names, feature_delim),
        MatrixStore::Dense(x),
        meta,
    )
}

fn read_with_plan(file: &str, plan: &ColumnPlan, opts: &IngestOptions) -> anyhow::Result<AnnotatedMatrix> {
    report_discarded(&plan.classes);
    let meta = read_metadata(file, plan, opts)?;
    let x = read_measurements(file, plan, opts)?;
    info!("{}: {} observations, {} features", file, x.nrows(), x.ncols());
    assemble(meta, x, plan.measurement_names().to_vec(), &opts.feature_delim)
}

/// Read a CellProfiler export into memory: header, classification,
/// metadata pass, measurement pass, assembly
pub fn read_cellprofiler(file: &str, opts: &IngestOptions) -> anyhow::Result<AnnotatedMatrix> {
    let header = parse_header(file, opts.n_headers, opts.delimiter, opts.sanitize)?;
    let plan = opts.plan(header);
    read_with_plan(file, &plan, opts)
}

/// Read per-image QC metrics. Metadata columns are those containing
/// `metadata` (any case) unless given explicitly; `label_col` moves
/// to the obs column `label`.
pub fn read_image_qc(file: &str, label_col: &str, opts: &IngestOptions) -> anyhow::Result<AnnotatedMatrix> {
    let header = parse_header(file, opts.n_headers, opts.delimiter, opts.sanitize)?;
    anyhow::ensure!(
        header.iter().any(|x| x.as_ref() == label_col),
        "{}: no label column `{}`",
        file,
        label_col
    );

    let mut meta_cols: Vec<Box<str>> = match &opts.meta_cols {
        Some(m) => m.clone(),
        None => header
            .iter()
            .filter(|x| x.to_lowercase().contains("metadata"))
            .cloned()
            .collect(),
    };
    if !meta_cols.iter().any(|x| x.as_ref() == label_col) {
        meta_cols.push(label_col.into());
    }

    let plan = ColumnPlan::new(header, Some(&meta_cols));
    let mut ret = read_with_plan(file, &plan, opts)?;
    ret.obs_mut().rename(label_col, "label")?;
    Ok(ret)
}

impl GroupedResult {
    /// Groups become observations: named by the key value for a
    /// single key, positionally otherwise, with the key columns
    /// rebuilt in `obs`
    pub fn to_annotated(&self) -> anyhow::Result<AnnotatedMatrix> {
        let ngroups = self.num_groups();
        let obs_names = if self.group_keys.len() == 1 {
            self.groups.iter().map(|g| g[0].clone()).collect()
        } else {
            positional_names(ngroups)
        };

        let mut obs = MetaTable::empty(ngroups);
        for (k, key) in self.group_keys.iter().enumerate() {
            let cells = self.groups.iter().map(|g| g[k].clone()).collect();
            obs.insert(key, MetaColumn::from_cells(cells))?;
        }

        AnnotatedMatrix::new(
            obs_names,
            VarAnnotations::plain(self.features.clone()),
            MatrixStore::Dense(self.values.mapv(|v| v as f32)),
            obs,
        )
    }

    /// Read groups back from the `group_keys` columns of `obs`
    pub fn from_annotated<S: AsRef<str>>(matrix: &AnnotatedMatrix, group_keys: &[S]) -> anyhow::Result<Self> {
        let cols = group_keys
            .iter()
            .map(|k| {
                matrix
                    .obs()
                    .column(k.as_ref())
                    .ok_or(anyhow::anyhow!("no metadata column `{}`", k.as_ref()))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let groups = (0..matrix.n_obs())
            .map(|i| cols.iter().map(|c| c.text_at(i)).collect())
            .collect();

        Ok(Self {
            group_keys: group_keys.iter().map(|k| Box::from(k.as_ref())).collect(),
            groups,
            features: matrix.var_names().to_vec(),
            values: matrix.dense(None)?.mapv(|v| v as f64),
        })
    }
}
