use crate::annotated::{AnnotatedMatrix, MatrixStore, VarAnnotations};
use crate::column_rules::{report_discarded, ColumnPlan};
use crate::columnar::{read_measurements, read_metadata, IngestOptions};
use crate::errors::MorphError;
use crate::hdf5_store::{write_meta_table, Hdf5Matrix};
use crate::header::parse_batch_header;
use crate::meta_table::MetaTable;
use crate::misc::{new_progress_bar, positional_names};

use log::info;
use ndarray::Array2;
use std::path::{Path, PathBuf};

/// Destination of per-file measurement blocks
pub trait BlockSink {
    /// `(rows, columns)` allocated up front
    fn shape(&self) -> (usize, usize);

    /// Write `block` into rows `row_offset..row_offset + block.nrows()`
    fn write_block(&mut self, row_offset: usize, block: &Array2<f32>) -> anyhow::Result<()>;
}

impl BlockSink for Hdf5Matrix {
    fn shape(&self) -> (usize, usize) {
        Hdf5Matrix::shape(self)
    }

    fn write_block(&mut self, row_offset: usize, block: &Array2<f32>) -> anyhow::Result<()> {
        self.write_rows(row_offset, &block.view())
    }
}

/// Find files whose name ends with `suffix`, recursively under each
/// root, sorted within each root. A root that is itself a matching
/// file is taken as is.
///
/// * `roots` - directories or files
/// * `suffix` - file name suffix, e.g. `Nuclei.csv`
pub fn find_files<P: AsRef<Path>>(roots: &[P], suffix: &str) -> anyhow::Result<Vec<PathBuf>> {
    let matches = |p: &Path| {
        p.file_name()
            .and_then(|x| x.to_str())
            .map(|x| x.ends_with(suffix))
            .unwrap_or(false)
    };

    let mut ret = vec![];
    for root in roots.iter().map(|x| x.as_ref()) {
        if root.is_file() && matches(root) {
            ret.push(root.to_path_buf());
        } else if root.is_dir() {
            let mut found = vec![];
            for entry in walkdir::WalkDir::new(root) {
                let entry = entry?;
                let path = entry.path();
                if path.is_file() && matches(path) {
                    found.push(path.to_path_buf());
                }
            }
            found.sort();
            ret.extend(found);
        } else {
            return Err(MorphError::InputNotFound(format!(
                "{} is neither a {} file nor a directory",
                root.display(),
                suffix
            ))
            .into());
        }
    }

    if ret.is_empty() {
        let roots: Vec<String> = roots.iter().map(|x| x.as_ref().display().to_string()).collect();
        return Err(MorphError::InputNotFound(format!(
            "no files ending in {} under {}",
            suffix,
            roots.join(", ")
        ))
        .into());
    }
    Ok(ret)
}

fn path_str(path: &Path) -> anyhow::Result<&str> {
    path.to_str()
        .ok_or(anyhow::anyhow!("non-utf8 path: {}", path.display()))
}

/// Metadata of every file, stacked in file order, with the number of
/// rows each file contributed
pub fn read_batch_metadata(
    files: &[PathBuf],
    plan: &ColumnPlan,
    opts: &IngestOptions,
) -> anyhow::Result<(MetaTable, Vec<usize>)> {
    let pb = new_progress_bar(files.len(), "files", opts.progress);
    let mut tables = Vec::with_capacity(files.len());
    for f in files {
        tables.push(read_metadata(path_str(f)?, plan, opts)?);
        pb.inc(1);
    }
    pb.finish_and_clear();

    let nrows = tables.iter().map(|t| t.nrows()).collect();
    Ok((MetaTable::concat(&tables), nrows))
}

/// Stream each file's measurement block into consecutive row ranges
/// of `sink`. Only one file's block is held at a time. Returns the
/// number of rows written.
///
/// * `files` - input files, in the order of the metadata pass
/// * `rows_per_file` - row counts seen in the metadata pass
/// * `sink` - preallocated destination
pub fn stream_measurements<S: BlockSink + ?Sized>(
    files: &[PathBuf],
    rows_per_file: &[usize],
    plan: &ColumnPlan,
    opts: &IngestOptions,
    sink: &mut S,
) -> anyhow::Result<usize> {
    let (nrows, ncols) = sink.shape();
    let pb = new_progress_bar(files.len(), "files", opts.progress);

    let mut offset = 0;
    for (f, &expected) in files.iter().zip(rows_per_file) {
        let file = path_str(f)?;
        let block = read_measurements(file, plan, opts)?;

        if block.nrows() != expected {
            return Err(MorphError::shape_mismatch(format!("rows of {}", file), expected, block.nrows()).into());
        }
        if block.ncols() != ncols {
            return Err(MorphError::shape_mismatch(format!("features of {}", file), ncols, block.ncols()).into());
        }
        if offset + block.nrows() > nrows {
            return Err(MorphError::shape_mismatch("rows of the store", nrows, offset + block.nrows()).into());
        }

        sink.write_block(offset, &block)?;
        offset += block.nrows();
        pb.inc(1);
    }
    pb.finish_and_clear();

    if offset != nrows {
        return Err(MorphError::shape_mismatch("rows written", nrows, offset).into());
    }
    Ok(offset)
}

/// Ingest every matching file under `roots` into a disk-backed matrix
/// at `output`.
///
/// The first file's header defines the columns for all files. A
/// metadata pass over all files sizes the store and fills `obs`;
/// `obs`/`var` are written before any measurement; a second pass
/// writes one file's block at a time. A failure in the second pass
/// leaves a structurally valid but incomplete file; rerun into a
/// fresh output.
///
/// * `roots` - directories (or files) to search
/// * `suffix` - file name suffix to match
/// * `output` - hdf5 file to create
pub fn ingest_directory<P: AsRef<Path>>(
    roots: &[P],
    suffix: &str,
    opts: &IngestOptions,
    output: &str,
) -> anyhow::Result<AnnotatedMatrix> {
    let files = find_files(roots, suffix)?;
    info!("Found {} files", files.len());

    let file_names = files
        .iter()
        .map(|f| path_str(f))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let header = parse_batch_header(&file_names, opts.n_headers, opts.delimiter, opts.sanitize)?;
    let plan = opts.plan(header);
    report_discarded(&plan.classes);

    info!("Reading in all metadata...");
    let (obs, rows_per_file) = read_batch_metadata(&files, &plan, opts)?;
    let obs_names = positional_names(obs.nrows());
    let var = VarAnnotations::split(plan.measurement_names().to_vec(), &opts.feature_delim);

    let (nrows, ncols) = (obs.nrows(), var.len());
    info!("Creating {} ({} x {})", output, nrows, ncols);
    {
        let store = Hdf5Matrix::create(output, nrows, ncols)?;
        write_meta_table(store.backend(), "obs", &obs_names, &obs)?;
        write_meta_table(store.backend(), "var", var.names(), &var.to_table())?;
        store.close()?;
    }

    info!("Converting all data...");
    let mut store = Hdf5Matrix::open_rw(output)?;
    stream_measurements(&files, &rows_per_file, &plan, opts, &mut store)?;
    store.flush()?;

    AnnotatedMatrix::new(obs_names, var, MatrixStore::Backed(store), obs)
}
