use crate::annotated::{AnnotatedMatrix, MatrixStore, VarAnnotations};
use crate::annotations::Annotations;
use crate::errors::MorphError;
use crate::meta_table::{MetaColumn, MetaTable};

use hdf5::types::{TypeDescriptor, VarLenUnicode};
use log::info;
use matrix_util::utils::{coalesce_runs, generate_minibatch_intervals};
use ndarray::{s, Array2, ArrayView2, Axis};
use std::ops::Range;

const MAX_CHUNK_ROWS: usize = 10000;
const MAX_CHUNK_COLS: usize = 10;
const COMPRESSION_LEVEL: u8 = 5;
const WRITE_BLOCK_ROWS: usize = 10000;

/// Dense `observation x feature` matrix with hdf5 backend
///
/// ```text
/// (root)
///     ├── n_obs, n_var (attributes)
///     ├── X  (f32, chunked by at most 10000 rows x 10 columns)
///     ├── obs
///     │   ├── _index
///     │   ├── column-order
///     │   └── col_0, col_1, ...
///     ├── var
///     │   ├── _index
///     │   ├── column-order
///     │   └── col_0, col_1, ...
///     └── uns (json)
/// ```
///
/// Rows not yet written hold the dataset fill value (zero).
#[derive(Debug)]
pub struct Hdf5Matrix {
    backend: hdf5::File,
    file_name: Box<str>,
    nrows: usize,
    ncols: usize,
}

impl Hdf5Matrix {
    /// Create a new file with an empty `nrows x ncols` matrix,
    /// truncating `file` if it exists
    ///
    /// * `file` - hdf5 file name
    /// * `nrows` - number of observations
    /// * `ncols` - number of features
    pub fn create(file: &str, nrows: usize, ncols: usize) -> anyhow::Result<Self> {
        anyhow::ensure!(
            nrows > 0 && ncols > 0,
            "cannot create an empty {} x {} matrix",
            nrows,
            ncols
        );

        let backend = hdf5::File::create(file)?;

        let chunk = (nrows.min(MAX_CHUNK_ROWS), ncols.min(MAX_CHUNK_COLS));
        backend
            .new_dataset::<f32>()
            .shape((nrows, ncols))
            .chunk(chunk)
            .blosc_blosclz(COMPRESSION_LEVEL, true)
            .create("X")?;

        for (name, value) in [("n_obs", nrows), ("n_var", ncols)] {
            backend
                .new_attr::<usize>()
                .create(name)?
                .write_scalar(&value)?;
        }

        info!("created {}: {} x {}", file, nrows, ncols);

        Ok(Self {
            backend,
            file_name: file.into(),
            nrows,
            ncols,
        })
    }

    /// Open an existing matrix read-only
    pub fn open(file: &str) -> anyhow::Result<Self> {
        if !std::path::Path::new(file).is_file() {
            return Err(MorphError::InputNotFound(file.to_string()).into());
        }
        Self::from_backend(hdf5::File::open(file)?, file)
    }

    /// Open an existing matrix for reading and writing
    pub fn open_rw(file: &str) -> anyhow::Result<Self> {
        if !std::path::Path::new(file).is_file() {
            return Err(MorphError::InputNotFound(file.to_string()).into());
        }
        Self::from_backend(hdf5::File::open_rw(file)?, file)
    }

    fn from_backend(backend: hdf5::File, file: &str) -> anyhow::Result<Self> {
        let shape = backend.dataset("X")?.shape();
        anyhow::ensure!(shape.len() == 2, "{}: X is not a matrix", file);
        let (nrows, ncols) = (shape[0], shape[1]);

        if let Ok(attr) = backend.attr("n_obs") {
            let n_obs: usize = attr.read_scalar()?;
            if n_obs != nrows {
                return Err(MorphError::shape_mismatch("n_obs attribute", nrows, n_obs).into());
            }
        }

        Ok(Self {
            backend,
            file_name: file.into(),
            nrows,
            ncols,
        })
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.nrows, self.ncols)
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn backend(&self) -> &hdf5::File {
        &self.backend
    }

    /// Write `block` into rows `offset..offset + block.nrows()`
    pub fn write_rows(&mut self, offset: usize, block: &ArrayView2<f32>) -> anyhow::Result<()> {
        if block.ncols() != self.ncols {
            return Err(MorphError::shape_mismatch("columns of a row block", self.ncols, block.ncols()).into());
        }
        let end = offset + block.nrows();
        if end > self.nrows {
            return Err(MorphError::shape_mismatch("rows of the store", self.nrows, end).into());
        }
        if block.nrows() == 0 {
            return Ok(());
        }
        let block = block.as_standard_layout();
        self.backend
            .dataset("X")?
            .write_slice(&block, s![offset..end, ..])?;
        Ok(())
    }

    /// Read a contiguous range of rows
    pub fn read_rows(&self, rows: Range<usize>) -> anyhow::Result<Array2<f32>> {
        if rows.end > self.nrows {
            return Err(MorphError::shape_mismatch("rows of the store", self.nrows, rows.end).into());
        }
        if rows.is_empty() {
            return Ok(Array2::zeros((0, self.ncols)));
        }
        Ok(self
            .backend
            .dataset("X")?
            .read_slice_2d::<f32, _>(s![rows.start..rows.end, ..])?)
    }

    /// Read rows in the given order, one hdf5 read per run of
    /// consecutive indexes
    pub fn read_rows_indexed(&self, rows: &[usize]) -> anyhow::Result<Array2<f32>> {
        let blocks = coalesce_runs(rows)
            .into_iter()
            .map(|r| self.read_rows(r))
            .collect::<anyhow::Result<Vec<_>>>()?;
        match blocks.len() {
            0 => Ok(Array2::zeros((0, self.ncols))),
            1 => Ok(blocks.into_iter().next().unwrap_or_default()),
            _ => {
                let views: Vec<_> = blocks.iter().map(|b| b.view()).collect();
                Ok(ndarray::concatenate(Axis(0), &views)?)
            }
        }
    }

    pub fn read_all(&self) -> anyhow::Result<Array2<f32>> {
        Ok(self.backend.dataset("X")?.read_2d::<f32>()?)
    }

    pub fn flush(&self) -> anyhow::Result<()> {
        self.backend.flush()?;
        Ok(())
    }

    /// Flush and release the file handle
    pub fn close(self) -> anyhow::Result<()> {
        self.flush()?;
        self.backend.close()?;
        Ok(())
    }
}

///////////////////////////////////
// names and metadata tables     //
///////////////////////////////////

fn write_strings(group: &hdf5::Group, key: &str, values: &[Box<str>]) -> anyhow::Result<()> {
    let values = values
        .iter()
        .map(|x| x.parse::<VarLenUnicode>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("invalid string in {}: {:?}", key, e))?;

    group
        .new_dataset::<VarLenUnicode>()
        .shape(values.len())
        .create(key)?
        .write(&values)?;
    Ok(())
}

fn read_strings(group: &hdf5::Group, key: &str) -> anyhow::Result<Vec<Box<str>>> {
    let ret = group.dataset(key)?.read_1d::<VarLenUnicode>()?;
    Ok(ret.iter().map(|x| x.to_string().into_boxed_str()).collect())
}

/// Write a table with its row index under `/<group_name>`
pub fn write_meta_table(
    file: &hdf5::File,
    group_name: &str,
    index: &[Box<str>],
    table: &MetaTable,
) -> anyhow::Result<()> {
    if index.len() != table.nrows() {
        return Err(MorphError::shape_mismatch(format!("index of /{}", group_name), table.nrows(), index.len()).into());
    }

    let group = file.create_group(group_name)?;
    write_strings(&group, "_index", index)?;
    write_strings(&group, "column-order", table.column_names())?;

    for (j, (_, col)) in table.iter().enumerate() {
        let key = format!("col_{}", j);
        match col {
            MetaColumn::Text(v) => write_strings(&group, &key, v)?,
            MetaColumn::Numeric(v) => {
                group
                    .new_dataset::<f64>()
                    .shape(v.len())
                    .create(key.as_str())?
                    .write(v)?;
            }
        }
    }
    Ok(())
}

/// Read back the row index and table under `/<group_name>`
pub fn read_meta_table(file: &hdf5::File, group_name: &str) -> anyhow::Result<(Vec<Box<str>>, MetaTable)> {
    let group = file.group(group_name)?;
    let index = read_strings(&group, "_index")?;
    let names = read_strings(&group, "column-order")?;

    let mut table = MetaTable::empty(index.len());
    for (j, name) in names.iter().enumerate() {
        let ds = group.dataset(&format!("col_{}", j))?;
        let col = match ds.dtype()?.to_descriptor()? {
            TypeDescriptor::VarLenUnicode => MetaColumn::Text(
                ds.read_1d::<VarLenUnicode>()?
                    .iter()
                    .map(|x| x.to_string().into_boxed_str())
                    .collect(),
            ),
            TypeDescriptor::Float(_) | TypeDescriptor::Integer(_) | TypeDescriptor::Unsigned(_) => {
                MetaColumn::Numeric(ds.read_1d::<f64>()?.to_vec())
            }
            other => anyhow::bail!("/{}/{}: unsupported type {:?}", group_name, name, other),
        };
        table.insert(name, col)?;
    }
    Ok((index, table))
}

impl AnnotatedMatrix {
    /// Write a full snapshot: matrix, obs and var tables, and the
    /// persistent annotations
    pub fn write_hdf5(&self, file: &str) -> anyhow::Result<()> {
        if let MatrixStore::Backed(backed) = self.x() {
            anyhow::ensure!(
                backed.file_name() != file,
                "{} is the backing file of this matrix",
                file
            );
        }

        let (nrows, ncols) = self.shape();
        let mut out = Hdf5Matrix::create(file, nrows, ncols)?;

        for (lb, ub) in generate_minibatch_intervals(nrows, WRITE_BLOCK_ROWS) {
            let block = self.x().read_rows(lb..ub)?;
            out.write_rows(lb, &block.view())?;
        }

        write_meta_table(out.backend(), "obs", self.obs_names(), self.obs())?;
        write_meta_table(out.backend(), "var", self.var_names(), &self.var().to_table())?;

        let uns = serde_json::to_string(&self.uns().to_json()?)?;
        write_strings(out.backend(), "uns", &[uns.into_boxed_str()])?;

        out.close()?;
        info!("wrote {}", file);
        Ok(())
    }

    /// Read a snapshot; with `backed`, `X` stays on disk and rows are
    /// read on demand
    pub fn read_hdf5(file: &str, backed: bool) -> anyhow::Result<Self> {
        if !std::path::Path::new(file).is_file() {
            return Err(MorphError::InputNotFound(file.to_string()).into());
        }

        let backend = hdf5::File::open(file)?;
        let (obs_names, obs) = read_meta_table(&backend, "obs")?;
        let (var_names, var_table) = read_meta_table(&backend, "var")?;

        let uns = match read_strings(&backend, "uns") {
            Ok(v) if !v.is_empty() => Annotations::from_json(serde_json::from_str(&v[0])?)?,
            _ => Annotations::default(),
        };

        let x = if backed {
            MatrixStore::Backed(Hdf5Matrix::open(file)?)
        } else {
            MatrixStore::Dense(backend.dataset("X")?.read_2d::<f32>()?)
        };

        let mut ret = AnnotatedMatrix::new(obs_names, VarAnnotations::from_table(var_names, &var_table), x, obs)?;
        *ret.uns_mut() = uns;
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matrix_util::common_io::create_temp_dir_file;

    #[test]
    fn indexed_rows_follow_request_order() -> anyhow::Result<()> {
        let file = create_temp_dir_file(".h5")?;
        let file = file.to_str().ok_or(anyhow::anyhow!("temp file"))?;

        let xx = Array2::from_shape_fn((6, 3), |(i, j)| (i * 10 + j) as f32);
        let mut mat = Hdf5Matrix::create(file, 6, 3)?;
        mat.write_rows(0, &xx.slice(s![0..4, ..]))?;
        mat.write_rows(4, &xx.slice(s![4..6, ..]))?;
        assert!(mat.write_rows(5, &xx.slice(s![0..2, ..])).is_err());

        let yy = mat.read_rows_indexed(&[4, 5, 0, 2])?;
        assert_eq!(yy, xx.select(Axis(0), &[4, 5, 0, 2]));
        assert_eq!(mat.read_all()?, xx);
        mat.close()?;
        Ok(())
    }
}
