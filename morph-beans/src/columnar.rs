use crate::column_rules::ColumnPlan;
use crate::errors::MorphError;
use crate::header::open_records;
use crate::meta_table::{MetaColumn, MetaTable};
use ndarray::Array2;

/// How delimited profiling exports are read
#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// number of header rows merged into column names
    pub n_headers: usize,
    /// field delimiter
    pub delimiter: u8,
    /// strip trailing `.<suffix>` from header cells
    pub sanitize: bool,
    /// delimiter splitting feature names into annotation parts
    pub feature_delim: Box<str>,
    /// explicit metadata columns instead of the built-in rules
    pub meta_cols: Option<Vec<Box<str>>>,
    /// show progress bars
    pub progress: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            n_headers: 1,
            delimiter: b',',
            sanitize: true,
            feature_delim: "_".into(),
            meta_cols: None,
            progress: false,
        }
    }
}

impl IngestOptions {
    pub fn plan(&self, header: Vec<Box<str>>) -> ColumnPlan {
        ColumnPlan::new(header, self.meta_cols.as_deref())
    }
}

/// Visit each data record of `file`, past the header rows
fn visit_records<F>(file: &str, plan: &ColumnPlan, opts: &IngestOptions, mut visit: F) -> anyhow::Result<usize>
where
    F: FnMut(usize, &csv::StringRecord) -> anyhow::Result<()>,
{
    let mut rdr = open_records(file, opts.delimiter)?;
    let mut record = csv::StringRecord::new();

    for _ in 0..opts.n_headers {
        if !rdr.read_record(&mut record)? {
            return Ok(0);
        }
    }

    let mut nrows = 0;
    while rdr.read_record(&mut record)? {
        if record.len() != plan.ncols() {
            return Err(MorphError::shape_mismatch(format!("columns of {}", file), plan.ncols(), record.len()).into());
        }
        visit(nrows, &record)?;
        nrows += 1;
    }
    Ok(nrows)
}

/// Read the metadata columns of `file`. A column is numeric if all
/// its non-empty cells are numbers; missing text is left empty.
///
/// * `file` - delimited file
/// * `plan` - column positions resolved from the header
pub fn read_metadata(file: &str, plan: &ColumnPlan, opts: &IngestOptions) -> anyhow::Result<MetaTable> {
    let mut cells: Vec<Vec<Box<str>>> = vec![vec![]; plan.metadata.len()];

    let nrows = visit_records(file, plan, opts, |_, record| {
        for (k, &j) in plan.metadata.iter().enumerate() {
            cells[k].push(Box::from(record.get(j).unwrap_or("")));
        }
        Ok(())
    })?;

    let mut ret = MetaTable::empty(nrows);
    for (name, col) in plan.metadata_names().iter().zip(cells) {
        ret.insert(name, MetaColumn::from_cells(col))?;
    }
    Ok(ret)
}

/// Parse a measurement cell: empty is `NaN`, anything else must be
/// a number
pub fn parse_measurement(cell: &str) -> Option<f32> {
    let cell = cell.trim();
    if cell.is_empty() {
        Some(f32::NAN)
    } else {
        cell.parse::<f32>().ok()
    }
}

/// Read the measurement columns of `file` as an `observation x
/// feature` matrix (row-major, the layout of the assembled matrix
/// and of the hdf5 store; no transposition)
///
/// * `file` - delimited file
/// * `plan` - column positions resolved from the header
pub fn read_measurements(file: &str, plan: &ColumnPlan, opts: &IngestOptions) -> anyhow::Result<Array2<f32>> {
    let ncols = plan.measurement.len();
    let mut data: Vec<f32> = vec![];

    let nrows = visit_records(file, plan, opts, |row, record| {
        for &j in plan.measurement.iter() {
            let cell = record.get(j).unwrap_or("");
            match parse_measurement(cell) {
                Some(x) => data.push(x),
                None => {
                    return Err(MorphError::MalformedValue {
                        file: file.to_string(),
                        row: row + opts.n_headers + 1,
                        column: plan.header[j].to_string(),
                        value: cell.to_string(),
                    }
                    .into())
                }
            }
        }
        Ok(())
    })?;

    Ok(Array2::from_shape_vec((nrows, ncols), data)?)
}
