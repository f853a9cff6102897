use crate::annotated::{assemble, AnnotatedMatrix};
use crate::column_rules::{report_discarded, ColumnPlan};
use crate::columnar::parse_measurement;
use crate::errors::MorphError;
use crate::meta_table::{MetaColumn, MetaTable};

use log::{info, warn};
use ndarray::Array2;
use regex::Regex;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};

/// Tables of a CellProfiler sqlite export; object tables are joined
/// column-wise in this order
const OBJECT_TABLES: [&str; 3] = ["Nuclei", "Cytoplasm", "Cells"];
const IMAGE_TABLE: &str = "Image";

/// Columns of the image table carried into `obs`
const IMAGE_KEEP_PATTERN: &str = r"^Metadata|TableNumber|Count_Cells|Count_Cytoplasm|Count_Nuclei";

/// A whole table as text cells, column by column; `NULL` is empty
struct RawTable {
    names: Vec<Box<str>>,
    columns: Vec<Vec<Box<str>>>,
    nrows: usize,
}

fn read_table(conn: &Connection, table: &str) -> anyhow::Result<RawTable> {
    let mut stmt = conn.prepare(&format!("SELECT * FROM \"{}\"", table))?;
    let names: Vec<Box<str>> = stmt.column_names().iter().map(|&x| Box::from(x)).collect();
    let ncols = names.len();

    let mut columns: Vec<Vec<Box<str>>> = vec![vec![]; ncols];
    let mut nrows = 0;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        for (j, col) in columns.iter_mut().enumerate() {
            let cell: Box<str> = match row.get_ref(j)? {
                ValueRef::Null => "".into(),
                ValueRef::Integer(i) => i.to_string().into(),
                ValueRef::Real(x) => x.to_string().into(),
                ValueRef::Text(t) => String::from_utf8_lossy(t).into(),
                ValueRef::Blob(_) => anyhow::bail!("{}.{}: binary values are not supported", table, names[j]),
            };
            col.push(cell);
        }
        nrows += 1;
    }

    Ok(RawTable {
        names,
        columns,
        nrows,
    })
}

/// List the tables of a sqlite file
pub fn list_tables(conn: &Connection) -> anyhow::Result<Vec<Box<str>>> {
    let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")?;
    let ret = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .map(|x| x.map(|s| s.into_boxed_str()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ret)
}

/// Read a CellProfiler sqlite export.
///
/// Object tables (`Nuclei`, `Cytoplasm`, `Cells`) are joined side by
/// side and must have the same number of rows; a column name seen in
/// an earlier table is skipped. Columns are classified as in the csv
/// path. Selected `Image` columns are left-joined into `obs` on the
/// shared metadata columns.
pub fn read_sql(file: &str, feature_delim: &str) -> anyhow::Result<AnnotatedMatrix> {
    if !std::path::Path::new(file).is_file() {
        return Err(MorphError::InputNotFound(file.to_string()).into());
    }
    let conn = Connection::open_with_flags(file, OpenFlags::SQLITE_OPEN_READ_ONLY)?;

    let tables = list_tables(&conn)?;
    let unknown: Vec<&str> = tables
        .iter()
        .map(|x| x.as_ref())
        .filter(|x| *x != IMAGE_TABLE && !OBJECT_TABLES.contains(x))
        .collect();
    if !unknown.is_empty() {
        warn!("Unknown tables found in SQL database: {}", unknown.join(", "));
    }

    let mut header: Vec<Box<str>> = vec![];
    let mut cells: Vec<Vec<Box<str>>> = vec![];
    let mut nrows: Option<usize> = None;

    for &t in OBJECT_TABLES.iter() {
        if !tables.iter().any(|x| x.as_ref() == t) {
            continue;
        }
        let raw = read_table(&conn, t)?;
        match nrows {
            Some(n) if n != raw.nrows => {
                return Err(MorphError::shape_mismatch(format!("rows of table {}", t), n, raw.nrows).into())
            }
            _ => nrows = Some(raw.nrows),
        }
        for (name, col) in raw.names.into_iter().zip(raw.columns) {
            if !header.contains(&name) {
                header.push(name);
                cells.push(col);
            }
        }
    }

    let nrows = nrows.ok_or(MorphError::InputNotFound(format!(
        "{}: none of the tables {}",
        file,
        OBJECT_TABLES.join(", ")
    )))?;

    let plan = ColumnPlan::new(header, None);
    report_discarded(&plan.classes);

    let mut obs = MetaTable::empty(nrows);
    for (&j, name) in plan.metadata.iter().zip(plan.metadata_names()) {
        obs.insert(name, MetaColumn::from_cells(std::mem::take(&mut cells[j])))?;
    }

    let ncols = plan.measurement.len();
    let mut x = Array2::<f32>::zeros((nrows, ncols));
    for (k, &j) in plan.measurement.iter().enumerate() {
        for (i, cell) in cells[j].iter().enumerate() {
            x[(i, k)] = parse_measurement(cell).ok_or_else(|| MorphError::MalformedValue {
                file: file.to_string(),
                row: i + 1,
                column: plan.header[j].to_string(),
                value: cell.to_string(),
            })?;
        }
    }

    let mut ret = assemble(obs, x, plan.measurement_names().to_vec(), feature_delim)?;

    if tables.iter().any(|x| x.as_ref() == IMAGE_TABLE) {
        let image = read_table(&conn, IMAGE_TABLE)?;
        let keep = Regex::new(IMAGE_KEEP_PATTERN)?;
        let mut meta = MetaTable::empty(image.nrows);
        for (name, col) in image.names.iter().zip(image.columns) {
            if keep.is_match(name) {
                meta.insert(name, MetaColumn::from_cells(col))?;
            }
        }
        info!(
            "Adding image metadata, keeping columns: {}",
            meta.column_names().join(", ")
        );
        let nmatched = ret.obs_mut().left_join(&meta)?;
        if nmatched < ret.n_obs() {
            warn!("{} of {} objects without image metadata", ret.n_obs() - nmatched, ret.n_obs());
        }
    }

    Ok(ret)
}
