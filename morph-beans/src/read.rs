use crate::annotated::{read_cellprofiler, AnnotatedMatrix};
use crate::columnar::IngestOptions;
use crate::errors::MorphError;
use crate::sql_io::read_sql;
use matrix_util::common_io::file_ext;

pub const SUPPORTED_EXTENSIONS: [&str; 5] = ["csv", "h5", "h5ad", "sql", "sqlite"];

/// Read a csv export (gzipped or not), an hdf5 snapshot or a sqlite
/// export, chosen by file extension. Snapshots are loaded into
/// memory.
pub fn read(file: &str, opts: &IngestOptions) -> anyhow::Result<AnnotatedMatrix> {
    let ext = file_ext(file).unwrap_or_default();
    match ext.as_ref() {
        "csv" => read_cellprofiler(file, opts),
        "h5" | "h5ad" => AnnotatedMatrix::read_hdf5(file, false),
        "sql" | "sqlite" => read_sql(file, &opts.feature_delim),
        _ => Err(MorphError::unsupported("file extension", &ext, &SUPPORTED_EXTENSIONS).into()),
    }
}
