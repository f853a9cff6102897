use crate::errors::MorphError;
use matrix_util::common_io::open_buf_reader;
use regex::Regex;
use std::sync::LazyLock;

/// `Area.1` -> `Area`; duplicated column names get such suffixes
static DOTTED_SUFFIX: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"^(.*)\.[^.]*$").ok());

/// Strip a trailing `.<suffix>` from a header cell
pub fn strip_dotted_suffix(cell: &str) -> Box<str> {
    match DOTTED_SUFFIX.as_ref() {
        Some(re) => re.replace(cell, "$1").into(),
        None => cell.into(),
    }
}

/// A csv reader over a (possibly gzipped) delimited file without
/// header handling
pub fn open_records(file: &str, delimiter: u8) -> anyhow::Result<csv::Reader<Box<dyn std::io::BufRead>>> {
    if !std::path::Path::new(file).is_file() {
        return Err(MorphError::InputNotFound(file.to_string()).into());
    }
    Ok(csv::ReaderBuilder::new()
        .has_headers(false)
        .delimiter(delimiter)
        .from_reader(open_buf_reader(file)?))
}

/// Read the first `n_headers` rows of a delimited file and merge
/// them into one name per column, joining the rows top to bottom
/// with `_`. The data body is not read.
///
/// * `file` - delimited file, gzipped or not
/// * `n_headers` - number of header rows
/// * `delimiter` - field delimiter
/// * `sanitize` - strip trailing `.<suffix>` from every header cell
pub fn parse_header(
    file: &str,
    n_headers: usize,
    delimiter: u8,
    sanitize: bool,
) -> anyhow::Result<Vec<Box<str>>> {
    anyhow::ensure!(n_headers > 0, "need at least one header row");

    let mut rdr = open_records(file, delimiter)?;
    let mut merged: Vec<Vec<Box<str>>> = vec![];
    let mut record = csv::StringRecord::new();

    for r in 0..n_headers {
        if !rdr.read_record(&mut record)? {
            anyhow::bail!("{}: expected {} header rows, found {}", file, n_headers, r);
        }
        if merged.is_empty() {
            merged = vec![vec![]; record.len()];
        }
        for (j, cell) in record.iter().enumerate() {
            let cell = if sanitize {
                strip_dotted_suffix(cell)
            } else {
                Box::from(cell)
            };
            merged[j].push(cell);
        }
    }

    Ok(merged
        .into_iter()
        .map(|parts| parts.join("_").into_boxed_str())
        .collect())
}

/// Header of a batch: only the first file is read
pub fn parse_batch_header<S: AsRef<str>>(
    files: &[S],
    n_headers: usize,
    delimiter: u8,
    sanitize: bool,
) -> anyhow::Result<Vec<Box<str>>> {
    let first = files
        .first()
        .ok_or(MorphError::InputNotFound("empty file list".to_string()))?;
    parse_header(first.as_ref(), n_headers, delimiter, sanitize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_is_stripped_once() {
        assert_eq!(strip_dotted_suffix("Area.1").as_ref(), "Area");
        assert_eq!(strip_dotted_suffix("a.b.c").as_ref(), "a.b");
        assert_eq!(strip_dotted_suffix("Area").as_ref(), "Area");
    }
}
