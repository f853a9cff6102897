use flate2::read::GzDecoder;
use std::ffi::OsStr;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tempfile::tempdir;

///
/// Open a file for reading, and return a buffered reader
/// * `input_file` - file name--either gzipped or not
pub fn open_buf_reader(input_file: &str) -> anyhow::Result<Box<dyn BufRead>> {
    let ext = Path::new(input_file).extension().and_then(|x| x.to_str());
    match ext {
        Some("gz") => {
            let input_file = File::open(input_file)?;
            let decoder = GzDecoder::new(input_file);
            Ok(Box::new(BufReader::new(decoder)))
        }
        _ => {
            let input_file = File::open(input_file)?;
            Ok(Box::new(BufReader::new(input_file)))
        }
    }
}

trait ToStr {
    fn into_boxed_str(&self) -> Box<str>;
}

impl ToStr for OsStr {
    fn into_boxed_str(&self) -> Box<str> {
        self.to_string_lossy().to_string().into_boxed_str()
    }
}

///
/// Take the extension of a file, looking through a trailing `.gz`
/// (`cells.csv.gz` -> `csv`)
/// * `file` - file name
///
pub fn file_ext(file: &str) -> anyhow::Result<Box<str>> {
    let path = Path::new(file);
    match path.extension() {
        Some(ext) if ext == "gz" => {
            let stem = path
                .file_stem()
                .ok_or(anyhow::anyhow!("no file stem: {}", file))?;
            Path::new(stem)
                .extension()
                .map(|x| x.into_boxed_str())
                .ok_or(anyhow::anyhow!("failed to extract extension: {}", file))
        }
        Some(ext) => Ok(ext.into_boxed_str()),
        None => Err(anyhow::anyhow!("failed to extract extension: {}", file)),
    }
}

///
/// Create a temporary directory and suggest a file name
/// * `suffix` - suffix of the file name
///
pub fn create_temp_dir_file(suffix: &str) -> anyhow::Result<std::path::PathBuf> {
    let temp_dir = tempdir()?.path().to_path_buf();
    std::fs::create_dir_all(&temp_dir)?;
    let temp_file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile_in(temp_dir)?
        .path()
        .to_owned();

    Ok(temp_file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_through_gzip() -> anyhow::Result<()> {
        assert_eq!(file_ext("a/b/Nuclei.csv.gz")?.as_ref(), "csv");
        assert_eq!(file_ext("out.h5ad")?.as_ref(), "h5ad");
        assert!(file_ext("no_extension").is_err());
        Ok(())
    }
}
