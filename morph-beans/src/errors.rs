use thiserror::Error;

/// Structured failures raised through `anyhow`; callers can recover
/// the kind with `err.downcast_ref::<MorphError>()`
#[derive(Debug, Error)]
pub enum MorphError {
    /// A path that is neither a matching file nor a directory, or a
    /// discovery pattern without any match
    #[error("input not found: {0}")]
    InputNotFound(String),

    /// Row or column counts that should agree do not
    #[error("shape mismatch in {what}: expected {expected}, found {actual}")]
    ShapeMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },

    #[error("singular covariance matrix: {0}")]
    SingularCovariance(String),

    /// A step needs an artifact produced by another step
    #[error("missing {missing}; run `{producer}` first")]
    MissingPrerequisite { missing: String, producer: String },

    #[error("unsupported {kind} `{requested}`, expected one of: {}", .valid.join(", "))]
    UnsupportedOperation {
        kind: String,
        requested: String,
        valid: Vec<String>,
    },

    /// A measurement cell that is neither empty nor a number
    #[error("malformed value `{value}` in {file} (row {row}, column `{column}`)")]
    MalformedValue {
        file: String,
        row: usize,
        column: String,
        value: String,
    },
}

impl MorphError {
    pub fn shape_mismatch(what: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::ShapeMismatch {
            what: what.into(),
            expected,
            actual,
        }
    }

    pub fn unsupported(kind: &str, requested: &str, valid: &[&str]) -> Self {
        Self::UnsupportedOperation {
            kind: kind.to_string(),
            requested: requested.to_string(),
            valid: valid.iter().map(|x| x.to_string()).collect(),
        }
    }

    pub fn missing_prerequisite(missing: &str, producer: &str) -> Self {
        Self::MissingPrerequisite {
            missing: missing.to_string(),
            producer: producer.to_string(),
        }
    }
}
