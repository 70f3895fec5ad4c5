use std::path::PathBuf;

/// Crate-wide error type. Mirrors the taxonomy in the system's error-handling
/// design: I/O failure, format error, invalid lattice, pattern syntax error,
/// and missing required input are all fatal and carry enough context for a
/// single-line `error: ...` diagnostic.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("format error at {path}:{line}: {message}")]
    Format {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("fst invalid: {0}")]
    FstInvalid(String),

    #[error("pattern syntax error in {0:?}: {1}")]
    PatternSyntax(String, String),

    #[error("missing required input: {0}")]
    MissingInput(String),
}

pub type Result<T> = std::result::Result<T, Error>;
