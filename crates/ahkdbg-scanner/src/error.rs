use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while scanning AutoHotkey sources.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid scanner pattern `{name}`: {detail}")]
    InvalidPattern { name: &'static str, detail: String },
    #[error("cannot resolve include `{0}`")]
    UnresolvedInclude(String),
    #[error("unknown built-in variable `{0}` in include path")]
    UnknownVariable(String),
}
