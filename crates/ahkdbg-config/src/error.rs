use std::path::PathBuf;
use thiserror::Error;

/// Why a debug configuration could not be used.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no debug configuration at {0}")]
    NotFound(PathBuf),

    /// The file is not valid TOML, or a field has the wrong type.
    #[error("cannot parse debug configuration: {0}")]
    Parse(String),

    /// A well-formed value the debugger cannot work with.
    #[error("invalid `{field}`: {message}")]
    Validation {
        /// Dotted path, with list indices, e.g. `breakpoints[0].line`.
        field: String,
        message: String,
    },

    #[error("cannot read debug configuration: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_names_the_field() {
        let err = ConfigError::Validation {
            field: "breakpoints[2].line".into(),
            message: "lines start at 1".into(),
        };
        assert_eq!(err.to_string(), "invalid `breakpoints[2].line`: lines start at 1");
    }

    #[test]
    fn missing_file_shows_the_path() {
        let err = ConfigError::NotFound(PathBuf::from("/work/.ahkdbg.toml"));
        assert!(err.to_string().ends_with("/work/.ahkdbg.toml"));
    }

    #[test]
    fn read_failure_keeps_the_io_source() {
        let err = ConfigError::from(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "access denied",
        ));
        assert!(matches!(err, ConfigError::Io(_)));
        assert!(err.to_string().contains("access denied"));
    }
}
