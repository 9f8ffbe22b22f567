use std::path::{Path, PathBuf};

use crate::config::NormalizedDebugConfig;
use crate::error::ConfigError;
use crate::validate::validate;

/// File name searched for by [`find_project_config`].
pub const PROJECT_CONFIG_NAME: &str = ".ahkdbg.toml";

/// Read, parse and validate a debug configuration file.
///
/// Relative `program`, `cwd` and breakpoint paths are resolved against the
/// directory holding the config file.
///
/// # Errors
///
/// Returns [`ConfigError`] on I/O failure, parse failure, or
/// validation failure.
pub fn load_config(path: &Path) -> Result<NormalizedDebugConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path)?;
    let mut config = parse(&content)?;

    if let Some(base) = path.parent() {
        anchor_paths(&mut config, base);
    }
    first_error(validate(&config))?;
    tracing::info!("Loaded debug config from {}", path.display());
    Ok(config)
}

/// Walk from `start` upward looking for `.ahkdbg.toml`.
pub fn find_project_config(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(PROJECT_CONFIG_NAME);
        if candidate.is_file() {
            return Some(candidate);
        }
        if !dir.pop() {
            return None;
        }
    }
}

/// Parse a TOML string directly into a validated [`NormalizedDebugConfig`].
///
/// Useful for tests or one-off parsing without file I/O. Paths are kept
/// as written.
///
/// # Errors
///
/// Returns [`ConfigError`] on parse or validation failure.
pub fn load_from_str(toml_str: &str) -> Result<NormalizedDebugConfig, ConfigError> {
    let config = parse(toml_str)?;
    first_error(validate(&config))?;
    Ok(config)
}

fn parse(toml_str: &str) -> Result<NormalizedDebugConfig, ConfigError> {
    toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))
}

fn first_error(result: Result<(), Vec<ConfigError>>) -> Result<(), ConfigError> {
    result.map_err(|errors| {
        for extra in errors.iter().skip(1) {
            tracing::warn!("{}", extra);
        }
        errors
            .into_iter()
            .next()
            .unwrap_or_else(|| ConfigError::Validation {
                field: "unknown".to_string(),
                message: "validation failed".to_string(),
            })
    })
}

fn anchor_paths(config: &mut NormalizedDebugConfig, base: &Path) {
    let anchor = |p: &mut PathBuf| {
        if !p.as_os_str().is_empty() && p.is_relative() {
            *p = base.join(&*p);
        }
    };
    anchor(&mut config.program);
    if let Some(cwd) = config.cwd.as_mut() {
        anchor(cwd);
    }
    for bp in &mut config.breakpoints {
        anchor(&mut bp.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn load_config_reads_and_anchors_paths() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("debug.toml");
        std::fs::write(
            &path,
            "program = 'main.ahk'\n[[breakpoints]]\nfile = 'lib/util.ahk'\nline = 4\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.program, tmp.path().join("main.ahk"));
        assert_eq!(config.breakpoints[0].file, tmp.path().join("lib/util.ahk"));
    }

    #[test]
    fn load_config_keeps_absolute_paths() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("debug.toml");
        std::fs::write(&path, "program = '/abs/main.ahk'\n").unwrap();
        assert_eq!(load_config(&path).unwrap().program, PathBuf::from("/abs/main.ahk"));
    }

    #[test]
    fn load_config_missing_file_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let err = load_config(&tmp.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn load_from_str_parses_valid_toml() {
        let config = load_from_str("program = 'a.ahk'\nport = 9005\n").unwrap();
        assert_eq!(config.port, 9005);
        assert_eq!(config.program, PathBuf::from("a.ahk"));
    }

    #[test]
    fn load_from_str_rejects_invalid_toml() {
        assert!(matches!(load_from_str("{{bad}}"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn load_from_str_requires_program() {
        assert!(matches!(load_from_str("port = 1"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn load_from_str_rejects_invalid_values() {
        let result = load_from_str("program = 'a.ahk'\nengine_version = 7\n");
        assert!(matches!(result, Err(ConfigError::Validation { .. })));
    }

    #[test]
    fn find_project_config_walks_up() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("repo");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join(PROJECT_CONFIG_NAME), "program = 'main.ahk'\n").unwrap();

        let deep = root.join("src").join("module");
        std::fs::create_dir_all(&deep).unwrap();

        let found = find_project_config(&deep).unwrap();
        assert_eq!(found, root.join(PROJECT_CONFIG_NAME));
    }
}
