use crate::config::{LaunchTransport, NormalizedDebugConfig, RequestKind};
use crate::error::ConfigError;

/// Validate a [`NormalizedDebugConfig`], returning all detected violations.
///
/// Returns `Ok(())` when the config is valid, or `Err` with a
/// vector of every validation error found.
pub fn validate(config: &NormalizedDebugConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();
    let mut fail = |field: &str, message: String| {
        errors.push(ConfigError::Validation {
            field: field.to_string(),
            message,
        });
    };

    if config.program.as_os_str().is_empty() {
        fail("program", "must not be empty".to_string());
    }
    if config.runtime.as_os_str().is_empty() {
        fail("runtime", "must not be empty".to_string());
    }
    if !matches!(config.engine_version, 1 | 2) {
        fail(
            "engine_version",
            format!("must be 1 or 2, got {}", config.engine_version),
        );
    }
    if config.host.trim().is_empty() {
        fail("host", "must not be empty".to_string());
    }

    // Port 0 asks the OS for a free port, which only works when we listen.
    let dials_out =
        config.request == RequestKind::Launch && config.launch_transport == LaunchTransport::Connect;
    if dials_out && config.port == 0 {
        fail(
            "port",
            "must be non-zero when launch_transport is \"connect\"".to_string(),
        );
    }

    if config.connect_timeout_ms == 0 {
        fail("connect_timeout_ms", "must be greater than 0".to_string());
    }
    if config.max_depth == 0 {
        fail("max_depth", "must be at least 1".to_string());
    }
    if config.max_children == 0 {
        fail("max_children", "must be at least 1".to_string());
    }

    for (i, bp) in config.breakpoints.iter().enumerate() {
        if bp.line == 0 {
            fail(
                &format!("breakpoints[{i}].line"),
                "lines are 1-based".to_string(),
            );
        }
        if bp.file.as_os_str().is_empty() {
            fail(&format!("breakpoints[{i}].file"), "must not be empty".to_string());
        }
    }
    for (i, bp) in config.function_breakpoints.iter().enumerate() {
        if bp.name.trim().is_empty() {
            fail(
                &format!("function_breakpoints[{i}].name"),
                "must not be empty".to_string(),
            );
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FunctionBreakpointEntry, SourceBreakpointEntry};
    use std::path::PathBuf;

    fn base() -> NormalizedDebugConfig {
        NormalizedDebugConfig::new("main.ahk")
    }

    #[test]
    fn valid_default_config_passes() {
        assert!(validate(&base()).is_ok());
    }

    #[test]
    fn empty_program_rejected() {
        let mut cfg = base();
        cfg.program = PathBuf::new();
        let errs = validate(&cfg).unwrap_err();
        assert_eq!(errs.len(), 1);
        assert!(format!("{}", errs[0]).contains("program"));
    }

    #[test]
    fn engine_version_must_be_one_or_two() {
        let mut cfg = base();
        cfg.engine_version = 3;
        let errs = validate(&cfg).unwrap_err();
        assert!(format!("{}", errs[0]).contains("engine_version"));
        cfg.engine_version = 1;
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn port_zero_only_when_listening() {
        let mut cfg = base();
        cfg.port = 0;
        assert!(validate(&cfg).is_ok());
        cfg.launch_transport = LaunchTransport::Connect;
        let errs = validate(&cfg).unwrap_err();
        assert!(format!("{}", errs[0]).contains("port"));
    }

    #[test]
    fn collects_every_violation() {
        let mut cfg = base();
        cfg.connect_timeout_ms = 0;
        cfg.max_depth = 0;
        cfg.breakpoints.push(SourceBreakpointEntry {
            file: PathBuf::from("main.ahk"),
            line: 0,
            condition: None,
            hit_condition: None,
            log_message: None,
        });
        cfg.function_breakpoints.push(FunctionBreakpointEntry {
            name: " ".into(),
            condition: None,
            hit_condition: None,
            on_return: false,
        });
        let errs = validate(&cfg).unwrap_err();
        assert_eq!(errs.len(), 4);
        assert!(format!("{}", errs[2]).contains("breakpoints[0].line"));
    }
}
