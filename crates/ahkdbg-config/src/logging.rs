//! Where the log file lives and how it is kept small.
//!
//! Subscriber setup belongs to the binary. Nothing here writes to stdout,
//! which carries front-end traffic.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Size at which [`rotate_log_files`] starts a fresh file.
pub const DEFAULT_MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

/// Number of `.N` backups kept by [`rotate_log_files`].
pub const DEFAULT_MAX_LOG_FILES: u32 = 5;

/// Environment variable that overrides the configured `log.level`.
pub const LOG_LEVEL_ENV: &str = "AHKDBG_LOG";

const APP_DIR: &str = "ahkdbg";
const LOG_FILE: &str = "ahkdbg.log";

/// `<local data dir>/ahkdbg/logs/ahkdbg.log`, or `<temp>/ahkdbg/ahkdbg.log`
/// where the platform has no data dir.
pub fn default_log_file_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|data| data.join(APP_DIR).join("logs"))
        .unwrap_or_else(|| std::env::temp_dir().join(APP_DIR))
        .join(LOG_FILE)
}

pub fn ensure_log_dir(log_path: &Path) -> io::Result<()> {
    match log_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

/// Shift `ahkdbg.log` to `ahkdbg.log.1`, `.1` to `.2` and so on once it has
/// grown past `max_size`. The backup numbered `max_files` is discarded.
pub fn rotate_log_files(log_path: &Path, max_size: u64, max_files: u32) -> io::Result<()> {
    let size = match fs::metadata(log_path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if size < max_size {
        return Ok(());
    }

    match fs::remove_file(backup_path(log_path, max_files)) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
        _ => {}
    }
    for n in (1..max_files).rev() {
        let from = backup_path(log_path, n);
        if from.exists() {
            fs::rename(&from, backup_path(log_path, n + 1))?;
        }
    }
    fs::rename(log_path, backup_path(log_path, 1))
}

/// Filter directive for a level name as users tend to write it, e.g. from
/// [`LOG_LEVEL_ENV`]. Unknown names fall back to `info`.
pub fn log_level_to_filter(level: &str) -> &'static str {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => "info",
    }
}

fn backup_path(log_path: &Path, n: u32) -> PathBuf {
    let mut name = log_path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{n}"));
    log_path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_log_file_path_names_the_app() {
        let path = default_log_file_path();
        assert!(path.to_string_lossy().contains("ahkdbg"), "got {:?}", path);
        assert!(path.extension().is_some_and(|e| e == "log"));
    }

    #[test]
    fn backups_are_numbered_after_the_file_name() {
        let base = Path::new("/tmp/ahkdbg.log");
        assert_eq!(backup_path(base, 1), PathBuf::from("/tmp/ahkdbg.log.1"));
        assert_eq!(backup_path(base, 3), PathBuf::from("/tmp/ahkdbg.log.3"));
    }

    #[test]
    fn rotate_no_op_when_file_missing() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = dir.path().join("ahkdbg.log");
        assert!(rotate_log_files(&log, DEFAULT_MAX_LOG_SIZE, DEFAULT_MAX_LOG_FILES).is_ok());
    }

    #[test]
    fn rotate_no_op_when_file_under_max_size() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = dir.path().join("ahkdbg.log");
        fs::write(&log, "small").unwrap();
        rotate_log_files(&log, DEFAULT_MAX_LOG_SIZE, DEFAULT_MAX_LOG_FILES).unwrap();
        assert!(log.exists());
    }

    #[test]
    fn rotate_cascades_and_drops_oldest() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = dir.path().join("ahkdbg.log");
        fs::write(dir.path().join("ahkdbg.log.1"), "old1").unwrap();
        fs::write(dir.path().join("ahkdbg.log.2"), "old2").unwrap();
        fs::write(&log, "x".repeat(200)).unwrap();

        rotate_log_files(&log, 50, 2).unwrap();

        assert!(!log.exists());
        assert_eq!(
            fs::read_to_string(dir.path().join("ahkdbg.log.1")).unwrap(),
            "x".repeat(200)
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("ahkdbg.log.2")).unwrap(),
            "old1"
        );
        assert!(!dir.path().join("ahkdbg.log.3").exists());
    }

    #[test]
    fn ensure_log_dir_creates_nested_parents() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = dir.path().join("a").join("b").join("ahkdbg.log");
        ensure_log_dir(&log).unwrap();
        ensure_log_dir(&log).unwrap();
        assert!(dir.path().join("a").join("b").exists());
    }

    #[test]
    fn log_level_to_filter_levels() {
        assert_eq!(log_level_to_filter("TRACE"), "trace");
        assert_eq!(log_level_to_filter("Warning"), "warn");
        assert_eq!(log_level_to_filter("verbose"), "info");
        assert_eq!(log_level_to_filter(" debug\n"), "debug");
        assert_eq!(log_level_to_filter(""), "info");
    }
}
