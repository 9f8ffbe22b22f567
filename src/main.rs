//! ahkdbg — debug an AutoHotkey script from a terminal or a wrapper process.
//!
//! Usage: `ahkdbg [CONFIG]`. Without an argument the nearest `.ahkdbg.toml`
//! at or above the current directory is used.

mod console;

use std::env;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use tracing::info;

use ahkdbg_config::load::PROJECT_CONFIG_NAME;
use ahkdbg_config::logging::{
    default_log_file_path, ensure_log_dir, log_level_to_filter, rotate_log_files,
    DEFAULT_MAX_LOG_FILES, DEFAULT_MAX_LOG_SIZE, LOG_LEVEL_ENV,
};
use ahkdbg_config::{find_project_config, load_config, LogConfig};

fn run(config_path: Option<PathBuf>) -> Result<()> {
    let config_path = match config_path {
        Some(path) => path,
        None => {
            let cwd = env::current_dir().context("cannot read the current directory")?;
            match find_project_config(&cwd) {
                Some(path) => path,
                None => bail!("no configuration given and no {} found", PROJECT_CONFIG_NAME),
            }
        }
    };
    let config = load_config(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    init_logging(&config.log);
    info!(
        "ahkdbg starting – {} with {}",
        config.program.display(),
        config.runtime.display()
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;
    runtime.block_on(console::run(config))
}

/// Direct tracing output to the log file. Stdout belongs to the front end.
/// `AHKDBG_LOG` overrides the configured level.
fn init_logging(log: &LogConfig) {
    let log_path = log.file.clone().unwrap_or_else(default_log_file_path);
    ensure_log_dir(&log_path).ok();
    rotate_log_files(&log_path, DEFAULT_MAX_LOG_SIZE, DEFAULT_MAX_LOG_FILES).ok();

    let log_file = match OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("ahkdbg: logging disabled, cannot open {}: {}", log_path.display(), e);
            return;
        }
    };
    let level = match env::var(LOG_LEVEL_ENV) {
        Ok(value) => log_level_to_filter(&value),
        Err(_) => log.level.as_filter(),
    };
    let env_filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_writer(Mutex::new(log_file))
        .with_ansi(false)
        .with_env_filter(env_filter)
        .init();
}

fn main() {
    let config_path = env::args().nth(1).map(PathBuf::from);
    if let Err(e) = run(config_path) {
        eprintln!("ahkdbg: {:#}", e);
        std::process::exit(1);
    }
}
