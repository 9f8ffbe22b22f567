use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Whether the bridge starts the script or attaches to a running one.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Spawn the interpreter with `/Debug`.
    #[default]
    Launch,
    /// Ask an already running script to connect back.
    Attach,
}

/// Which side opens the DBGP connection when launching.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchTransport {
    /// The bridge listens and the engine dials in (the engine's own default).
    #[default]
    Listen,
    /// The bridge dials an engine that is already listening.
    Connect,
}

/// Log verbosity level.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Most verbose, includes every DBGP packet.
    Trace,
    /// Debug messages.
    Debug,
    /// Informational messages (default).
    #[default]
    Info,
    /// Warnings only.
    Warn,
    /// Errors only.
    Error,
}

impl LogLevel {
    /// Directive string for a `tracing` env filter.
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Logging settings.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub level: LogLevel,
    /// Log file; the platform data directory when unset.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// A line or log breakpoint to install before the script runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceBreakpointEntry {
    pub file: PathBuf,
    pub line: u32,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub hit_condition: Option<String>,
    /// Turns the breakpoint into a logpoint.
    #[serde(default)]
    pub log_message: Option<String>,
}

/// A function breakpoint to install before the script runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionBreakpointEntry {
    /// Bare (`Method`) or dotted (`Class.Method`) name.
    pub name: String,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub hit_condition: Option<String>,
    /// Break when the function returns instead of when it is entered.
    #[serde(default)]
    pub on_return: bool,
}

/// Fully resolved settings for one debug session.
///
/// Produced and validated by [`load_from_str`](crate::load_from_str) or
/// [`load_config`](crate::load_config); the debugger core reads it as is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedDebugConfig {
    #[serde(default)]
    pub request: RequestKind,
    /// Interpreter executable.
    #[serde(default = "default_runtime")]
    pub runtime: PathBuf,
    /// Interpreter switches placed before `/Debug`.
    #[serde(default)]
    pub runtime_args: Vec<String>,
    /// Script to debug. For attach, the script whose window receives the
    /// attach request.
    pub program: PathBuf,
    /// Script arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory; the script's directory when unset.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Extra environment variables for the interpreter.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_host")]
    pub host: String,
    /// DBGP port. `0` picks a free port when listening.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Major engine version, 1 or 2.
    #[serde(default = "default_engine_version")]
    pub engine_version: u8,
    #[serde(default)]
    pub launch_transport: LaunchTransport,
    /// How long to wait for the engine to connect.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub stop_on_entry: bool,
    #[serde(default = "default_max_children")]
    pub max_children: u32,
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    #[serde(default = "default_max_data")]
    pub max_data: u32,
    /// Redirect the script's stdout/stderr through DBGP streams.
    #[serde(default = "default_true")]
    pub redirect_output: bool,
    #[serde(default)]
    pub break_on_exception: bool,
    #[serde(default)]
    pub breakpoints: Vec<SourceBreakpointEntry>,
    #[serde(default)]
    pub function_breakpoints: Vec<FunctionBreakpointEntry>,
    #[serde(default)]
    pub log: LogConfig,
}

fn default_runtime() -> PathBuf {
    PathBuf::from("AutoHotkey64.exe")
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    9002
}
fn default_engine_version() -> u8 {
    2
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_max_children() -> u32 {
    10_000
}
fn default_max_depth() -> u32 {
    1
}
fn default_max_data() -> u32 {
    1024 * 1024
}
fn default_true() -> bool {
    true
}

impl NormalizedDebugConfig {
    /// Defaults for debugging `program`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            request: RequestKind::Launch,
            runtime: default_runtime(),
            runtime_args: Vec::new(),
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            host: default_host(),
            port: default_port(),
            engine_version: default_engine_version(),
            launch_transport: LaunchTransport::Listen,
            connect_timeout_ms: default_connect_timeout_ms(),
            stop_on_entry: false,
            max_children: default_max_children(),
            max_depth: default_max_depth(),
            max_data: default_max_data(),
            redirect_output: true,
            break_on_exception: false,
            breakpoints: Vec::new(),
            function_breakpoints: Vec::new(),
            log: LogConfig::default(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// `cwd`, or the directory holding the script.
    pub fn working_dir(&self) -> PathBuf {
        self.cwd.clone().unwrap_or_else(|| {
            self.program
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        })
    }

    /// `host:port` as passed to `/Debug=`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
