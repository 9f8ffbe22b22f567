//! ahkdbg-config — debug session configuration and log file helpers.
pub mod config;
pub mod error;
pub mod load;
pub mod logging;
pub mod validate;

pub use config::{
    FunctionBreakpointEntry, LaunchTransport, LogConfig, LogLevel, NormalizedDebugConfig,
    RequestKind, SourceBreakpointEntry,
};
pub use error::ConfigError;
pub use load::{find_project_config, load_config, load_from_str};
