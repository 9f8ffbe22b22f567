//! Adapter error types.

use ahkdbg_dbgp::{DbgpError, EngineError, ProtocolError};
use ahkdbg_scanner::ScanError;
use thiserror::Error;

/// Errors from runtime and breakpoint operations.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Session-level failure: malformed traffic, closed connection or
    /// cancelled request.
    #[error("debugger session error: {0}")]
    Session(#[source] DbgpError),

    /// The engine rejected a command.
    #[error("{0}")]
    Engine(EngineError),

    /// The interpreter could not be started or exited unexpectedly.
    #[error("debuggee process error: {0}")]
    Process(String),

    /// A breakpoint or source target could not be resolved.
    #[error("cannot resolve {0}")]
    Resolution(String),

    /// The engine did not connect in time.
    #[error("engine did not connect within {0} ms")]
    ConnectTimeout(u64),

    /// A handle from an earlier stop, or one that never existed.
    #[error("unknown or expired reference {0}")]
    InvalidReference(i64),

    /// A hit condition that the engine cannot express.
    #[error("unsupported hit condition `{0}`")]
    InvalidHitCondition(String),

    /// The runtime is not in a phase that allows the operation.
    #[error("cannot {operation}: runtime is {phase}")]
    InvalidPhase {
        operation: &'static str,
        phase: String,
    },

    /// Source files could not be scanned.
    #[error(transparent)]
    Scan(#[from] ScanError),

    /// No engine is connected.
    #[error("no debugger engine is connected")]
    NotConnected,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<DbgpError> for AdapterError {
    fn from(err: DbgpError) -> Self {
        match err {
            DbgpError::Engine(engine) => AdapterError::Engine(engine),
            other => AdapterError::Session(other),
        }
    }
}

impl From<ProtocolError> for AdapterError {
    fn from(err: ProtocolError) -> Self {
        AdapterError::Session(DbgpError::Protocol(err))
    }
}

impl AdapterError {
    /// Whether the connection to the engine is gone.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            AdapterError::Session(DbgpError::SessionClosed) | AdapterError::NotConnected
        )
    }
}
