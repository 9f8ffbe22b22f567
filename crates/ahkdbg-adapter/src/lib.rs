//! ahkdbg-adapter — debug runtime bridging a DAP-style front end to the
//! AutoHotkey DBGP engine.
//!
//! This crate starts or attaches to scripts, manages breakpoints, maps
//! frames and variables to front-end handles, and reports lifecycle and
//! output events.

pub mod breakpoint;
pub mod condition;
pub mod error;
pub mod event;
pub mod features;
pub mod handles;
pub mod process;
pub mod protocol;
pub mod runtime;

#[cfg(test)]
pub(crate) mod testing;

// Re-export key types for convenience.
pub use breakpoint::{
    Breakpoint, BreakpointData, BreakpointKind, BreakpointManager, BreakpointRequest, BreakpointState,
};
pub use condition::{parse_log_message, HitCondition, HitOperator, LogSegment};
pub use error::AdapterError;
pub use event::{EventSink, RuntimeEvent};
pub use features::EngineFeatures;
pub use handles::{FrameRef, Handles, VariableRef};
pub use process::ScriptProcess;
pub use runtime::{
    Continuation, ExceptionDetails, ExecutionStatus, Pauser, Phase, Runtime, EXCEPTION_FILTER, THREAD_ID,
};
