//! ahkdbg-dbgp — DBGP wire protocol client for the AutoHotkey debugger engine.
//!
//! This crate handles frame decoding, command encoding, typed packet views,
//! and a single-flight session that correlates commands with responses over
//! one connection.
pub mod codec;
pub mod command;
pub mod error;
pub mod packet;
pub mod queue;
pub mod response;
pub mod session;
pub mod uri;
pub mod xml;

// Re-export key types for convenience.
pub use codec::{decode_frame, encode_frame, Decoded};
pub use command::Command;
pub use error::{DbgpError, EngineError, EngineErrorClass, ProtocolError};
pub use packet::{InitPacket, NotifyPacket, Packet, StreamKind, StreamPacket};
pub use queue::RequestQueue;
pub use response::{
    ContextName, EngineBreakpoint, Property, Response, RunState, StackFrame, StatusReason,
};
pub use session::{Session, SessionEvent, SessionEvents};
pub use uri::{path_to_uri, same_file, uri_to_path};
pub use xml::XmlElement;
