//! DBGP error types.

use thiserror::Error;

/// A wire-level problem: bad framing, bad XML, or a response nobody asked for.
///
/// Protocol errors are logged and the connection is kept alive whenever the
/// byte stream can be resynchronised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The frame length prefix is not a decimal number.
    #[error("invalid frame length: {0:?}")]
    InvalidLength(String),

    /// The payload was not followed by a NUL terminator.
    #[error("frame payload is not NUL-terminated")]
    MissingTerminator,

    /// The payload is not valid UTF-8.
    #[error("frame payload is not valid UTF-8")]
    InvalidUtf8,

    /// The payload could not be parsed as XML.
    #[error("invalid XML payload: {0}")]
    InvalidXml(String),

    /// The root element is not one of init/stream/response/notify.
    #[error("unknown packet type: {0}")]
    UnknownPacket(String),

    /// A required attribute is missing or unparseable.
    #[error("<{element}> is missing attribute `{attribute}`")]
    MissingAttribute {
        /// Element name.
        element: String,
        /// Attribute name.
        attribute: String,
    },

    /// A base64 value could not be decoded.
    #[error("invalid base64 data: {0}")]
    InvalidBase64(String),

    /// A response arrived for a transaction that is not pending.
    #[error("no pending transaction with id {0}")]
    UnmatchedTransaction(u32),

    /// A command line could not be parsed.
    #[error("malformed command: {0}")]
    MalformedCommand(String),
}

/// Broad DBGP error classes, derived from the numeric error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorClass {
    /// 0-99: command parsing errors.
    CommandParsing,
    /// 100-199: file related errors.
    File,
    /// 200-299: breakpoint or code flow errors.
    Breakpoint,
    /// 300-399: data errors.
    Data,
    /// 900-999: protocol errors.
    Protocol,
    /// Anything outside the documented ranges.
    Unknown,
}

impl EngineErrorClass {
    /// Classify a DBGP error code.
    pub fn from_code(code: u32) -> Self {
        match code {
            0..=99 => Self::CommandParsing,
            100..=199 => Self::File,
            200..=299 => Self::Breakpoint,
            300..=399 => Self::Data,
            900..=999 => Self::Protocol,
            _ => Self::Unknown,
        }
    }
}

/// An `<error>` element returned by the debugger engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("engine error {code} on `{command}`: {message}")]
pub struct EngineError {
    /// The command that failed.
    pub command: String,
    /// DBGP numeric error code.
    pub code: u32,
    /// Message text, if the engine sent one.
    pub message: String,
}

impl EngineError {
    /// Command is unimplemented by the engine.
    pub const UNIMPLEMENTED: u32 = 4;
    /// Breakpoint could not be set.
    pub const BREAKPOINT_NOT_SET: u32 = 200;
    /// No such breakpoint.
    pub const NO_SUCH_BREAKPOINT: u32 = 205;
    /// Property could not be retrieved.
    pub const CANNOT_GET_PROPERTY: u32 = 300;

    /// The error class of this error's code.
    pub fn class(&self) -> EngineErrorClass {
        EngineErrorClass::from_code(self.code)
    }
}

/// Errors returned by session operations.
#[derive(Debug, Error)]
pub enum DbgpError {
    /// Wire-level error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The engine answered with an error element.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The connection is gone; the command was never answered.
    #[error("session closed")]
    SessionClosed,

    /// The caller stopped waiting (timeout or cancellation).
    #[error("command `{0}` cancelled before its response arrived")]
    Cancelled(String),

    /// Socket I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DbgpError {
    /// The engine error, if this is one.
    pub fn as_engine(&self) -> Option<&EngineError> {
        match self {
            Self::Engine(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_error_class_ranges() {
        assert_eq!(EngineErrorClass::from_code(1), EngineErrorClass::CommandParsing);
        assert_eq!(EngineErrorClass::from_code(100), EngineErrorClass::File);
        assert_eq!(EngineErrorClass::from_code(205), EngineErrorClass::Breakpoint);
        assert_eq!(EngineErrorClass::from_code(300), EngineErrorClass::Data);
        assert_eq!(EngineErrorClass::from_code(998), EngineErrorClass::Protocol);
        assert_eq!(EngineErrorClass::from_code(500), EngineErrorClass::Unknown);
    }

    #[test]
    fn engine_error_display() {
        let err = EngineError {
            command: "breakpoint_set".into(),
            code: 200,
            message: "breakpoint could not be set".into(),
        };
        assert_eq!(
            err.to_string(),
            "engine error 200 on `breakpoint_set`: breakpoint could not be set"
        );
        assert_eq!(err.class(), EngineErrorClass::Breakpoint);
    }

    #[test]
    fn protocol_error_display() {
        let err = ProtocolError::MissingAttribute {
            element: "response".into(),
            attribute: "transaction_id".into(),
        };
        assert_eq!(
            err.to_string(),
            "<response> is missing attribute `transaction_id`"
        );
    }

    #[test]
    fn dbgp_error_from_protocol() {
        let err: DbgpError = ProtocolError::UnmatchedTransaction(7).into();
        assert!(matches!(err, DbgpError::Protocol(_)));
        assert!(err.to_string().contains("7"));
        assert!(err.as_engine().is_none());
    }

    #[test]
    fn dbgp_error_session_closed_display() {
        assert_eq!(DbgpError::SessionClosed.to_string(), "session closed");
    }

    #[test]
    fn dbgp_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = DbgpError::from(io);
        assert!(err.to_string().contains("reset"));
    }
}
