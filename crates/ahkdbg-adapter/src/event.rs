//! Events the runtime reports to its front end.

use tokio::sync::mpsc;

use crate::protocol::{ExitedEventBody, OutputEventBody};

/// Something the front end should hear about outside a request/response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    /// Script stdout, from the process pipe or a redirected DBGP stream.
    StdOut(String),
    /// Script stderr.
    StdErr(String),
    /// Debugger console output, e.g. a logpoint message.
    OutputDebug(String),
    /// A recoverable problem.
    Warning(String),
    /// A failure the session may not survive.
    Error(String),
    /// The interpreter exited. `None` when it was killed by a signal.
    ProcessClose(Option<i32>),
    /// The DBGP connection closed.
    SocketClose,
    /// The listening socket was released.
    ServerClose,
}

impl RuntimeEvent {
    /// The DAP `output` body for text-carrying events.
    pub fn output_body(&self) -> Option<OutputEventBody> {
        let (category, text) = match self {
            RuntimeEvent::StdOut(text) => ("stdout", text),
            RuntimeEvent::StdErr(text) => ("stderr", text),
            RuntimeEvent::OutputDebug(text) => ("console", text),
            RuntimeEvent::Warning(text) => ("console", text),
            RuntimeEvent::Error(text) => ("important", text),
            _ => return None,
        };
        Some(OutputEventBody {
            category: Some(category.to_string()),
            output: text.clone(),
        })
    }

    /// The DAP `exited` body for [`RuntimeEvent::ProcessClose`].
    pub fn exited_body(&self) -> Option<ExitedEventBody> {
        match self {
            RuntimeEvent::ProcessClose(code) => Some(ExitedEventBody {
                exit_code: code.map_or(-1, i64::from),
            }),
            _ => None,
        }
    }
}

/// Receiver of runtime events.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: RuntimeEvent);
}

impl EventSink for mpsc::UnboundedSender<RuntimeEvent> {
    fn emit(&self, event: RuntimeEvent) {
        if self.send(event).is_err() {
            tracing::debug!("runtime event dropped: receiver gone");
        }
    }
}
