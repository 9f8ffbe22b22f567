//! The debug runtime: one script, one engine connection.
//!
//! A [`Runtime`] starts or attaches to an AutoHotkey script, sets up the DBGP
//! session and then answers the front end's requests against it. Phases only
//! move forward; a closed runtime stays closed.
//!
//! Connection lifecycle events are reported through the [`EventSink`] by a
//! supervisor task that owns the engine's event stream, the interpreter
//! process and the listening socket. When the connection goes away it
//! reports, in order, [`RuntimeEvent::ProcessClose`] (launched scripts only),
//! [`RuntimeEvent::SocketClose`] and [`RuntimeEvent::ServerClose`] (when a
//! listener was used).

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahkdbg_config::{LaunchTransport, NormalizedDebugConfig, RequestKind};
use ahkdbg_dbgp::{
    same_file, uri_to_path, Command, DbgpError, InitPacket, Property, ProtocolError, RequestQueue,
    Response, RunState, Session, SessionEvent, SessionEvents, StatusReason, StreamKind, XmlElement,
};
use ahkdbg_scanner::{flatten, EngineVersion, IncludeContext, Scanner, SourceNode};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::breakpoint::{Breakpoint, BreakpointData, BreakpointKind, BreakpointManager};
use crate::condition::{parse_log_message, LogSegment};
use crate::error::AdapterError;
use crate::event::{EventSink, RuntimeEvent};
use crate::features::{feature_set_commands, EngineFeatures};
use crate::handles::{FrameRef, Handles, VariableRef};
use crate::process::{launch_args, post_attach_request, ScriptProcess};
use crate::protocol::{
    BreakpointResponse, Capabilities, CompletionItem, EvaluateArguments, EvaluateResponseBody,
    ExceptionBreakpointsFilter, FunctionBreakpoint, Scope, SetBreakpointsArguments, Source,
    StackFrame, StopReason, StoppedEventBody, Thread, Variable,
};

/// AutoHotkey scripts have exactly one thread.
pub const THREAD_ID: i64 = 1;

/// Filter id of the "break on exceptions" option.
pub const EXCEPTION_FILTER: &str = "exceptions";

/// How long a launched script may take to exit by itself once the
/// connection is gone.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Pause between connection attempts when the engine is the listener.
const CONNECT_RETRY: Duration = Duration::from_millis(100);

const STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Where a runtime is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Launching,
    Attaching,
    /// Connected, with the engine's last reported state.
    Connected(RunState),
    Closed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Idle => f.write_str("idle"),
            Phase::Launching => f.write_str("launching"),
            Phase::Attaching => f.write_str("attaching"),
            Phase::Connected(state) => write!(f, "connected ({})", state.as_str()),
            Phase::Closed => f.write_str("closed"),
        }
    }
}

/// A command that resumes (or stops) the script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    Continue,
    Next,
    StepIn,
    StepOut,
    Pause,
    Stop,
}

impl Continuation {
    /// The DBGP command name.
    pub fn command_name(self) -> &'static str {
        match self {
            Continuation::Continue => "run",
            Continuation::Next => "step_over",
            Continuation::StepIn => "step_into",
            Continuation::StepOut => "step_out",
            Continuation::Pause => "break",
            Continuation::Stop => "stop",
        }
    }

    fn operation(self) -> &'static str {
        match self {
            Continuation::Continue => "continue",
            Continuation::Next => "step over",
            Continuation::StepIn => "step in",
            Continuation::StepOut => "step out",
            Continuation::Pause => "pause",
            Continuation::Stop => "stop",
        }
    }
}

/// Result of a continuation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionStatus {
    pub state: RunState,
    pub reason: StatusReason,
    /// Set whenever `state` is [`RunState::Break`].
    pub stop_reason: Option<StopReason>,
    /// Top frame at the break.
    pub location: Option<(PathBuf, u32)>,
    /// Breakpoints at `location` that caused the stop. Logpoints never do.
    pub hit_breakpoint_ids: Vec<u32>,
    /// Exception text for exception stops.
    pub exception_message: Option<String>,
}

impl ExecutionStatus {
    fn new(state: RunState, reason: StatusReason) -> Self {
        Self {
            state,
            reason,
            stop_reason: None,
            location: None,
            hit_breakpoint_ids: Vec::new(),
            exception_message: None,
        }
    }

    /// Body of the `stopped` event to send, if the script is at a break.
    pub fn stopped_event(&self) -> Option<StoppedEventBody> {
        let reason = self.stop_reason?;
        Some(StoppedEventBody {
            reason,
            description: None,
            thread_id: Some(THREAD_ID),
            text: self.exception_message.clone(),
            hit_breakpoint_ids: self.hit_breakpoint_ids.clone(),
        })
    }
}

/// The exception the script is stopped on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionDetails {
    /// Exception class, e.g. `ValueError`.
    pub exception_id: Option<String>,
    pub message: String,
    pub location: Option<(PathBuf, u32)>,
}

/// Breaks into a running script from outside the request that resumed it.
#[derive(Debug, Clone)]
pub struct Pauser {
    session: Session,
    supports_async: bool,
}

impl Pauser {
    /// Send `break`.
    ///
    /// Engines without `supports_async` only read it after the running
    /// command completes.
    pub async fn pause(&self) -> Result<(), AdapterError> {
        let command = Command::new(Continuation::Pause.command_name());
        if self.supports_async {
            self.session.interrupt(command).await?;
        } else {
            self.session.send_command(command).await?;
        }
        Ok(())
    }
}

struct Established {
    session: Session,
    events: SessionEvents,
    listener: Option<TcpListener>,
    process: Option<Arc<ScriptProcess>>,
}

struct Connection {
    mode: RequestKind,
    session: Session,
    init: InitPacket,
    features: EngineFeatures,
    breakpoints: BreakpointManager,
    frames: Handles<FrameRef>,
    variables: Handles<VariableRef>,
    last_stop: Option<Response>,
    process: Option<Arc<ScriptProcess>>,
    detached: Arc<AtomicBool>,
    supervisor: Option<JoinHandle<()>>,
}

/// Debugs one AutoHotkey script.
pub struct Runtime {
    config: NormalizedDebugConfig,
    sink: Arc<dyn EventSink>,
    scanner: Arc<Scanner>,
    phase: Phase,
    connection: Option<Connection>,
}

impl Runtime {
    pub fn new(config: NormalizedDebugConfig, sink: Arc<dyn EventSink>) -> Result<Self, AdapterError> {
        let version = EngineVersion::from_major(config.engine_version);
        let context = IncludeContext::for_script(config.program.clone(), version)
            .with_runtime(Some(config.runtime.clone()));
        let scanner = Arc::new(Scanner::new(context)?);
        Ok(Self {
            config,
            sink,
            scanner,
            phase: Phase::Idle,
            connection: None,
        })
    }

    /// What this adapter supports, for the `initialize` response.
    pub fn capabilities() -> Capabilities {
        Capabilities {
            supports_configuration_done_request: Some(true),
            supports_function_breakpoints: Some(true),
            supports_conditional_breakpoints: Some(true),
            supports_hit_conditional_breakpoints: Some(true),
            supports_log_points: Some(true),
            supports_evaluate_for_hovers: Some(true),
            supports_completions_request: Some(true),
            supports_loaded_sources_request: Some(true),
            supports_exception_info_request: Some(true),
            support_terminate_debuggee: Some(true),
            exception_breakpoint_filters: Some(vec![ExceptionBreakpointsFilter {
                filter: EXCEPTION_FILTER.to_string(),
                label: "Thrown exceptions".to_string(),
                default: Some(false),
            }]),
        }
    }

    pub fn config(&self) -> &NormalizedDebugConfig {
        &self.config
    }

    /// Current phase. A runtime whose connection dropped reports `Closed`.
    pub fn phase(&self) -> Phase {
        match (self.phase, &self.connection) {
            (Phase::Connected(_), Some(conn)) if conn.session.is_closed() => Phase::Closed,
            (phase, _) => phase,
        }
    }

    /// The engine's `<init>` packet, once connected.
    pub fn init_packet(&self) -> Option<&InitPacket> {
        self.connection.as_ref().map(|c| &c.init)
    }

    pub fn features(&self) -> Option<&EngineFeatures> {
        self.connection.as_ref().map(|c| &c.features)
    }

    /// Every breakpoint, in id order.
    pub fn breakpoints(&self) -> Vec<&Breakpoint> {
        self.connection
            .as_ref()
            .map(|c| c.breakpoints.get_all_breakpoints())
            .unwrap_or_default()
    }

    /// A handle that can break into the script while a continuation is
    /// being awaited.
    pub fn pauser(&self) -> Option<Pauser> {
        self.connection.as_ref().map(|c| Pauser {
            session: c.session.clone(),
            supports_async: c.features.supports_async,
        })
    }

    /// Launch or attach, whichever the configuration asks for.
    pub async fn start(&mut self) -> Result<(), AdapterError> {
        match self.config.request {
            RequestKind::Launch => self.launch().await,
            RequestKind::Attach => self.attach().await,
        }
    }

    /// Start the interpreter with `/Debug` and wait for its engine.
    pub async fn launch(&mut self) -> Result<(), AdapterError> {
        self.begin("launch", Phase::Launching)?;
        let established = match self.config.launch_transport {
            LaunchTransport::Listen => self.launch_listening().await,
            LaunchTransport::Connect => self.launch_connecting().await,
        };
        self.finish_connect(RequestKind::Launch, established).await
    }

    /// Ask an already running script to connect to us.
    pub async fn attach(&mut self) -> Result<(), AdapterError> {
        self.begin("attach", Phase::Attaching)?;
        let established = self.attach_listening().await;
        self.finish_connect(RequestKind::Attach, established).await
    }

    /// Debug over a stream that is already connected to an engine.
    ///
    /// The runtime behaves as if attached: closing detaches, and no process
    /// is started or stopped.
    pub async fn attach_stream<S>(&mut self, io: S) -> Result<(), AdapterError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.begin("attach", Phase::Attaching)?;
        let (session, events) = Session::from_stream(io);
        let established = Established {
            session,
            events,
            listener: None,
            process: None,
        };
        self.finish_connect(RequestKind::Attach, Ok(established)).await
    }

    fn begin(&mut self, operation: &'static str, next: Phase) -> Result<(), AdapterError> {
        if self.phase != Phase::Idle {
            return Err(AdapterError::InvalidPhase {
                operation,
                phase: self.phase().to_string(),
            });
        }
        self.phase = next;
        Ok(())
    }

    async fn launch_listening(&self) -> Result<Established, AdapterError> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let address = listener.local_addr()?;
        tracing::info!("waiting for the engine on {}", address);

        let args = launch_args(&self.config, &address.to_string());
        let process = match self.spawn(&args) {
            Ok(process) => process,
            Err(err) => {
                self.release_listener(listener);
                return Err(err);
            }
        };

        let accepted = tokio::select! {
            accepted = tokio::time::timeout(self.config.connect_timeout(), Session::accept(&listener)) => {
                match accepted {
                    Ok(result) => result.map_err(AdapterError::from),
                    Err(_) => Err(AdapterError::ConnectTimeout(self.config.connect_timeout_ms)),
                }
            }
            code = process.wait() => {
                self.sink.emit(RuntimeEvent::ProcessClose(code));
                Err(AdapterError::Process(format!(
                    "interpreter exited with code {code:?} before the engine connected"
                )))
            }
        };

        match accepted {
            Ok((session, events)) => Ok(Established {
                session,
                events,
                listener: Some(listener),
                process: Some(process),
            }),
            Err(err) => {
                process.kill();
                self.release_listener(listener);
                Err(err)
            }
        }
    }

    async fn launch_connecting(&self) -> Result<Established, AdapterError> {
        let args = launch_args(&self.config, &self.config.address());
        let process = self.spawn(&args)?;
        let deadline = Instant::now() + self.config.connect_timeout();
        loop {
            match Session::connect(&self.config.host, self.config.port).await {
                Ok((session, events)) => {
                    return Ok(Established {
                        session,
                        events,
                        listener: None,
                        process: Some(process),
                    })
                }
                Err(err) if process.has_exited() => {
                    let code = process.wait().await;
                    self.sink.emit(RuntimeEvent::ProcessClose(code));
                    return Err(AdapterError::Process(format!(
                        "interpreter exited with code {code:?} before accepting a connection ({err})"
                    )));
                }
                Err(err) if Instant::now() >= deadline => {
                    tracing::warn!("giving up on {}: {}", self.config.address(), err);
                    process.kill();
                    return Err(AdapterError::ConnectTimeout(self.config.connect_timeout_ms));
                }
                Err(err) => {
                    tracing::trace!("engine not listening yet: {}", err);
                    tokio::time::sleep(CONNECT_RETRY).await;
                }
            }
        }
    }

    async fn attach_listening(&self) -> Result<Established, AdapterError> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let address = listener.local_addr()?;
        if let Err(err) = post_attach_request(&self.config, address).await {
            self.release_listener(listener);
            return Err(err);
        }
        let accepted =
            tokio::time::timeout(self.config.connect_timeout(), Session::accept(&listener)).await;
        match accepted {
            Ok(Ok((session, events))) => Ok(Established {
                session,
                events,
                listener: Some(listener),
                process: None,
            }),
            Ok(Err(err)) => {
                self.release_listener(listener);
                Err(err.into())
            }
            Err(_) => {
                self.release_listener(listener);
                Err(AdapterError::ConnectTimeout(self.config.connect_timeout_ms))
            }
        }
    }

    fn spawn(&self, args: &[String]) -> Result<Arc<ScriptProcess>, AdapterError> {
        let process = ScriptProcess::spawn(
            &self.config.runtime,
            args,
            &self.config.working_dir(),
            &self.config.env,
            self.sink.clone(),
        )?;
        Ok(Arc::new(process))
    }

    fn release_listener(&self, listener: TcpListener) {
        drop(listener);
        self.sink.emit(RuntimeEvent::ServerClose);
    }

    async fn finish_connect(
        &mut self,
        mode: RequestKind,
        established: Result<Established, AdapterError>,
    ) -> Result<(), AdapterError> {
        let Established {
            session,
            mut events,
            listener,
            process,
        } = match established {
            Ok(established) => established,
            Err(err) => {
                self.phase = Phase::Closed;
                return Err(err);
            }
        };

        let init = match tokio::time::timeout(self.config.connect_timeout(), events.wait_for_init()).await {
            Ok(Ok(init)) => init,
            Ok(Err(err)) => {
                self.abandon(&session, process.as_deref(), listener).await;
                return Err(err.into());
            }
            Err(_) => {
                self.abandon(&session, process.as_deref(), listener).await;
                return Err(AdapterError::ConnectTimeout(self.config.connect_timeout_ms));
            }
        };
        tracing::info!("debugging {} ({} {})", init.file_uri, init.app_id, init.language);

        let detached = Arc::new(AtomicBool::new(false));
        let supervisor = tokio::spawn(supervise(
            events,
            process.clone(),
            listener,
            detached.clone(),
            self.sink.clone(),
        ));
        let breakpoints =
            BreakpointManager::new(session.clone(), self.scanner.clone(), self.config.program.clone());
        self.connection = Some(Connection {
            mode,
            session,
            init,
            features: EngineFeatures::default(),
            breakpoints,
            frames: Handles::new(),
            variables: Handles::new(),
            last_stop: None,
            process,
            detached,
            supervisor: Some(supervisor),
        });
        self.phase = Phase::Connected(RunState::Starting);

        if let Err(err) = self.negotiate().await {
            tracing::error!("session setup failed: {}", err);
            self.close().await;
            return Err(err);
        }
        Ok(())
    }

    async fn abandon(&mut self, session: &Session, process: Option<&ScriptProcess>, listener: Option<TcpListener>) {
        self.phase = Phase::Closed;
        session.close().await;
        if let Some(process) = process {
            process.kill();
        }
        if let Some(listener) = listener {
            self.release_listener(listener);
        }
    }

    /// Feature negotiation, output redirection and the configured
    /// breakpoints.
    async fn negotiate(&mut self) -> Result<(), AdapterError> {
        let conn = self.connection.as_mut().ok_or(AdapterError::NotConnected)?;
        conn.features = EngineFeatures::query(&conn.session).await?;

        let configured = EngineVersion::from_major(self.config.engine_version);
        if let Some(reported) = conn.features.engine_version() {
            if reported != configured {
                let warning = format!(
                    "engine reports version {} but engine_version is {}",
                    conn.features.language_version.as_deref().unwrap_or_default(),
                    self.config.engine_version
                );
                tracing::warn!("{}", warning);
                self.sink.emit(RuntimeEvent::Warning(warning));
            }
        }

        let mut setup = feature_set_commands(&self.config);
        if self.config.redirect_output {
            setup.push(Command::new("stdout").arg('c', 1));
            setup.push(Command::new("stderr").arg('c', 1));
        }
        let queue = RequestQueue::new();
        for command in setup {
            let session = conn.session.clone();
            let sink = self.sink.clone();
            queue.enqueue(async move {
                let name = command.name.clone();
                if let Err(err) = session.send_command(command).await {
                    tracing::warn!("{} failed: {}", name, err);
                    sink.emit(RuntimeEvent::Warning(format!("{name} failed: {err}")));
                }
            });
        }
        queue.flush().await;
        if conn.session.is_closed() {
            return Err(AdapterError::Session(DbgpError::SessionClosed));
        }

        let mut seeded = Vec::new();
        let mut by_file: BTreeMap<PathBuf, Vec<BreakpointData>> = BTreeMap::new();
        for entry in &self.config.breakpoints {
            let mut data = with_options(
                BreakpointData::line(entry.file.clone(), entry.line),
                entry.condition.as_deref(),
                entry.hit_condition.as_deref(),
            );
            if let Some(message) = &entry.log_message {
                data = data.with_log_message(message.clone());
            }
            by_file.entry(entry.file.clone()).or_default().push(data);
        }
        for (file, requests) in by_file {
            seeded.extend(conn.breakpoints.set_line_breakpoints(&file, requests).await?);
        }
        for entry in &self.config.function_breakpoints {
            let data = if entry.on_return {
                BreakpointData::on_return(entry.name.clone())
            } else {
                BreakpointData::function(entry.name.clone())
            };
            let data = with_options(data, entry.condition.as_deref(), entry.hit_condition.as_deref());
            seeded.push(conn.breakpoints.set_breakpoint(data).await?);
        }
        if self.config.break_on_exception {
            seeded.extend(conn.breakpoints.set_exception_breakpoint(true).await?);
        }
        for bp in seeded.iter().filter(|bp| !bp.verified()) {
            let warning = format!(
                "breakpoint {} not set: {}",
                describe(bp),
                bp.message.as_deref().unwrap_or("not verified")
            );
            tracing::warn!("{}", warning);
            self.sink.emit(RuntimeEvent::Warning(warning));
        }
        Ok(())
    }

    fn connection_mut(&mut self, operation: &'static str) -> Result<&mut Connection, AdapterError> {
        match self.phase() {
            Phase::Connected(_) => self.connection.as_mut().ok_or(AdapterError::NotConnected),
            Phase::Closed => Err(AdapterError::NotConnected),
            phase => Err(AdapterError::InvalidPhase {
                operation,
                phase: phase.to_string(),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Execution control
    // -----------------------------------------------------------------------

    /// The front end is done configuring: run, or stop on the first line
    /// when `stop_on_entry` is set.
    pub async fn configuration_done(&mut self) -> Result<ExecutionStatus, AdapterError> {
        if !self.config.stop_on_entry {
            return self.execute(Continuation::Continue).await;
        }
        let mut status = self.execute(Continuation::StepIn).await?;
        if status.stop_reason == Some(StopReason::Step) {
            status.stop_reason = Some(StopReason::Entry);
        }
        Ok(status)
    }

    pub async fn continue_execution(&mut self) -> Result<ExecutionStatus, AdapterError> {
        self.execute(Continuation::Continue).await
    }

    pub async fn next(&mut self) -> Result<ExecutionStatus, AdapterError> {
        self.execute(Continuation::Next).await
    }

    pub async fn step_in(&mut self) -> Result<ExecutionStatus, AdapterError> {
        self.execute(Continuation::StepIn).await
    }

    pub async fn step_out(&mut self) -> Result<ExecutionStatus, AdapterError> {
        self.execute(Continuation::StepOut).await
    }

    /// Break into the script. To pause while a continuation is pending, use
    /// a [`Pauser`] instead.
    pub async fn pause(&mut self) -> Result<ExecutionStatus, AdapterError> {
        self.execute(Continuation::Pause).await
    }

    /// End the script. The engine closes the connection afterwards.
    pub async fn stop(&mut self) -> Result<ExecutionStatus, AdapterError> {
        self.execute(Continuation::Stop).await
    }

    async fn execute(&mut self, continuation: Continuation) -> Result<ExecutionStatus, AdapterError> {
        let operation = continuation.operation();
        let state = match self.phase() {
            Phase::Connected(state) => state,
            Phase::Closed => return Err(AdapterError::NotConnected),
            phase => {
                return Err(AdapterError::InvalidPhase {
                    operation,
                    phase: phase.to_string(),
                })
            }
        };
        let finished = state == RunState::Stopped
            || (state == RunState::Stopping && continuation != Continuation::Stop);
        if finished {
            return Err(AdapterError::InvalidPhase {
                operation,
                phase: self.phase().to_string(),
            });
        }

        let conn = self.connection.as_mut().ok_or(AdapterError::NotConnected)?;
        self.phase = Phase::Connected(RunState::Running);
        let result = conn.execute(continuation, self.sink.as_ref()).await;
        self.phase = match &result {
            Ok(status) => Phase::Connected(status.state),
            Err(err) if err.is_closed() => Phase::Closed,
            Err(_) => Phase::Connected(state),
        };
        result
    }

    /// Details of the exception the script is stopped on, if any.
    pub fn exception_details(&self) -> Option<ExceptionDetails> {
        let response = self.connection.as_ref()?.last_stop.as_ref()?;
        match exception_message(&response.element) {
            Some(el) => Some(ExceptionDetails {
                exception_id: el.attr("exception").map(str::to_string),
                message: el.text.trim().to_string(),
                location: el
                    .attr("filename")
                    .map(|uri| (uri_to_path(uri), el.attr_u32("lineno").unwrap_or(0))),
            }),
            None if response.reason() == Some(StatusReason::Exception) => Some(ExceptionDetails {
                exception_id: None,
                message: String::new(),
                location: None,
            }),
            None => None,
        }
    }

    // -----------------------------------------------------------------------
    // Breakpoints
    // -----------------------------------------------------------------------

    /// Replace the line breakpoints and logpoints of one source.
    pub async fn set_breakpoints(
        &mut self,
        args: SetBreakpointsArguments,
    ) -> Result<Vec<BreakpointResponse>, AdapterError> {
        let path = args
            .source
            .path
            .as_deref()
            .map(PathBuf::from)
            .ok_or_else(|| AdapterError::Resolution("a source without a path".to_string()))?;
        let requests = args
            .breakpoints
            .iter()
            .map(|bp| {
                let mut data = with_options(
                    BreakpointData::line(path.clone(), bp.line),
                    bp.condition.as_deref(),
                    bp.hit_condition.as_deref(),
                );
                if let Some(column) = bp.column {
                    data = data.with_character(column);
                }
                if let Some(message) = &bp.log_message {
                    data = data.with_log_message(message.clone());
                }
                data
            })
            .collect();
        let conn = self.connection_mut("set breakpoints")?;
        let set = conn.breakpoints.set_line_breakpoints(&path, requests).await?;
        Ok(set.iter().map(Breakpoint::to_response).collect())
    }

    /// Replace every function breakpoint. A name ending in `()` breaks when
    /// the function returns instead of when it is entered.
    pub async fn set_function_breakpoints(
        &mut self,
        breakpoints: Vec<FunctionBreakpoint>,
    ) -> Result<Vec<BreakpointResponse>, AdapterError> {
        let conn = self.connection_mut("set function breakpoints")?;
        conn.breakpoints.remove_function_breakpoints().await?;
        let mut responses = Vec::with_capacity(breakpoints.len());
        for bp in breakpoints {
            let name = bp.name.trim();
            let data = match name.strip_suffix("()") {
                Some(name) => BreakpointData::on_return(name.trim()),
                None => BreakpointData::function(name),
            };
            let data = with_options(data, bp.condition.as_deref(), bp.hit_condition.as_deref());
            responses.push(conn.breakpoints.set_breakpoint(data).await?.to_response());
        }
        Ok(responses)
    }

    /// Enable or disable breaking on exceptions.
    pub async fn set_exception_breakpoints(
        &mut self,
        filters: &[String],
    ) -> Result<Vec<BreakpointResponse>, AdapterError> {
        let enable = filters.iter().any(|f| f == EXCEPTION_FILTER);
        let conn = self.connection_mut("set exception breakpoints")?;
        let bp = conn.breakpoints.set_exception_breakpoint(enable).await?;
        Ok(bp.iter().map(Breakpoint::to_response).collect())
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub fn threads(&self) -> Vec<Thread> {
        vec![Thread {
            id: THREAD_ID,
            name: "Main Thread".to_string(),
        }]
    }

    /// The call stack, innermost frame first.
    pub async fn stack_trace(&mut self) -> Result<Vec<StackFrame>, AdapterError> {
        let conn = self.connection_mut("read the stack")?;
        let response = conn.session.send_command(Command::new("stack_get")).await?;
        let frames = response
            .stack_frames()
            .into_iter()
            .map(|frame| {
                let id = conn.frames.create(FrameRef { depth: frame.level });
                let source = (!frame.file_uri.is_empty())
                    .then(|| Source::from_path(&uri_to_path(&frame.file_uri)));
                let name = if frame.location.is_empty() {
                    "[auto-execute]".to_string()
                } else {
                    frame.location
                };
                StackFrame {
                    id,
                    name,
                    source,
                    line: frame.line,
                    column: 1,
                }
            })
            .collect();
        Ok(frames)
    }

    /// Variable contexts of a frame, in engine order.
    pub async fn scopes(&mut self, frame_id: i64) -> Result<Vec<Scope>, AdapterError> {
        let conn = self.connection_mut("read scopes")?;
        let frame = *conn
            .frames
            .get(frame_id)
            .ok_or(AdapterError::InvalidReference(frame_id))?;
        let response = conn
            .session
            .send_command(Command::new("context_names").arg('d', frame.depth))
            .await?;
        let scopes = response
            .contexts()
            .into_iter()
            .map(|context| Scope {
                variables_reference: conn.variables.create(VariableRef::Context {
                    depth: frame.depth,
                    context_id: context.id,
                }),
                expensive: context.name.eq_ignore_ascii_case("global"),
                name: context.name,
            })
            .collect();
        Ok(scopes)
    }

    /// Children of a scope or of an object-valued variable.
    pub async fn variables(&mut self, reference: i64) -> Result<Vec<Variable>, AdapterError> {
        let conn = self.connection_mut("read variables")?;
        let target = conn
            .variables
            .get(reference)
            .cloned()
            .ok_or(AdapterError::InvalidReference(reference))?;
        let (depth, context_id, properties) = match target {
            VariableRef::Context { depth, context_id } => {
                let command = Command::new("context_get")
                    .arg('d', depth)
                    .arg('c', context_id);
                let properties = conn.session.send_command(command).await?.properties()?;
                (depth, Some(context_id), properties)
            }
            VariableRef::Property {
                depth,
                context_id,
                full_name,
            } => {
                let properties = conn.property_children(depth, context_id, &full_name).await?;
                (depth, context_id, properties)
            }
        };
        Ok(properties
            .iter()
            .map(|p| conn.variable(depth, context_id, p))
            .collect())
    }

    /// Look up an expression. The engine resolves it as a property name.
    pub async fn evaluate(&mut self, args: EvaluateArguments) -> Result<EvaluateResponseBody, AdapterError> {
        let conn = self.connection_mut("evaluate")?;
        let depth = conn.depth(args.frame_id)?;
        let expression = args.expression.trim();
        let command = Command::new("property_get")
            .arg('d', depth)
            .arg('n', expression);
        let property = conn
            .session
            .send_command(command)
            .await?
            .properties()?
            .into_iter()
            .next()
            .ok_or_else(|| AdapterError::Resolution(format!("`{expression}`")))?;
        let variable = conn.variable(depth, None, &property);
        Ok(EvaluateResponseBody {
            result: variable.value,
            result_type: variable.variable_type,
            variables_reference: variable.variables_reference,
        })
    }

    /// Variable and member names completing the word at the end of `text`.
    pub async fn completions(
        &mut self,
        text: &str,
        frame_id: Option<i64>,
    ) -> Result<Vec<CompletionItem>, AdapterError> {
        let conn = self.connection_mut("complete")?;
        let depth = conn.depth(frame_id)?;
        let word = completion_word(text);
        let (names, prefix) = match word.rfind('.') {
            Some(dot) => {
                let members = match conn.property_children(depth, None, &word[..dot]).await {
                    Ok(members) => members,
                    Err(AdapterError::Engine(err)) => {
                        tracing::debug!("no members for `{}`: {}", &word[..dot], err);
                        Vec::new()
                    }
                    Err(err) => return Err(err),
                };
                let names: Vec<(String, &str)> =
                    members.into_iter().map(|p| (p.name, "property")).collect();
                (names, &word[dot + 1..])
            }
            None => {
                let response = conn
                    .session
                    .send_command(Command::new("context_names").arg('d', depth))
                    .await?;
                let mut names = Vec::new();
                for context in response.contexts() {
                    let command = Command::new("context_get")
                        .arg('d', depth)
                        .arg('c', context.id);
                    let properties = conn.session.send_command(command).await?.properties()?;
                    names.extend(properties.into_iter().map(|p| (p.name, "variable")));
                }
                (names, word)
            }
        };

        let prefix = prefix.to_lowercase();
        let mut seen = HashSet::new();
        Ok(names
            .into_iter()
            .filter(|(name, _)| name.to_lowercase().starts_with(&prefix))
            .filter(|(name, _)| seen.insert(name.to_lowercase()))
            .map(|(label, kind)| CompletionItem {
                label,
                item_type: Some(kind.to_string()),
            })
            .collect())
    }

    /// The main script and every file it includes.
    pub fn loaded_sources(&self) -> Result<Vec<Source>, AdapterError> {
        let nodes = self.scanner.find(&self.config.program)?;
        let mut files = vec![self.config.program.clone()];
        for node in flatten(&nodes) {
            let SourceNode::Include(include) = node else {
                continue;
            };
            let Some(path) = include.resolved.as_ref().filter(|p| p.is_file()) else {
                continue;
            };
            if !files.iter().any(|f| same_file(f, path)) {
                files.push(path.clone());
            }
        }
        Ok(files.iter().map(|f| Source::from_path(f)).collect())
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// End the debug session. A launched script is stopped; an attached one
    /// is detached from and keeps running. Safe to call more than once.
    pub async fn close(&mut self) {
        self.phase = Phase::Closed;
        if let Some(conn) = self.connection.take() {
            conn.shutdown().await;
        }
    }

    /// Let the script run on without the debugger, launched or not.
    pub async fn detach(&mut self) -> Result<(), AdapterError> {
        let conn = self.connection_mut("detach")?;
        conn.detached.store(true, Ordering::SeqCst);
        let result = conn.session.detach().await;
        self.phase = Phase::Closed;
        if let Some(conn) = self.connection.take() {
            conn.shutdown().await;
        }
        result.map_err(AdapterError::from)
    }
}

impl Connection {
    async fn execute(
        &mut self,
        continuation: Continuation,
        sink: &dyn EventSink,
    ) -> Result<ExecutionStatus, AdapterError> {
        loop {
            self.frames.reset();
            self.variables.reset();
            self.last_stop = None;

            let response = self
                .session
                .send_command(Command::new(continuation.command_name()))
                .await?;
            let state = response.status().ok_or_else(|| ProtocolError::MissingAttribute {
                element: "response".to_string(),
                attribute: "status".to_string(),
            })?;
            let reason = response.reason().unwrap_or(StatusReason::Ok);
            let mut status = ExecutionStatus::new(state, reason);
            if state != RunState::Break {
                return Ok(status);
            }

            status.exception_message = exception_message(&response.element).map(|el| el.text.trim().to_string());
            let exception = status.exception_message.is_some() || reason == StatusReason::Exception;
            status.location = self.top_location().await?;

            let mut log_messages = Vec::new();
            let mut functions_only = true;
            if let Some((file, line)) = &status.location {
                for bp in self.breakpoints.get_breakpoints_by_line(file, *line) {
                    match bp.log_message() {
                        Some(message) => log_messages.push(message.to_string()),
                        None => {
                            functions_only &= matches!(
                                bp.kind,
                                BreakpointKind::Function(_) | BreakpointKind::Return(_)
                            );
                            status.hit_breakpoint_ids.push(bp.id);
                        }
                    }
                }
            }

            if continuation == Continuation::Continue && !exception && !log_messages.is_empty() {
                for template in &log_messages {
                    let message = self.format_log_message(template).await?;
                    sink.emit(RuntimeEvent::OutputDebug(message));
                }
                if status.hit_breakpoint_ids.is_empty() {
                    continue;
                }
            }

            status.stop_reason = Some(if exception {
                StopReason::Exception
            } else if continuation == Continuation::Continue && !status.hit_breakpoint_ids.is_empty() {
                if functions_only {
                    StopReason::FunctionBreakpoint
                } else {
                    StopReason::Breakpoint
                }
            } else {
                match continuation {
                    Continuation::Continue | Continuation::Pause => StopReason::Pause,
                    _ => StopReason::Step,
                }
            });
            self.last_stop = Some(response);
            return Ok(status);
        }
    }

    async fn top_location(&self) -> Result<Option<(PathBuf, u32)>, AdapterError> {
        match self.session.send_command(Command::new("stack_get").arg('d', 0)).await {
            Ok(response) => Ok(response
                .stack_frames()
                .first()
                .map(|frame| (uri_to_path(&frame.file_uri), frame.line))),
            Err(DbgpError::Engine(err)) => {
                tracing::debug!("no stack at break: {}", err);
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn format_log_message(&self, template: &str) -> Result<String, AdapterError> {
        let mut message = String::new();
        for segment in parse_log_message(template) {
            match segment {
                LogSegment::Text(text) => message.push_str(&text),
                LogSegment::Expression(expression) => {
                    let command = Command::new("property_get").arg('d', 0).arg('n', &expression);
                    match self.session.send_command(command).await {
                        Ok(response) => {
                            if let Some(property) = response.properties()?.first() {
                                message.push_str(&property.display_value());
                            }
                        }
                        Err(DbgpError::Engine(err)) => {
                            message.push_str(&format!("<{}>", err.message));
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
            }
        }
        if !message.ends_with('\n') {
            message.push('\n');
        }
        Ok(message)
    }

    fn depth(&self, frame_id: Option<i64>) -> Result<u32, AdapterError> {
        match frame_id {
            Some(id) => self
                .frames
                .get(id)
                .map(|frame| frame.depth)
                .ok_or(AdapterError::InvalidReference(id)),
            None => Ok(0),
        }
    }

    /// All children of a property, fetching further pages as needed.
    async fn property_children(
        &self,
        depth: u32,
        context_id: Option<u32>,
        full_name: &str,
    ) -> Result<Vec<Property>, AdapterError> {
        let page_command = |page: u32| {
            Command::new("property_get")
                .arg('d', depth)
                .arg_opt('c', context_id)
                .arg('p', page)
                .arg('n', full_name)
        };
        let response = self.session.send_command(page_command(0)).await?;
        let Some(property) = response.properties()?.into_iter().next() else {
            return Ok(Vec::new());
        };
        let total = property.num_children as usize;
        let mut page = property.page;
        let mut children = property.children;
        while children.len() < total {
            page += 1;
            let more = self
                .session
                .send_command(page_command(page))
                .await?
                .properties()?
                .into_iter()
                .next()
                .map(|p| p.children)
                .unwrap_or_default();
            if more.is_empty() {
                break;
            }
            children.extend(more);
        }
        Ok(children)
    }

    fn variable(&mut self, depth: u32, context_id: Option<u32>, property: &Property) -> Variable {
        let variables_reference = if property.has_children {
            self.variables.create(VariableRef::Property {
                depth,
                context_id,
                full_name: property.full_name.clone(),
            })
        } else {
            0
        };
        Variable {
            name: property.name.clone(),
            value: property.display_value(),
            variable_type: Some(
                property
                    .class_name
                    .clone()
                    .unwrap_or_else(|| property.kind.clone()),
            ),
            evaluate_name: Some(property.full_name.clone()),
            variables_reference,
            named_variables: property.has_children.then_some(property.num_children),
        }
    }

    async fn shutdown(mut self) {
        if !self.session.is_closed() {
            match self.mode {
                RequestKind::Launch if !self.detached.load(Ordering::SeqCst) => {
                    let stop = Command::new(Continuation::Stop.command_name());
                    if let Err(err) = self.session.send_command_with_timeout(stop, STOP_TIMEOUT).await {
                        tracing::debug!("stop during close failed: {}", err);
                    }
                    self.session.close().await;
                }
                _ => {
                    self.detached.store(true, Ordering::SeqCst);
                    if let Err(err) = self.session.detach().await {
                        tracing::warn!("detach during close failed: {}", err);
                    }
                }
            }
        }
        if let Some(supervisor) = self.supervisor.take() {
            if let Err(err) = supervisor.await {
                tracing::warn!("connection supervisor failed: {}", err);
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(process) = &self.process {
            if !self.detached.load(Ordering::SeqCst) {
                process.kill();
            }
        }
    }
}

/// Forward engine output until the connection closes, then report the end
/// of the process, the socket and the listener, in that order.
async fn supervise(
    mut events: SessionEvents,
    process: Option<Arc<ScriptProcess>>,
    listener: Option<TcpListener>,
    detached: Arc<AtomicBool>,
    sink: Arc<dyn EventSink>,
) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Stream(stream) => sink.emit(match stream.kind {
                StreamKind::Stdout => RuntimeEvent::StdOut(stream.data),
                StreamKind::Stderr => RuntimeEvent::StdErr(stream.data),
            }),
            SessionEvent::Notify(notify) => {
                tracing::debug!("engine notification `{}`", notify.name);
            }
            SessionEvent::ProtocolError(err) => {
                tracing::warn!("protocol error: {}", err);
                sink.emit(RuntimeEvent::Warning(format!("malformed engine message: {err}")));
            }
            SessionEvent::Init(_) => tracing::warn!("ignoring a second init packet"),
            SessionEvent::Closed => break,
        }
    }
    tracing::info!("engine connection closed");

    if let Some(process) = process {
        if detached.load(Ordering::SeqCst) {
            tracing::info!("leaving detached script running (pid {:?})", process.id());
        } else {
            let code = match tokio::time::timeout(EXIT_GRACE, process.wait()).await {
                Ok(code) => code,
                Err(_) => {
                    tracing::warn!("script still running after the engine disconnected; killing it");
                    process.kill();
                    process.wait().await
                }
            };
            sink.emit(RuntimeEvent::ProcessClose(code));
        }
    }
    sink.emit(RuntimeEvent::SocketClose);
    if let Some(listener) = listener {
        drop(listener);
        sink.emit(RuntimeEvent::ServerClose);
    }
}

fn with_options(data: BreakpointData, condition: Option<&str>, hit_condition: Option<&str>) -> BreakpointData {
    let data = match condition {
        Some(condition) => data.with_condition(condition),
        None => data,
    };
    match hit_condition {
        Some(hit) => data.with_hit_condition(hit),
        None => data,
    }
}

fn describe(bp: &Breakpoint) -> String {
    match &bp.kind {
        BreakpointKind::Function(target) | BreakpointKind::Return(target) => {
            format!("`{}`", target.name)
        }
        BreakpointKind::Exception => "on exceptions".to_string(),
        BreakpointKind::Line(_) | BreakpointKind::Log { .. } => match bp.location() {
            Some((file, _)) => format!("{}:{}", file.display(), unverified_line(bp)),
            None => format!("#{}", bp.id),
        },
    }
}

/// The line the user asked for, before any shifting.
fn unverified_line(bp: &Breakpoint) -> u32 {
    match &bp.kind {
        BreakpointKind::Line(target) | BreakpointKind::Log { target, .. } => target.unverified_line,
        _ => 0,
    }
}

/// The `<message>` child that carries exception details, whatever its
/// namespace prefix.
fn exception_message(element: &XmlElement) -> Option<&XmlElement> {
    element
        .children
        .iter()
        .find(|child| child.name == "message" || child.name.ends_with(":message"))
}

/// The identifier-ish word at the end of `text`, dots included.
fn completion_word(text: &str) -> &str {
    let start = text
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_alphanumeric() || matches!(c, '_' | '.' | '#' | '@' | '$'))
        .last()
        .map_or(text.len(), |(i, _)| i);
    &text[start..]
}
