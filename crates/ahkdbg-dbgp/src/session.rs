//! DBGP session over a single connection.
//!
//! A session is an actor task that owns the write half of the connection
//! and the transaction table, plus a reader task that owns the read half
//! and feeds decoded packets back to the actor. Commands are single-flight:
//! the next one is written only after the previous response has arrived or
//! the connection is gone.
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::codec::{decode_frame, Decoded};
use crate::command::Command;
use crate::error::{DbgpError, EngineError, ProtocolError};
use crate::packet::{InitPacket, NotifyPacket, Packet, StreamPacket};
use crate::response::Response;

type Reply = oneshot::Sender<Result<Response, DbgpError>>;

/// Out-of-band events produced by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The engine's handshake packet.
    Init(InitPacket),
    /// Redirected stdout/stderr.
    Stream(StreamPacket),
    /// Engine notification.
    Notify(NotifyPacket),
    /// A frame or response that could not be used. The connection stays up.
    ProtocolError(ProtocolError),
    /// The connection is closed. Sent exactly once, always last.
    Closed,
}

/// Receiving end of a session's event stream.
#[derive(Debug)]
pub struct SessionEvents {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl SessionEvents {
    /// Next event, or `None` once the session actor has gone away.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    /// Wait for the engine's `<init>` packet.
    ///
    /// Events that arrive before it are logged and dropped.
    pub async fn wait_for_init(&mut self) -> Result<InitPacket, DbgpError> {
        loop {
            match self.rx.recv().await {
                Some(SessionEvent::Init(init)) => return Ok(init),
                Some(SessionEvent::Closed) | None => return Err(DbgpError::SessionClosed),
                Some(other) => tracing::debug!("event before init dropped: {:?}", other),
            }
        }
    }
}

enum SessionMessage {
    Submit { command: Command, reply: Reply },
    Interrupt { command: Command, reply: Reply },
    Close { done: oneshot::Sender<()> },
}

enum Inbound {
    Packet(Packet),
    Malformed(ProtocolError),
}

/// Handle to a DBGP session. Cheap to clone; all clones share one connection.
#[derive(Debug, Clone)]
pub struct Session {
    tx: mpsc::UnboundedSender<SessionMessage>,
}

impl std::fmt::Debug for SessionMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionMessage::Submit { command, .. } => write!(f, "Submit({})", command.name),
            SessionMessage::Interrupt { command, .. } => write!(f, "Interrupt({})", command.name),
            SessionMessage::Close { .. } => f.write_str("Close"),
        }
    }
}

impl Session {
    /// Dial an engine that is listening.
    pub async fn connect(host: &str, port: u16) -> Result<(Session, SessionEvents), DbgpError> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        tracing::info!("connected to debugger engine at {}:{}", host, port);
        Ok(Session::from_stream(stream))
    }

    /// Accept the next engine connection on `listener`.
    pub async fn accept(listener: &TcpListener) -> Result<(Session, SessionEvents), DbgpError> {
        let (stream, peer) = listener.accept().await?;
        stream.set_nodelay(true)?;
        tracing::info!("debugger engine connected from {}", peer);
        Ok(Session::from_stream(stream))
    }

    /// Start a session over any byte stream. Must be called inside a Tokio runtime.
    pub fn from_stream<S>(io: S) -> (Session, SessionEvents)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (tx, rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_loop(read_half, inbound_tx));
        let actor = SessionActor {
            writer: write_half,
            rx,
            inbound: inbound_rx,
            reader,
            events: event_tx,
            queue: VecDeque::new(),
            in_flight: None,
            interrupts: HashMap::new(),
            next_transaction_id: 1,
        };
        tokio::spawn(actor.run());

        (Session { tx }, SessionEvents { rx: event_rx })
    }

    /// Whether the session has shut down.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Send a command and wait for its response.
    ///
    /// Engine `<error>` responses come back as [`DbgpError::Engine`].
    pub async fn send_command(&self, command: Command) -> Result<Response, DbgpError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionMessage::Submit { command, reply })
            .map_err(|_| DbgpError::SessionClosed)?;
        rx.await.map_err(|_| DbgpError::SessionClosed)?
    }

    /// Like [`send_command`](Self::send_command), giving up after `limit`.
    ///
    /// Giving up only releases the caller. The transaction slot stays taken
    /// until the engine actually answers.
    pub async fn send_command_with_timeout(
        &self,
        command: Command,
        limit: Duration,
    ) -> Result<Response, DbgpError> {
        let name = command.name.clone();
        tokio::time::timeout(limit, self.send_command(command))
            .await
            .map_err(|_| DbgpError::Cancelled(name))?
    }

    /// Like [`send_command`](Self::send_command), giving up when `token` fires.
    pub async fn send_command_cancellable(
        &self,
        command: Command,
        token: &CancellationToken,
    ) -> Result<Response, DbgpError> {
        let name = command.name.clone();
        tokio::select! {
            result = self.send_command(command) => result,
            _ = token.cancelled() => Err(DbgpError::Cancelled(name)),
        }
    }

    /// Write a command immediately, even while another one is in flight.
    ///
    /// Only meant for `break` against engines that advertise `supports_async`.
    pub async fn interrupt(&self, command: Command) -> Result<Response, DbgpError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionMessage::Interrupt { command, reply })
            .map_err(|_| DbgpError::SessionClosed)?;
        rx.await.map_err(|_| DbgpError::SessionClosed)?
    }

    /// Close the connection. Pending commands fail with `SessionClosed`.
    /// Calling this more than once has no further effect.
    pub async fn close(&self) {
        let (done, rx) = oneshot::channel();
        if self.tx.send(SessionMessage::Close { done }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Ask the engine to detach, then close locally. The engine keeps running.
    pub async fn detach(&self) -> Result<(), DbgpError> {
        let result = match self.send_command(Command::new("detach")).await {
            Ok(_) | Err(DbgpError::SessionClosed) => Ok(()),
            Err(DbgpError::Engine(err)) if err.code == EngineError::UNIMPLEMENTED => {
                tracing::warn!("engine does not implement detach; closing instead");
                Ok(())
            }
            Err(other) => Err(other),
        };
        self.close().await;
        result
    }
}

struct InFlight {
    transaction_id: u32,
    command: String,
    reply: Reply,
}

struct Queued {
    command: Command,
    reply: Reply,
}

struct SessionActor<W> {
    writer: W,
    rx: mpsc::UnboundedReceiver<SessionMessage>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    reader: JoinHandle<()>,
    events: mpsc::UnboundedSender<SessionEvent>,
    queue: VecDeque<Queued>,
    in_flight: Option<InFlight>,
    interrupts: HashMap<u32, InFlight>,
    next_transaction_id: u32,
}

impl<W> SessionActor<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn run(mut self) {
        let mut close_ack = None;
        loop {
            tokio::select! {
                message = self.rx.recv() => match message {
                    Some(SessionMessage::Submit { command, reply }) => {
                        self.queue.push_back(Queued { command, reply });
                        if self.pump().await.is_err() {
                            break;
                        }
                    }
                    Some(SessionMessage::Interrupt { command, reply }) => {
                        if self.write_interrupt(command, reply).await.is_err() {
                            break;
                        }
                    }
                    Some(SessionMessage::Close { done }) => {
                        close_ack = Some(done);
                        break;
                    }
                    None => break,
                },
                inbound = self.inbound.recv() => match inbound {
                    Some(Inbound::Packet(packet)) => {
                        if self.handle_packet(packet).await.is_err() {
                            break;
                        }
                    }
                    Some(Inbound::Malformed(error)) => {
                        tracing::warn!("dropping malformed frame: {}", error);
                        let _ = self.events.send(SessionEvent::ProtocolError(error));
                    }
                    None => {
                        tracing::info!("debugger engine closed the connection");
                        break;
                    }
                },
            }
        }
        self.teardown().await;
        if let Some(done) = close_ack {
            let _ = done.send(());
        }
    }

    /// Write queued commands while the transaction slot is free.
    async fn pump(&mut self) -> Result<(), std::io::Error> {
        while self.in_flight.is_none() {
            let Some(Queued { command, reply }) = self.queue.pop_front() else {
                break;
            };
            if reply.is_closed() {
                tracing::debug!("skipping `{}`: caller stopped waiting", command.name);
                continue;
            }
            let transaction_id = self.allocate_transaction_id();
            tracing::debug!("dbgp -> {} -i {}", command.name, transaction_id);
            self.writer.write_all(&command.encode(transaction_id)).await?;
            self.writer.flush().await?;
            self.in_flight = Some(InFlight {
                transaction_id,
                command: command.name,
                reply,
            });
        }
        Ok(())
    }

    async fn write_interrupt(&mut self, command: Command, reply: Reply) -> Result<(), std::io::Error> {
        let transaction_id = self.allocate_transaction_id();
        tracing::debug!("dbgp -> {} -i {} (interrupt)", command.name, transaction_id);
        self.writer.write_all(&command.encode(transaction_id)).await?;
        self.writer.flush().await?;
        self.interrupts.insert(
            transaction_id,
            InFlight {
                transaction_id,
                command: command.name,
                reply,
            },
        );
        Ok(())
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<(), std::io::Error> {
        match packet {
            Packet::Response(response) => {
                let tid = response.transaction_id;
                let slot = if self.in_flight.as_ref().map(|f| f.transaction_id) == Some(tid) {
                    self.in_flight.take()
                } else {
                    self.interrupts.remove(&tid)
                };
                match slot {
                    Some(pending) => {
                        tracing::debug!("dbgp <- {} -i {}", pending.command, tid);
                        let result = response.into_result().map_err(DbgpError::from);
                        let _ = pending.reply.send(result);
                        self.pump().await?;
                    }
                    None => {
                        let error = ProtocolError::UnmatchedTransaction(tid);
                        tracing::warn!("{}", error);
                        let _ = self.events.send(SessionEvent::ProtocolError(error));
                    }
                }
            }
            Packet::Init(init) => {
                let _ = self.events.send(SessionEvent::Init(init));
            }
            Packet::Stream(stream) => {
                let _ = self.events.send(SessionEvent::Stream(stream));
            }
            Packet::Notify(notify) => {
                let _ = self.events.send(SessionEvent::Notify(notify));
            }
        }
        Ok(())
    }

    fn allocate_transaction_id(&mut self) -> u32 {
        let id = self.next_transaction_id;
        self.next_transaction_id = self.next_transaction_id.wrapping_add(1).max(1);
        id
    }

    async fn teardown(&mut self) {
        self.rx.close();
        if let Some(pending) = self.in_flight.take() {
            let _ = pending.reply.send(Err(DbgpError::SessionClosed));
        }
        for (_, pending) in self.interrupts.drain() {
            let _ = pending.reply.send(Err(DbgpError::SessionClosed));
        }
        for queued in self.queue.drain(..) {
            let _ = queued.reply.send(Err(DbgpError::SessionClosed));
        }
        // Messages that raced with shutdown.
        while let Ok(message) = self.rx.try_recv() {
            match message {
                SessionMessage::Submit { reply, .. } | SessionMessage::Interrupt { reply, .. } => {
                    let _ = reply.send(Err(DbgpError::SessionClosed));
                }
                SessionMessage::Close { done } => {
                    let _ = done.send(());
                }
            }
        }
        if let Err(e) = self.writer.shutdown().await {
            tracing::debug!("socket shutdown: {}", e);
        }
        self.reader.abort();
        let _ = self.events.send(SessionEvent::Closed);
    }
}

async fn read_loop<R>(mut reader: R, inbound: mpsc::UnboundedSender<Inbound>)
where
    R: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(8192);
    let mut chunk = [0u8; 4096];
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("read error: {}", e);
                return;
            }
        };
        buf.extend_from_slice(&chunk[..n]);
        loop {
            let item = match decode_frame(&buf) {
                Decoded::Incomplete => break,
                Decoded::Packet { packet, consumed } => {
                    buf.drain(..consumed);
                    Inbound::Packet(packet)
                }
                Decoded::Malformed { error, consumed } => {
                    buf.drain(..consumed);
                    Inbound::Malformed(error)
                }
            };
            if inbound.send(item).is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::codec::encode_frame;
    use tokio::io::DuplexStream;

    /// Engine side of an in-memory connection.
    pub(crate) struct FakeEngine {
        io: DuplexStream,
        buf: Vec<u8>,
    }

    impl FakeEngine {
        pub(crate) fn new(io: DuplexStream) -> Self {
            Self {
                io,
                buf: Vec::new(),
            }
        }

        pub(crate) async fn next_command(&mut self) -> Option<(u32, Command)> {
            loop {
                if let Some(end) = self.buf.iter().position(|b| *b == 0) {
                    let line: Vec<u8> = self.buf.drain(..=end).collect();
                    return Some(Command::parse(&line).unwrap());
                }
                let mut chunk = [0u8; 1024];
                let n = self.io.read(&mut chunk).await.ok()?;
                if n == 0 {
                    return None;
                }
                self.buf.extend_from_slice(&chunk[..n]);
            }
        }

        /// True if another command arrives within `wait`.
        pub(crate) async fn has_pending_command(&mut self, wait: Duration) -> bool {
            if self.buf.contains(&0) {
                return true;
            }
            let mut chunk = [0u8; 1024];
            match tokio::time::timeout(wait, self.io.read(&mut chunk)).await {
                Ok(Ok(n)) if n > 0 => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    true
                }
                _ => false,
            }
        }

        pub(crate) async fn send(&mut self, payload: &str) {
            self.io.write_all(&encode_frame(payload)).await.unwrap();
        }

        pub(crate) async fn reply(&mut self, tid: u32, command: &str, attrs: &str) {
            self.send(&format!(
                r#"<response command="{command}" transaction_id="{tid}" {attrs}/>"#
            ))
            .await;
        }
    }

    fn pair() -> (Session, SessionEvents, FakeEngine) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (session, events) = Session::from_stream(ours);
        (session, events, FakeEngine::new(theirs))
    }

    #[tokio::test]
    async fn response_is_correlated() {
        let (session, _events, mut engine) = pair();
        let engine_task = tokio::spawn(async move {
            let (tid, cmd) = engine.next_command().await.unwrap();
            assert_eq!(cmd.name, "status");
            engine.reply(tid, "status", r#"status="starting" reason="ok""#).await;
            engine
        });
        let response = session.send_command(Command::new("status")).await.unwrap();
        assert_eq!(response.command, "status");
        assert_eq!(response.transaction_id, 1);
        engine_task.await.unwrap();
    }

    #[tokio::test]
    async fn unawaited_commands_are_single_flight_and_ordered() {
        let (session, _events, mut engine) = pair();
        let engine_task = tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..3 {
                let (tid, cmd) = engine.next_command().await.unwrap();
                assert!(
                    !engine.has_pending_command(Duration::from_millis(30)).await,
                    "a second command was written before `{}` was answered",
                    cmd.name
                );
                seen.push((tid, cmd.name.clone()));
                engine.reply(tid, &cmd.name, r#"success="1""#).await;
            }
            seen
        });

        let (a, b, c) = tokio::join!(
            session.send_command(Command::new("feature_set").arg('n', "a")),
            session.send_command(Command::new("stdout").arg('c', 1)),
            session.send_command(Command::new("stderr").arg('c', 1)),
        );
        assert_eq!(a.unwrap().command, "feature_set");
        assert_eq!(b.unwrap().command, "stdout");
        assert_eq!(c.unwrap().command, "stderr");

        let seen = engine_task.await.unwrap();
        assert_eq!(
            seen,
            vec![
                (1, "feature_set".to_string()),
                (2, "stdout".to_string()),
                (3, "stderr".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn streams_delivered_while_command_in_flight() {
        let (session, mut events, mut engine) = pair();
        let engine_task = tokio::spawn(async move {
            let (tid, _) = engine.next_command().await.unwrap();
            engine
                .send(r#"<stream type="stdout" encoding="base64">aGk=</stream>"#)
                .await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            engine.reply(tid, "run", r#"status="break" reason="ok""#).await;
            engine
        });

        let pending = tokio::spawn({
            let session = session.clone();
            async move { session.send_command(Command::new("run")).await }
        });
        match events.recv().await {
            Some(SessionEvent::Stream(s)) => assert_eq!(s.data, "hi"),
            other => panic!("expected stream, got {other:?}"),
        }
        assert!(pending.await.unwrap().is_ok());
        engine_task.await.unwrap();
    }

    #[tokio::test]
    async fn unmatched_response_is_protocol_error_not_fatal() {
        let (session, mut events, mut engine) = pair();
        engine.reply(99, "status", r#"status="break""#).await;
        match events.recv().await {
            Some(SessionEvent::ProtocolError(ProtocolError::UnmatchedTransaction(99))) => {}
            other => panic!("expected unmatched transaction, got {other:?}"),
        }

        let engine_task = tokio::spawn(async move {
            let (tid, _) = engine.next_command().await.unwrap();
            engine.reply(tid, "status", r#"status="break""#).await;
            engine
        });
        assert!(session.send_command(Command::new("status")).await.is_ok());
        engine_task.await.unwrap();
    }

    #[tokio::test]
    async fn engine_error_is_returned_to_caller() {
        let (session, _events, mut engine) = pair();
        let engine_task = tokio::spawn(async move {
            let (tid, _) = engine.next_command().await.unwrap();
            engine
                .send(&format!(
                    r#"<response command="property_get" transaction_id="{tid}"><error code="300"><message>can not get property</message></error></response>"#
                ))
                .await;
            engine
        });
        let err = session
            .send_command(Command::new("property_get").arg('n', "nope"))
            .await
            .unwrap_err();
        assert_eq!(err.as_engine().map(|e| e.code), Some(300));
        engine_task.await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_fails_pending_and_later_commands() {
        let (session, mut events, mut engine) = pair();
        let engine_task = tokio::spawn(async move {
            let _ = engine.next_command().await.unwrap();
            drop(engine);
        });

        let err = session.send_command(Command::new("run")).await.unwrap_err();
        assert!(matches!(err, DbgpError::SessionClosed));
        engine_task.await.unwrap();

        let err = session.send_command(Command::new("status")).await.unwrap_err();
        assert!(matches!(err, DbgpError::SessionClosed));
        assert!(session.is_closed());

        assert_eq!(events.recv().await, Some(SessionEvent::Closed));
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn close_twice_emits_one_closed_event() {
        let (session, mut events, _engine) = pair();
        session.close().await;
        session.close().await;
        assert_eq!(events.recv().await, Some(SessionEvent::Closed));
        assert_eq!(events.recv().await, None);
        assert!(matches!(
            session.send_command(Command::new("status")).await,
            Err(DbgpError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn timed_out_caller_keeps_slot_taken() {
        let (session, _events, mut engine) = pair();
        let engine_task = tokio::spawn(async move {
            let (first, cmd) = engine.next_command().await.unwrap();
            assert_eq!(cmd.name, "run");
            assert!(!engine.has_pending_command(Duration::from_millis(80)).await);
            engine.reply(first, "run", r#"status="break""#).await;
            let (second, cmd) = engine.next_command().await.unwrap();
            assert_eq!(cmd.name, "status");
            engine.reply(second, "status", r#"status="break""#).await;
            engine
        });

        let err = session
            .send_command_with_timeout(Command::new("run"), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, DbgpError::Cancelled(_)));

        let response = session.send_command(Command::new("status")).await.unwrap();
        assert_eq!(response.transaction_id, 2);
        engine_task.await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_token_releases_caller() {
        let (session, _events, mut engine) = pair();
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });
        let engine_task = tokio::spawn(async move {
            let _ = engine.next_command().await;
            engine
        });
        let err = session
            .send_command_cancellable(Command::new("run"), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, DbgpError::Cancelled(name) if name == "run"));
        session.close().await;
        let _ = engine_task.await;
    }

    #[tokio::test]
    async fn interrupt_is_written_while_run_in_flight() {
        let (session, _events, mut engine) = pair();
        let engine_task = tokio::spawn(async move {
            let (run_tid, run) = engine.next_command().await.unwrap();
            assert_eq!(run.name, "run");
            let (break_tid, brk) = engine.next_command().await.unwrap();
            assert_eq!(brk.name, "break");
            engine.reply(break_tid, "break", r#"success="1""#).await;
            engine
                .reply(run_tid, "run", r#"status="break" reason="ok""#)
                .await;
            engine
        });

        let run = tokio::spawn({
            let session = session.clone();
            async move { session.send_command(Command::new("run")).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let brk = session.interrupt(Command::new("break")).await.unwrap();
        assert!(brk.success());
        let run = run.await.unwrap().unwrap();
        assert_eq!(run.status(), Some(crate::RunState::Break));
        engine_task.await.unwrap();
    }

    #[tokio::test]
    async fn detach_sends_detach_then_closes() {
        let (session, mut events, mut engine) = pair();
        let engine_task = tokio::spawn(async move {
            let (tid, cmd) = engine.next_command().await.unwrap();
            assert_eq!(cmd.name, "detach");
            engine.reply(tid, "detach", r#"status="stopping" reason="ok""#).await;
            engine
        });
        session.detach().await.unwrap();
        assert!(session.is_closed());
        assert_eq!(events.recv().await, Some(SessionEvent::Closed));
        engine_task.await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_init_skips_earlier_events() {
        let (_session, mut events, mut engine) = pair();
        engine.send(r#"<stream type="stdout">x</stream>"#).await;
        engine
            .send(r#"<init appid="AutoHotkey" language="AutoHotkey" protocol_version="1.0" fileuri="file:///C:/a.ahk"/>"#)
            .await;
        let init = events.wait_for_init().await.unwrap();
        assert_eq!(init.file_uri, "file:///C:/a.ahk");
    }
}
