//! Scripted engine for unit tests.

use std::time::Duration;

use ahkdbg_dbgp::{encode_frame, Command, Session, SessionEvents};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};

/// Engine side of a connection, driven by the test.
pub(crate) struct FakeEngine<S = DuplexStream> {
    io: S,
    buf: Vec<u8>,
}

impl FakeEngine<DuplexStream> {
    /// A session wired to a fake engine over an in-memory pipe.
    pub(crate) fn pair() -> (Session, SessionEvents, FakeEngine) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (session, events) = Session::from_stream(ours);
        (session, events, FakeEngine::new(theirs))
    }
}

impl<S> FakeEngine<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(io: S) -> Self {
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
            let mut chunk = [0u8; 4096];
            let n = self.io.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Next command, asserting its name.
    pub(crate) async fn expect(&mut self, name: &str) -> (u32, Command) {
        let (tid, cmd) = self.next_command().await.unwrap();
        assert_eq!(cmd.name, name, "unexpected command {cmd:?}");
        (tid, cmd)
    }

    /// True if another command arrives within `wait`.
    pub(crate) async fn has_pending_command(&mut self, wait: Duration) -> bool {
        if self.buf.contains(&0) {
            return true;
        }
        let mut chunk = [0u8; 4096];
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

    pub(crate) async fn init(&mut self, file_uri: &str) {
        self.send(&format!(
            r#"<init appid="AutoHotkey" ide_key="" session="" thread="1" language="AutoHotkey" protocol_version="1.0" fileuri="{file_uri}"/>"#
        ))
        .await;
    }

    /// A bare response with the given attributes.
    pub(crate) async fn reply(&mut self, tid: u32, command: &str, attrs: &str) {
        self.send(&format!(
            r#"<response command="{command}" transaction_id="{tid}" {attrs}/>"#
        ))
        .await;
    }

    /// A response with child elements.
    pub(crate) async fn reply_with(&mut self, tid: u32, command: &str, attrs: &str, body: &str) {
        self.send(&format!(
            r#"<response command="{command}" transaction_id="{tid}" {attrs}>{body}</response>"#
        ))
        .await;
    }

    pub(crate) async fn feature(&mut self, tid: u32, name: &str, value: Option<&str>) {
        match value {
            Some(v) => {
                self.send(&format!(
                    r#"<response command="feature_get" transaction_id="{tid}" feature_name="{name}" supported="1">{v}</response>"#
                ))
                .await
            }
            None => {
                self.reply(tid, "feature_get", &format!(r#"feature_name="{name}" supported="0""#))
                    .await
            }
        }
    }

    pub(crate) async fn error(&mut self, tid: u32, command: &str, code: u32, message: &str) {
        self.reply_with(
            tid,
            command,
            "",
            &format!(r#"<error code="{code}"><message>{message}</message></error>"#),
        )
        .await;
    }

    pub(crate) async fn status(&mut self, tid: u32, command: &str, status: &str, reason: &str) {
        self.reply(tid, command, &format!(r#"status="{status}" reason="{reason}""#))
            .await;
    }

    /// Play the engine's side of connection setup: `<init>`, the feature
    /// queries, the `feature_set` commands and, when `redirect` is set, the
    /// output redirects.
    pub(crate) async fn handshake(&mut self, file_uri: &str, supports_async: bool, redirect: bool) {
        self.init(file_uri).await;
        let (tid, _) = self.expect("feature_get").await;
        let value = if supports_async { "1" } else { "0" };
        self.feature(tid, "supports_async", Some(value)).await;
        let (tid, _) = self.expect("feature_get").await;
        self.feature(tid, "language_version", Some("2.0.10")).await;
        let (tid, _) = self.expect("feature_get").await;
        self.feature(tid, "breakpoint_types", Some("line conditional exception"))
            .await;
        for _ in 0..3 {
            let (tid, _) = self.expect("feature_set").await;
            self.reply(tid, "feature_set", r#"success="1""#).await;
        }
        if redirect {
            for name in ["stdout", "stderr"] {
                let (tid, cmd) = self.expect(name).await;
                assert_eq!(cmd.get('c'), Some("1"));
                self.reply(tid, name, r#"success="1""#).await;
            }
        }
    }

    /// Accept the next `breakpoint_set` as `engine_id` and report it bound
    /// to `line`. Returns the `breakpoint_set` command.
    pub(crate) async fn accept_breakpoint(&mut self, engine_id: u32, line: u32) -> Command {
        let (tid, cmd) = self.expect("breakpoint_set").await;
        self.reply(tid, "breakpoint_set", &format!(r#"state="enabled" id="{engine_id}""#))
            .await;
        let (tid, _) = self.expect("breakpoint_get").await;
        self.reply_with(
            tid,
            "breakpoint_get",
            "",
            &format!(r#"<breakpoint id="{engine_id}" type="line" state="enabled" lineno="{line}"/>"#),
        )
        .await;
        cmd
    }

    /// Answer `stack_get` with a single frame.
    pub(crate) async fn top_frame(&mut self, file_uri: &str, line: u32) {
        let (tid, _) = self.expect("stack_get").await;
        self.reply_with(
            tid,
            "stack_get",
            "",
            &format!(r#"<stack level="0" type="file" filename="{file_uri}" lineno="{line}" where=""/>"#),
        )
        .await;
    }

    pub(crate) async fn shutdown(mut self) {
        let _ = self.io.shutdown().await;
    }
}
