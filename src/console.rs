//! Line-oriented front end over stdin and stdout.
//!
//! Every input line is one command, named after the DAP request it stands
//! for (`continue`, `stackTrace`, `variables 3`, ...). Every output line is
//! one JSON object: either an event, `{"event": ..., "body": ...}`, or a
//! response, `{"command": ..., "success": ..., "body" | "message": ...}`.
//! While the script runs only `pause` is accepted.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use ahkdbg_adapter::protocol::{
    EvaluateArguments, FunctionBreakpoint, SetBreakpointsArguments, Source, SourceBreakpoint,
};
use ahkdbg_adapter::{AdapterError, ExecutionStatus, Pauser, Runtime, RuntimeEvent};
use ahkdbg_config::NormalizedDebugConfig;
use ahkdbg_dbgp::RunState;

/// How long queued events may take to drain after the session ends.
const EVENT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConsoleCommand {
    Continue,
    Next,
    StepIn,
    StepOut,
    Pause,
    Threads,
    StackTrace,
    Scopes(i64),
    Variables(i64),
    Evaluate(String),
    Completions(String),
    LoadedSources,
    ExceptionInfo,
    Breakpoints,
    SetBreakpoints { file: PathBuf, lines: Vec<u32> },
    SetFunctionBreakpoints(Vec<String>),
    SetExceptionBreakpoints(Vec<String>),
    Disconnect,
}

impl ConsoleCommand {
    pub(crate) fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let (name, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();
        let words = || rest.split_whitespace().map(str::to_string).collect::<Vec<_>>();
        let reference = |what: &str| {
            rest.parse::<i64>()
                .map_err(|_| format!("`{name}` needs a {what}, got `{rest}`"))
        };

        let command = match name {
            "continue" => Self::Continue,
            "next" => Self::Next,
            "stepIn" => Self::StepIn,
            "stepOut" => Self::StepOut,
            "pause" => Self::Pause,
            "threads" => Self::Threads,
            "stackTrace" => Self::StackTrace,
            "scopes" => Self::Scopes(reference("frame id")?),
            "variables" => Self::Variables(reference("variables reference")?),
            "evaluate" if !rest.is_empty() => Self::Evaluate(rest.to_string()),
            "evaluate" => return Err("`evaluate` needs an expression".to_string()),
            "completions" => Self::Completions(rest.to_string()),
            "loadedSources" => Self::LoadedSources,
            "exceptionInfo" => Self::ExceptionInfo,
            "breakpoints" => Self::Breakpoints,
            "setBreakpoints" => {
                let mut parts = rest.split_whitespace();
                let file = parts
                    .next()
                    .ok_or_else(|| "`setBreakpoints` needs a file".to_string())?;
                let lines = parts
                    .map(|p| p.parse::<u32>().map_err(|_| format!("`{p}` is not a line number")))
                    .collect::<Result<Vec<_>, _>>()?;
                Self::SetBreakpoints {
                    file: PathBuf::from(file),
                    lines,
                }
            }
            "setFunctionBreakpoints" => Self::SetFunctionBreakpoints(words()),
            "setExceptionBreakpoints" => Self::SetExceptionBreakpoints(words()),
            "disconnect" => Self::Disconnect,
            "" => return Err("empty command".to_string()),
            other => return Err(format!("unknown command `{other}`")),
        };
        Ok(command)
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Next => "next",
            Self::StepIn => "stepIn",
            Self::StepOut => "stepOut",
            Self::Pause => "pause",
            Self::Threads => "threads",
            Self::StackTrace => "stackTrace",
            Self::Scopes(_) => "scopes",
            Self::Variables(_) => "variables",
            Self::Evaluate(_) => "evaluate",
            Self::Completions(_) => "completions",
            Self::LoadedSources => "loadedSources",
            Self::ExceptionInfo => "exceptionInfo",
            Self::Breakpoints => "breakpoints",
            Self::SetBreakpoints { .. } => "setBreakpoints",
            Self::SetFunctionBreakpoints(_) => "setFunctionBreakpoints",
            Self::SetExceptionBreakpoints(_) => "setExceptionBreakpoints",
            Self::Disconnect => "disconnect",
        }
    }
}

/// Run one debug session against stdin and stdout.
pub(crate) async fn run(config: NormalizedDebugConfig) -> Result<()> {
    let (event_tx, mut events) = mpsc::unbounded_channel();
    let mut runtime = Runtime::new(config, Arc::new(event_tx))?;
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Some(line) = event_line(&event) {
                emit(&line);
            }
        }
    });

    emit(&json!({ "event": "initialized", "body": Runtime::capabilities() }));
    runtime.start().await?;
    let pauser = runtime.pauser();
    let mut commands = spawn_stdin_reader();

    let mut outcome = Some(wait_pausable(runtime.configuration_done(), pauser.as_ref(), &mut commands).await);
    loop {
        if let Some(result) = outcome.take() {
            match result {
                Ok(status) => {
                    if let Some(body) = status.stopped_event() {
                        emit(&json!({ "event": "stopped", "body": body }));
                    }
                    if matches!(status.state, RunState::Stopping | RunState::Stopped) {
                        break;
                    }
                }
                Err(err) if err.is_closed() => break,
                Err(err) => respond_error("continue", &err),
            }
        }

        let Some(line) = commands.recv().await else {
            debug!("stdin closed");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        let command = match ConsoleCommand::parse(&line) {
            Ok(command) => command,
            Err(message) => {
                respond_failure(line.split_whitespace().next().unwrap_or_default(), &message);
                continue;
            }
        };
        let name = command.name();
        let result = match command {
            ConsoleCommand::Continue => {
                outcome = Some(wait_pausable(runtime.continue_execution(), pauser.as_ref(), &mut commands).await);
                continue;
            }
            ConsoleCommand::Next => {
                outcome = Some(wait_pausable(runtime.next(), pauser.as_ref(), &mut commands).await);
                continue;
            }
            ConsoleCommand::StepIn => {
                outcome = Some(wait_pausable(runtime.step_in(), pauser.as_ref(), &mut commands).await);
                continue;
            }
            ConsoleCommand::StepOut => {
                outcome = Some(wait_pausable(runtime.step_out(), pauser.as_ref(), &mut commands).await);
                continue;
            }
            ConsoleCommand::Pause => {
                outcome = Some(runtime.pause().await);
                continue;
            }
            ConsoleCommand::Disconnect => {
                runtime.close().await;
                respond(name, json!({}));
                break;
            }
            ConsoleCommand::Threads => Ok(json!({ "threads": runtime.threads() })),
            ConsoleCommand::StackTrace => runtime
                .stack_trace()
                .await
                .map(|frames| json!({ "stackFrames": frames, "totalFrames": frames.len() })),
            ConsoleCommand::Scopes(frame_id) => runtime
                .scopes(frame_id)
                .await
                .map(|scopes| json!({ "scopes": scopes })),
            ConsoleCommand::Variables(reference) => runtime
                .variables(reference)
                .await
                .map(|variables| json!({ "variables": variables })),
            ConsoleCommand::Evaluate(expression) => runtime
                .evaluate(EvaluateArguments {
                    expression,
                    frame_id: None,
                    context: Some("repl".to_string()),
                })
                .await
                .map(|body| json!(body)),
            ConsoleCommand::Completions(text) => runtime
                .completions(&text, None)
                .await
                .map(|targets| json!({ "targets": targets })),
            ConsoleCommand::LoadedSources => runtime
                .loaded_sources()
                .map(|sources| json!({ "sources": sources })),
            ConsoleCommand::ExceptionInfo => Ok(match runtime.exception_details() {
                Some(details) => json!({
                    "exceptionId": details.exception_id,
                    "description": details.message,
                    "breakMode": "always",
                }),
                None => Value::Null,
            }),
            ConsoleCommand::Breakpoints => {
                let all: Vec<_> = runtime.breakpoints().into_iter().map(|bp| bp.to_response()).collect();
                Ok(json!({ "breakpoints": all }))
            }
            ConsoleCommand::SetBreakpoints { file, lines } => {
                let args = SetBreakpointsArguments {
                    source: Source::from_path(&file),
                    breakpoints: lines
                        .into_iter()
                        .map(|line| SourceBreakpoint {
                            line,
                            column: None,
                            condition: None,
                            hit_condition: None,
                            log_message: None,
                        })
                        .collect(),
                };
                runtime
                    .set_breakpoints(args)
                    .await
                    .map(|set| json!({ "breakpoints": set }))
            }
            ConsoleCommand::SetFunctionBreakpoints(names) => {
                let breakpoints = names
                    .into_iter()
                    .map(|name| FunctionBreakpoint {
                        name,
                        condition: None,
                        hit_condition: None,
                    })
                    .collect();
                runtime
                    .set_function_breakpoints(breakpoints)
                    .await
                    .map(|set| json!({ "breakpoints": set }))
            }
            ConsoleCommand::SetExceptionBreakpoints(filters) => runtime
                .set_exception_breakpoints(&filters)
                .await
                .map(|set| json!({ "breakpoints": set })),
        };
        match result {
            Ok(body) => respond(name, body),
            Err(err) => respond_error(name, &err),
        }
    }

    runtime.close().await;
    drop(runtime);
    if tokio::time::timeout(EVENT_DRAIN_TIMEOUT, printer).await.is_err() {
        warn!("events still pending at exit");
    }
    Ok(())
}

/// Wait for a continuation, breaking in when `pause` is read meanwhile.
async fn wait_pausable<F>(
    continuation: F,
    pauser: Option<&Pauser>,
    commands: &mut mpsc::UnboundedReceiver<String>,
) -> Result<ExecutionStatus, AdapterError>
where
    F: Future<Output = Result<ExecutionStatus, AdapterError>>,
{
    tokio::pin!(continuation);
    let mut stdin_open = true;
    loop {
        tokio::select! {
            result = &mut continuation => return result,
            line = commands.recv(), if stdin_open => {
                let Some(line) = line else {
                    stdin_open = false;
                    continue;
                };
                match (ConsoleCommand::parse(&line), pauser) {
                    (Ok(ConsoleCommand::Pause), Some(pauser)) => match pauser.pause().await {
                        Ok(()) => respond("pause", json!({})),
                        Err(err) => respond_error("pause", &err),
                    },
                    (Ok(command), _) => respond_failure(command.name(), "the script is running"),
                    (Err(message), _) => respond_failure("", &message),
                }
            }
        }
    }
}

fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("reading stdin failed: {}", e);
                    break;
                }
            }
        }
    });
    rx
}

/// The JSON line for a runtime event, if the front end cares about it.
fn event_line(event: &RuntimeEvent) -> Option<Value> {
    if let Some(body) = event.output_body() {
        return Some(json!({ "event": "output", "body": body }));
    }
    if let Some(body) = event.exited_body() {
        return Some(json!({ "event": "exited", "body": body }));
    }
    match event {
        RuntimeEvent::SocketClose => Some(json!({ "event": "terminated" })),
        _ => {
            debug!("not forwarded: {:?}", event);
            None
        }
    }
}

fn emit(value: &Value) {
    println!("{value}");
}

fn respond(command: &str, body: Value) {
    emit(&json!({ "command": command, "success": true, "body": body }));
}

fn respond_failure(command: &str, message: &str) {
    emit(&json!({ "command": command, "success": false, "message": message }));
}

fn respond_error(command: &str, err: &AdapterError) {
    respond_failure(command, &err.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_execution_commands() {
        assert_eq!(ConsoleCommand::parse("continue"), Ok(ConsoleCommand::Continue));
        assert_eq!(ConsoleCommand::parse("  stepIn "), Ok(ConsoleCommand::StepIn));
        assert_eq!(ConsoleCommand::parse("scopes 3"), Ok(ConsoleCommand::Scopes(3)));
        assert!(ConsoleCommand::parse("variables x").is_err());
    }

    #[test]
    fn evaluate_keeps_the_whole_expression() {
        assert_eq!(
            ConsoleCommand::parse("evaluate obj.items[1]  "),
            Ok(ConsoleCommand::Evaluate("obj.items[1]".into()))
        );
        assert!(ConsoleCommand::parse("evaluate").is_err());
    }

    #[test]
    fn set_breakpoints_takes_a_file_and_lines() {
        assert_eq!(
            ConsoleCommand::parse("setBreakpoints main.ahk 4 12"),
            Ok(ConsoleCommand::SetBreakpoints {
                file: PathBuf::from("main.ahk"),
                lines: vec![4, 12],
            })
        );
        assert_eq!(
            ConsoleCommand::parse("setBreakpoints main.ahk"),
            Ok(ConsoleCommand::SetBreakpoints {
                file: PathBuf::from("main.ahk"),
                lines: vec![],
            })
        );
        assert!(ConsoleCommand::parse("setBreakpoints main.ahk four").is_err());
    }

    #[test]
    fn unknown_commands_are_rejected() {
        assert_eq!(
            ConsoleCommand::parse("launch"),
            Err("unknown command `launch`".to_string())
        );
        assert!(ConsoleCommand::parse("").is_err());
    }

    #[test]
    fn events_map_to_json_lines() {
        let line = event_line(&RuntimeEvent::StdOut("hi\n".into())).unwrap();
        assert_eq!(line["event"], "output");
        assert_eq!(line["body"]["category"], "stdout");
        let line = event_line(&RuntimeEvent::ProcessClose(Some(2))).unwrap();
        assert_eq!(line["body"]["exitCode"], 2);
        assert_eq!(
            event_line(&RuntimeEvent::SocketClose).unwrap()["event"],
            "terminated"
        );
        assert!(event_line(&RuntimeEvent::ServerClose).is_none());
    }
}
