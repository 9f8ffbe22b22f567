//! Starting the interpreter, for launching a script or asking a running one
//! to attach.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use ahkdbg_config::NormalizedDebugConfig;
use ahkdbg_scanner::EngineVersion;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::AdapterError;
use crate::event::{EventSink, RuntimeEvent};

/// How long to keep draining output pipes after the process exited.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Interpreter arguments for launching `program` under the debugger:
/// `[runtime_args..., /Debug=host:port, program, args...]`.
pub fn launch_args(config: &NormalizedDebugConfig, address: &str) -> Vec<String> {
    let mut args = config.runtime_args.clone();
    args.push(format!("/Debug={address}"));
    args.push(config.program.to_string_lossy().into_owned());
    args.extend(config.args.iter().cloned());
    args
}

/// `wParam` for `AHK_ATTACH_DEBUGGER`: the IPv4 address as `inet_addr`
/// returns it, read as a little-endian integer.
pub fn ipv4_wparam(ip: Ipv4Addr) -> u32 {
    u32::from_le_bytes(ip.octets())
}

/// Script run by the interpreter (reading from stdin) that asks the window
/// of `program` to connect to `address`. Exits with 1 when no such script is
/// running.
pub fn attach_script(
    version: EngineVersion,
    program: &Path,
    address: SocketAddr,
) -> Result<String, AdapterError> {
    let ip = match address.ip() {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(ip) => ip.to_ipv4_mapped().ok_or_else(|| {
            AdapterError::Process(format!("attach needs an IPv4 address, got {ip}"))
        })?,
    };
    let wparam = ipv4_wparam(ip);
    let port = address.port();
    let target = format!("{} ahk_class AutoHotkey", program.display());

    let script = match version {
        EngineVersion::V2 => format!(
            "#NoTrayIcon\n\
             DetectHiddenWindows true\n\
             SetTitleMatchMode 2\n\
             target := \"{target}\"\n\
             if !WinExist(target)\n    ExitApp 1\n\
             msg := DllCall(\"RegisterWindowMessage\", \"Str\", \"AHK_ATTACH_DEBUGGER\", \"UInt\")\n\
             PostMessage msg, {wparam}, {port}, , target\n\
             ExitApp 0\n"
        ),
        EngineVersion::V1 => format!(
            "#NoTrayIcon\n\
             DetectHiddenWindows, On\n\
             SetTitleMatchMode, 2\n\
             target := \"{target}\"\n\
             if !WinExist(target)\n    ExitApp, 1\n\
             msg := DllCall(\"RegisterWindowMessage\", \"Str\", \"AHK_ATTACH_DEBUGGER\", \"UInt\")\n\
             PostMessage, %msg%, {wparam}, {port}, , %target%\n\
             ExitApp, 0\n"
        ),
    };
    Ok(script)
}

/// Run the attach script against `config.program` and wait for it to finish.
pub async fn post_attach_request(
    config: &NormalizedDebugConfig,
    address: SocketAddr,
) -> Result<(), AdapterError> {
    let version = EngineVersion::from_major(config.engine_version);
    let script = attach_script(version, &config.program, address)?;

    let mut args = config.runtime_args.clone();
    args.push("/ErrorStdOut".to_string());
    args.push("*".to_string());

    let mut child = Command::new(&config.runtime)
        .args(&args)
        .current_dir(config.working_dir())
        .envs(&config.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| spawn_error(&config.runtime, e))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(script.as_bytes()).await?;
        stdin.shutdown().await?;
    }

    let output = tokio::time::timeout(config.connect_timeout(), child.wait_with_output())
        .await
        .map_err(|_| AdapterError::Process("attach helper did not finish".to_string()))??;

    if output.status.success() {
        tracing::info!("attach request posted to {}", config.program.display());
        Ok(())
    } else {
        let detail = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let mut message = format!(
            "no running script matches {} (helper exited with {:?})",
            config.program.display(),
            output.status.code()
        );
        if !detail.is_empty() {
            message.push_str(": ");
            message.push_str(&detail);
        }
        Err(AdapterError::Process(message))
    }
}

/// A launched interpreter.
///
/// Its stdout and stderr lines are forwarded as [`RuntimeEvent::StdOut`] and
/// [`RuntimeEvent::StdErr`]. Dropping the handle leaves the process running;
/// call [`kill`](Self::kill) to stop it.
#[derive(Debug)]
pub struct ScriptProcess {
    pid: Option<u32>,
    kill: CancellationToken,
    exit: watch::Receiver<Option<Option<i32>>>,
}

impl ScriptProcess {
    pub fn spawn(
        program: &Path,
        args: &[String],
        cwd: &Path,
        env: &HashMap<String, String>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, AdapterError> {
        let mut child = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(program, e))?;
        let pid = child.id();
        tracing::info!("started {} (pid {:?}) with {:?}", program.display(), pid, args);

        let stdout = child
            .stdout
            .take()
            .map(|out| tokio::spawn(forward_lines(out, sink.clone(), RuntimeEvent::StdOut)));
        let stderr = child
            .stderr
            .take()
            .map(|err| tokio::spawn(forward_lines(err, sink.clone(), RuntimeEvent::StdErr)));

        let kill = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(None);
        let token = kill.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = token.cancelled() => {
                    if let Err(e) = child.start_kill() {
                        tracing::debug!("kill failed: {}", e);
                    }
                    child.wait().await
                }
            };
            for pipe in [stdout, stderr].into_iter().flatten() {
                if tokio::time::timeout(PIPE_DRAIN_TIMEOUT, pipe).await.is_err() {
                    tracing::debug!("output pipe still open after exit");
                }
            }
            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!("waiting for debuggee failed: {}", e);
                    None
                }
            };
            tracing::info!("debuggee exited with {:?}", code);
            let _ = exit_tx.send(Some(code));
        });

        Ok(Self {
            pid,
            kill,
            exit: exit_rx,
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Ask for the process to be killed. Returns immediately.
    pub fn kill(&self) {
        self.kill.cancel();
    }

    /// Whether the process has exited.
    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Wait for the process to exit and return its exit code, `None` when it
    /// was killed by a signal.
    pub async fn wait(&self) -> Option<i32> {
        let mut exit = self.exit.clone();
        let code = match exit.wait_for(Option::is_some).await {
            Ok(code) => (*code).flatten(),
            Err(_) => None,
        };
        code
    }
}

async fn forward_lines<R>(pipe: R, sink: Arc<dyn EventSink>, wrap: fn(String) -> RuntimeEvent)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => sink.emit(wrap(String::from_utf8_lossy(&line).replace("\r\n", "\n"))),
            Err(e) => {
                tracing::debug!("output pipe closed: {}", e);
                break;
            }
        }
    }
}

fn spawn_error(program: &Path, err: std::io::Error) -> AdapterError {
    AdapterError::Process(format!("cannot start {}: {}", program.display(), err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokio::sync::mpsc;

    fn config(program: &str) -> NormalizedDebugConfig {
        let mut config = NormalizedDebugConfig::new(program);
        config.runtime_args = vec!["/restart".into()];
        config.args = vec!["first".into(), "second arg".into()];
        config
    }

    #[test]
    fn launch_args_order() {
        let args = launch_args(&config("C:/s/main.ahk"), "127.0.0.1:9002");
        assert_eq!(
            args,
            vec!["/restart", "/Debug=127.0.0.1:9002", "C:/s/main.ahk", "first", "second arg"]
        );
    }

    #[test]
    fn wparam_matches_inet_addr() {
        assert_eq!(ipv4_wparam(Ipv4Addr::new(127, 0, 0, 1)), 0x0100_007F);
        assert_eq!(ipv4_wparam(Ipv4Addr::new(192, 168, 1, 20)), 0x1401_A8C0);
    }

    #[test]
    fn attach_script_versions() {
        let address: SocketAddr = "127.0.0.1:9005".parse().unwrap();
        let v2 = attach_script(EngineVersion::V2, Path::new("C:/s/main.ahk"), address).unwrap();
        assert!(v2.contains("AHK_ATTACH_DEBUGGER"));
        assert!(v2.contains("PostMessage msg, 16777343, 9005, , target"));
        assert!(v2.contains("target := \"C:/s/main.ahk ahk_class AutoHotkey\""));

        let v1 = attach_script(EngineVersion::V1, Path::new("C:/s/main.ahk"), address).unwrap();
        assert!(v1.contains("PostMessage, %msg%, 16777343, 9005, , %target%"));
        assert!(v1.contains("DetectHiddenWindows, On"));
    }

    #[test]
    fn attach_script_rejects_plain_ipv6() {
        let address: SocketAddr = "[::1]:9005".parse().unwrap();
        assert!(matches!(
            attach_script(EngineVersion::V2, Path::new("a.ahk"), address),
            Err(AdapterError::Process(_))
        ));
    }

    #[tokio::test]
    async fn spawn_failure_is_process_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = ScriptProcess::spawn(
            Path::new("/definitely/not/an/interpreter"),
            &[],
            Path::new("."),
            &HashMap::new(),
            Arc::new(tx),
        );
        assert!(matches!(result, Err(AdapterError::Process(m)) if m.contains("cannot start")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn output_is_forwarded_and_exit_code_reported() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let process = ScriptProcess::spawn(
            Path::new("sh"),
            &["-c".into(), "echo out; echo err >&2; exit 3".into()],
            Path::new("."),
            &HashMap::new(),
            Arc::new(tx),
        )
        .unwrap();
        assert_eq!(process.wait().await, Some(3));
        assert!(process.has_exited());

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(events.contains(&RuntimeEvent::StdOut("out\n".into())));
        assert!(events.contains(&RuntimeEvent::StdErr("err\n".into())));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_stops_the_process() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let process = ScriptProcess::spawn(
            Path::new("sh"),
            &["-c".into(), "exec sleep 30".into()],
            Path::new("."),
            &HashMap::from([("AHKDBG_TEST".to_string(), "1".to_string())]),
            Arc::new(tx),
        )
        .unwrap();
        assert!(process.id().is_some());
        process.kill();
        let code = tokio::time::timeout(Duration::from_secs(5), process.wait())
            .await
            .unwrap();
        assert_eq!(code, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn attach_helper_exit_status_decides_success() {
        let address: SocketAddr = "127.0.0.1:9005".parse().unwrap();
        let mut ok = NormalizedDebugConfig::new("/tmp/main.ahk");
        ok.runtime = PathBuf::from("sh");
        ok.runtime_args = vec!["-c".into(), "cat > /dev/null; exit 0".into(), "helper".into()];
        ok.cwd = Some(std::env::temp_dir());
        post_attach_request(&ok, address).await.unwrap();

        let mut missing = ok.clone();
        missing.runtime_args[1] = "cat > /dev/null; echo no window; exit 1".into();
        let err = post_attach_request(&missing, address).await.unwrap_err();
        assert!(err.to_string().contains("no window"), "{err}");
    }
}
