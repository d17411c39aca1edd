//! Terminal Bridge: per-connection fan-out between a client WebSocket and a
//! container's interactive exec stream.
//!
//! The connection-handling shape — split the socket, register an `mpsc`
//! sender, spawn a read task and a write task joined with `tokio::select!`
//! — is adapted from `OpenAgentsInc-openagents`'s `server::ws::transport`
//! module (`WebSocketTransport::handle_socket`), generalized from relaying
//! chat text to relaying PTY bytes. Exec creation (`CreateExecOptions` with
//! `tty: true`, attached stdio) follows the base crate's
//! `container::interactive` module, rewired from host stdin/stdout to the
//! WebSocket's two halves.

use axum::extract::ws::{Message, WebSocket};
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecResults};
use bollard::Docker;
use chrono::Utc;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::OnceLock;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::rate_limit::{RateLimiter, Tier};
use crate::session::{SessionId, SessionStore};

/// Maximum size, in bytes, of a single inbound client frame.
const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Close code: normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code: policy violation (malicious input).
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Close code: message too large.
pub const CLOSE_MESSAGE_TOO_BIG: u16 = 1009;
/// Close code: internal/stream error.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Process-wide registry of live bridge connections, keyed by connection id.
/// Each [`run`] call registers itself on start and deregisters on exit; the
/// shutdown path uses this to force-close every outstanding WebSocket with
/// [`CLOSE_NORMAL`] instead of only stopping new connections from arriving.
pub type ConnectionRegistry = Arc<DashMap<String, mpsc::Sender<Message>>>;

/// Terminal Bridge errors.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Failed to create or start the interactive exec.
    #[error("failed to start exec stream: {0}")]
    ExecStartFailed(String),
    /// The exec stream ended in detached mode unexpectedly.
    #[error("exec stream attached unexpectedly in detached mode")]
    UnexpectedDetached,
}

/// Server-to-client frames.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ServerFrame {
    #[serde(rename = "connected")]
    Connected { session_id: String },
    #[serde(rename = "output")]
    Output { data: String },
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "initComplete")]
    InitComplete {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Client-to-server frames, as recognized tagged JSON.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ClientFrame {
    #[serde(rename = "input")]
    Input { data: String },
    #[serde(rename = "resize")]
    Resize { cols: i64, rows: i64 },
    #[serde(rename = "init")]
    Init {
        commands: Vec<String>,
        #[serde(default)]
        timeout: Option<u64>,
        #[serde(default)]
        silent: bool,
    },
}

/// Parse an inbound text frame; unrecognized JSON shapes fall back to raw
/// input, per the tolerance the design notes require for reconnect races.
fn parse_client_frame(text: &str) -> ClientFrame {
    serde_json::from_str(text).unwrap_or_else(|_| ClientFrame::Input {
        data: text.to_string(),
    })
}

fn malicious_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // Deny-list: OSC 52 (clipboard exfiltration), DCS sequences, and
        // bracketed-paste toggles are the terminal-escape patterns most
        // commonly abused to hijack or exfiltrate via a shared terminal.
        Regex::new(r"(?x)
            \x1b\]52;              # OSC 52 clipboard set/query
            | \x1bP                # Device Control String
            | \x1b\[\?2004[hl]     # bracketed paste mode toggle injected by the client
        ").expect("static regex is valid")
    })
}

/// Reject input containing a denied escape-sequence pattern.
fn is_malicious_input(data: &str) -> bool {
    malicious_pattern().is_match(data)
}

/// Parameters needed to run one bridge for the lifetime of a connection.
pub struct BridgeContext {
    /// Docker/Podman client, shared across the process.
    pub docker: Arc<Docker>,
    /// Container this session's exec runs inside.
    pub container_id: String,
    /// Session this connection is attached to.
    pub session_id: SessionId,
    /// Tracking key for rate-limit bookkeeping.
    pub owner_key: String,
    /// Tier for rate-limit bookkeeping.
    pub tier: Tier,
    /// This connection's unique id, used to release its concurrency slot on teardown.
    pub connection_id: String,
    /// Initial terminal size, already clamped by the server layer.
    pub cols: u32,
    /// Initial terminal size, already clamped by the server layer.
    pub rows: u32,
    /// Optional per-tool-pair welcome banner, sent as one `output` frame right after `connected`.
    pub welcome_banner: Option<String>,
}

/// Run the bridge for one attached connection until the client disconnects,
/// the exec stream ends, or an unrecoverable error occurs. Always performs
/// the compound release (session-activity bump, rate-limiter
/// `unregisterConnection`, connection-registry removal) on the way out,
/// regardless of exit path.
pub async fn run(
    socket: WebSocket,
    ctx: BridgeContext,
    sessions: Arc<SessionStore>,
    rate_limiter: Arc<RateLimiter>,
    connections: ConnectionRegistry,
) {
    let outcome = run_inner(socket, &ctx, &sessions, &rate_limiter, &connections).await;

    sessions
        .update_activity(ctx.session_id, Utc::now())
        .ok();
    rate_limiter.unregister_connection(&ctx.owner_key, &ctx.connection_id);
    connections.remove(&ctx.connection_id);

    match outcome {
        Ok(()) => info!("bridge for session {} closed normally", ctx.session_id),
        Err(e) => warn!("bridge for session {} ended with error: {}", ctx.session_id, e),
    }
}

/// Request a normal closure of every currently live connection. Each bridge
/// task removes its own entry from `connections` as it tears down; this only
/// asks — it does not wait for the close to land. Pair with polling
/// `connections.is_empty()` for a bounded drain.
pub async fn close_all(connections: &ConnectionRegistry) {
    // Collect the senders before awaiting anything: holding a `dashmap`
    // shard guard across an `.await` would block any concurrent
    // insert/remove on a key hashing to that shard (a connection tearing
    // down or upgrading mid-drain) for as long as that entry's send takes.
    let senders: Vec<_> = connections
        .iter()
        .map(|entry| entry.value().clone())
        .collect();

    for tx in senders {
        send_tx_close(&tx, CLOSE_NORMAL).await.ok();
    }
}

async fn run_inner(
    socket: WebSocket,
    ctx: &BridgeContext,
    sessions: &SessionStore,
    rate_limiter: &RateLimiter,
    connections: &ConnectionRegistry,
) -> Result<(), BridgeError> {
    let exec = ctx
        .docker
        .create_exec(
            &ctx.container_id,
            CreateExecOptions {
                attach_stdin: Some(true),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                tty: Some(true),
                cmd: Some(vec!["/bin/sh".to_string()]),
                env: Some(vec!["TERM=xterm-256color".to_string()]),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| BridgeError::ExecStartFailed(e.to_string()))?;

    let start = ctx
        .docker
        .start_exec(&exec.id, None)
        .await
        .map_err(|e| BridgeError::ExecStartFailed(e.to_string()))?;

    let (mut pty_output, mut pty_input) = match start {
        StartExecResults::Attached { output, input } => (output, input),
        StartExecResults::Detached => return Err(BridgeError::UnexpectedDetached),
    };

    ctx.docker
        .resize_exec(
            &exec.id,
            ResizeExecOptions {
                height: ctx.rows as u16,
                width: ctx.cols as u16,
            },
        )
        .await
        .ok();

    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(64);

    connections.insert(ctx.connection_id.clone(), tx.clone());

    send_frame(&tx, &ServerFrame::Connected {
        session_id: ctx.session_id.to_string(),
    })
    .await;
    if let Some(banner) = &ctx.welcome_banner {
        send_frame(&tx, &ServerFrame::Output {
            data: banner.clone(),
        })
        .await;
    }

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let suppress_output = Arc::new(AtomicBool::new(false));

    let output_tx = tx.clone();
    let output_suppress = Arc::clone(&suppress_output);
    let output_task = tokio::spawn(async move {
        while let Some(chunk) = pty_output.next().await {
            match chunk {
                Ok(log) => {
                    if output_suppress.load(Ordering::Relaxed) {
                        continue;
                    }
                    let frame = ServerFrame::Output {
                        data: log.to_string(),
                    };
                    if send_frame(&output_tx, &frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("exec stream read ended: {}", e);
                    break;
                }
            }
        }
    });

    let close_code = input_loop(
        &mut ws_stream,
        &tx,
        ctx,
        &exec.id,
        &mut pty_input,
        sessions,
        rate_limiter,
        &suppress_output,
    )
    .await;

    pty_input.shutdown().await.ok();
    output_task.abort();
    let _ = send_tx_close(&tx, close_code).await;
    send_task.abort();

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn input_loop(
    ws_stream: &mut futures::stream::SplitStream<WebSocket>,
    tx: &mpsc::Sender<Message>,
    ctx: &BridgeContext,
    exec_id: &str,
    pty_input: &mut Pin<Box<dyn tokio::io::AsyncWrite + Send>>,
    sessions: &SessionStore,
    rate_limiter: &RateLimiter,
    suppress_output: &Arc<AtomicBool>,
) -> u16 {
    loop {
        let message = match ws_stream.next().await {
            Some(Ok(m)) => m,
            Some(Err(_)) | None => return CLOSE_INTERNAL_ERROR,
        };

        let text = match message {
            Message::Text(t) => t,
            Message::Binary(b) => String::from_utf8_lossy(&b).to_string(),
            Message::Close(_) => return CLOSE_NORMAL,
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        // Every inbound frame counts as activity, not just `input` — a
        // client mid-`init` or actively resizing is not idle.
        sessions.update_activity(ctx.session_id, Utc::now()).ok();

        if text.len() > MAX_FRAME_BYTES {
            send_frame(tx, &ServerFrame::Error {
                message: "message too large".to_string(),
            })
            .await
            .ok();
            return CLOSE_MESSAGE_TOO_BIG;
        }

        match parse_client_frame(&text) {
            ClientFrame::Input { data } => {
                if is_malicious_input(&data) {
                    warn!(
                        "rejected malicious input on session {}: suspicious escape sequence",
                        ctx.session_id
                    );
                    send_frame(tx, &ServerFrame::Error {
                        message: "input rejected".to_string(),
                    })
                    .await
                    .ok();
                    return CLOSE_POLICY_VIOLATION;
                }

                let admission = rate_limiter.check_command_limit(&ctx.owner_key, ctx.tier);
                if !admission.allowed {
                    send_frame(tx, &ServerFrame::Error {
                        message: "command rate limit exceeded".to_string(),
                    })
                    .await
                    .ok();
                    continue;
                }
                rate_limiter.record_command(&ctx.owner_key, ctx.tier);

                if pty_input.write_all(data.as_bytes()).await.is_err() {
                    return CLOSE_INTERNAL_ERROR;
                }
            }
            ClientFrame::Resize { cols, rows } => {
                if cols > 0 && rows > 0 {
                    // bollard's resize_exec is invoked on the same docker
                    // client the bridge was constructed with; the exec id
                    // is stable for this connection's lifetime.
                    resize(ctx, exec_id, cols as u16, rows as u16).await;
                }
            }
            ClientFrame::Init {
                commands,
                timeout,
                silent,
            } => {
                let result =
                    run_init_sequence(pty_input, suppress_output, &commands, timeout, silent)
                        .await;
                send_frame(tx, &ServerFrame::InitComplete {
                    success: result.is_ok(),
                    error: result.err(),
                })
                .await
                .ok();
            }
        }
    }
}

async fn resize(ctx: &BridgeContext, exec_id: &str, cols: u16, rows: u16) {
    ctx.docker
        .resize_exec(
            exec_id,
            ResizeExecOptions {
                height: rows,
                width: cols,
            },
        )
        .await
        .ok();
}

/// Inject a sequence of setup commands into the PTY, one at a time. When
/// `silent`, raises `suppress_output` before the first write and lowers it
/// again once every command has settled, so the concurrently running output
/// fan-out task drops PTY chunks for the duration instead of forwarding them
/// to the client.
async fn run_init_sequence(
    pty_input: &mut Pin<Box<dyn tokio::io::AsyncWrite + Send>>,
    suppress_output: &Arc<AtomicBool>,
    commands: &[String],
    timeout_ms: Option<u64>,
    silent: bool,
) -> Result<(), String> {
    if silent {
        suppress_output.store(true, Ordering::Relaxed);
    }

    let result = write_init_commands(pty_input, commands, timeout_ms).await;

    if silent {
        suppress_output.store(false, Ordering::Relaxed);
    }

    result
}

/// Lacking a prompt-detection heuristic shared with the shell, settling
/// between commands is approximated with a fixed per-command delay bounded
/// by the caller's timeout.
async fn write_init_commands(
    pty_input: &mut Pin<Box<dyn tokio::io::AsyncWrite + Send>>,
    commands: &[String],
    timeout_ms: Option<u64>,
) -> Result<(), String> {
    let per_command_timeout =
        std::time::Duration::from_millis(timeout_ms.unwrap_or(5000) / commands.len().max(1) as u64);

    for command in commands {
        let mut line = command.clone();
        line.push('\n');
        tokio::time::timeout(per_command_timeout, pty_input.write_all(line.as_bytes()))
            .await
            .map_err(|_| format!("timed out writing command: {command}"))?
            .map_err(|e| e.to_string())?;
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    }
    Ok(())
}

async fn send_frame(tx: &mpsc::Sender<Message>, frame: &ServerFrame) -> Result<(), ()> {
    let text = serde_json::to_string(frame).map_err(|_| ())?;
    tx.send(Message::Text(text)).await.map_err(|_| ())
}

async fn send_tx_close(tx: &mpsc::Sender<Message>, code: u16) -> Result<(), ()> {
    tx.send(Message::Close(Some(axum::extract::ws::CloseFrame {
        code,
        reason: std::borrow::Cow::Borrowed(""),
    })))
    .await
    .map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unrecognized_json_falls_back_to_raw_input() {
        let frame = parse_client_frame("not json at all");
        assert!(matches!(frame, ClientFrame::Input { data } if data == "not json at all"));
    }

    #[test]
    fn test_recognizes_input_frame() {
        let frame = parse_client_frame(r#"{"type":"input","data":"echo hi\n"}"#);
        assert!(matches!(frame, ClientFrame::Input { data } if data == "echo hi\n"));
    }

    #[test]
    fn test_recognizes_resize_frame() {
        let frame = parse_client_frame(r#"{"type":"resize","cols":120,"rows":40}"#);
        assert!(matches!(frame, ClientFrame::Resize { cols: 120, rows: 40 }));
    }

    #[test]
    fn test_recognizes_init_frame_with_defaults() {
        let frame = parse_client_frame(r#"{"type":"init","commands":["echo hi"]}"#);
        match frame {
            ClientFrame::Init { commands, timeout, silent } => {
                assert_eq!(commands, vec!["echo hi".to_string()]);
                assert_eq!(timeout, None);
                assert!(!silent);
            }
            _ => panic!("expected Init frame"),
        }
    }

    #[test]
    fn test_osc52_is_malicious() {
        assert!(is_malicious_input("\x1b]52;c;aGVsbG8=\x07"));
    }

    #[test]
    fn test_plain_text_is_not_malicious() {
        assert!(!is_malicious_input("echo hello world\n"));
    }

    #[test]
    fn test_connected_frame_serializes_with_tag() {
        let frame = ServerFrame::Connected {
            session_id: "abc-123".to_string(),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""type":"connected""#));
        assert!(json.contains("abc-123"));
    }

    #[test]
    fn test_init_complete_omits_error_when_successful() {
        let frame = ServerFrame::InitComplete {
            success: true,
            error: None,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(!json.contains("error"));
    }

    #[tokio::test]
    async fn test_run_init_sequence_suppresses_output_only_while_silent_and_running() {
        let suppress = Arc::new(AtomicBool::new(false));
        let mut sink: Pin<Box<dyn tokio::io::AsyncWrite + Send>> = Box::pin(tokio::io::sink());

        assert!(!suppress.load(Ordering::Relaxed));
        run_init_sequence(&mut sink, &suppress, &["echo hi".to_string()], Some(1000), true)
            .await
            .unwrap();
        assert!(!suppress.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_run_init_sequence_leaves_output_unsuppressed_when_not_silent() {
        let suppress = Arc::new(AtomicBool::new(false));
        let mut sink: Pin<Box<dyn tokio::io::AsyncWrite + Send>> = Box::pin(tokio::io::sink());

        run_init_sequence(&mut sink, &suppress, &["echo hi".to_string()], Some(1000), false)
            .await
            .unwrap();
        assert!(!suppress.load(Ordering::Relaxed));
    }
}
