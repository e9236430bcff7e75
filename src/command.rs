//! Per-command WebSocket session
//!
//! One `WsCommand` owns one WebSocket connection bound to exactly one remote
//! process (or one attach to an existing remote session). Non-TTY traffic is
//! framed with stream tags; TTY traffic is raw bytes plus out-of-band JSON
//! control messages. Inbound events are delivered to the caller through an
//! ordered channel, with the terminal event (exit or error) always last and
//! exactly once.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use crate::error::{Result, SpriteError};
use crate::frame::{self, StreamTag};
use crate::protocol::{SessionOptions, TtyMessage};

/// How long an attach waits for the server's `session_info` message
pub const ATTACH_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Inbound event from a command session or a multiplexed operation
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Remote stdout payload
    Stdout(Vec<u8>),
    /// Remote stderr payload (non-TTY only; TTY merges into Stdout)
    Stderr(Vec<u8>),
    /// Generic JSON message forwarded from the server
    Message(Value),
    /// Remote process exited with this code; always the final event
    Exit(i32),
}

/// Outbound requests from the caller to the session I/O task
enum Outbound {
    /// Stdin data (non-TTY) or raw terminal bytes (TTY)
    Data(Vec<u8>),
    /// End of stdin (non-TTY only)
    Eof,
    /// Pre-serialized JSON text message (resize, signal)
    Text(String),
    /// Close the transport
    Close,
}

/// One streaming session bound to a single remote process
pub struct WsCommand {
    outbound: mpsc::Sender<Outbound>,
    events: mpsc::Receiver<Result<SessionEvent>>,
    tty: bool,
    exit: Option<i32>,
    finished: bool,
}

impl WsCommand {
    /// Open a session to the given WebSocket endpoint
    ///
    /// When `opts.session_id` is set this is an attach: the TTY mode is not
    /// assumed from `opts` but negotiated from the server's `session_info`
    /// message (bounded by [`ATTACH_TIMEOUT`]).
    pub async fn connect(url: Url, token: Option<&str>, opts: SessionOptions) -> Result<Self> {
        let mut request = url.as_str().into_client_request()?;
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| SpriteError::Protocol(format!("invalid bearer token: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (mut ws, _response) = connect_async(request).await?;
        debug!(url = %url, attach = opts.session_id.is_some(), "command session connected");

        let mut tty = opts.tty;
        let mut pending = Vec::new();
        if opts.session_id.is_some() {
            tty = attach_handshake(&mut ws, &mut pending).await?;
            debug!(tty, "attach handshake complete");
        }

        let (events_tx, events_rx) = mpsc::channel(256);
        let (outbound_tx, outbound_rx) = mpsc::channel(64);

        // Generic messages received while waiting for session_info are the
        // first events the caller sees.
        for event in pending {
            let _ = events_tx.send(Ok(event)).await;
        }

        tokio::spawn(run_io(
            ws,
            outbound_rx,
            events_tx,
            tty,
            opts.keepalive_interval,
            opts.keepalive_timeout,
        ));

        Ok(Self {
            outbound: outbound_tx,
            events: events_rx,
            tty,
            exit: None,
            finished: false,
        })
    }

    /// Whether this session runs in TTY mode
    pub fn is_tty(&self) -> bool {
        self.tty
    }

    /// Send input to the remote process
    ///
    /// Stdin data in non-TTY mode, raw terminal bytes in TTY mode.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        self.send_outbound(Outbound::Data(data.to_vec())).await
    }

    /// Signal end of stdin (non-TTY only; the concept does not exist in TTY mode)
    pub async fn send_eof(&self) -> Result<()> {
        if self.tty {
            return Err(SpriteError::Protocol(
                "stdin EOF does not apply to TTY sessions".to_string(),
            ));
        }
        self.send_outbound(Outbound::Eof).await
    }

    /// Request a terminal resize (TTY only)
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        if !self.tty {
            return Err(SpriteError::Protocol(
                "resize only applies to TTY sessions".to_string(),
            ));
        }
        let text = serde_json::to_string(&TtyMessage::Resize { cols, rows })?;
        self.send_outbound(Outbound::Text(text)).await
    }

    /// Ask the server to deliver a signal to the remote process (best-effort)
    pub async fn signal(&self, signal: &str) -> Result<()> {
        let text = serde_json::to_string(&TtyMessage::Signal {
            signal: signal.to_string(),
        })?;
        self.send_outbound(Outbound::Text(text)).await
    }

    /// Receive the next inbound event, in transport-arrival order
    ///
    /// Returns `None` once the session is finished. The terminal event
    /// (`Exit` or an error) is always delivered after all preceding data.
    pub async fn next_event(&mut self) -> Option<Result<SessionEvent>> {
        if self.finished {
            return None;
        }
        match self.events.recv().await {
            Some(Ok(SessionEvent::Exit(code))) => {
                self.exit = Some(code);
                self.finished = true;
                Some(Ok(SessionEvent::Exit(code)))
            }
            Some(Err(e)) => {
                self.finished = true;
                Some(Err(e))
            }
            Some(other) => Some(other),
            None => {
                self.finished = true;
                None
            }
        }
    }

    /// Wait for the remote process to exit, discarding remaining output
    ///
    /// For TTY sessions whose transport closes without an explicit exit
    /// notification, the code is derived from the close status (clean close
    /// maps to 0, anything else to 1) - an approximation, not a real exit
    /// code.
    pub async fn wait(&mut self) -> Result<i32> {
        if let Some(code) = self.exit {
            return Ok(code);
        }
        while let Some(event) = self.next_event().await {
            match event {
                Ok(SessionEvent::Exit(code)) => return Ok(code),
                Ok(_) => {}
                Err(e) => return Err(e),
            }
        }
        Err(SpriteError::Protocol(
            "session closed before exit".to_string(),
        ))
    }

    /// Close the transport (best-effort, idempotent)
    pub async fn close(&mut self) {
        let _ = self.outbound.send(Outbound::Close).await;
    }

    async fn send_outbound(&self, out: Outbound) -> Result<()> {
        self.outbound
            .send(out)
            .await
            .map_err(|_| SpriteError::OperationConflict("session is closed"))
    }
}

/// Wait for the server to declare the attached session's TTY mode
///
/// Generic JSON messages arriving first are collected for later delivery;
/// binary messages are historical buffered output and are discarded.
async fn attach_handshake(ws: &mut WsStream, pending: &mut Vec<SessionEvent>) -> Result<bool> {
    let deadline = tokio::time::sleep(ATTACH_TIMEOUT);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => return Err(SpriteError::AttachTimeout),
            msg = ws.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let value: Value = match serde_json::from_str(&text) {
                        Ok(value) => value,
                        Err(e) => {
                            debug!(error = %e, "ignoring non-JSON text during attach");
                            continue;
                        }
                    };
                    if value.get("type").and_then(Value::as_str) == Some("session_info") {
                        if let Ok(TtyMessage::SessionInfo { tty }) =
                            serde_json::from_value(value.clone())
                        {
                            return Ok(tty);
                        }
                        return Err(SpriteError::Protocol(format!(
                            "malformed session_info: {value}"
                        )));
                    }
                    pending.push(SessionEvent::Message(value));
                }
                Some(Ok(Message::Binary(_))) => {
                    // Buffered history from before the attach; not part of
                    // the live stream.
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(SpriteError::Protocol(
                        "connection closed during attach handshake".to_string(),
                    ));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }
}

/// Session I/O loop: owns the transport until the session terminates
async fn run_io(
    ws: WsStream,
    mut outbound: mpsc::Receiver<Outbound>,
    events: mpsc::Sender<Result<SessionEvent>>,
    tty: bool,
    keepalive_interval: Duration,
    keepalive_timeout: Duration,
) {
    let (mut sink, mut stream) = ws.split();
    let mut last_activity = Instant::now();
    let mut keepalive = tokio::time::interval(keepalive_interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    keepalive.reset();

    loop {
        tokio::select! {
            msg = stream.next() => {
                last_activity = Instant::now();
                match handle_inbound(msg, tty, &events).await {
                    Flow::Continue => {}
                    Flow::Terminal => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            out = outbound.recv() => match out {
                Some(Outbound::Data(data)) => {
                    let message = if tty {
                        Message::Binary(data.into())
                    } else {
                        Message::Binary(frame::encode(StreamTag::Stdin, &data).into())
                    };
                    if let Err(e) = sink.send(message).await {
                        let _ = events.send(Err(e.into())).await;
                        break;
                    }
                }
                Some(Outbound::Eof) => {
                    let message = Message::Binary(frame::encode(StreamTag::StdinEof, &[]).into());
                    if let Err(e) = sink.send(message).await {
                        let _ = events.send(Err(e.into())).await;
                        break;
                    }
                }
                Some(Outbound::Text(text)) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        let _ = events.send(Err(e.into())).await;
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = keepalive.tick() => {
                if last_activity.elapsed() >= keepalive_timeout {
                    warn!(timeout = ?keepalive_timeout, "session keepalive expired");
                    let _ = events
                        .send(Err(SpriteError::KeepaliveTimeout(keepalive_timeout)))
                        .await;
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }
}

enum Flow {
    Continue,
    Terminal,
}

/// Dispatch one inbound transport message, emitting session events
async fn handle_inbound(
    msg: Option<std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>,
    tty: bool,
    events: &mpsc::Sender<Result<SessionEvent>>,
) -> Flow {
    match msg {
        Some(Ok(Message::Binary(data))) => {
            if tty {
                let _ = events.send(Ok(SessionEvent::Stdout(data.to_vec()))).await;
                return Flow::Continue;
            }
            match frame::decode(&data) {
                Ok((StreamTag::Stdout, payload)) => {
                    let _ = events.send(Ok(SessionEvent::Stdout(payload.to_vec()))).await;
                    Flow::Continue
                }
                Ok((StreamTag::Stderr, payload)) => {
                    let _ = events.send(Ok(SessionEvent::Stderr(payload.to_vec()))).await;
                    Flow::Continue
                }
                Ok((StreamTag::Exit, payload)) => {
                    // Authoritative termination: exit wins over any racing
                    // transport error.
                    let code = frame::exit_code(payload);
                    let _ = events.send(Ok(SessionEvent::Exit(code))).await;
                    Flow::Terminal
                }
                Ok((tag, _)) => {
                    warn!(?tag, "ignoring unexpected inbound frame tag");
                    Flow::Continue
                }
                Err(e) => {
                    let _ = events.send(Err(e)).await;
                    Flow::Terminal
                }
            }
        }
        Some(Ok(Message::Text(text))) => {
            let value: Value = match serde_json::from_str(&text) {
                Ok(value) => value,
                Err(e) => {
                    debug!(error = %e, "ignoring non-JSON text message");
                    return Flow::Continue;
                }
            };
            if tty && value.get("type").and_then(Value::as_str) == Some("exit") {
                if let Ok(TtyMessage::Exit { exit_code }) = serde_json::from_value(value.clone()) {
                    let _ = events.send(Ok(SessionEvent::Exit(exit_code))).await;
                    return Flow::Terminal;
                }
            }
            let _ = events.send(Ok(SessionEvent::Message(value))).await;
            Flow::Continue
        }
        Some(Ok(Message::Close(close_frame))) => {
            if tty {
                // No explicit exit notification arrived; derive the code
                // from the close status. Approximate: clean close means 0,
                // anything else means 1.
                let code = match close_frame {
                    Some(f) if u16::from(f.code) == 1000 => 0,
                    None => 0,
                    Some(_) => 1,
                };
                let _ = events.send(Ok(SessionEvent::Exit(code))).await;
            } else {
                let _ = events
                    .send(Err(SpriteError::Protocol(
                        "transport closed without exit frame".to_string(),
                    )))
                    .await;
            }
            Flow::Terminal
        }
        Some(Ok(_)) => Flow::Continue,
        Some(Err(e)) => {
            if tty {
                debug!(error = %e, "TTY transport error, synthesizing exit 1");
                let _ = events.send(Ok(SessionEvent::Exit(1))).await;
            } else {
                let _ = events.send(Err(e.into())).await;
            }
            Flow::Terminal
        }
        None => {
            if tty {
                let _ = events.send(Ok(SessionEvent::Exit(1))).await;
            } else {
                let _ = events
                    .send(Err(SpriteError::Protocol(
                        "transport closed without exit frame".to_string(),
                    )))
                    .await;
            }
            Flow::Terminal
        }
    }
}
