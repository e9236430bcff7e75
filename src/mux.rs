//! Multiplexed control channel
//!
//! A `ControlConnection` is one persistent WebSocket hosting a sequence of
//! non-overlapping operations. Each operation is an `OpConn` with the same
//! stream semantics as a dedicated command session, but its frames travel
//! through the shared connection. Text messages carrying the reserved
//! `control:` prefix are control envelopes (`op.start` / `op.complete` /
//! `op.error`); everything else on the connection is data belonging to the
//! currently active operation.
//!
//! The core invariant: at most one live operation per connection at any
//! instant. Busy/idle is modeled as `Option<ActiveOp>` so the invariant is a
//! check on the sum type, not on a nullable flag.

use std::fmt;
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use crate::command::SessionEvent;
use crate::error::{Result, SpriteError};
use crate::frame::{self, StreamTag};
use crate::protocol::{
    ControlEnvelope, SessionOptions, TtyMessage, OP_COMPLETE, OP_ERROR, OP_START,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Where a control connection dials, and with what credentials
#[derive(Debug, Clone)]
pub struct ControlEndpoint {
    /// WebSocket URL of the control channel
    pub url: Url,
    /// Opaque bearer token, passed through as-is
    pub token: Option<String>,
}

impl ControlEndpoint {
    fn request(&self) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
        let mut request = self.url.as_str().into_client_request()?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| SpriteError::Protocol(format!("invalid bearer token: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        Ok(request)
    }
}

/// The operation currently occupying a connection
struct ActiveOp {
    tty: bool,
    events: mpsc::Sender<Result<SessionEvent>>,
    shared: Arc<OpShared>,
}

/// State shared between an `OpConn` and the connection's routing task
#[derive(Default)]
struct OpShared {
    /// Exit code seen on the data plane (an `Exit` frame). Recorded only -
    /// completion is authoritative via `op.complete`.
    data_exit: Mutex<Option<i32>>,
}

struct ConnState {
    connected: bool,
    closed: bool,
    /// Pool checkout flag; never set for two concurrent callers
    active: bool,
    outbound: Option<mpsc::Sender<Message>>,
    current: Option<ActiveOp>,
}

/// One physical control connection hosting sequential operations
pub struct ControlConnection {
    endpoint: ControlEndpoint,
    state: Arc<Mutex<ConnState>>,
}

impl ControlConnection {
    /// Create an unconnected control connection
    pub fn new(endpoint: ControlEndpoint) -> Self {
        Self {
            endpoint,
            state: Arc::new(Mutex::new(ConnState {
                connected: false,
                closed: false,
                active: false,
                outbound: None,
                current: None,
            })),
        }
    }

    /// Open the transport; may be called once per connection
    pub async fn connect(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Err(SpriteError::OperationConflict("connection is closed"));
            }
            if state.connected {
                return Err(SpriteError::OperationConflict("connection already connected"));
            }
            // Reserve before awaiting so a concurrent connect fails fast.
            state.connected = true;
        }

        let request = match self.endpoint.request() {
            Ok(request) => request,
            Err(e) => {
                self.state.lock().unwrap().connected = false;
                return Err(e);
            }
        };
        let ws = match connect_async(request).await {
            Ok((ws, _response)) => ws,
            Err(e) => {
                self.state.lock().unwrap().connected = false;
                return Err(e.into());
            }
        };
        debug!(url = %self.endpoint.url, "control connection established");

        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        self.state.lock().unwrap().outbound = Some(outbound_tx);
        tokio::spawn(conn_io(ws, outbound_rx, self.state.clone()));
        Ok(())
    }

    /// Start an operation on this connection
    ///
    /// Sends the `op.start` envelope and returns the `OpConn` the server's
    /// data frames will be routed to. Fails with an operation conflict if
    /// the connection is closed or another operation is in flight.
    pub async fn start_op(&self, op: &str, opts: &SessionOptions) -> Result<OpConn> {
        let (events_tx, events_rx) = mpsc::channel(256);
        let shared = Arc::new(OpShared::default());

        let outbound = {
            let mut state = self.state.lock().unwrap();
            if state.closed || !state.connected {
                return Err(SpriteError::OperationConflict("connection is not open"));
            }
            if state.current.is_some() {
                return Err(SpriteError::OperationConflict("operation already in flight"));
            }
            let Some(outbound) = state.outbound.clone() else {
                return Err(SpriteError::OperationConflict("connection is not open"));
            };
            state.current = Some(ActiveOp {
                tty: opts.tty,
                events: events_tx,
                shared: shared.clone(),
            });
            outbound
        };

        let envelope = ControlEnvelope {
            kind: OP_START.to_string(),
            op: Some(op.to_string()),
            args: Some(opts.to_op_args()),
        };
        let text = envelope.to_text()?;
        if outbound.send(Message::Text(text.into())).await.is_err() {
            self.state.lock().unwrap().current = None;
            return Err(SpriteError::OperationConflict("connection is not open"));
        }
        debug!(op, tty = opts.tty, "operation started");

        Ok(OpConn {
            state: self.state.clone(),
            outbound,
            events: events_rx,
            shared,
            tty: opts.tty,
            exit: None,
            finished: false,
        })
    }

    /// Send a raw data-plane message (framed by the caller as needed)
    pub async fn send_data(&self, data: &[u8]) -> Result<()> {
        self.send_message(Message::Binary(data.to_vec().into())).await
    }

    /// Send a control envelope
    pub async fn send_control(&self, envelope: &ControlEnvelope) -> Result<()> {
        self.send_message(Message::Text(envelope.to_text()?.into())).await
    }

    async fn send_message(&self, message: Message) -> Result<()> {
        let outbound = {
            let state = self.state.lock().unwrap();
            if state.closed || !state.connected {
                return Err(SpriteError::OperationConflict("connection is not open"));
            }
            state.outbound.clone()
        };
        let Some(outbound) = outbound else {
            return Err(SpriteError::OperationConflict("connection is not open"));
        };
        outbound
            .send(message)
            .await
            .map_err(|_| SpriteError::OperationConflict("connection is not open"))
    }

    /// Close the connection and fail any in-flight operation (idempotent)
    pub fn close(&self) {
        let current = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            state.connected = false;
            // Dropping the sender makes the I/O task perform the close
            // handshake and exit.
            state.outbound = None;
            state.current.take()
        };
        if let Some(op) = current {
            let _ = op
                .events
                .try_send(Err(SpriteError::OperationConflict("connection closed")));
        }
    }

    /// Whether the transport is permanently gone
    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Open, checked out by nobody, and with no operation in flight
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.connected && !state.closed && !state.active && state.current.is_none()
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state.lock().unwrap().active
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.state.lock().unwrap().active = active;
    }

    pub(crate) fn clear_op(&self) {
        self.state.lock().unwrap().current = None;
    }
}

/// One logical operation multiplexed on a control connection
pub struct OpConn {
    state: Arc<Mutex<ConnState>>,
    outbound: mpsc::Sender<Message>,
    events: mpsc::Receiver<Result<SessionEvent>>,
    shared: Arc<OpShared>,
    tty: bool,
    exit: Option<i32>,
    finished: bool,
}

impl OpConn {
    /// Whether this operation runs in TTY mode
    pub fn is_tty(&self) -> bool {
        self.tty
    }

    /// Send input: stdin data (non-TTY, framed) or raw terminal bytes (TTY)
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        if self.finished {
            return Err(SpriteError::OperationConflict("operation already complete"));
        }
        let message = if self.tty {
            Message::Binary(data.to_vec().into())
        } else {
            Message::Binary(frame::encode(StreamTag::Stdin, data).into())
        };
        self.send(message).await
    }

    /// Signal end of stdin (non-TTY only)
    pub async fn send_eof(&self) -> Result<()> {
        if self.finished {
            return Err(SpriteError::OperationConflict("operation already complete"));
        }
        if self.tty {
            return Err(SpriteError::Protocol(
                "stdin EOF does not apply to TTY operations".to_string(),
            ));
        }
        self.send(Message::Binary(frame::encode(StreamTag::StdinEof, &[]).into()))
            .await
    }

    /// Request a terminal resize (TTY only)
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        if self.finished {
            return Err(SpriteError::OperationConflict("operation already complete"));
        }
        if !self.tty {
            return Err(SpriteError::Protocol(
                "resize only applies to TTY operations".to_string(),
            ));
        }
        let text = serde_json::to_string(&TtyMessage::Resize { cols, rows })?;
        self.send(Message::Text(text.into())).await
    }

    /// Ask the server to deliver a signal to the remote process (best-effort)
    pub async fn signal(&self, signal: &str) -> Result<()> {
        if self.finished {
            return Err(SpriteError::OperationConflict("operation already complete"));
        }
        let text = serde_json::to_string(&TtyMessage::Signal {
            signal: signal.to_string(),
        })?;
        self.send(Message::Text(text.into())).await
    }

    /// Receive the next inbound event, in transport-arrival order
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

    /// Wait for the operation to complete, discarding remaining output
    ///
    /// Completion comes from the control plane: an `op.complete` envelope
    /// resolves with its exit code, an `op.error` envelope rejects with the
    /// server-supplied message. A data-plane `Exit` frame alone does not
    /// complete the operation.
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
            "operation ended before completion".to_string(),
        ))
    }

    /// Detach from the connection, leaving it usable for the next operation
    pub fn close(&mut self) {
        self.finished = true;
        self.detach();
    }

    fn detach(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(op) = &state.current {
            if Arc::ptr_eq(&op.shared, &self.shared) {
                state.current = None;
            }
        }
    }

    async fn send(&self, message: Message) -> Result<()> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| SpriteError::OperationConflict("connection is not open"))
    }
}

impl Drop for OpConn {
    fn drop(&mut self) {
        self.detach();
    }
}

impl fmt::Debug for OpConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpConn")
            .field("tty", &self.tty)
            .field("exit", &self.exit)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

/// Routing loop for one control connection
async fn conn_io(ws: WsStream, mut outbound: mpsc::Receiver<Message>, state: Arc<Mutex<ConnState>>) {
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => match ControlEnvelope::parse(&text) {
                    Some(Ok(envelope)) => dispatch_envelope(envelope, &state).await,
                    Some(Err(e)) => warn!(error = %e, "malformed control envelope"),
                    None => route_text(&text, &state).await,
                },
                Some(Ok(Message::Binary(data))) => route_binary(&data, &state).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "control connection transport error");
                    break;
                }
            },
            out = outbound.recv() => match out {
                Some(message) => {
                    if sink.send(message).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }

    // Transport gone: the connection is permanently unusable. Fail the
    // in-flight operation, if any.
    let current = {
        let mut st = state.lock().unwrap();
        st.closed = true;
        st.connected = false;
        st.outbound = None;
        st.current.take()
    };
    if let Some(op) = current {
        let _ = op
            .events
            .send(Err(SpriteError::Protocol(
                "control connection closed".to_string(),
            )))
            .await;
    }
}

/// Handle an `op.complete` / `op.error` envelope from the server
async fn dispatch_envelope(envelope: ControlEnvelope, state: &Arc<Mutex<ConnState>>) {
    match envelope.kind.as_str() {
        OP_COMPLETE => {
            let Some(op) = state.lock().unwrap().current.take() else {
                debug!("op.complete with no active operation");
                return;
            };
            let code = envelope
                .exit_code()
                .or_else(|| *op.shared.data_exit.lock().unwrap())
                .unwrap_or(0);
            let _ = op.events.send(Ok(SessionEvent::Exit(code))).await;
        }
        OP_ERROR => {
            let Some(op) = state.lock().unwrap().current.take() else {
                debug!("op.error with no active operation");
                return;
            };
            let message = envelope
                .error_message()
                .unwrap_or("remote operation failed")
                .to_string();
            let _ = op
                .events
                .send(Err(SpriteError::RemoteOperation(message)))
                .await;
        }
        other => debug!(kind = other, "ignoring unknown control envelope"),
    }
}

/// Route a binary data frame to the current operation
async fn route_binary(data: &[u8], state: &Arc<Mutex<ConnState>>) {
    let op = {
        let st = state.lock().unwrap();
        st.current
            .as_ref()
            .map(|op| (op.tty, op.events.clone(), op.shared.clone()))
    };
    let Some((tty, events, shared)) = op else {
        debug!("dropping data frame with no active operation");
        return;
    };

    if tty {
        let _ = events.send(Ok(SessionEvent::Stdout(data.to_vec()))).await;
        return;
    }

    match frame::decode(data) {
        Ok((StreamTag::Stdout, payload)) => {
            let _ = events.send(Ok(SessionEvent::Stdout(payload.to_vec()))).await;
        }
        Ok((StreamTag::Stderr, payload)) => {
            let _ = events.send(Ok(SessionEvent::Stderr(payload.to_vec()))).await;
        }
        Ok((StreamTag::Exit, payload)) => {
            // Recorded only; op.complete is the durable completion signal
            // because data-plane and control-plane messages may arrive out
            // of strict order.
            *shared.data_exit.lock().unwrap() = Some(frame::exit_code(payload));
        }
        Ok((tag, _)) => warn!(?tag, "ignoring unexpected frame tag on control channel"),
        Err(e) => {
            // A bad frame fails the operation but must not poison the
            // connection; only transport-level closure tears it down.
            let op = state.lock().unwrap().current.take();
            if let Some(op) = op {
                let _ = op.events.send(Err(e)).await;
            }
        }
    }
}

/// Route a non-envelope text message to the current operation
async fn route_text(text: &str, state: &Arc<Mutex<ConnState>>) {
    let op = {
        let st = state.lock().unwrap();
        st.current
            .as_ref()
            .map(|op| (op.tty, op.events.clone(), op.shared.clone()))
    };
    let Some((tty, events, shared)) = op else {
        debug!("dropping text message with no active operation");
        return;
    };

    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, "ignoring non-JSON text on control channel");
            return;
        }
    };
    if tty && value.get("type").and_then(Value::as_str) == Some("exit") {
        if let Ok(TtyMessage::Exit { exit_code }) = serde_json::from_value(value.clone()) {
            *shared.data_exit.lock().unwrap() = Some(exit_code);
            return;
        }
    }
    let _ = events.send(Ok(SessionEvent::Message(value))).await;
}
