//! One WebSocket connection, from upgrade request to terminal event.
//!
//! Each session runs on its own task and reports to the supervisor through a
//! shared event channel. Every event is tagged with the [`SessionId`] that
//! produced it so the receiver can discard events from superseded sessions.
//! A session emits `Opened` at most once and exactly one terminal event
//! (`Closed` or `Errored`), after which it sends nothing.

use std::fmt;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use tl_protocol::{ProbeFormat, RawFrame, close_codes};

pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const CLIENT_CLOSE_REASON: &str = "client disconnect";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Opened,
    Frame(RawFrame),
    /// The transport closed. `intentional` is set when this side asked for it.
    Closed {
        code: u16,
        reason: String,
        intentional: bool,
    },
    /// The transport failed before or after opening.
    Errored(String),
}

impl SessionEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionEvent::Closed { .. } | SessionEvent::Errored(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEnvelope {
    pub session: SessionId,
    pub event: SessionEvent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed { code: u16, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub keepalive_interval: Duration,
    pub connect_timeout: Duration,
    pub probe: ProbeFormat,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            probe: ProbeFormat::default(),
        }
    }
}

/// Owner's handle on a running session. Dropping it closes the session.
pub struct SessionHandle {
    id: SessionId,
    state_rx: watch::Receiver<SessionState>,
    close_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state_rx.borrow().clone()
    }

    /// Request a normal closure. Returns false if close was already requested.
    pub fn close(&self) -> bool {
        !self.close_tx.send_replace(true)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait until the session task has exited.
    pub async fn join(self) {
        let SessionHandle { task, close_tx, .. } = self;
        let _keep_open = close_tx;
        let _ = task.await;
    }
}

/// Start a session for `request`. Events are tagged with `id`.
pub fn open(
    id: SessionId,
    request: Request,
    cfg: SessionConfig,
    events: mpsc::UnboundedSender<SessionEnvelope>,
) -> SessionHandle {
    let (state_tx, state_rx) = watch::channel(SessionState::Idle);
    let (close_tx, close_rx) = watch::channel(false);
    let task = tokio::spawn(run_session(id, request, cfg, events, state_tx, close_rx));
    SessionHandle {
        id,
        state_rx,
        close_tx,
        task,
    }
}

async fn run_session(
    id: SessionId,
    request: Request,
    cfg: SessionConfig,
    events: mpsc::UnboundedSender<SessionEnvelope>,
    state_tx: watch::Sender<SessionState>,
    mut close_rx: watch::Receiver<bool>,
) {
    let emit = |event: SessionEvent| {
        let _ = events.send(SessionEnvelope { session: id, event });
    };

    state_tx.send_replace(SessionState::Connecting);
    debug!(session = %id, uri = %request.uri().path(), "connecting");

    let connect = tokio::time::timeout(cfg.connect_timeout, connect_async(request));
    let terminal = tokio::select! {
        biased;
        _ = close_requested(&mut close_rx) => SessionEvent::Closed {
            code: close_codes::NORMAL,
            reason: CLIENT_CLOSE_REASON.to_owned(),
            intentional: true,
        },
        res = connect => match res {
            Err(_) => SessionEvent::Errored(format!(
                "connect timed out after {}s",
                cfg.connect_timeout.as_secs_f64()
            )),
            Ok(Err(WsError::Http(response))) if matches!(response.status().as_u16(), 401 | 403) => {
                SessionEvent::Closed {
                    code: close_codes::POLICY_VIOLATION,
                    reason: format!("handshake rejected: HTTP {}", response.status().as_u16()),
                    intentional: false,
                }
            }
            Ok(Err(e)) => SessionEvent::Errored(e.to_string()),
            Ok(Ok((ws, _))) => {
                info!(session = %id, "session open");
                state_tx.send_replace(SessionState::Open);
                emit(SessionEvent::Opened);
                run_session_loop(ws, cfg, &mut close_rx, &state_tx, |frame| {
                    emit(SessionEvent::Frame(frame))
                })
                .await
            }
        },
    };

    let closed = match &terminal {
        SessionEvent::Closed { code, reason, .. } => SessionState::Closed {
            code: *code,
            reason: reason.clone(),
        },
        SessionEvent::Errored(detail) => SessionState::Closed {
            code: close_codes::ABNORMAL,
            reason: detail.clone(),
        },
        _ => SessionState::Closed {
            code: close_codes::ABNORMAL,
            reason: String::new(),
        },
    };
    debug!(session = %id, ?terminal, "session finished");
    state_tx.send_replace(closed);
    emit(terminal);
}

/// Resolves once close has been requested or the handle is gone.
async fn close_requested(close_rx: &mut watch::Receiver<bool>) {
    loop {
        if *close_rx.borrow_and_update() {
            return;
        }
        if close_rx.changed().await.is_err() {
            return;
        }
    }
}

/// Pump an open transport until it ends, returning the terminal event.
///
/// The keepalive interval lives in this frame, so it is gone on every exit
/// path before the transport is released.
pub async fn run_session_loop<S, F>(
    mut ws: S,
    cfg: SessionConfig,
    close_rx: &mut watch::Receiver<bool>,
    state_tx: &watch::Sender<SessionState>,
    mut on_frame: F,
) -> SessionEvent
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
    F: FnMut(RawFrame),
{
    let mut keepalive = tokio::time::interval_at(
        Instant::now() + cfg.keepalive_interval,
        cfg.keepalive_interval,
    );
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = close_requested(close_rx) => {
                state_tx.send_replace(SessionState::Closing);
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: CLIENT_CLOSE_REASON.into(),
                };
                if let Err(e) = ws.send(Message::Close(Some(frame))).await {
                    debug!(error = %e, "close frame not delivered");
                }
                return SessionEvent::Closed {
                    code: close_codes::NORMAL,
                    reason: CLIENT_CLOSE_REASON.to_owned(),
                    intentional: true,
                };
            }
            msg = ws.next() => match msg {
                None => {
                    return SessionEvent::Closed {
                        code: close_codes::ABNORMAL,
                        reason: "connection lost".to_owned(),
                        intentional: false,
                    };
                }
                Some(Err(e)) => return SessionEvent::Errored(e.to_string()),
                Some(Ok(Message::Text(text))) => on_frame(RawFrame::Text(text.as_str().to_owned())),
                Some(Ok(Message::Binary(bytes))) => on_frame(RawFrame::Binary(bytes)),
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(e) = ws.send(Message::Pong(payload)).await {
                        return SessionEvent::Errored(e.to_string());
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(f) => (u16::from(f.code), f.reason.as_str().to_owned()),
                        None => (close_codes::NO_STATUS, String::new()),
                    };
                    state_tx.send_replace(SessionState::Closing);
                    return SessionEvent::Closed { code, reason, intentional: false };
                }
                Some(Ok(_)) => {}
            },
            _ = keepalive.tick() => {
                if let Err(e) = ws.send(Message::Text(cfg.probe.encode().into())).await {
                    warn!(error = %e, "keepalive probe failed");
                    return SessionEvent::Errored(e.to_string());
                }
            }
        }
    }
}
