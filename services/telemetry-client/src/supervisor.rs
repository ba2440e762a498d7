//! Reconnect supervisor.
//!
//! [`ReconnectMachine`] is a synchronous state machine: every input (caller
//! command, timer firing, session event) goes through [`ReconnectMachine::handle`]
//! and yields a list of [`Action`]s for the async driver to carry out. It never
//! touches sockets or timers itself, so its behavior can be tested by feeding
//! inputs with a synthetic clock.
//!
//! Failure classification:
//!
//! | terminal event                              | outcome                                  |
//! |---------------------------------------------|------------------------------------------|
//! | close 1000                                  | `Disabled`                               |
//! | close 1008 (or handshake 401/403)           | `PermanentlyFailed(AuthenticationRejected)` |
//! | no token                                    | `PermanentlyFailed(NotAuthenticated)`    |
//! | anything else, budget left                  | `AwaitingRetry`                          |
//! | anything else, budget used                  | `PermanentlyFailed(AttemptsExhausted)`   |

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, trace};

use tl_protocol::{FallbackPolicy, Frame, close_codes, decode};

use crate::backoff::BackoffPolicy;
use crate::session::{SessionEvent, SessionId};
use crate::status_log::LogLevel;

/// Default pause between a manual reconnect and the fresh attempt.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NotAuthenticated,
    AuthenticationRejected,
    AttemptsExhausted,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureReason::NotAuthenticated => "Not authenticated",
            FailureReason::AuthenticationRejected => "Authentication rejected",
            FailureReason::AttemptsExhausted => "Max reconnection attempts reached",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disabled,
    Attempting { attempt: u32 },
    Connected,
    /// Waiting out a backoff delay. `attempt` is the number of failures in the
    /// current streak; 0 means the manual-reconnect settling pause.
    AwaitingRetry { attempt: u32, due_at: Instant },
    PermanentlyFailed { reason: FailureReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    Disabled,
    Attempting,
    Connected,
    AwaitingRetry,
    PermanentlyFailed,
}

impl Phase {
    pub fn kind(&self) -> PhaseKind {
        match self {
            Phase::Disabled => PhaseKind::Disabled,
            Phase::Attempting { .. } => PhaseKind::Attempting,
            Phase::Connected => PhaseKind::Connected,
            Phase::AwaitingRetry { .. } => PhaseKind::AwaitingRetry,
            Phase::PermanentlyFailed { .. } => PhaseKind::PermanentlyFailed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReconnectState {
    pub attempt: u32,
    pub should_reconnect: bool,
    pub last_error: Option<String>,
}

/// Snapshot of the supervisor as seen by callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientStatus {
    pub connected: bool,
    pub last_error: Option<String>,
    pub attempt: u32,
    pub phase: PhaseKind,
    pub ignored_frames: u64,
}

impl Default for ClientStatus {
    fn default() -> Self {
        Self {
            connected: false,
            last_error: None,
            attempt: 0,
            phase: PhaseKind::Disabled,
            ignored_frames: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Enable,
    Disable,
    ManualReconnect,
    RetryDue { generation: u64 },
    /// Target resolution for `session` found no token.
    NotAuthenticated { session: SessionId },
    Session { id: SessionId, event: SessionEvent },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Connect { session: SessionId, attempt: u32 },
    CloseSession { session: SessionId },
    ScheduleRetry { generation: u64, delay: Duration },
    CancelRetry,
    Publish(Value),
    ClearCache,
    Log { level: LogLevel, message: String },
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub backoff: BackoffPolicy,
    pub settle_delay: Duration,
    pub fallback: FallbackPolicy,
    pub clear_on_disable: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            settle_delay: DEFAULT_SETTLE_DELAY,
            fallback: FallbackPolicy::default(),
            clear_on_disable: false,
        }
    }
}

pub struct ReconnectMachine {
    cfg: SupervisorConfig,
    phase: Phase,
    state: ReconnectState,
    current_session: Option<SessionId>,
    next_session: u64,
    retry_generation: u64,
    ignored_frames: u64,
}

impl ReconnectMachine {
    pub fn new(cfg: SupervisorConfig) -> Self {
        Self {
            cfg,
            phase: Phase::Disabled,
            state: ReconnectState::default(),
            current_session: None,
            next_session: 1,
            retry_generation: 0,
            ignored_frames: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn reconnect_state(&self) -> &ReconnectState {
        &self.state
    }

    pub fn current_session(&self) -> Option<SessionId> {
        self.current_session
    }

    pub fn status(&self) -> ClientStatus {
        ClientStatus {
            connected: self.phase == Phase::Connected,
            last_error: self.state.last_error.clone(),
            attempt: self.state.attempt,
            phase: self.phase.kind(),
            ignored_frames: self.ignored_frames,
        }
    }

    pub fn handle(&mut self, input: Input, now: Instant) -> Vec<Action> {
        let mut out = Vec::new();
        match input {
            Input::Enable => self.on_enable(&mut out),
            Input::Disable => self.on_disable(&mut out),
            Input::ManualReconnect => self.on_manual_reconnect(now, &mut out),
            Input::RetryDue { generation } => self.on_retry_due(generation, &mut out),
            Input::NotAuthenticated { session } => {
                if self.is_current(session) {
                    self.current_session = None;
                    self.fail_permanently(FailureReason::NotAuthenticated, &mut out);
                }
            }
            Input::Session { id, event } => {
                if self.is_current(id) {
                    self.on_session_event(event, now, &mut out);
                } else {
                    debug!(session = %id, ?event, "dropping event from stale session");
                }
            }
        }
        out
    }

    fn is_current(&self, id: SessionId) -> bool {
        self.current_session == Some(id)
    }

    fn on_enable(&mut self, out: &mut Vec<Action>) {
        match self.phase {
            Phase::Disabled | Phase::PermanentlyFailed { .. } => {
                self.state.should_reconnect = true;
                self.state.last_error = None;
                self.state.attempt = 0;
                self.start_attempt(1, out);
            }
            phase => debug!(?phase, "enable ignored, already active"),
        }
    }

    fn on_disable(&mut self, out: &mut Vec<Action>) {
        if self.phase == Phase::Disabled && self.current_session.is_none() {
            return;
        }
        self.state.should_reconnect = false;
        self.state.attempt = 0;
        self.state.last_error = None;
        self.cancel_retry(out);
        if let Some(session) = self.current_session.take() {
            out.push(Action::CloseSession { session });
        }
        self.phase = Phase::Disabled;
        if self.cfg.clear_on_disable {
            out.push(Action::ClearCache);
        }
        log(out, LogLevel::Info, "Disconnected");
    }

    fn on_manual_reconnect(&mut self, now: Instant, out: &mut Vec<Action>) {
        if self.phase == Phase::Disabled {
            debug!("manual reconnect ignored while disabled");
            return;
        }
        self.state.should_reconnect = true;
        self.state.attempt = 0;
        self.state.last_error = None;
        if let Some(session) = self.current_session.take() {
            out.push(Action::CloseSession { session });
        }
        self.cancel_retry(out);
        let delay = self.cfg.settle_delay;
        self.phase = Phase::AwaitingRetry {
            attempt: 0,
            due_at: now + delay,
        };
        out.push(Action::ScheduleRetry {
            generation: self.retry_generation,
            delay,
        });
        log(out, LogLevel::Info, "Manual reconnect requested");
    }

    fn on_retry_due(&mut self, generation: u64, out: &mut Vec<Action>) {
        if generation != self.retry_generation {
            trace!(generation, current = self.retry_generation, "stale retry timer");
            return;
        }
        match self.phase {
            Phase::AwaitingRetry { attempt, .. } if self.state.should_reconnect => {
                self.start_attempt(attempt.saturating_add(1), out);
            }
            phase => debug!(?phase, "retry timer fired outside AwaitingRetry"),
        }
    }

    fn on_session_event(&mut self, event: SessionEvent, now: Instant, out: &mut Vec<Action>) {
        match event {
            SessionEvent::Opened => {
                self.phase = Phase::Connected;
                self.state.attempt = 0;
                self.state.last_error = None;
                log(out, LogLevel::Info, "Connected");
            }
            SessionEvent::Frame(raw) => match decode(&raw, self.cfg.fallback) {
                Frame::TelemetryData(value) => out.push(Action::Publish(value)),
                Frame::KeepaliveAck => trace!("keepalive acknowledged"),
                Frame::Ignore => {
                    self.ignored_frames += 1;
                    debug!(total = self.ignored_frames, "ignoring unrecognised frame");
                }
            },
            SessionEvent::Closed {
                intentional: true, ..
            } => {
                // Only reachable if a close was requested without retiring the
                // session first.
                self.current_session = None;
            }
            SessionEvent::Closed { code, reason, .. } => {
                self.current_session = None;
                match code {
                    close_codes::NORMAL => {
                        self.state.should_reconnect = false;
                        self.state.attempt = 0;
                        self.phase = Phase::Disabled;
                        log(out, LogLevel::Info, "Server closed the connection");
                    }
                    close_codes::POLICY_VIOLATION => {
                        self.fail_permanently(FailureReason::AuthenticationRejected, out);
                    }
                    _ => {
                        let detail = if reason.is_empty() {
                            format!("Connection closed (code {code})")
                        } else {
                            format!("Connection closed (code {code}): {reason}")
                        };
                        self.on_retryable_failure(detail, now, out);
                    }
                }
            }
            SessionEvent::Errored(detail) => {
                self.current_session = None;
                self.on_retryable_failure(detail, now, out);
            }
        }
    }

    fn on_retryable_failure(&mut self, detail: String, now: Instant, out: &mut Vec<Action>) {
        let was_connected = self.phase == Phase::Connected;
        let failed = self.state.attempt.max(1);
        self.state.attempt = failed;
        self.state.last_error = Some(detail);
        if was_connected {
            log(out, LogLevel::Warn, "Connection lost");
        }
        if !self.state.should_reconnect {
            self.phase = Phase::Disabled;
            return;
        }
        if self.cfg.backoff.is_exhausted(failed) {
            self.fail_permanently(FailureReason::AttemptsExhausted, out);
            return;
        }
        let delay = self.cfg.backoff.delay(failed);
        self.cancel_retry(out);
        self.phase = Phase::AwaitingRetry {
            attempt: failed,
            due_at: now + delay,
        };
        out.push(Action::ScheduleRetry {
            generation: self.retry_generation,
            delay,
        });
        log(
            out,
            LogLevel::Warn,
            format!(
                "Reconnecting in {:.1}s (attempt {}/{})",
                delay.as_secs_f64(),
                failed + 1,
                self.cfg.backoff.max_attempts
            ),
        );
    }

    fn start_attempt(&mut self, attempt: u32, out: &mut Vec<Action>) {
        self.cancel_retry(out);
        if let Some(old) = self.current_session.take() {
            out.push(Action::CloseSession { session: old });
        }
        let session = SessionId(self.next_session);
        self.next_session += 1;
        self.current_session = Some(session);
        self.phase = Phase::Attempting { attempt };
        self.state.attempt = attempt;
        log(out, LogLevel::Info, "Connecting");
        out.push(Action::Connect { session, attempt });
    }

    fn fail_permanently(&mut self, reason: FailureReason, out: &mut Vec<Action>) {
        self.state.should_reconnect = false;
        self.state.last_error = Some(reason.to_string());
        self.cancel_retry(out);
        self.phase = Phase::PermanentlyFailed { reason };
        log(out, LogLevel::Error, reason);
    }

    /// Invalidates any timer already scheduled, even one that has fired but
    /// not yet been delivered.
    fn cancel_retry(&mut self, out: &mut Vec<Action>) {
        self.retry_generation += 1;
        out.push(Action::CancelRetry);
    }
}

fn log(out: &mut Vec<Action>, level: LogLevel, message: impl fmt::Display) {
    out.push(Action::Log {
        level,
        message: message.to_string(),
    });
}
