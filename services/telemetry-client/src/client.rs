//! Public telemetry client: command surface plus the driver task that runs
//! the reconnect machine against real sessions and timers.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, Sleep};
use tracing::{debug, info, warn};

use crate::cache::{LatestValueCache, SnapshotRef};
use crate::config::ClientConfig;
use crate::session::{self, SessionConfig, SessionEnvelope, SessionEvent, SessionHandle, SessionId};
use crate::status_log::{LogEntry, StatusLog};
use crate::supervisor::{Action, ClientStatus, Input, ReconnectMachine};
use crate::target::{BaseTargetResolver, ConnectionTarget, TargetError, TokenProvider};

const STATUS_LOG_CAPACITY: usize = 200;

/// Upper bound on waiting for closing sessions to deliver their close frame.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

enum Command {
    Input(Input),
    Shutdown(oneshot::Sender<()>),
}

type Resolved = (SessionId, u32, Result<ConnectionTarget, TargetError>);

/// Handle to a running telemetry client. Clones share the same client; the
/// driver shuts down once every clone is dropped or [`TelemetryClient::shutdown`]
/// is called on any of them.
///
/// None of the methods fail or block. Commands take effect asynchronously and
/// are observable through [`TelemetryClient::subscribe_status`].
#[derive(Clone)]
pub struct TelemetryClient {
    commands: mpsc::UnboundedSender<Command>,
    cache: LatestValueCache,
    status_rx: watch::Receiver<ClientStatus>,
    log: Arc<StatusLog>,
}

impl TelemetryClient {
    /// Start the driver task. Must be called inside a tokio runtime.
    pub fn spawn(
        config: ClientConfig,
        tokens: Arc<dyn TokenProvider>,
        base: Arc<dyn BaseTargetResolver>,
    ) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (resolved_tx, resolved_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ClientStatus::default());
        let cache = LatestValueCache::new(config.cache.tick);
        let log = Arc::new(StatusLog::new(STATUS_LOG_CAPACITY));

        let driver = Driver {
            machine: ReconnectMachine::new(config.supervisor),
            session_cfg: config.session,
            ws_path: config.server.ws_path,
            tokens,
            base,
            cache: cache.clone(),
            status_tx,
            log: Arc::clone(&log),
            events_tx,
            resolved_tx,
            session: None,
            closing: Vec::new(),
            retry: None,
        };
        tokio::spawn(driver.run(commands_rx, events_rx, resolved_rx));

        Self {
            commands,
            cache,
            status_rx,
            log,
        }
    }

    pub fn enable(&self) {
        self.send(Input::Enable);
    }

    pub fn disable(&self) {
        self.send(Input::Disable);
    }

    pub fn manual_reconnect(&self) {
        self.send(Input::ManualReconnect);
    }

    /// Disable the client, wait for open sessions to send their close frame,
    /// and stop the driver. Later commands on any clone are ignored.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(done_tx)).is_err() {
            return;
        }
        let _ = done_rx.await;
    }

    pub fn current_value(&self) -> SnapshotRef {
        self.cache.current_value()
    }

    pub fn current_status(&self) -> ClientStatus {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ClientStatus> {
        self.status_rx.clone()
    }

    /// Coalesced telemetry change feed.
    pub fn subscribe(&self) -> watch::Receiver<SnapshotRef> {
        self.cache.subscribe()
    }

    /// Coalesced change notifications delivered so far.
    pub fn value_notifications(&self) -> u64 {
        self.cache.notification_count()
    }

    pub fn recent_log(&self) -> Vec<LogEntry> {
        self.log.entries()
    }

    pub fn subscribe_log(&self) -> broadcast::Receiver<LogEntry> {
        self.log.subscribe()
    }

    fn send(&self, input: Input) {
        if self.commands.send(Command::Input(input)).is_err() {
            debug!("telemetry client driver has stopped");
        }
    }
}

enum Wake {
    Command(Option<Command>),
    Session(SessionEnvelope),
    Resolved(Resolved),
    Retry(u64),
}

struct Driver {
    machine: ReconnectMachine,
    session_cfg: SessionConfig,
    ws_path: String,
    tokens: Arc<dyn TokenProvider>,
    base: Arc<dyn BaseTargetResolver>,
    cache: LatestValueCache,
    status_tx: watch::Sender<ClientStatus>,
    log: Arc<StatusLog>,
    events_tx: mpsc::UnboundedSender<SessionEnvelope>,
    resolved_tx: mpsc::UnboundedSender<Resolved>,
    session: Option<SessionHandle>,
    /// Retired sessions that may still be sending their close frame.
    closing: Vec<SessionHandle>,
    retry: Option<(u64, Pin<Box<Sleep>>)>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<SessionEnvelope>,
        mut resolved: mpsc::UnboundedReceiver<Resolved>,
    ) {
        loop {
            let wake = tokio::select! {
                cmd = commands.recv() => Wake::Command(cmd),
                Some(envelope) = events.recv() => Wake::Session(envelope),
                Some(target) = resolved.recv() => Wake::Resolved(target),
                generation = retry_due(&mut self.retry) => Wake::Retry(generation),
            };
            match wake {
                Wake::Command(Some(Command::Input(input))) => self.apply(input),
                Wake::Command(Some(Command::Shutdown(done))) => {
                    info!("telemetry client shutting down");
                    self.shutdown().await;
                    let _ = done.send(());
                    return;
                }
                Wake::Command(None) => {
                    info!("telemetry client handle dropped, shutting down");
                    self.shutdown().await;
                    return;
                }
                Wake::Session(envelope) => self.apply(Input::Session {
                    id: envelope.session,
                    event: envelope.event,
                }),
                Wake::Resolved((id, attempt, result)) => {
                    if let Some(input) = self.open_resolved(id, attempt, result) {
                        self.apply(input);
                    }
                }
                Wake::Retry(generation) => self.apply(Input::RetryDue { generation }),
            }
        }
    }

    async fn shutdown(&mut self) {
        self.apply(Input::Disable);
        if let Some(handle) = self.session.take() {
            handle.close();
            self.closing.push(handle);
        }
        for handle in std::mem::take(&mut self.closing) {
            let id = handle.id();
            if tokio::time::timeout(SHUTDOWN_GRACE, handle.join()).await.is_err() {
                warn!(session = %id, "session did not close within grace period");
            }
        }
    }

    /// Feed one input through the machine, including any follow-up inputs
    /// produced while carrying out its actions.
    fn apply(&mut self, input: Input) {
        let mut pending = VecDeque::from([input]);
        while let Some(input) = pending.pop_front() {
            for action in self.machine.handle(input, Instant::now()) {
                if let Some(follow_up) = self.execute(action) {
                    pending.push_back(follow_up);
                }
            }
        }
        let status = self.machine.status();
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    fn execute(&mut self, action: Action) -> Option<Input> {
        match action {
            Action::Connect { session, attempt } => {
                self.resolve_target(session, attempt);
                None
            }
            Action::CloseSession { session } => {
                if let Some(handle) = self.session.take_if(|h| h.id() == session) {
                    self.retire(handle);
                }
                None
            }
            Action::ScheduleRetry { generation, delay } => {
                self.retry = Some((generation, Box::pin(tokio::time::sleep(delay))));
                None
            }
            Action::CancelRetry => {
                self.retry = None;
                None
            }
            Action::Publish(value) => {
                self.cache.publish(value);
                None
            }
            Action::ClearCache => {
                self.cache.clear();
                None
            }
            Action::Log { level, message } => {
                self.log.log_at(level, message);
                None
            }
        }
    }

    /// Token providers may touch the filesystem, so resolution runs on the
    /// blocking pool and reports back through `resolved_tx`.
    fn resolve_target(&self, id: SessionId, attempt: u32) {
        let base = Arc::clone(&self.base);
        let tokens = Arc::clone(&self.tokens);
        let ws_path = self.ws_path.clone();
        let resolved_tx = self.resolved_tx.clone();
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || {
                ConnectionTarget::resolve(&*base, &*tokens, &ws_path)
            })
            .await
            .unwrap_or_else(|e| Err(TargetError::ResolverFailed(e.to_string())));
            let _ = resolved_tx.send((id, attempt, result));
        });
    }

    fn open_resolved(
        &mut self,
        id: SessionId,
        attempt: u32,
        result: Result<ConnectionTarget, TargetError>,
    ) -> Option<Input> {
        if self.machine.current_session() != Some(id) {
            debug!(session = %id, "dropping target resolved for stale session");
            return None;
        }
        let target = match result {
            Ok(target) => target,
            Err(TargetError::NotAuthenticated) => {
                return Some(Input::NotAuthenticated { session: id });
            }
            Err(e) => return Some(errored(id, e)),
        };
        info!(session = %id, attempt, url = %target.redacted(), "opening session");
        let request = match target.into_request() {
            Ok(request) => request,
            Err(e) => return Some(errored(id, e)),
        };
        let handle = session::open(id, request, self.session_cfg, self.events_tx.clone());
        if let Some(previous) = self.session.replace(handle) {
            self.retire(previous);
        }
        None
    }

    fn retire(&mut self, handle: SessionHandle) {
        handle.close();
        self.closing.retain(|h| !h.is_finished());
        self.closing.push(handle);
    }
}

fn errored(id: SessionId, e: TargetError) -> Input {
    Input::Session {
        id,
        event: SessionEvent::Errored(e.to_string()),
    }
}

async fn retry_due(retry: &mut Option<(u64, Pin<Box<Sleep>>)>) -> u64 {
    match retry {
        Some((generation, sleep)) => {
            let generation = *generation;
            sleep.as_mut().await;
            *retry = None;
            generation
        }
        None => std::future::pending().await,
    }
}
