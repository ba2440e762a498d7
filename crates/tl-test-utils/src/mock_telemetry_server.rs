// mock_telemetry_server: An in-process telemetry WebSocket server for tests.
//
// Mirrors the production server closely enough to exercise the client's
// reconnect behavior: the token arrives as a `token` query parameter (or a
// Bearer header), keepalive probes are answered with `pong`, and telemetry
// is pushed as `{"type":"telemetry","data":...}` envelopes.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::handshake::server::{Callback, ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};

/// What the server does with the next incoming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPlan {
    /// Complete the handshake and serve the connection until told otherwise.
    Accept,
    /// Refuse the WebSocket upgrade with this HTTP status.
    RejectHandshake(u16),
    /// Complete the handshake, then immediately close with this code.
    CloseWith(u16),
    /// Complete the handshake, then drop the socket without a close frame.
    Drop,
}

#[derive(Debug, Clone)]
enum Push {
    Text(String),
    Binary(Vec<u8>),
    Close(u16),
    Kick,
}

struct Shared {
    plans: Mutex<VecDeque<ConnectionPlan>>,
    default_plan: Mutex<ConnectionPlan>,
    connections: AtomicUsize,
    live: AtomicUsize,
    probes: AtomicUsize,
    tokens: Mutex<Vec<Option<String>>>,
    client_close_codes: Mutex<Vec<Option<u16>>>,
    push_tx: broadcast::Sender<Push>,
}

impl Shared {
    fn next_plan(&self) -> ConnectionPlan {
        let queued = self.plans.lock().ok().and_then(|mut plans| plans.pop_front());
        queued.unwrap_or_else(|| {
            self.default_plan
                .lock()
                .map(|plan| *plan)
                .unwrap_or(ConnectionPlan::Accept)
        })
    }
}

/// A scriptable telemetry server bound to a random localhost port.
///
/// Every connection consumes one queued [`ConnectionPlan`]; once the queue is
/// empty the default plan (initially [`ConnectionPlan::Accept`]) applies.
pub struct MockTelemetryServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    /// Accept loop; aborted when the server is dropped.
    task: tokio::task::JoinHandle<()>,
}

impl MockTelemetryServer {
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (push_tx, _) = broadcast::channel(256);
        let shared = Arc::new(Shared {
            plans: Mutex::new(VecDeque::new()),
            default_plan: Mutex::new(ConnectionPlan::Accept),
            connections: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
            tokens: Mutex::new(Vec::new()),
            client_close_codes: Mutex::new(Vec::new()),
            push_tx,
        });

        let loop_shared = Arc::clone(&shared);
        let task = tokio::spawn(async move {
            Self::accept_loop(listener, loop_shared).await;
        });

        Ok(Self { addr, shared, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// HTTP base URL, as a base-target resolver would hand it to the client.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn enqueue_plans(&self, plans: impl IntoIterator<Item = ConnectionPlan>) {
        if let Ok(mut queue) = self.shared.plans.lock() {
            queue.extend(plans);
        }
    }

    pub fn set_default_plan(&self, plan: ConnectionPlan) {
        if let Ok(mut default_plan) = self.shared.default_plan.lock() {
            *default_plan = plan;
        }
    }

    /// Push a telemetry envelope to every live connection.
    pub fn push_telemetry(&self, data: serde_json::Value) {
        let _ = self
            .shared
            .push_tx
            .send(Push::Text(tl_protocol::telemetry_frame(data)));
    }

    pub fn push_text(&self, text: impl Into<String>) {
        let _ = self.shared.push_tx.send(Push::Text(text.into()));
    }

    pub fn push_binary(&self, bytes: impl Into<Vec<u8>>) {
        let _ = self.shared.push_tx.send(Push::Binary(bytes.into()));
    }

    /// Close every live connection with a close frame carrying `code`.
    pub fn close_all(&self, code: u16) {
        let _ = self.shared.push_tx.send(Push::Close(code));
    }

    /// Drop every live connection without a close frame, as a crashed or
    /// restarted server would.
    pub fn kick_all(&self) {
        let _ = self.shared.push_tx.send(Push::Kick);
    }

    /// Number of TCP connections accepted so far (including rejected ones).
    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    pub fn live_connections(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    pub fn probe_count(&self) -> usize {
        self.shared.probes.load(Ordering::SeqCst)
    }

    /// Token presented by each connection attempt, in arrival order.
    pub fn tokens_seen(&self) -> Vec<Option<String>> {
        self.shared
            .tokens
            .lock()
            .map(|tokens| tokens.clone())
            .unwrap_or_default()
    }

    /// Close codes received from clients that closed their side.
    pub fn client_close_codes(&self) -> Vec<Option<u16>> {
        self.shared
            .client_close_codes
            .lock()
            .map(|codes| codes.clone())
            .unwrap_or_default()
    }

    /// Poll until `pred` holds or `limit` elapses. Returns the final outcome.
    pub async fn wait_until(&self, limit: Duration, pred: impl Fn(&Self) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if pred(self) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    // -- internal --

    async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
        while let Ok((stream, _peer)) = listener.accept().await {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                // Client-side drops are expected in reconnect tests.
                let _ = Self::handle_connection(stream, shared).await;
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        shared: Arc<Shared>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        shared.connections.fetch_add(1, Ordering::SeqCst);
        let plan = shared.next_plan();

        let callback = Handshake {
            shared: Arc::clone(&shared),
            plan,
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;

        match plan {
            ConnectionPlan::Accept => {}
            ConnectionPlan::RejectHandshake(_) => return Ok(()),
            ConnectionPlan::CloseWith(code) => {
                ws.send(close_message(code)).await?;
                return Ok(());
            }
            ConnectionPlan::Drop => return Ok(()),
        }

        let mut push_rx = shared.push_tx.subscribe();
        shared.live.fetch_add(1, Ordering::SeqCst);
        let result = Self::serve(&mut ws, &mut push_rx, &shared).await;
        shared.live.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn serve(
        ws: &mut tokio_tungstenite::WebSocketStream<TcpStream>,
        push_rx: &mut broadcast::Receiver<Push>,
        shared: &Shared,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            tokio::select! {
                push = push_rx.recv() => match push {
                    Ok(Push::Text(text)) => ws.send(Message::Text(text.into())).await?,
                    Ok(Push::Binary(bytes)) => ws.send(Message::Binary(bytes.into())).await?,
                    Ok(Push::Close(code)) => {
                        ws.send(close_message(code)).await?;
                        return Ok(());
                    }
                    Ok(Push::Kick) | Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                },
                msg = ws.next() => match msg {
                    None => return Ok(()),
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(Message::Text(text))) => {
                        if tl_protocol::is_probe(&text) {
                            shared.probes.fetch_add(1, Ordering::SeqCst);
                            ws.send(Message::Text(tl_protocol::ACK_LITERAL.into())).await?;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        if let Ok(mut codes) = shared.client_close_codes.lock() {
                            codes.push(frame.map(|f| u16::from(f.code)));
                        }
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                },
            }
        }
    }
}

impl Drop for MockTelemetryServer {
    fn drop(&mut self) {
        self.task.abort();
        let _ = self.shared.push_tx.send(Push::Kick);
    }
}

fn close_message(code: u16) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: "".into(),
    }))
}

/// Records the presented token and applies handshake rejection plans.
struct Handshake {
    shared: Arc<Shared>,
    plan: ConnectionPlan,
}

impl Callback for Handshake {
    fn on_request(self, request: &Request, response: Response) -> Result<Response, ErrorResponse> {
        let token = token_from_request(request);
        if let Ok(mut tokens) = self.shared.tokens.lock() {
            tokens.push(token);
        }

        match self.plan {
            ConnectionPlan::RejectHandshake(status) => {
                let mut rejection = ErrorResponse::new(Some("unauthorized".to_owned()));
                *rejection.status_mut() =
                    StatusCode::from_u16(status).unwrap_or(StatusCode::FORBIDDEN);
                Err(rejection)
            }
            _ => Ok(response),
        }
    }
}

fn token_from_request(request: &Request) -> Option<String> {
    let from_query = request.uri().query().and_then(|query| {
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == "token")
            .map(|(_, value)| value.into_owned())
    });
    from_query.or_else(|| {
        request
            .headers()
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::to_owned)
    })
}
