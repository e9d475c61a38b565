//! In-process mock relay for the end-to-end tests.
//!
//! Speaks just enough of the relay protocol to drive a listener: it
//! accepts the control-channel upgrade at `/$hc/<entity>` with
//! `sb-hc-action=listen`, lets tests push commands over it, pairs
//! rendezvous dials with waiting tests, and records rejection dials
//! (`statusCode`/`statusDescription` query parameters).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;
use url::Url;

pub type ServerWs = WebSocketStream<TcpStream>;

pub struct MockRelay {
    local_addr: SocketAddr,
    entity: String,
    state: Arc<RelayState>,
    controls: Mutex<mpsc::UnboundedReceiver<ControlHandle>>,
    rejections: Mutex<mpsc::UnboundedReceiver<Rejection>>,
    accept_task: tokio::task::JoinHandle<()>,
}

struct RelayState {
    control_tx: mpsc::UnboundedSender<ControlHandle>,
    rejection_tx: mpsc::UnboundedSender<Rejection>,
    pending_rendezvous: Mutex<HashMap<String, oneshot::Sender<ServerWs>>>,
    /// When set, every upgrade is refused with HTTP 404, as if the
    /// hybrid connection entity had been deleted.
    not_found: AtomicBool,
}

/// One control connection as seen by the relay.
pub struct ControlHandle {
    /// Query parameters of the upgrade request (decoded).
    pub query: HashMap<String, String>,
    /// Value of the `ServiceBusAuthorization` header, when present.
    pub authorization: Option<String>,
    to_listener: mpsc::UnboundedSender<Message>,
    from_listener: mpsc::UnboundedReceiver<Message>,
    kill: Option<oneshot::Sender<()>>,
}

/// A rejection dial observed by the relay.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub status_code: String,
    pub status_description: String,
}

impl MockRelay {
    pub async fn start(entity: &str) -> MockRelay {
        let tcp = TcpListener::bind("127.0.0.1:0").await.expect("bind mock relay");
        let local_addr = tcp.local_addr().expect("local addr");

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (rejection_tx, rejection_rx) = mpsc::unbounded_channel();
        let state = Arc::new(RelayState {
            control_tx,
            rejection_tx,
            pending_rendezvous: Mutex::new(HashMap::new()),
            not_found: AtomicBool::new(false),
        });

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = tcp.accept().await else {
                    return;
                };
                let state = accept_state.clone();
                tokio::spawn(async move {
                    if let Err(error) = handle_connection(stream, state).await {
                        eprintln!("mock relay connection error: {error}");
                    }
                });
            }
        });

        MockRelay {
            local_addr,
            entity: entity.to_string(),
            state,
            controls: Mutex::new(control_rx),
            rejections: Mutex::new(rejection_rx),
            accept_task,
        }
    }

    /// Listener address for this relay, to be used with
    /// `insecure_transport(true)`.
    pub fn address(&self) -> Url {
        Url::parse(&format!("sb://{}/{}", self.local_addr, self.entity)).expect("address")
    }

    /// Rendezvous URL handed out in accept commands.
    pub fn rendezvous_url(&self, id: &str) -> String {
        format!(
            "ws://{}/$hc/{}/{id}?sb-hc-action=accept&sb-hc-id={id}",
            self.local_addr, self.entity
        )
    }

    /// Waits for the next control connection.
    pub async fn next_control(&self, timeout: Duration) -> ControlHandle {
        let mut controls = self.controls.lock().await;
        tokio::time::timeout(timeout, controls.recv())
            .await
            .expect("timed out waiting for a control connection")
            .expect("mock relay stopped")
    }

    /// Registers interest in a rendezvous dial for `id`; resolve the
    /// returned receiver to get the relay-side socket.
    pub async fn expect_rendezvous(&self, id: &str) -> oneshot::Receiver<ServerWs> {
        let (tx, rx) = oneshot::channel();
        self.state
            .pending_rendezvous
            .lock()
            .await
            .insert(id.to_string(), tx);
        rx
    }

    /// Makes the relay answer every further upgrade with HTTP 404.
    pub fn set_not_found(&self, not_found: bool) {
        self.state.not_found.store(not_found, Ordering::SeqCst);
    }

    /// Waits for the next rejection dial.
    pub async fn next_rejection(&self, timeout: Duration) -> Rejection {
        let mut rejections = self.rejections.lock().await;
        tokio::time::timeout(timeout, rejections.recv())
            .await
            .expect("timed out waiting for a rejection")
            .expect("mock relay stopped")
    }
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

impl ControlHandle {
    /// Pushes an `accept` command for `id` over the control channel.
    pub fn send_accept(&self, rendezvous_url: &str, id: &str, connect_headers: serde_json::Value) {
        self.send_json(serde_json::json!({
            "accept": {
                "id": id,
                "address": rendezvous_url,
                "connectHeaders": connect_headers,
                "remoteEndpoint": {"address": "203.0.113.7", "port": 50231},
            }
        }));
    }

    /// Pushes a `request` command over the control channel.
    pub fn send_request(&self, id: &str, method: &str, target: &str) {
        self.send_json(serde_json::json!({
            "request": {
                "id": id,
                "method": method,
                "requestTarget": target,
            }
        }));
    }

    pub fn send_json(&self, value: serde_json::Value) {
        self.to_listener
            .send(Message::Text(value.to_string()))
            .expect("control connection gone");
    }

    pub fn send_raw(&self, message: Message) {
        self.to_listener.send(message).expect("control connection gone");
    }

    /// Next frame sent by the listener (responses, renewToken, bodies).
    pub async fn next_frame(&mut self, timeout: Duration) -> Message {
        tokio::time::timeout(timeout, self.from_listener.recv())
            .await
            .expect("timed out waiting for a listener frame")
            .expect("control connection gone")
    }

    /// Next frame parsed as JSON.
    pub async fn next_json(&mut self, timeout: Duration) -> serde_json::Value {
        match self.next_frame(timeout).await {
            Message::Text(text) => serde_json::from_str(&text).expect("listener sent invalid JSON"),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    /// Drops the TCP connection without a close handshake, simulating an
    /// unexpected disconnect.
    pub fn drop_connection(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<RelayState>) -> anyhow::Result<()> {
    let mut path = String::new();
    let mut query: HashMap<String, String> = HashMap::new();
    let mut authorization = None;

    let not_found = state.not_found.load(Ordering::SeqCst);
    let upgrade = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        if not_found {
            let refusal = tokio_tungstenite::tungstenite::http::Response::builder()
                .status(404)
                .body(None)
                .expect("build 404 response");
            return Err(refusal);
        }
        path = req.uri().path().to_string();
        if let Some(raw) = req.uri().query() {
            query = url::form_urlencoded::parse(raw.as_bytes())
                .into_owned()
                .collect();
        }
        authorization = req
            .headers()
            .get("ServiceBusAuthorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(resp)
    })
    .await;
    let ws = match upgrade {
        Ok(ws) => ws,
        // Refused handshakes (the 404 mode) are expected.
        Err(_) => return Ok(()),
    };

    if query.get("sb-hc-action").map(String::as_str) == Some("listen") {
        serve_control(ws, query, authorization, &state);
        return Ok(());
    }

    if let Some(status_code) = query.get("statusCode") {
        let rejection = Rejection {
            status_code: status_code.clone(),
            status_description: query.get("statusDescription").cloned().unwrap_or_default(),
        };
        let _ = state.rejection_tx.send(rejection);
        // The real service refuses rejected rendezvous dials; completing
        // the handshake and dropping is close enough for the listener.
        drop(ws);
        return Ok(());
    }

    // Rendezvous dial: the id is the last path segment.
    let id = path.rsplit('/').next().unwrap_or_default().to_string();
    let waiter = state.pending_rendezvous.lock().await.remove(&id);
    match waiter {
        Some(waiter) => {
            let _ = waiter.send(ws);
        }
        None => {
            eprintln!("mock relay: unexpected rendezvous dial for {id}");
        }
    }
    Ok(())
}

fn serve_control(
    ws: ServerWs,
    query: HashMap<String, String>,
    authorization: Option<String>,
    state: &RelayState,
) {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Message>();
    let (kill_tx, mut kill_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let (mut sink, mut source) = ws.split();
        loop {
            tokio::select! {
                _ = &mut kill_rx => {
                    // Abrupt drop, no close frame.
                    return;
                }
                outgoing = out_rx.recv() => {
                    match outgoing {
                        Some(message) => {
                            if sink.send(message).await.is_err() {
                                return;
                            }
                        }
                        None => return,
                    }
                }
                incoming = source.next() => {
                    match incoming {
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = sink.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(message)) => {
                            let _ = in_tx.send(message);
                        }
                    }
                }
            }
        }
    });

    let _ = state.control_tx.send(ControlHandle {
        query,
        authorization,
        to_listener: out_tx,
        from_listener: in_rx,
        kill: Some(kill_tx),
    });
}
