//! The listener facade.
//!
//! Owns the control connection, the accepted-channel queue, and the
//! user-installed handlers, and runs the accept pipeline that turns
//! `accept` commands into [`RelayChannel`]s or rejections.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use url::Url;

use hc_common::{RelayConnectionString, RelayError, RelayResult};
use hc_protocol::{
    query, AcceptCommand, RequestCommand, CLOSE_NORMAL, DEFAULT_OPERATION_TIMEOUT,
    DEFAULT_TOKEN_VALIDITY, MAX_CHANNEL_MESSAGE_SIZE, MAX_CONTROL_FRAME_SIZE,
    RENDEZVOUS_CONNECT_TIMEOUT,
};

use crate::address;
use crate::channel::RelayChannel;
use crate::context::{ListenerContext, STATUS_PLACEHOLDER};
use crate::control::{ControlConnection, ControlEvents};
use crate::httpbridge;
use crate::queue::InputQueue;
use crate::token::{SasTokenProvider, TokenProvider};
use crate::tracking::TrackingContext;
use crate::ws;

/// Inspects an inbound connection request and decides whether to accept
/// it; may adjust the response status/headers before a rejection.
pub type AcceptHandler = Arc<dyn Fn(&mut ListenerContext) -> bool + Send + Sync>;

/// Answers a relayed HTTP request by mutating the context's response.
pub type RequestHandler = Arc<dyn Fn(&mut ListenerContext) + Send + Sync>;

type OnlineHandler = Arc<dyn Fn() + Send + Sync>;
type OfflineHandler = Arc<dyn Fn(Option<&RelayError>) + Send + Sync>;
type ConnectingHandler = Arc<dyn Fn(&RelayError) + Send + Sync>;

/// Facade lifecycle. A listener opens at most once and ends closed;
/// `Closing` is observable while unaccepted channels are drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Open,
    Closing,
    Closed,
}

#[derive(Default)]
struct Handlers {
    accept: Mutex<Option<AcceptHandler>>,
    request: Mutex<Option<RequestHandler>>,
    online: Mutex<Option<OnlineHandler>>,
    offline: Mutex<Option<OfflineHandler>>,
    connecting: Mutex<Option<ConnectingHandler>>,
}

/// Accepts inbound hybrid connections through a cloud relay without any
/// listening ports: one outbound control channel, one outbound
/// rendezvous dial per accepted peer.
pub struct Listener {
    core: Arc<ListenerCore>,
}

struct ListenerCore {
    address: Url,
    tracking: Arc<TrackingContext>,
    operation_timeout: Duration,
    queue: InputQueue<RelayChannel>,
    control: ControlConnection,
    handlers: Handlers,
    lifecycle: Mutex<Lifecycle>,
    weak_self: Weak<ListenerCore>,
}

/// Configures and builds a [`Listener`].
pub struct ListenerBuilder {
    address: Url,
    provider: Arc<dyn TokenProvider>,
    operation_timeout: Duration,
    token_validity: Duration,
    insecure: bool,
}

impl ListenerBuilder {
    /// Default timeout applied by the no-argument `open`/`close`
    /// variants and to internally-timed operations.
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Validity requested for each security token.
    pub fn token_validity(mut self, validity: Duration) -> Self {
        self.token_validity = validity;
        self
    }

    /// Uses plain `ws://` for the control channel. Only meaningful for
    /// loopback relays; production relays require TLS.
    pub fn insecure_transport(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    pub fn build(self) -> RelayResult<Listener> {
        address::validate_listener_address(&self.address)?;
        let tracking = Arc::new(TrackingContext::new(self.address.to_string()));
        let control = ControlConnection::new(
            self.address.clone(),
            tracking.clone(),
            self.provider,
            self.token_validity,
            !self.insecure,
        );
        let core = Arc::new_cyclic(|weak| ListenerCore {
            address: self.address,
            tracking,
            operation_timeout: self.operation_timeout,
            queue: InputQueue::new(),
            control,
            handlers: Handlers::default(),
            lifecycle: Mutex::new(Lifecycle::Created),
            weak_self: weak.clone(),
        });
        let events: Arc<dyn ControlEvents> = core.clone();
        core.control.set_events(Arc::downgrade(&events));
        Ok(Listener { core })
    }
}

impl Listener {
    /// Starts configuring a listener for `address`
    /// (`sb://namespace/hybrid-connection`) authorized by `provider`.
    pub fn builder(address: Url, provider: Arc<dyn TokenProvider>) -> ListenerBuilder {
        ListenerBuilder {
            address,
            provider,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            token_validity: DEFAULT_TOKEN_VALIDITY,
            insecure: false,
        }
    }

    /// Builds a listener with default options.
    pub fn new(address: Url, provider: Arc<dyn TokenProvider>) -> RelayResult<Listener> {
        Listener::builder(address, provider).build()
    }

    /// Builds a listener from a connection string whose `EntityPath`
    /// names the hybrid connection.
    pub fn from_connection_string(connection_string: &str) -> RelayResult<Listener> {
        let parsed = RelayConnectionString::from_str(connection_string)?;
        let path = parsed.entity_path.clone().ok_or_else(|| {
            RelayError::InvalidArgument("connection string is missing EntityPath".into())
        })?;
        Listener::from_parsed(parsed, &path)
    }

    /// Builds a listener from a connection string without `EntityPath`,
    /// using `path` as the hybrid connection name.
    pub fn from_connection_string_with_path(
        connection_string: &str,
        path: &str,
    ) -> RelayResult<Listener> {
        let parsed = RelayConnectionString::from_str(connection_string)?;
        if parsed.entity_path.is_some() {
            return Err(RelayError::InvalidArgument(
                "EntityPath must not appear in the connection string when a path is given".into(),
            ));
        }
        Listener::from_parsed(parsed, path)
    }

    fn from_parsed(parsed: RelayConnectionString, path: &str) -> RelayResult<Listener> {
        parsed.validate()?;
        let address = parsed.address_for(path)?;
        let provider = Arc::new(SasTokenProvider::new(
            parsed.shared_access_key_name.clone().unwrap_or_default(),
            parsed.shared_access_key.clone().unwrap_or_default(),
        ));
        let mut builder = Listener::builder(address, provider);
        if let Some(timeout) = parsed.operation_timeout {
            builder = builder.operation_timeout(timeout);
        }
        builder.build()
    }

    pub fn address(&self) -> &Url {
        &self.core.address
    }

    pub fn tracking(&self) -> &TrackingContext {
        &self.core.tracking
    }

    pub fn operation_timeout(&self) -> Duration {
        self.core.operation_timeout
    }

    /// True between a successful connect and the next disconnect edge.
    pub fn is_online(&self) -> bool {
        self.core.control.is_online()
    }

    /// The most recent control-channel error, if any.
    pub fn last_error(&self) -> Option<Arc<RelayError>> {
        self.core.control.last_error()
    }

    // ─── Handlers ────────────────────────────────────────────

    /// Predicate run for every inbound connection request; return
    /// `false` to reject (optionally setting a response status first).
    pub fn set_accept_handler(
        &self,
        handler: impl Fn(&mut ListenerContext) -> bool + Send + Sync + 'static,
    ) {
        *self.core.handlers.accept.lock().unwrap() = Some(Arc::new(handler));
    }

    /// Handler run for every relayed HTTP request.
    pub fn set_request_handler(
        &self,
        handler: impl Fn(&mut ListenerContext) + Send + Sync + 'static,
    ) {
        *self.core.handlers.request.lock().unwrap() = Some(Arc::new(handler));
    }

    /// Runs after the listener (re-)establishes its control channel.
    pub fn set_online_handler(&self, handler: impl Fn() + Send + Sync + 'static) {
        *self.core.handlers.online.lock().unwrap() = Some(Arc::new(handler));
    }

    /// Runs when the listener goes offline for good; no reconnect is
    /// attempted afterwards.
    pub fn set_offline_handler(
        &self,
        handler: impl Fn(Option<&RelayError>) + Send + Sync + 'static,
    ) {
        *self.core.handlers.offline.lock().unwrap() = Some(Arc::new(handler));
    }

    /// Runs when the listener loses its control channel and is about to
    /// reconnect.
    pub fn set_connecting_handler(&self, handler: impl Fn(&RelayError) + Send + Sync + 'static) {
        *self.core.handlers.connecting.lock().unwrap() = Some(Arc::new(handler));
    }

    // ─── Lifecycle ───────────────────────────────────────────

    /// Registers this listener with the relay. One-shot: a listener
    /// cannot be reopened.
    pub async fn open(&self) -> RelayResult<()> {
        self.open_with_timeout(self.core.operation_timeout).await
    }

    pub async fn open_with_timeout(&self, timeout: Duration) -> RelayResult<()> {
        {
            let mut lifecycle = self.core.lifecycle.lock().unwrap();
            match *lifecycle {
                Lifecycle::Created => *lifecycle = Lifecycle::Open,
                Lifecycle::Open => {
                    return Err(RelayError::InvalidOperation(
                        "the listener is already open".into(),
                    ));
                }
                Lifecycle::Closing | Lifecycle::Closed => {
                    return Err(RelayError::InvalidOperation(
                        "the listener is closed".into(),
                    ));
                }
            }
        }
        self.core.control.open(timeout).await
    }

    /// Unregisters from the relay: wakes pending accepts with `None`,
    /// closes unaccepted channels, then closes the control channel.
    /// Idempotent.
    pub async fn close(&self) -> RelayResult<()> {
        self.close_with_timeout(self.core.operation_timeout).await
    }

    pub async fn close_with_timeout(&self, timeout: Duration) -> RelayResult<()> {
        {
            let mut lifecycle = self.core.lifecycle.lock().unwrap();
            match *lifecycle {
                Lifecycle::Closing | Lifecycle::Closed => return Ok(()),
                _ => *lifecycle = Lifecycle::Closing,
            }
        }
        tracing::info!(listener = %self, "closing");
        let deadline = tokio::time::Instant::now() + timeout;

        // Wakes every parked accept_connection with None and stops new
        // enqueues; items already in flight stay readable below.
        self.core.queue.shutdown();
        while self.core.queue.pending_count() > 0 {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match self.core.queue.dequeue_timeout(remaining).await {
                Some(channel) => {
                    let _ = channel
                        .close(Some((CLOSE_NORMAL, "Client closing the socket normally")))
                        .await;
                }
                None => break,
            }
        }

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let result = self.core.control.close(remaining).await;
        self.core.queue.dispose();
        *self.core.lifecycle.lock().unwrap() = Lifecycle::Closed;
        tracing::info!(listener = %self, "closed");
        result
    }

    /// Waits for the next accepted channel. Resolves `None` once the
    /// listener closes.
    pub async fn accept_connection(&self) -> RelayResult<Option<RelayChannel>> {
        {
            let lifecycle = self.core.lifecycle.lock().unwrap();
            if *lifecycle == Lifecycle::Created {
                return Err(RelayError::InvalidOperation(
                    "cannot accept connections because the listener is not open".into(),
                ));
            }
        }
        Ok(self.core.queue.dequeue().await)
    }
}

impl fmt::Display for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Listener({})", self.core.tracking)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let lifecycle = *self.core.lifecycle.lock().unwrap();
        if lifecycle != Lifecycle::Closed {
            self.core.queue.shutdown();
            self.core.control.shutdown_sync();
        }
    }
}

impl ListenerCore {
    fn accept_handler(&self) -> Option<AcceptHandler> {
        self.handlers.accept.lock().unwrap().clone()
    }

    async fn handle_accept(self: Arc<Self>, command: AcceptCommand) {
        let id = command.id.clone();
        let address = command.address.clone();
        if let Err(error) = self.accept_exchange(command).await {
            tracing::warn!(id = %id, rendezvous = %address, %error, "rendezvous failed");
        }
    }

    async fn accept_exchange(&self, command: AcceptCommand) -> RelayResult<()> {
        let rendezvous = Url::parse(&command.address)?;
        let request_uri = address::accept_request_uri(&self.address, &rendezvous)?;
        let tracking = Arc::new(TrackingContext::with_tracking_id(
            command.id,
            request_uri.as_str(),
        ));
        let mut context = ListenerContext::for_accept(
            tracking,
            request_uri,
            command.connect_headers,
            command.remote_endpoint,
        );

        let handler = self.accept_handler();
        let mut should_accept = handler.is_none();
        if let Some(handler) = handler {
            match catch_unwind(AssertUnwindSafe(|| handler(&mut context))) {
                Ok(decision) => should_accept = decision,
                Err(_) => {
                    let description = format!(
                        "The listener's accept handler failed. TrackingId: {}",
                        context.tracking().tracking_id()
                    );
                    tracing::warn!(
                        tracking_id = %context.tracking().tracking_id(),
                        "accept handler panicked"
                    );
                    context.response_mut().set_status(502, description);
                    should_accept = false;
                }
            }
        }

        if should_accept {
            self.complete_accept(context, rendezvous).await
        } else {
            self.reject(context, rendezvous).await
        }
    }

    /// Dials the rendezvous URL and hands the channel to the queue. Runs
    /// off the pump so a slow rendezvous cannot head-of-line-block other
    /// commands.
    async fn complete_accept(&self, context: ListenerContext, rendezvous: Url) -> RelayResult<()> {
        if *self.lifecycle.lock().unwrap() != Lifecycle::Open {
            tracing::info!(rendezvous = %rendezvous, "listener is closing, dropping rendezvous");
            return Ok(());
        }
        tracing::debug!(rendezvous = %rendezvous, "dialing rendezvous");
        let stream = ws::connect(
            &rendezvous,
            None,
            RENDEZVOUS_CONNECT_TIMEOUT,
            MAX_CHANNEL_MESSAGE_SIZE,
        )
        .await?;
        let channel = RelayChannel::new(context.tracking_arc(), stream);
        if !self.queue.enqueue(channel) {
            // Closed while dialing; dropping the channel closes the socket.
            tracing::info!("listener closed before the rendezvous was handed over");
        }
        Ok(())
    }

    /// Notifies the relay of a rejection by dialing the rendezvous URL
    /// with the status appended; the relay acknowledges by refusing the
    /// upgrade, so a failed dial is the expected outcome.
    async fn reject(&self, mut context: ListenerContext, rendezvous: Url) -> RelayResult<()> {
        {
            let response = context.response_mut();
            if response.status_code == STATUS_PLACEHOLDER {
                response.set_status(400, "Rejected by user code");
            }
        }
        let response = context.response();
        tracing::debug!(
            status = response.status_code,
            description = %response.status_description,
            "rejecting rendezvous"
        );

        let mut reject_url = rendezvous;
        reject_url
            .query_pairs_mut()
            .append_pair(query::STATUS_CODE, &response.status_code.to_string())
            .append_pair(query::STATUS_DESCRIPTION, &response.status_description);

        match ws::connect(
            &reject_url,
            None,
            RENDEZVOUS_CONNECT_TIMEOUT,
            MAX_CONTROL_FRAME_SIZE,
        )
        .await
        {
            Ok(mut stream) => {
                let _ = stream.close(None).await;
            }
            Err(error) => {
                tracing::debug!(%error, "rejection dial refused by the relay");
            }
        }
        Ok(())
    }
}

impl ControlEvents for ListenerCore {
    fn on_accept(&self, command: AcceptCommand) {
        let Some(core) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(core.handle_accept(command));
    }

    fn on_request(&self, command: RequestCommand, body: Option<Vec<u8>>) {
        let Some(core) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let handler = core.handlers.request.lock().unwrap().clone();
            let id = command.id.clone();
            if let Err(error) = httpbridge::handle_request(
                &core.address,
                &core.control,
                handler,
                command,
                body,
                core.operation_timeout,
            )
            .await
            {
                tracing::warn!(id = %id, %error, "failed to answer relayed request");
            }
        });
    }

    fn on_online(&self) {
        let handler = self.handlers.online.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    fn on_offline(&self, error: Option<&RelayError>) {
        let handler = self.handlers.offline.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(error);
        }
    }

    fn on_connecting(&self, error: &RelayError) {
        let handler = self.handlers.connecting.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(error);
        }
    }
}

impl fmt::Display for ListenerCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Listener({})", self.tracking)
    }
}
