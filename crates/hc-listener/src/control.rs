//! The standing control connection to the relay.
//!
//! One outbound websocket carries every command the relay issues for
//! this listener. The connection moves through
//! `Idle → Connecting → Online`, drops to `Reconnecting` on transport
//! failures, and ends in `Closed` on a local close or a terminal error
//! (the entity no longer existing). Reconnects are scheduled with a
//! fixed backoff table and reuse the base tracking id so correlation
//! survives the relay's `_Gxx` decoration.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{watch, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message;
use url::Url;

use hc_common::{RelayError, RelayResult};
use hc_protocol::{
    AcceptCommand, ListenerCommand, RenewTokenCommand, RequestCommand,
    DEFAULT_OPERATION_TIMEOUT, MAX_CONTROL_FRAME_SIZE,
};

use crate::address::build_listen_url;
use crate::token::{TokenProvider, TokenRenewer};
use crate::tracking::TrackingContext;
use crate::ws::{self, WsSource};

/// Retry delays applied to successive failed connects; the index resets
/// on every successful online transition.
const CONNECT_DELAYS: [Duration; 6] = [
    Duration::ZERO,
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(30),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Idle,
    Connecting,
    Online,
    Reconnecting,
    Closed,
}

/// Callbacks out of the control connection. Implemented by the listener
/// core; held weakly so the listener owns the connection, never the
/// other way around.
pub(crate) trait ControlEvents: Send + Sync {
    fn on_accept(&self, command: AcceptCommand);
    fn on_request(&self, command: RequestCommand, body: Option<Vec<u8>>);
    fn on_online(&self);
    fn on_offline(&self, error: Option<&RelayError>);
    fn on_connecting(&self, error: &RelayError);
}

#[derive(Clone)]
pub(crate) struct ControlConnection {
    inner: Arc<ControlInner>,
}

struct ControlInner {
    address: Url,
    tracking: Arc<TrackingContext>,
    renewer: TokenRenewer,
    secure: bool,
    phase: watch::Sender<Phase>,
    state: Mutex<ControlState>,
    /// Write discipline: one command (plus its optional body frame) at a
    /// time. The pump is the sole reader; this lock is the sole writer.
    writer: AsyncMutex<Option<ws::WsSink>>,
    events: Mutex<Option<Weak<dyn ControlEvents>>>,
    close_notify: Notify,
}

struct ControlState {
    connect_delay_index: i32,
    last_error: Option<Arc<RelayError>>,
    close_requested: bool,
    pump: Option<JoinHandle<()>>,
}

impl ControlConnection {
    pub(crate) fn new(
        address: Url,
        tracking: Arc<TrackingContext>,
        provider: Arc<dyn TokenProvider>,
        token_validity: Duration,
        secure: bool,
    ) -> Self {
        let renewer = TokenRenewer::new(provider, address.to_string(), token_validity);
        let (phase, _) = watch::channel(Phase::Idle);
        ControlConnection {
            inner: Arc::new(ControlInner {
                address,
                tracking,
                renewer,
                secure,
                phase,
                state: Mutex::new(ControlState {
                    connect_delay_index: 0,
                    last_error: None,
                    close_requested: false,
                    pump: None,
                }),
                writer: AsyncMutex::new(None),
                events: Mutex::new(None),
                close_notify: Notify::new(),
            }),
        }
    }

    pub(crate) fn set_events(&self, events: Weak<dyn ControlEvents>) {
        *self.inner.events.lock().unwrap() = Some(events);
    }

    pub(crate) fn is_online(&self) -> bool {
        *self.inner.phase.borrow() == Phase::Online
    }

    /// Most recent transport error, kept for diagnostics.
    pub(crate) fn last_error(&self) -> Option<Arc<RelayError>> {
        self.inner.state.lock().unwrap().last_error.clone()
    }

    /// Connects the control channel, starts the read pump, and wires the
    /// token renewer so renewed tokens are pushed in-band.
    pub(crate) async fn open(&self, timeout: Duration) -> RelayResult<()> {
        {
            let _state = self.inner.state.lock().unwrap();
            let phase = *self.inner.phase.borrow();
            if phase != Phase::Idle {
                return Err(RelayError::InvalidOperation(format!(
                    "cannot open the control connection in phase {phase:?}"
                )));
            }
            self.inner.phase.send_replace(Phase::Connecting);
        }

        match self.inner.connect_once(timeout).await {
            Ok(stream) => {
                let (sink, source) = stream.split();
                *self.inner.writer.lock().await = Some(sink);
                self.inner.transition_online();

                let weak = Arc::downgrade(&self.inner);
                self.inner.renewer.set_on_token_renewed(move |token| {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    tokio::spawn(async move {
                        let command = ListenerCommand::RenewToken(RenewTokenCommand {
                            token: token.token().to_string(),
                        });
                        // The renewer retries on its own schedule; a failed
                        // push is only worth a warning.
                        if let Err(error) = inner
                            .send_command(&command, None, DEFAULT_OPERATION_TIMEOUT)
                            .await
                        {
                            tracing::warn!(%error, "failed to push renewed token");
                        }
                    });
                });

                let pump = tokio::spawn(run_pump(self.inner.clone(), source));
                self.inner.state.lock().unwrap().pump = Some(pump);
                self.inner.emit_online();
                Ok(())
            }
            Err(error) => {
                // Half-open sockets are torn down by dropping the connect
                // future; nothing is left to abort here.
                self.inner.phase.send_replace(Phase::Closed);
                self.inner.renewer.close();
                Err(error)
            }
        }
    }

    /// Sends `command` (and its optional body) once the channel is
    /// online, waiting out an in-flight reconnect if necessary.
    pub(crate) async fn send_command(
        &self,
        command: &ListenerCommand,
        body: Option<Vec<u8>>,
        timeout: Duration,
    ) -> RelayResult<()> {
        self.inner.send_command(command, body, timeout).await
    }

    /// Gracefully closes the control channel and stops the pump.
    /// Idempotent.
    pub(crate) async fn close(&self, timeout: Duration) -> RelayResult<()> {
        let pump = {
            let mut state = self.inner.state.lock().unwrap();
            if state.close_requested {
                return Ok(());
            }
            state.close_requested = true;
            state.pump.take()
        };
        self.inner.close_notify.notify_waiters();
        self.inner.renewer.close();

        {
            let mut writer = self.inner.writer.lock().await;
            if let Some(sink) = writer.as_mut() {
                let close = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "Normal Closure".into(),
                    })))
                    .await;
                if let Err(error) = close {
                    tracing::debug!(%error, "close frame not delivered");
                }
            }
        }

        if let Some(mut pump) = pump {
            if tokio::time::timeout(timeout, &mut pump).await.is_err() {
                tracing::warn!("control pump did not stop in time, aborting it");
                pump.abort();
            }
        }
        self.inner.enter_closed(None);
        Ok(())
    }

    /// Synchronous last-resort teardown for `Drop`: stops the pump and
    /// the renewer without the close handshake.
    pub(crate) fn shutdown_sync(&self) {
        let pump = {
            let mut state = self.inner.state.lock().unwrap();
            state.close_requested = true;
            state.pump.take()
        };
        self.inner.close_notify.notify_waiters();
        self.inner.renewer.close();
        if let Some(pump) = pump {
            pump.abort();
        }
        self.inner.phase.send_replace(Phase::Closed);
    }
}

impl ControlInner {
    async fn connect_once(&self, timeout: Duration) -> RelayResult<ws::WsStream> {
        let token = self.renewer.get_token().await?;
        // Reconnects must not let the tracking id grow: always register
        // with the base (suffix-free) form.
        let listen_url = build_listen_url(&self.address, self.secure, self.tracking.base_tracking_id())?;
        tracing::debug!(url = %listen_url, "connecting control channel");
        ws::connect(
            &listen_url,
            Some(token.token()),
            timeout,
            MAX_CONTROL_FRAME_SIZE,
        )
        .await
    }

    async fn send_command(
        &self,
        command: &ListenerCommand,
        body: Option<Vec<u8>>,
        timeout: Duration,
    ) -> RelayResult<()> {
        let send = async {
            self.wait_online().await?;
            let json = serde_json::to_string(command)?;
            let mut writer = self.writer.lock().await;
            let sink = writer.as_mut().ok_or_else(|| {
                RelayError::ConnectionLost(
                    self.tracking.ensure_trackable("control channel writer is gone"),
                )
            })?;
            sink.send(Message::Text(json)).await?;
            if let Some(body) = body {
                sink.send(Message::Binary(body)).await?;
            }
            Ok(())
        };
        match tokio::time::timeout(timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::Timeout(
                self.tracking.ensure_trackable("sending a control command"),
            )),
        }
    }

    /// Resolves once the phase is `Online`; fails fast when the
    /// connection is closed or was never opened.
    async fn wait_online(&self) -> RelayResult<()> {
        let mut phase = self.phase.subscribe();
        loop {
            let current = *phase.borrow_and_update();
            match current {
                Phase::Online => return Ok(()),
                Phase::Idle => {
                    return Err(RelayError::InvalidOperation(
                        "the control connection is not open".into(),
                    ));
                }
                Phase::Closed => {
                    return Err(RelayError::InvalidOperation(
                        "the control connection is closed".into(),
                    ));
                }
                Phase::Connecting | Phase::Reconnecting => {
                    if phase.changed().await.is_err() {
                        return Err(RelayError::InvalidOperation(
                            "the control connection is closed".into(),
                        ));
                    }
                }
            }
        }
    }

    fn transition_online(&self) {
        let mut state = self.state.lock().unwrap();
        state.connect_delay_index = -1;
        state.last_error = None;
        self.phase.send_replace(Phase::Online);
    }

    /// Advances the backoff index (clamped to the last delay) and
    /// records the error.
    fn record_failure(&self, error: &Arc<RelayError>) {
        let mut state = self.state.lock().unwrap();
        state.last_error = Some(error.clone());
        if state.connect_delay_index < (CONNECT_DELAYS.len() as i32 - 1) {
            state.connect_delay_index += 1;
        }
    }

    fn next_delay(&self) -> Duration {
        let state = self.state.lock().unwrap();
        let index = state.connect_delay_index.clamp(0, CONNECT_DELAYS.len() as i32 - 1);
        CONNECT_DELAYS[index as usize]
    }

    fn close_requested(&self) -> bool {
        self.state.lock().unwrap().close_requested
    }

    /// Terminal transition; the offline callback fires at most once and
    /// only when the connection had been opened.
    fn enter_closed(&self, error: Option<Arc<RelayError>>) {
        let emit = {
            let mut state = self.state.lock().unwrap();
            let previous = *self.phase.borrow();
            if previous == Phase::Closed {
                false
            } else {
                if let Some(error) = &error {
                    state.last_error = Some(error.clone());
                }
                self.phase.send_replace(Phase::Closed);
                previous != Phase::Idle
            }
        };
        if emit {
            tracing::info!(tracking_id = %self.tracking.tracking_id(), "control connection offline");
            self.emit_offline(error.as_deref());
        }
    }

    // ─── Event emission ──────────────────────────────────────

    fn events(&self) -> Option<Arc<dyn ControlEvents>> {
        self.events.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }

    fn emit_online(&self) {
        tracing::info!(tracking_id = %self.tracking.tracking_id(), "control connection online");
        if let Some(events) = self.events() {
            events.on_online();
        }
    }

    fn emit_offline(&self, error: Option<&RelayError>) {
        if let Some(events) = self.events() {
            events.on_offline(error);
        }
    }

    fn emit_connecting(&self, error: &RelayError) {
        if let Some(events) = self.events() {
            events.on_connecting(error);
        }
    }

    fn dispatch_frame(&self, text: &str, pending_request: &mut Option<RequestCommand>) {
        match serde_json::from_str::<ListenerCommand>(text) {
            Ok(ListenerCommand::Accept(command)) => {
                tracing::debug!(id = %command.id, "accept command received");
                if let Some(events) = self.events() {
                    events.on_accept(command);
                }
            }
            Ok(ListenerCommand::Request(command)) => {
                if command.body {
                    // The body arrives as the next binary frame.
                    *pending_request = Some(command);
                } else if let Some(events) = self.events() {
                    events.on_request(command, None);
                }
            }
            Ok(other) => {
                tracing::warn!(?other, "ignoring unexpected command on the control channel");
            }
            Err(error) => {
                tracing::warn!(%error, frame = text, "ignoring invalid command frame");
            }
        }
    }

    /// Reconnect loop entered from the pump after a recoverable
    /// disconnect. Returns the new read half, or `None` when the
    /// connection ended for good.
    async fn reconnect(&self) -> Option<WsSource> {
        loop {
            if self.close_requested() {
                self.enter_closed(None);
                return None;
            }
            let delay = self.next_delay();
            if delay > Duration::ZERO {
                tracing::debug!(seconds = delay.as_secs(), "reconnect backoff");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.close_notify.notified() => {}
                }
            }
            if self.close_requested() {
                self.enter_closed(None);
                return None;
            }

            match self.connect_once(DEFAULT_OPERATION_TIMEOUT).await {
                Ok(stream) => {
                    let (sink, source) = stream.split();
                    *self.writer.lock().await = Some(sink);
                    self.transition_online();
                    return Some(source);
                }
                Err(error) => {
                    let error = Arc::new(error);
                    if !error.should_reconnect() {
                        self.enter_closed(Some(error));
                        return None;
                    }
                    tracing::warn!(error = %error, "reconnect attempt failed");
                    self.record_failure(&error);
                    self.emit_connecting(&error);
                }
            }
        }
    }

    /// Handles a lost or closed socket. Returns the replacement read
    /// half when the pump should keep running.
    async fn handle_disconnect(&self, reason: Option<String>) -> Option<WsSource> {
        *self.writer.lock().await = None;

        if self.close_requested() {
            self.enter_closed(None);
            return None;
        }

        let detail = reason.unwrap_or_else(|| "the connection to the relay was lost".into());
        let error = Arc::new(RelayError::ConnectionLost(
            self.tracking.ensure_trackable(&detail),
        ));
        if !error.should_reconnect() {
            self.enter_closed(Some(error));
            return None;
        }

        self.record_failure(&error);
        self.emit_connecting(&error);
        self.phase.send_replace(Phase::Reconnecting);

        let source = self.reconnect().await?;
        self.emit_online();
        Some(source)
    }
}

/// Perpetual frame reader for the control channel. Commands are
/// dispatched without blocking the pump; disconnects roll into the
/// reconnect loop.
async fn run_pump(inner: Arc<ControlInner>, mut source: WsSource) {
    let mut pending_request: Option<RequestCommand> = None;
    loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => {
                inner.dispatch_frame(&text, &mut pending_request);
            }
            Some(Ok(Message::Binary(data))) => match pending_request.take() {
                Some(request) => {
                    if let Some(events) = inner.events() {
                        events.on_request(request, Some(data));
                    }
                }
                None => {
                    tracing::warn!("ignoring unexpected binary frame on the control channel");
                }
            },
            Some(Ok(Message::Ping(payload))) => {
                let mut writer = inner.writer.lock().await;
                if let Some(sink) = writer.as_mut() {
                    let _ = sink.send(Message::Pong(payload)).await;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                pending_request = None;
                let reason = frame.map(|f| {
                    format!(
                        "the relay closed the connection with code {}: {}",
                        u16::from(f.code),
                        f.reason
                    )
                });
                match inner.handle_disconnect(reason).await {
                    Some(next) => source = next,
                    None => return,
                }
            }
            Some(Ok(_)) => {}
            Some(Err(error)) => {
                pending_request = None;
                match inner.handle_disconnect(Some(error.to_string())).await {
                    Some(next) => source = next,
                    None => return,
                }
            }
            None => {
                pending_request = None;
                match inner.handle_disconnect(None).await {
                    Some(next) => source = next,
                    None => return,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_table_matches_contract() {
        assert_eq!(
            CONNECT_DELAYS.map(|d| d.as_secs()),
            [0, 1, 2, 5, 10, 30]
        );
    }

    #[test]
    fn renew_token_frame_shape() {
        let command = ListenerCommand::RenewToken(RenewTokenCommand {
            token: "SharedAccessSignature sr=ns&sig=abc&se=1&skn=root".into(),
        });
        let json = serde_json::to_string(&command).unwrap();
        assert!(json.starts_with(r#"{"renewToken":{"token":"#));
    }
}
