//! Duplex byte stream for one accepted rendezvous connection.
//!
//! Created after the user accepts and the rendezvous socket is
//! connected. The `InputQueue` owns the channel until a consumer
//! dequeues it; from then on the consumer must close it. Dropping an
//! unconsumed channel closes the underlying socket.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message;

use hc_common::{RelayError, RelayResult};
use hc_protocol::CLOSE_NORMAL;

use crate::tracking::TrackingContext;
use crate::ws::{WsSink, WsSource, WsStream};

/// One accepted peer-to-peer connection.
pub struct RelayChannel {
    tracking: Arc<TrackingContext>,
    writer: Mutex<WsSink>,
    reader: Mutex<WsSource>,
    open: AtomicBool,
}

impl RelayChannel {
    pub(crate) fn new(tracking: Arc<TrackingContext>, stream: WsStream) -> Self {
        let (writer, reader) = stream.split();
        RelayChannel {
            tracking,
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            open: AtomicBool::new(true),
        }
    }

    pub fn tracking(&self) -> &TrackingContext {
        &self.tracking
    }

    /// Whether the channel has seen neither a close frame nor an error.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Reads the next payload. `None` means the peer closed the channel.
    pub async fn read(&self) -> RelayResult<Option<Vec<u8>>> {
        let mut reader = self.reader.lock().await;
        loop {
            match reader.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(data)),
                Some(Ok(Message::Text(text))) => return Ok(Some(text.into_bytes())),
                Some(Ok(Message::Close(_))) | None => {
                    self.open.store(false, Ordering::Release);
                    return Ok(None);
                }
                Some(Ok(_)) => continue,
                Some(Err(error)) => {
                    self.open.store(false, Ordering::Release);
                    return Err(RelayError::ConnectionLost(
                        self.tracking.ensure_trackable(&error.to_string()),
                    ));
                }
            }
        }
    }

    /// Like [`read`](Self::read) with a deadline.
    pub async fn read_timeout(&self, timeout: Duration) -> RelayResult<Option<Vec<u8>>> {
        match tokio::time::timeout(timeout, self.read()).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::Timeout(
                self.tracking.ensure_trackable("reading from channel"),
            )),
        }
    }

    /// Writes one binary payload.
    pub async fn write(&self, data: Vec<u8>) -> RelayResult<()> {
        let mut writer = self.writer.lock().await;
        writer.send(Message::Binary(data)).await?;
        Ok(())
    }

    /// Sends a close frame. The default reason is a normal closure.
    pub async fn close(&self, reason: Option<(u16, &str)>) -> RelayResult<()> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let (code, description) = reason.unwrap_or((CLOSE_NORMAL, "Normal Closure"));
        let mut writer = self.writer.lock().await;
        let result = writer
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: description.to_string().into(),
            })))
            .await;
        // The peer may already be gone; closing a dead channel is fine.
        if let Err(error) = result {
            tracing::debug!(tracking_id = %self.tracking.tracking_id(), %error, "close frame not delivered");
        }
        Ok(())
    }
}

impl fmt::Display for RelayChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RelayChannel({})", self.tracking)
    }
}

impl fmt::Debug for RelayChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
