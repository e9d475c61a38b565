//! End-to-end correlation identity.
//!
//! Every log line and outbound URL carries a tracking id so an exchange
//! can be followed across the listener, the relay, and the remote peer.
//! The relay may decorate ids with a `_Gxx` routing suffix; the base
//! form (up to the first `_`) is what identifies the listener across
//! reconnects.

use std::fmt;

use chrono::Utc;
use uuid::Uuid;

const TRACKING_ID_NAME: &str = "TrackingId";
const UUID_STRING_LENGTH: usize = 36;

/// Immutable correlation identity, shared by reference.
#[derive(Debug, Clone)]
pub struct TrackingContext {
    activity_id: Uuid,
    tracking_id: String,
    address: String,
}

impl TrackingContext {
    /// Creates a context with a fresh activity id for `address`.
    pub fn new(address: impl Into<String>) -> Self {
        let activity_id = Uuid::new_v4();
        TrackingContext {
            activity_id,
            tracking_id: activity_id.to_string(),
            address: address.into(),
        }
    }

    /// Creates a context from an externally supplied tracking id, e.g.
    /// the `id` field of an accept command. When the id is not
    /// UUID-shaped a fresh activity id is generated and the original
    /// string is kept verbatim for correlation.
    pub fn with_tracking_id(tracking_id: impl Into<String>, address: impl Into<String>) -> Self {
        let tracking_id = tracking_id.into();
        let prefix = tracking_id
            .get(..UUID_STRING_LENGTH.min(tracking_id.len()))
            .unwrap_or(tracking_id.as_str());
        let activity_id = match Uuid::parse_str(prefix) {
            Ok(id) => id,
            Err(_) => {
                let fallback = Uuid::new_v4();
                tracing::warn!(
                    tracking_id = %tracking_id,
                    activity_id = %fallback,
                    "tracking id is not a UUID, generated a fresh activity id"
                );
                fallback
            }
        };
        TrackingContext {
            activity_id,
            tracking_id,
            address: address.into(),
        }
    }

    pub fn activity_id(&self) -> Uuid {
        self.activity_id
    }

    pub fn tracking_id(&self) -> &str {
        &self.tracking_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Strips the `_Gxx` routing suffix: everything from the first `_`.
    pub fn remove_suffix(tracking_id: &str) -> &str {
        match tracking_id.find('_') {
            Some(index) => &tracking_id[..index],
            None => tracking_id,
        }
    }

    /// The base (suffix-free) form of this context's tracking id.
    pub fn base_tracking_id(&self) -> &str {
        Self::remove_suffix(&self.tracking_id)
    }

    /// Appends `TrackingId:…, Address:…, Timestamp:…` to a message that
    /// does not already carry a tracking id, terminating the original
    /// sentence with a period if needed.
    pub fn ensure_trackable(&self, message: &str) -> String {
        if message.contains(TRACKING_ID_NAME) {
            return message.to_string();
        }
        let mut out = message.to_string();
        if !out.is_empty() && !out.ends_with('.') {
            out.push('.');
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(&format!(
            "{TRACKING_ID_NAME}:{}, Address:{}, Timestamp:{}",
            self.tracking_id,
            self.address,
            Utc::now()
        ));
        out
    }
}

impl fmt::Display for TrackingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.address.is_empty() {
            write!(f, "{TRACKING_ID_NAME}:{}", self.tracking_id)
        } else {
            write!(
                f,
                "{TRACKING_ID_NAME}:{}, Address:{}",
                self.tracking_id, self.address
            )
        }
    }
}
