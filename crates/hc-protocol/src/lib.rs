//! # hc-protocol
//!
//! Wire model for the relay control channel. Every control frame is a
//! JSON text message holding exactly one command; binary frames, when
//! present, immediately follow a text frame and carry its body.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Scheme of listener addresses (`sb://namespace/path`).
pub const HYBRID_CONNECTION_SCHEME: &str = "sb";

/// Path prefix the relay puts in front of hybrid connection names.
pub const HYBRID_CONNECTION_PATH_PREFIX: &str = "$hc/";

/// Header carrying the bearer token on the websocket upgrade request.
pub const SERVICEBUS_AUTHORIZATION_HEADER: &str = "ServiceBusAuthorization";

/// Sub-protocol negotiation header flowed from request to response.
pub const SEC_WEBSOCKET_PROTOCOL_HEADER: &str = "Sec-WebSocket-Protocol";

/// Query parameter names understood by the relay.
pub mod query {
    /// Requested action (`listen`, `connect`, `accept`).
    pub const ACTION: &str = "sb-hc-action";
    /// End-to-end tracking id.
    pub const ID: &str = "sb-hc-id";
    /// Prefix of all relay-internal parameters, filtered out of the
    /// logical request URI handed to user code.
    pub const RELAY_PREFIX: &str = "sb-hc-";
    /// Status code appended to a rendezvous URI when rejecting.
    pub const STATUS_CODE: &str = "statusCode";
    /// Status description appended to a rendezvous URI when rejecting.
    pub const STATUS_DESCRIPTION: &str = "statusDescription";

    pub const ACTION_LISTEN: &str = "listen";
    pub const ACTION_ACCEPT: &str = "accept";
}

/// Default timeout for externally-facing listener operations.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Validity requested for issued security tokens.
pub const DEFAULT_TOKEN_VALIDITY: Duration = Duration::from_secs(3600);

/// Tokens are renewed no sooner than this before expiry; the provider
/// never returns a token closer than this to expiring, so no extra
/// padding is applied.
pub const MIN_TOKEN_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

/// Bound on a rendezvous dial, both for accepts and rejections.
pub const RENDEZVOUS_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Largest accepted control frame.
pub const MAX_CONTROL_FRAME_SIZE: usize = 64 * 1024;

/// Largest accepted payload on an accepted channel (10 MB).
pub const MAX_CHANNEL_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Websocket close code for a user-initiated close.
pub const CLOSE_NORMAL: u16 = 1000;

/// Websocket close code used when aborting a half-open connect.
pub const CLOSE_UNEXPECTED_CONDITION: u16 = 1011;

/// One control-channel frame. Externally tagged so the JSON object
/// contains exactly one of the keys `accept`, `request`, `response`,
/// `renewToken`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ListenerCommand {
    /// A remote peer wants a rendezvous connection (inbound).
    Accept(AcceptCommand),
    /// A relayed HTTP request (inbound).
    Request(RequestCommand),
    /// Reply to a relayed HTTP request (outbound).
    Response(ResponseCommand),
    /// Fresh bearer token for the standing control channel (outbound).
    RenewToken(RenewTokenCommand),
}

/// Address and port of the remote peer as observed by the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEndpoint {
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AcceptCommand {
    /// Tracking id assigned to this exchange by the relay.
    pub id: String,
    /// One-shot rendezvous URL, dialed verbatim.
    pub address: String,
    /// Headers of the remote peer's upgrade request.
    #[serde(default)]
    pub connect_headers: HashMap<String, String>,
    #[serde(default)]
    pub remote_endpoint: Option<RemoteEndpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RequestCommand {
    pub id: String,
    pub method: String,
    /// Path and query of the logical request.
    pub request_target: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// True when a binary body frame follows this frame.
    #[serde(default)]
    pub body: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseCommand {
    pub request_id: String,
    pub status_code: u16,
    pub status_description: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// True when a binary body frame follows this frame.
    #[serde(default)]
    pub body: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RenewTokenCommand {
    pub token: String,
}
