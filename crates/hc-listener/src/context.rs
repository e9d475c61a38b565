//! Per-exchange context handed to user handlers.
//!
//! One context is synthesized for every inbound `accept` or `request`
//! command. The request side is immutable after construction; the
//! response side is writable by user code until the exchange completes.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use url::Url;

use hc_protocol::{RemoteEndpoint, SEC_WEBSOCKET_PROTOCOL_HEADER};

use crate::tracking::TrackingContext;

/// Placeholder status marking "user code has not set a reject status".
/// User code must not reject with 100; it is normalized to 400.
pub(crate) const STATUS_PLACEHOLDER: u16 = 100;

/// The inbound half of an exchange.
#[derive(Debug, Clone)]
pub struct ListenerRequest {
    uri: Url,
    method: String,
    headers: HashMap<String, String>,
    remote_endpoint: Option<RemoteEndpoint>,
    body: Option<Vec<u8>>,
}

impl ListenerRequest {
    pub fn uri(&self) -> &Url {
        &self.uri
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Remote peer address as observed by the relay.
    pub fn remote_endpoint(&self) -> Option<&RemoteEndpoint> {
        self.remote_endpoint.as_ref()
    }

    /// Request body, when the command carried one.
    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }
}

/// The outbound half of an exchange, writable by user code.
#[derive(Debug, Clone)]
pub struct ListenerResponse {
    pub status_code: u16,
    pub status_description: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl ListenerResponse {
    fn new(status_code: u16, status_description: &str) -> Self {
        ListenerResponse {
            status_code,
            status_description: status_description.to_string(),
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }

    /// Sets status code and description in one go.
    pub fn set_status(&mut self, code: u16, description: impl Into<String>) {
        self.status_code = code;
        self.status_description = description.into();
    }
}

/// Context for one inbound exchange.
pub struct ListenerContext {
    tracking: Arc<TrackingContext>,
    request: ListenerRequest,
    response: ListenerResponse,
}

impl ListenerContext {
    /// Context for a websocket accept; the response starts at the `100`
    /// placeholder so a rejection without an explicit status becomes
    /// `400 Bad Request`.
    pub(crate) fn for_accept(
        tracking: Arc<TrackingContext>,
        uri: Url,
        headers: HashMap<String, String>,
        remote_endpoint: Option<RemoteEndpoint>,
    ) -> Self {
        let mut context = ListenerContext {
            tracking,
            request: ListenerRequest {
                uri,
                method: "GET".to_string(),
                headers,
                remote_endpoint,
                body: None,
            },
            response: ListenerResponse::new(STATUS_PLACEHOLDER, "Continue"),
        };
        context.flow_sub_protocol();
        context
    }

    /// Context for a relayed HTTP request; the response defaults to
    /// `200 OK`.
    pub(crate) fn for_request(
        tracking: Arc<TrackingContext>,
        uri: Url,
        method: String,
        headers: HashMap<String, String>,
        body: Option<Vec<u8>>,
    ) -> Self {
        ListenerContext {
            tracking,
            request: ListenerRequest {
                uri,
                method,
                headers,
                remote_endpoint: None,
                body,
            },
            response: ListenerResponse::new(200, "OK"),
        }
    }

    pub fn tracking(&self) -> &TrackingContext {
        &self.tracking
    }

    pub(crate) fn tracking_arc(&self) -> Arc<TrackingContext> {
        self.tracking.clone()
    }

    pub fn request(&self) -> &ListenerRequest {
        &self.request
    }

    pub fn response(&self) -> &ListenerResponse {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut ListenerResponse {
        &mut self.response
    }

    /// Copies the first client-offered sub-protocol into the response,
    /// i.e. the server picks the first entry of a comma-separated list.
    fn flow_sub_protocol(&mut self) {
        let Some(offered) = self.request.headers.get(SEC_WEBSOCKET_PROTOCOL_HEADER) else {
            return;
        };
        let selected = match offered.find(',') {
            Some(index) => offered[..index].trim(),
            None => offered.trim(),
        };
        if !selected.is_empty() {
            self.response
                .headers
                .insert(SEC_WEBSOCKET_PROTOCOL_HEADER.to_string(), selected.to_string());
        }
    }
}

impl fmt::Display for ListenerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ListenerContext({})", self.tracking)
    }
}
