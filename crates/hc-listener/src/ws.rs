//! Thin wrappers over the websocket client used for the control channel
//! and rendezvous connections.

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{self, protocol::Message};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use url::Url;

use hc_common::{RelayError, RelayResult};
use hc_protocol::SERVICEBUS_AUTHORIZATION_HEADER;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub(crate) type WsSink = SplitSink<WsStream, Message>;
pub(crate) type WsSource = SplitStream<WsStream>;

/// Dials `url` within `timeout`, optionally attaching a bearer token to
/// the upgrade request. Dropping the in-flight connect on timeout tears
/// down the half-open socket.
pub(crate) async fn connect(
    url: &Url,
    token: Option<&str>,
    timeout: Duration,
    max_message_size: usize,
) -> RelayResult<WsStream> {
    let request = build_upgrade_request(url, token)?;
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_message_size);

    let connect = connect_async_with_config(request, Some(config), false);
    match tokio::time::timeout(timeout, connect).await {
        Err(_) => Err(RelayError::Timeout(format!("connecting to {url}"))),
        Ok(Err(error)) => Err(RelayError::from_upgrade(error, url)),
        Ok(Ok((stream, _response))) => Ok(stream),
    }
}

/// Builds the websocket HTTP upgrade request with the relay auth header.
fn build_upgrade_request(
    url: &Url,
    token: Option<&str>,
) -> RelayResult<tungstenite::http::Request<()>> {
    let host = url
        .host_str()
        .ok_or_else(|| RelayError::InvalidArgument(format!("url has no host: {url}")))?;
    let host = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    let mut builder = tungstenite::http::Request::builder()
        .uri(url.as_str())
        .header("Host", host)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header(
            "Sec-WebSocket-Key",
            tungstenite::handshake::client::generate_key(),
        );
    if let Some(token) = token {
        builder = builder.header(SERVICEBUS_AUTHORIZATION_HEADER, token);
    }
    builder
        .body(())
        .map_err(|e| RelayError::InvalidArgument(format!("invalid upgrade request: {e}")))
}
