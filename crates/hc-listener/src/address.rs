//! Listener address handling and relay URL construction.
//!
//! Listener addresses use the `sb` scheme
//! (`sb://contoso.example.net/demo`). The control channel derives a
//! websocket URL from them; accept commands carry rendezvous URLs that
//! are dialed verbatim.

use hc_common::{RelayError, RelayResult};
use hc_protocol::{query, HYBRID_CONNECTION_PATH_PREFIX, HYBRID_CONNECTION_SCHEME};
use url::Url;

/// Rejects anything that is not a usable `sb://host/name` address.
pub(crate) fn validate_listener_address(address: &Url) -> RelayResult<()> {
    if address.scheme() != HYBRID_CONNECTION_SCHEME {
        return Err(RelayError::InvalidArgument(format!(
            "invalid scheme, expected {HYBRID_CONNECTION_SCHEME}, got {}",
            address.scheme()
        )));
    }
    if address.host_str().is_none() {
        return Err(RelayError::InvalidArgument(
            "listener address has no host".into(),
        ));
    }
    if address.path().trim_matches('/').is_empty() {
        return Err(RelayError::InvalidArgument(
            "listener address has no hybrid connection path".into(),
        ));
    }
    Ok(())
}

/// Builds the control-channel URL:
/// `wss://host[:port]/$hc/<path>?<query>&sb-hc-action=listen&sb-hc-id=<id>`.
///
/// The `url` crate refuses scheme changes between special and
/// non-special schemes, so the websocket URL is assembled as a string.
pub(crate) fn build_listen_url(
    address: &Url,
    secure: bool,
    tracking_id: &str,
) -> RelayResult<Url> {
    let scheme = if secure { "wss" } else { "ws" };
    let host = address
        .host_str()
        .ok_or_else(|| RelayError::InvalidArgument("listener address has no host".into()))?;

    let mut raw = format!("{scheme}://{host}");
    if let Some(port) = address.port() {
        raw.push_str(&format!(":{port}"));
    }
    raw.push_str("/$hc/");
    raw.push_str(address.path().trim_start_matches('/'));

    let mut listen = Url::parse(&raw)?;
    {
        let mut pairs = listen.query_pairs_mut();
        if let Some(existing) = address.query() {
            for (key, value) in url::form_urlencoded::parse(existing.as_bytes()) {
                pairs.append_pair(&key, &value);
            }
        }
        pairs.append_pair(query::ACTION, query::ACTION_LISTEN);
        pairs.append_pair(query::ID, tracking_id);
    }
    Ok(listen)
}

/// The logical request URI for an inbound exchange: scheme/host/port of
/// the listener, the rendezvous path minus the `$hc/` prefix, and the
/// rendezvous query minus every relay-internal `sb-hc-*` parameter.
pub(crate) fn accept_request_uri(address: &Url, rendezvous: &Url) -> RelayResult<Url> {
    let host = address
        .host_str()
        .ok_or_else(|| RelayError::InvalidArgument("listener address has no host".into()))?;

    let path = rendezvous.path();
    let path = path
        .strip_prefix('/')
        .unwrap_or(path)
        .strip_prefix(HYBRID_CONNECTION_PATH_PREFIX)
        .unwrap_or_else(|| path.trim_start_matches('/'));

    let mut raw = format!("{}://{host}", address.scheme());
    if let Some(port) = address.port() {
        raw.push_str(&format!(":{port}"));
    }
    raw.push('/');
    raw.push_str(path);
    if let Some(filtered) = rendezvous.query().and_then(filter_relay_query) {
        raw.push('?');
        raw.push_str(&filtered);
    }
    Ok(Url::parse(&raw)?)
}

/// The logical URI of a relayed HTTP request: listener authority plus
/// the command's request target (path and query).
pub(crate) fn request_target_uri(address: &Url, target: &str) -> RelayResult<Url> {
    let host = address
        .host_str()
        .ok_or_else(|| RelayError::InvalidArgument("listener address has no host".into()))?;
    let mut raw = format!("{}://{host}", address.scheme());
    if let Some(port) = address.port() {
        raw.push_str(&format!(":{port}"));
    }
    if !target.starts_with('/') {
        raw.push('/');
    }
    raw.push_str(target);
    Ok(Url::parse(&raw)?)
}

/// Drops `sb-hc-*` pairs from a query string; returns `None` when
/// nothing user-visible remains.
fn filter_relay_query(raw: &str) -> Option<String> {
    let mut filtered = url::form_urlencoded::Serializer::new(String::new());
    let mut any = false;
    for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
        if key.starts_with(query::RELAY_PREFIX) {
            continue;
        }
        filtered.append_pair(&key, &value);
        any = true;
    }
    any.then(|| filtered.finish())
}
