use url::Url;

/// Convenient Result alias.
pub type RelayResult<T> = Result<T, RelayError>;

/// Error type shared by the hybrid-connection client crates.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Endpoint not found: {0}")]
    EndpointNotFound(String),

    #[error("Token error: {0}")]
    Token(String),

    #[error("Invalid address: {0}")]
    Address(#[from] url::ParseError),

    #[error("Transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("Invalid wire frame: {0}")]
    Wire(#[from] serde_json::Error),
}

impl RelayError {
    /// A failed websocket upgrade carrying HTTP 404 means the hybrid
    /// connection entity does not exist; that condition is terminal and
    /// must not be retried.
    pub fn from_upgrade(error: tungstenite::Error, url: &Url) -> Self {
        match error {
            tungstenite::Error::Http(ref response) if response.status().as_u16() == 404 => {
                RelayError::EndpointNotFound(format!("no listener endpoint at {url}"))
            }
            other => RelayError::Transport(other),
        }
    }

    /// Whether the control connection may transparently reconnect after
    /// this error.
    pub fn should_reconnect(&self) -> bool {
        !matches!(self, RelayError::EndpointNotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_not_found_is_terminal() {
        let err = RelayError::EndpointNotFound("gone".into());
        assert!(!err.should_reconnect());
        assert!(RelayError::ConnectionLost("reset".into()).should_reconnect());
        assert!(RelayError::Timeout("read".into()).should_reconnect());
    }

    #[test]
    fn upgrade_404_maps_to_endpoint_not_found() {
        let url = Url::parse("wss://contoso.example.net/$hc/demo").unwrap();
        let response = tungstenite::http::Response::builder()
            .status(404)
            .body(None)
            .unwrap();
        let err = RelayError::from_upgrade(tungstenite::Error::Http(response), &url);
        assert!(matches!(err, RelayError::EndpointNotFound(_)));
    }
}
