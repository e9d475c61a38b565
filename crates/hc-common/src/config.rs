//! Relay connection-string parsing.
//!
//! Connection strings have the semicolon-separated `Key=Value` form used
//! by the relay portal, e.g.
//! `Endpoint=sb://contoso.example.net/;EntityPath=demo;SharedAccessKeyName=root;SharedAccessKey=abc123=;OperationTimeout=PT30S`.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::error::{RelayError, RelayResult};

const ENDPOINT: &str = "endpoint";
const ENTITY_PATH: &str = "entitypath";
const SHARED_ACCESS_KEY_NAME: &str = "sharedaccesskeyname";
const SHARED_ACCESS_KEY: &str = "sharedaccesskey";
const OPERATION_TIMEOUT: &str = "operationtimeout";

/// Parsed relay connection string. Keys are matched case-insensitively;
/// unknown keys are rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConnectionString {
    /// Namespace endpoint, scheme `sb`.
    pub endpoint: Url,
    /// Hybrid connection name, when embedded in the string.
    pub entity_path: Option<String>,
    /// Shared access key name (`skn` of issued tokens).
    pub shared_access_key_name: Option<String>,
    /// Shared access key material, base64.
    pub shared_access_key: Option<String>,
    /// Override for the listener operation timeout, ISO-8601 (`PT…S`).
    pub operation_timeout: Option<Duration>,
}

impl RelayConnectionString {
    /// Checks the invariants a listener requires: an `sb` endpoint and a
    /// complete shared-access credential pair.
    pub fn validate(&self) -> RelayResult<()> {
        if self.endpoint.scheme() != "sb" {
            return Err(RelayError::InvalidArgument(format!(
                "connection string endpoint must use the sb scheme, got {}",
                self.endpoint.scheme()
            )));
        }
        match (&self.shared_access_key_name, &self.shared_access_key) {
            (Some(_), Some(_)) => Ok(()),
            _ => Err(RelayError::InvalidArgument(
                "connection string requires both SharedAccessKeyName and SharedAccessKey".into(),
            )),
        }
    }

    /// The full listener address for `path`, resolved against the endpoint.
    pub fn address_for(&self, path: &str) -> RelayResult<Url> {
        let path = path.trim_matches('/');
        if path.is_empty() {
            return Err(RelayError::InvalidArgument(
                "hybrid connection path must not be empty".into(),
            ));
        }
        Ok(self.endpoint.join(path)?)
    }
}

impl FromStr for RelayConnectionString {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(RelayError::InvalidArgument(
                "connection string must not be empty".into(),
            ));
        }

        let mut endpoint = None;
        let mut entity_path = None;
        let mut key_name = None;
        let mut key = None;
        let mut timeout = None;

        for pair in s.split(';').filter(|p| !p.trim().is_empty()) {
            let (name, value) = pair.split_once('=').ok_or_else(|| {
                RelayError::InvalidArgument(format!("malformed connection string token: {pair}"))
            })?;
            let value = value.trim();
            match name.trim().to_ascii_lowercase().as_str() {
                ENDPOINT => {
                    // Normalize to a trailing slash so entity paths join cleanly.
                    let normalized = if value.ends_with('/') {
                        value.to_string()
                    } else {
                        format!("{value}/")
                    };
                    endpoint = Some(Url::parse(&normalized)?);
                }
                ENTITY_PATH => entity_path = Some(value.trim_matches('/').to_string()),
                SHARED_ACCESS_KEY_NAME => key_name = Some(value.to_string()),
                SHARED_ACCESS_KEY => key = Some(value.to_string()),
                OPERATION_TIMEOUT => timeout = Some(parse_iso8601_duration(value)?),
                other => {
                    return Err(RelayError::InvalidArgument(format!(
                        "unknown connection string key: {other}"
                    )));
                }
            }
        }

        Ok(RelayConnectionString {
            endpoint: endpoint.ok_or_else(|| {
                RelayError::InvalidArgument("connection string is missing Endpoint".into())
            })?,
            entity_path,
            shared_access_key_name: key_name,
            shared_access_key: key,
            operation_timeout: timeout,
        })
    }
}

impl fmt::Display for RelayConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Endpoint={}", self.endpoint)?;
        if let Some(path) = &self.entity_path {
            write!(f, ";EntityPath={path}")?;
        }
        if let Some(name) = &self.shared_access_key_name {
            write!(f, ";SharedAccessKeyName={name}")?;
        }
        if let Some(key) = &self.shared_access_key {
            write!(f, ";SharedAccessKey={key}")?;
        }
        if let Some(timeout) = self.operation_timeout {
            write!(f, ";OperationTimeout=PT{}S", timeout.as_secs())?;
        }
        Ok(())
    }
}

/// Parses the `PT[nH][nM][nS]` subset of ISO-8601 durations used by the
/// `OperationTimeout` property.
fn parse_iso8601_duration(s: &str) -> RelayResult<Duration> {
    let invalid =
        || RelayError::InvalidArgument(format!("invalid ISO-8601 duration: {s}"));

    let rest = s
        .strip_prefix("PT")
        .or_else(|| s.strip_prefix("pt"))
        .ok_or_else(invalid)?;
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut total = Duration::ZERO;
    let mut digits = String::new();
    for c in rest.chars() {
        if c.is_ascii_digit() || c == '.' {
            digits.push(c);
        } else {
            let value: f64 = digits.parse().map_err(|_| invalid())?;
            digits.clear();
            let secs = match c.to_ascii_uppercase() {
                'H' => value * 3600.0,
                'M' => value * 60.0,
                'S' => value,
                _ => return Err(invalid()),
            };
            total += Duration::from_secs_f64(secs);
        }
    }
    if !digits.is_empty() {
        return Err(invalid());
    }
    Ok(total)
}
