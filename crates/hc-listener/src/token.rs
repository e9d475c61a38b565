//! Security tokens and their lifecycle.
//!
//! A [`TokenProvider`] issues bearer tokens for an audience URI. The
//! [`TokenRenewer`] keeps a standing listener authorized: each fetched
//! token arms a single-shot timer that re-fetches before expiry and
//! pushes the fresh token to a subscriber (the control connection, which
//! turns it into a `renewToken` frame). The timer is convenience, not a
//! liveness requirement: any outbound use fetches a fresh token after a
//! reconnect anyway.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::Sha256;
use tokio::task::JoinHandle;

use hc_common::{RelayError, RelayResult};
use hc_protocol::MIN_TOKEN_REFRESH_INTERVAL;

/// RFC 3986 unreserved characters stay literal; everything else is
/// percent-encoded, matching what the relay expects in `sr` and `sig`.
const SAS_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// A bearer token and the instant it stops being valid.
#[derive(Debug, Clone)]
pub struct SecurityToken {
    token: String,
    expires_at: DateTime<Utc>,
}

impl SecurityToken {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        SecurityToken {
            token: token.into(),
            expires_at,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

/// Issues bearer tokens for an audience URI.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Returns a token valid for `audience` for at least `validity`.
    async fn get_token(&self, audience: &str, validity: Duration) -> RelayResult<SecurityToken>;
}

/// Shared-access-signature token provider: HMAC-SHA256 over
/// `<encoded audience>\n<expiry>` with a named key.
pub struct SasTokenProvider {
    key_name: String,
    key: String,
}

impl SasTokenProvider {
    pub fn new(key_name: impl Into<String>, key: impl Into<String>) -> Self {
        SasTokenProvider {
            key_name: key_name.into(),
            key: key.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for SasTokenProvider {
    async fn get_token(&self, audience: &str, validity: Duration) -> RelayResult<SecurityToken> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(validity)
                .map_err(|e| RelayError::Token(format!("token validity out of range: {e}")))?;
        let expiry = expires_at.timestamp();

        let audience = audience.to_lowercase();
        let encoded_audience = utf8_percent_encode(&audience, SAS_ENCODE_SET).to_string();
        let to_sign = format!("{encoded_audience}\n{expiry}");

        let mut mac = Hmac::<Sha256>::new_from_slice(self.key.as_bytes())
            .map_err(|e| RelayError::Token(format!("invalid shared access key: {e}")))?;
        mac.update(to_sign.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());

        let token = format!(
            "SharedAccessSignature sr={encoded_audience}&sig={}&se={expiry}&skn={}",
            utf8_percent_encode(&signature, SAS_ENCODE_SET),
            self.key_name
        );
        Ok(SecurityToken::new(token, expires_at))
    }
}

type RenewedCallback = Arc<dyn Fn(SecurityToken) + Send + Sync>;
type RenewErrorCallback = Arc<dyn Fn(RelayError) + Send + Sync>;

/// Fetches tokens on demand and re-fetches them ahead of expiry.
pub struct TokenRenewer {
    inner: Arc<RenewerInner>,
}

struct RenewerInner {
    provider: Arc<dyn TokenProvider>,
    audience: String,
    validity: Duration,
    /// Single-cell renewal timer; rescheduling replaces the task, it
    /// never reuses one.
    timer: Mutex<Option<JoinHandle<()>>>,
    on_renewed: Mutex<Option<RenewedCallback>>,
    on_error: Mutex<Option<RenewErrorCallback>>,
    closed: AtomicBool,
}

impl TokenRenewer {
    pub fn new(
        provider: Arc<dyn TokenProvider>,
        audience: impl Into<String>,
        validity: Duration,
    ) -> Self {
        TokenRenewer {
            inner: Arc::new(RenewerInner {
                provider,
                audience: audience.into(),
                validity,
                timer: Mutex::new(None),
                on_renewed: Mutex::new(None),
                on_error: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Subscriber invoked with every token fetched by the renewal timer.
    /// Delivery happens before the internal re-fetch completes, so the
    /// subscriber never sees a token older than the renewer's own.
    pub fn set_on_token_renewed(&self, callback: impl Fn(SecurityToken) + Send + Sync + 'static) {
        *self.inner.on_renewed.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Invoked when a timer-driven renewal fails; the timer stays
    /// disarmed until the next successful `get_token`.
    pub fn set_on_renew_error(&self, callback: impl Fn(RelayError) + Send + Sync + 'static) {
        *self.inner.on_error.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Fetches a token and arms the renewal timer for it.
    pub async fn get_token(&self) -> RelayResult<SecurityToken> {
        Self::fetch(&self.inner, false).await
    }

    async fn fetch(inner: &Arc<RenewerInner>, notify: bool) -> RelayResult<SecurityToken> {
        let token = inner
            .provider
            .get_token(&inner.audience, inner.validity)
            .await?;
        if notify {
            let callback = inner.on_renewed.lock().unwrap().clone();
            if let Some(callback) = callback {
                callback(token.clone());
            }
        }
        Self::schedule(inner, token.expires_at());
        Ok(token)
    }

    fn schedule(inner: &Arc<RenewerInner>, expires_at: DateTime<Utc>) {
        if inner.closed.load(Ordering::Acquire) {
            return;
        }
        let until_expiry = match (expires_at - Utc::now()).to_std() {
            Ok(interval) => interval,
            // Already expired: nothing to arm, the next use re-fetches.
            Err(_) => return,
        };
        let interval = until_expiry.max(MIN_TOKEN_REFRESH_INTERVAL);
        tracing::debug!(seconds = interval.as_secs(), "token renewal scheduled");

        let weak = Arc::downgrade(inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            Self::on_timer(weak).await;
        });

        let mut timer = inner.timer.lock().unwrap();
        if inner.closed.load(Ordering::Acquire) {
            handle.abort();
            return;
        }
        if let Some(previous) = timer.replace(handle) {
            previous.abort();
        }
    }

    async fn on_timer(weak: Weak<RenewerInner>) {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if inner.closed.load(Ordering::Acquire) {
            return;
        }
        if let Err(error) = Self::fetch(&inner, true).await {
            tracing::warn!(%error, "scheduled token renewal failed");
            let callback = inner.on_error.lock().unwrap().clone();
            if let Some(callback) = callback {
                callback(error);
            }
        }
    }

    /// Cancels the renewal timer. Idempotent.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        if let Some(handle) = self.inner.timer.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl Drop for TokenRenewer {
    fn drop(&mut self) {
        self.close();
    }
}
