//! # hc-listener
//!
//! Client-side listener for a cloud relay: a process behind NAT or a
//! firewall accepts inbound connections without opening ports. The
//! listener keeps one outbound websocket to the relay (the control
//! channel), receives `accept`/`request` commands over it, and completes
//! each accepted exchange by dialing a one-shot rendezvous URL.
//!
//! ```no_run
//! use std::sync::Arc;
//! use hc_listener::{Listener, SasTokenProvider};
//! use url::Url;
//!
//! # async fn run() -> hc_common::RelayResult<()> {
//! let address = Url::parse("sb://contoso.example.net/demo").unwrap();
//! let provider = Arc::new(SasTokenProvider::new("root", "key"));
//! let listener = Listener::new(address, provider)?;
//! listener.open().await?;
//! while let Some(channel) = listener.accept_connection().await? {
//!     tokio::spawn(async move {
//!         while let Ok(Some(data)) = channel.read().await {
//!             let _ = channel.write(data).await;
//!         }
//!     });
//! }
//! # Ok(())
//! # }
//! ```

mod address;
mod channel;
mod context;
mod control;
mod httpbridge;
mod queue;
mod token;
mod tracking;
mod ws;

mod listener;

pub use channel::RelayChannel;
pub use context::{ListenerContext, ListenerRequest, ListenerResponse};
pub use listener::{AcceptHandler, Listener, ListenerBuilder, RequestHandler};
pub use queue::InputQueue;
pub use token::{SasTokenProvider, SecurityToken, TokenProvider, TokenRenewer};
pub use tracking::TrackingContext;

pub use hc_common::{RelayConnectionString, RelayError, RelayResult};
pub use hc_protocol as protocol;
