//! # hc-agent
//!
//! Demo relay agent: opens a hybrid-connection listener, echoes bytes on
//! every accepted channel, and answers relayed HTTP requests with a
//! version banner.
//!
//! ## Usage
//!
//! ```sh
//! HC__RELAY__CONNECTION_STRING="Endpoint=sb://...;EntityPath=...;..." hc-agent
//! HC__RELAY__ADDRESS=sb://contoso.example.net/demo \
//!   HC__RELAY__KEY_NAME=root HC__RELAY__KEY=... hc-agent
//! ```

mod config;

use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use url::Url;

use hc_listener::{Listener, SasTokenProvider};

use crate::config::AgentConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AgentConfig::load()?;
    let listener = build_listener(&config)?;

    listener.set_online_handler(|| tracing::info!("listener online"));
    listener.set_connecting_handler(|error| {
        tracing::warn!(%error, "control channel lost, reconnecting");
    });
    listener.set_offline_handler(|error| match error {
        Some(error) => tracing::error!(%error, "listener offline"),
        None => tracing::info!("listener offline"),
    });
    listener.set_accept_handler(|context| {
        tracing::info!(
            peer = ?context.request().remote_endpoint(),
            uri = %context.request().uri(),
            "accepting connection"
        );
        true
    });
    listener.set_request_handler(|context| {
        let response = context.response_mut();
        response.set_status(200, "OK");
        response.body = format!("hc-agent v{}\n", env!("CARGO_PKG_VERSION")).into_bytes();
    });

    tracing::info!(address = %listener.address(), "opening listener");
    listener.open().await?;

    loop {
        tokio::select! {
            accepted = listener.accept_connection() => {
                match accepted? {
                    Some(channel) => {
                        tokio::spawn(async move {
                            tracing::info!(tracking_id = %channel.tracking().tracking_id(), "channel accepted");
                            if let Err(error) = echo(&channel).await {
                                tracing::warn!(%error, "channel error");
                            }
                            let _ = channel.close(None).await;
                        });
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                listener.close().await?;
                break;
            }
        }
    }

    Ok(())
}

fn build_listener(config: &AgentConfig) -> anyhow::Result<Listener> {
    let relay = &config.relay;
    if let Some(connection_string) = &relay.connection_string {
        return Ok(Listener::from_connection_string(connection_string)?);
    }

    let address = relay
        .address
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("HC__RELAY__ADDRESS or HC__RELAY__CONNECTION_STRING is required"))?;
    let key_name = relay
        .key_name
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("HC__RELAY__KEY_NAME is required"))?;
    let key = relay
        .key
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("HC__RELAY__KEY is required"))?;

    let address = Url::parse(address)?;
    let provider = Arc::new(SasTokenProvider::new(key_name, key));
    let listener = Listener::builder(address, provider)
        .insecure_transport(relay.insecure)
        .build()?;
    Ok(listener)
}

/// Echo loop: every payload goes straight back to the peer.
async fn echo(channel: &hc_listener::RelayChannel) -> hc_common::RelayResult<()> {
    while let Some(data) = channel.read().await? {
        channel.write(data).await?;
    }
    Ok(())
}
