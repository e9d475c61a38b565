use serde::Deserialize;

/// Agent configuration, loaded from `HC__*` environment variables
/// (e.g. `HC__RELAY__ADDRESS`, `HC__RELAY__KEY_NAME`).
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Relay settings
    pub relay: RelayConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Full connection string; takes precedence over the discrete fields.
    #[serde(default)]
    pub connection_string: Option<String>,
    /// Listener address, e.g. sb://contoso.example.net/demo
    #[serde(default)]
    pub address: Option<String>,
    /// Shared access key name
    #[serde(default)]
    pub key_name: Option<String>,
    /// Shared access key
    #[serde(default)]
    pub key: Option<String>,
    /// Use plain ws:// for local relays (default: false)
    #[serde(default)]
    pub insecure: bool,
}

impl AgentConfig {
    /// Load config from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let cfg = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .prefix("HC")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        cfg.try_deserialize()
    }
}
