//! Server configuration: defaults, optional TOML file, environment.

use std::{
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
};

use agent_hub_core::HubConfig;
use anyhow::{Context, Result};
use config::{Config, ConfigBuilder, Environment, File, FileFormat, builder::DefaultState};
use serde::{Deserialize, Serialize};

/// Environment prefix, e.g. `AGENT_HUB__HUB__SESSION_TIMEOUT_SECS=30`.
pub const ENV_PREFIX: &str = "AGENT_HUB";

const DEFAULT_PORT: u16 = 7700;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP listen address.
    pub listen: SocketAddr,
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,
    pub hub: HubConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            log_level: "info".to_string(),
            hub: HubConfig::default(),
        }
    }
}

impl ServerConfig {
    /// `<config dir>/agent-hub/config.toml`.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("agent-hub").join("config.toml"))
    }

    /// Load from `path` (required) or the default path (optional), then
    /// apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(path) => (Some(path.to_path_buf()), true),
            None => (Self::default_path(), false),
        };

        let mut builder = Config::builder();
        if let Some(path) = &path {
            builder = builder.add_source(
                File::from(path.as_path())
                    .format(FileFormat::Toml)
                    .required(required),
            );
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        Self::from_builder(builder)
            .with_context(|| match &path {
                Some(path) => format!("loading configuration from {}", path.display()),
                None => "loading configuration".to_string(),
            })
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let config: Self = builder
            .build()
            .context("reading configuration sources")?
            .try_deserialize()
            .context("parsing configuration")?;
        config.hub.validate().context("invalid hub configuration")?;
        Ok(config)
    }
}
