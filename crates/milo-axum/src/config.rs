//! Server configuration: a TOML file with environment overrides.
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 8080
//! sweep_interval_secs = 3600
//!
//! [store]
//! backend = "mongodb"
//! uri = "mongodb://localhost:27017"
//! database = "milo"
//!
//! [auth]
//! lenient_session_expiry = false
//!
//! [billing]
//! webhook_secret = "whsec_..."
//! seed_products = true
//!
//! [billing.plans.free]
//! meal_scans = 5
//! ```
//!
//! `MILO_HOST`, `MILO_PORT`, `MILO_STORE_URI`, `MILO_STORE_DATABASE` and
//! `MILO_WEBHOOK_SECRET` take precedence over the file.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use milo_billing::BillingOptions;
use milo_core::options::{AuthOptions, StoreBackend, StoreOptions};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenOptions {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Seconds between expiry sweeps; 0 disables the sweeper.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_sweep_interval() -> u64 {
    3600
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ListenOptions,
    #[serde(default)]
    pub store: StoreOptions,
    #[serde(default)]
    pub auth: AuthOptions,
    #[serde(default)]
    pub billing: BillingOptions,
}

impl ServerConfig {
    /// Read `path` (when given), then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                Self::from_toml(&raw)
                    .with_context(|| format!("invalid config file {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply `MILO_*` overrides read through `lookup`. Setting a store URI
    /// selects the MongoDB backend.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup("MILO_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("MILO_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("MILO_PORT must be a valid port number, got {port:?}"))?;
        }
        if let Some(uri) = lookup("MILO_STORE_URI") {
            self.store.uri = uri;
            self.store.backend = StoreBackend::Mongodb;
        }
        if let Some(database) = lookup("MILO_STORE_DATABASE") {
            self.store.database = database;
        }
        if let Some(secret) = lookup("MILO_WEBHOOK_SECRET").filter(|s| !s.is_empty()) {
            self.billing.webhook_secret = Some(secret);
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
