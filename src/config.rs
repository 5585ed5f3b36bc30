//! Relay configuration, read from a TOML file.
//!
//! ```toml
//! store_path = "follows.json"
//!
//! [upstream]
//! api_base = "https://api.twitter.com/1.1"
//! stream_base = "https://stream.twitter.com/1.1"
//! bearer_token = "..."
//!
//! [stream]
//! backoff_max_ms = 60000
//!
//! [destinations]
//! 100 = "https://discord.com/api/webhooks/..."
//! ```
//!
//! Every field except the webhook map has a default.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{RelayError, Result};
use crate::item::DestinationId;

/// Environment variable that overrides `upstream.bearer_token`.
pub const TOKEN_ENV: &str = "FEEDRELAY_BEARER_TOKEN";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// JSON file holding the follow registry.
    pub store_path: PathBuf,
    pub upstream: UpstreamConfig,
    pub stream: StreamConfig,
    /// Destination id → webhook URL.
    pub destinations: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("follows.json"),
            upstream: UpstreamConfig::default(),
            stream: StreamConfig::default(),
            destinations: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub api_base: String,
    pub stream_base: String,
    pub bearer_token: String,
    /// Prefix of delivered item URLs.
    pub item_url_base: String,
    /// Bound on a single REST call.  A backfill walking several pages gets
    /// this much per page.
    pub fetch_timeout_secs: u64,
    /// Pages of history a backfill may walk through.
    pub max_pages: usize,
    /// A live stream silent for this long (not even keep-alives) is treated
    /// as dropped.
    pub stall_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.twitter.com/1.1".to_string(),
            stream_base: "https://stream.twitter.com/1.1".to_string(),
            bearer_token: String::new(),
            item_url_base: "https://twitter.com".to_string(),
            fetch_timeout_secs: 30,
            max_pages: 16,
            stall_timeout_secs: 90,
        }
    }
}

impl UpstreamConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Bound on a whole cursor-bounded fetch, which may take `max_pages`
    /// requests.
    pub fn backfill_timeout(&self) -> Duration {
        self.fetch_timeout() * self.max_pages.max(1) as u32
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// How long a restart waits for the new subscription before returning.
    pub ready_timeout_secs: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ready_timeout_secs: 30,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 60_000,
        }
    }
}

impl StreamConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms.max(self.backoff_initial_ms))
    }
}

impl Config {
    /// Read and parse `path`, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&raw)?;
        if let Ok(token) = std::env::var(TOKEN_ENV) {
            config.upstream.bearer_token = token;
        }
        Ok(config)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).map_err(|e| RelayError::Config(e.to_string()))?;
        config.webhooks()?;
        Ok(config)
    }

    /// The `[destinations]` table with parsed ids.
    pub fn webhooks(&self) -> Result<HashMap<DestinationId, String>> {
        self.destinations
            .iter()
            .map(|(id, url)| {
                id.parse::<u64>()
                    .map(|id| (DestinationId(id), url.clone()))
                    .map_err(|_| RelayError::Config(format!("destination id {id:?} is not numeric")))
            })
            .collect()
    }
}
