use std::time::Duration;

use serde::Deserialize;

use crate::broker::HubConfig;
use crate::source::lastfm::DEFAULT_API_URL;

/// Top-level configuration settings for the application.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub lastfm: LastFmSettings,
    pub broker: BrokerSettings,
    pub log_level: String,
}

/// Where the WebSocket server listens and whom it accepts.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Empty means every origin is accepted.
    pub allowed_origins: Vec<String>,
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LastFmSettings {
    pub api_key: String,
    pub api_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerSettings {
    pub max_pollers: usize,
    pub poll_interval_secs: u64,
}

/// Raw values as found in `config/default.*` and the environment. Every
/// field is optional and kept as text so validation can report the value
/// it rejected.
#[derive(Debug, Default, Deserialize)]
pub struct PartialSettings {
    pub lastfm_api_key: Option<String>,
    pub lastfm_api_url: Option<String>,
    pub host: Option<String>,
    pub port: Option<String>,
    pub allowed_origins: Option<String>,
    pub max_pollers: Option<String>,
    pub poll_interval_secs: Option<String>,
    pub shutdown_timeout_secs: Option<String>,
    pub log_level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "0.0.0.0".to_string(),
                port: 3621,
                allowed_origins: Vec::new(),
                shutdown_timeout_secs: 10,
            },
            lastfm: LastFmSettings {
                api_key: String::new(),
                api_url: DEFAULT_API_URL.to_string(),
            },
            broker: BrokerSettings {
                max_pollers: 1000,
                poll_interval_secs: 5,
            },
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            max_pollers: self.broker.max_pollers,
            poll_interval: Duration::from_secs(self.broker.poll_interval_secs),
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }
}
