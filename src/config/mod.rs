mod settings;

use config::{Config, Environment, File};
use tracing::warn;

use crate::utils::error::ConfigError;

pub use settings::{BrokerSettings, LastFmSettings, PartialSettings, ServerSettings, Settings};

/// Loads the configuration from `config/default.*` (optional) and the
/// environment, environment winning. Names are the lower-cased environment
/// variable names, e.g. `LASTFM_API_KEY` or `lastfm_api_key` in the file.
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(Environment::default());

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;
    resolve(partial)
}

/// Validate raw values and merge them with the defaults.
///
/// A missing API key or a bad port is fatal. Bad tuning values only warn and
/// fall back to their defaults.
pub fn resolve(partial: PartialSettings) -> Result<Settings, ConfigError> {
    let default = Settings::default();

    let api_key = partial
        .lastfm_api_key
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
        .ok_or(ConfigError::MissingApiKey)?;

    let port = match non_empty(partial.port) {
        Some(raw) => parse_port(&raw)?,
        None => default.server.port,
    };

    Ok(Settings {
        server: ServerSettings {
            host: non_empty(partial.host).unwrap_or(default.server.host),
            port,
            allowed_origins: partial
                .allowed_origins
                .as_deref()
                .map(parse_allowed_origins)
                .unwrap_or_default(),
            shutdown_timeout_secs: positive_or_default(
                "SHUTDOWN_TIMEOUT_SECS",
                partial.shutdown_timeout_secs,
                default.server.shutdown_timeout_secs,
            ),
        },
        lastfm: LastFmSettings {
            api_key,
            api_url: non_empty(partial.lastfm_api_url).unwrap_or(default.lastfm.api_url),
        },
        broker: BrokerSettings {
            max_pollers: positive_or_default(
                "MAX_POLLERS",
                partial.max_pollers,
                default.broker.max_pollers as u64,
            ) as usize,
            poll_interval_secs: positive_or_default(
                "POLL_INTERVAL_SECS",
                partial.poll_interval_secs,
                default.broker.poll_interval_secs,
            ),
        },
        log_level: non_empty(partial.log_level).unwrap_or(default.log_level),
    })
}

/// Split a comma separated origin list, trimming entries and dropping
/// empty ones.
pub fn parse_allowed_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_port(raw: &str) -> Result<u16, ConfigError> {
    match raw.trim().parse::<u16>() {
        Ok(port) if port >= 1 => Ok(port),
        _ => Err(ConfigError::InvalidPort(raw.to_string())),
    }
}

fn positive_or_default(name: &str, raw: Option<String>, default: u64) -> u64 {
    let Some(raw) = non_empty(raw) else {
        return default;
    };
    match raw.trim().parse::<i64>() {
        Ok(value) if value > 0 => value as u64,
        Ok(_) => {
            warn!("Invalid {name} value {raw:?}: must be greater than 0; using default {default}");
            default
        }
        Err(_) => {
            warn!("Invalid {name} value {raw:?}: not a valid integer; using default {default}");
            default
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
