//! The `error` module defines the error types used within `fmrelay`.
//!
//! Each enum maps to one failure class: input validation, capacity,
//! upstream transient errors, configuration and server lifecycle. Errors
//! local to one connection or one poll tick are logged where they happen;
//! only configuration and server errors reach `main`.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// A requested username was rejected before reaching the broker.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UsernameError {
    #[error("Username not provided")]
    Missing,
    #[error("Invalid username")]
    Invalid(String),
}

/// Errors returned by `Hub::subscribe`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HubError {
    #[error("maximum number of monitored users reached")]
    CapacityExceeded { limit: usize },
}

/// Failures while asking the upstream service for the latest track.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request to Last.fm failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Last.fm API returned status {status} for user {username}: {body}")]
    Status {
        status: u16,
        username: String,
        body: String,
    },
    #[error("failed to parse Last.fm response: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Last.fm response exceeded {limit} bytes")]
    BodyTooLarge { limit: usize },
}

/// Fatal configuration problems detected at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("LASTFM_API_KEY environment variable not set")]
    MissingApiKey,
    #[error("Invalid PORT value {0:?}: must be an integer between 1 and 65535")]
    InvalidPort(String),
    #[error(transparent)]
    Load(#[from] config::ConfigError),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("server forced to shutdown after {0:?}")]
    ShutdownTimeout(Duration),
}
