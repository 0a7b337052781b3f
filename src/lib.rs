//! # fmrelay
//!
//! `fmrelay` relays a Last.fm user's now-playing (or last played) track to
//! any number of WebSocket subscribers. However many clients watch the same
//! username, the upstream API is polled once per username.
//!
//! ## Core Modules
//!
//! - `broker`: the hub of per-username pollers and their fan-out.
//! - `client`: usernames and the subscriber handle a connection registers.
//! - `config`: loading and validating server configuration.
//! - `source`: the upstream track source and its Last.fm implementation.
//! - `transport`: the WebSocket server and per-connection duties.
//! - `utils`: error types and logging.

pub mod broker;
pub mod client;
pub mod config;
pub mod source;
pub mod transport;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_support;
