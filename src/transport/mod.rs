//! The `transport` module is responsible for the WebSocket side of the
//! relay.
//!
//! - `handshake`: validates `/fm/{username}` requests and the origin
//!   allow-list before the upgrade completes.
//! - `connection`: the reader and writer duties of one subscriber
//!   connection, including ping/pong liveness.
//! - `websocket`: the accept loop and graceful shutdown.

pub mod connection;
pub mod handshake;
pub mod websocket;

pub use connection::ConnectionConfig;
pub use handshake::OriginPolicy;
pub use websocket::{ServerOptions, serve, start_websocket_server};
