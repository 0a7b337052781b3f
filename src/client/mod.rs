//! The `client` module defines how a connected WebSocket peer is
//! represented to the broker.
//!
//! It provides the `Username` key every subscription is scoped by and the
//! `Subscriber` handle: the connection's identifier plus the sending half
//! of its bounded outbound queue.

pub mod pubsub_client;
pub mod username;

pub use pubsub_client::{Delivery, Subscriber, SubscriberId, OUTBOUND_CAPACITY};
pub use username::Username;
