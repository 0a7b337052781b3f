//! The `broker` module owns polling and fan-out.
//!
//! - `engine`: the `Hub`, a registry of one `TopicPoller` per username.
//! - `topic`: the `TopicPoller`, which polls the upstream source and pushes
//!   every change to the subscribers registered with it.

pub mod engine;
pub mod topic;

pub use engine::{Hub, HubConfig};
pub use topic::TopicPoller;

#[cfg(test)]
mod tests;
