//! Subscriber representation
//!
//! `Subscriber` is what a connection hands to the `Hub` when it subscribes.
//! It owns the sending half of the connection's bounded outbound queue;
//! once the broker drops it, the writer duty sees the queue close and
//! shuts the socket down.

use tokio::sync::mpsc::{self, Sender, error::TrySendError};
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use super::Username;

pub type SubscriberId = String;

/// Messages buffered per connection before new ones are dropped.
pub const OUTBOUND_CAPACITY: usize = 16;

/// Outcome of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    Full,
    Closed,
}

#[derive(Debug)]
pub struct Subscriber {
    pub id: SubscriberId,
    pub username: Username,
    sender: Sender<WsMessage>,
}

impl Subscriber {
    /// Create a subscriber with a fresh `client-<uuid>` id.
    pub fn new(username: Username, sender: Sender<WsMessage>) -> Self {
        Self {
            id: format!("client-{}", Uuid::new_v4()),
            username,
            sender,
        }
    }

    /// Convenience for callers that do not manage the channel themselves.
    pub fn channel(username: Username) -> (Self, mpsc::Receiver<WsMessage>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        (Self::new(username, tx), rx)
    }

    /// Enqueue without waiting. A full queue drops the message for this
    /// subscriber only.
    pub fn try_deliver(&self, msg: WsMessage) -> Delivery {
        match self.sender.try_send(msg) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}
