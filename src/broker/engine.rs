//! Broker engine
//!
//! The `Hub` maps each username to the single `TopicPoller` serving it:
//! - the first subscriber for a username creates and starts the poller
//! - later subscribers join it and get the cached track replayed
//! - the last unsubscribe cancels the poller and removes the entry
//!
//! Concurrency and usage notes:
//! - The registry is one `Mutex<HashMap>`, held only for lookups and
//!   structural changes, never across I/O.
//! - Subscriber membership lives behind each poller's own lock. The registry
//!   lock stays held while membership changes so an emptiness check and the
//!   removal of a poller happen in one critical section; nobody can join a
//!   poller that is being torn down.
//! - `subscribe` spawns the polling task and must be called from within a
//!   Tokio runtime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, info};

use crate::broker::topic::TopicPoller;
use crate::client::{Subscriber, SubscriberId, Username};
use crate::source::TrackSource;
use crate::utils::error::HubError;

pub const DEFAULT_MAX_POLLERS: usize = 1000;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Limits and cadence shared by every poller of a `Hub`.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Maximum number of usernames polled at once.
    pub max_pollers: usize,
    /// Time between polls of one username.
    pub poll_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_pollers: DEFAULT_MAX_POLLERS,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Registry of active pollers, keyed by normalized username.
pub struct Hub {
    pollers: Mutex<HashMap<Username, Arc<TopicPoller>>>,
    source: Arc<dyn TrackSource>,
    config: HubConfig,
}

impl Hub {
    /// Create an empty hub that fetches tracks from `source`.
    pub fn new(source: Arc<dyn TrackSource>, config: HubConfig) -> Self {
        Self {
            pollers: Mutex::new(HashMap::new()),
            source,
            config,
        }
    }

    /// The limits this hub was built with.
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Attach `subscriber` to the poller for its username, creating the
    /// poller if this is the first subscriber. A poller whose task died is
    /// replaced rather than joined.
    ///
    /// Fails with `HubError::CapacityExceeded` when a new username would
    /// exceed `max_pollers`; nothing is registered in that case and the
    /// subscriber (with its queue) is dropped.
    pub fn subscribe(&self, subscriber: Subscriber) -> Result<(), HubError> {
        let mut pollers = self.lock_pollers();
        let username = subscriber.username.clone();

        let poller = match pollers.get(&username) {
            Some(poller) if !poller.is_stopped() => Arc::clone(poller),
            stale => {
                if stale.is_none() && pollers.len() >= self.config.max_pollers {
                    return Err(HubError::CapacityExceeded {
                        limit: self.config.max_pollers,
                    });
                }
                let poller = TopicPoller::new(username.clone());
                pollers.insert(username.clone(), Arc::clone(&poller));
                poller.start(Arc::clone(&self.source), self.config.poll_interval);
                poller
            }
        };

        debug!(username = %username, subscriber = %subscriber.id, "subscribed");
        poller.add_subscriber(subscriber);
        Ok(())
    }

    /// Detach a subscriber. When it was the last one the poller is cancelled
    /// and forgotten in the same critical section. The subscriber is dropped
    /// afterwards, which closes its queue and lets the writer finish.
    ///
    /// Returns whether the subscriber was registered.
    pub fn unsubscribe(&self, username: &Username, id: &SubscriberId) -> bool {
        let removed = {
            let mut pollers = self.lock_pollers();
            let Some(poller) = pollers.get(username) else {
                return false;
            };

            let (removed, remaining) = poller.remove_subscriber(id);
            if remaining == 0 {
                poller.stop();
                pollers.remove(username);
                info!(username = %username, "last subscriber left, poller removed");
            }
            removed
        };

        match removed {
            Some(subscriber) => {
                debug!(username = %username, subscriber = %subscriber.id, "unsubscribed");
                drop(subscriber);
                true
            }
            None => false,
        }
    }

    /// Number of usernames currently polled.
    pub fn topic_count(&self) -> usize {
        self.lock_pollers().len()
    }

    /// Whether a poller is registered for `username`.
    pub fn contains(&self, username: &Username) -> bool {
        self.lock_pollers().contains_key(username)
    }

    /// Subscribers attached to `username`, zero when it is not polled.
    pub fn subscriber_count(&self, username: &Username) -> usize {
        self.poller(username)
            .map(|poller| poller.subscriber_count())
            .unwrap_or(0)
    }

    /// The poller serving `username`, if any.
    pub fn poller(&self, username: &Username) -> Option<Arc<TopicPoller>> {
        self.lock_pollers().get(username).cloned()
    }

    fn lock_pollers(&self) -> MutexGuard<'_, HashMap<Username, Arc<TopicPoller>>> {
        self.pollers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("topics", &self.topic_count())
            .field("config", &self.config)
            .finish()
    }
}
