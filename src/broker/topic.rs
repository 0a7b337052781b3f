//! Topic poller
//!
//! A `TopicPoller` exists for exactly one username while at least one
//! subscriber is registered for it. It polls immediately on start, then on
//! a fixed interval, and broadcasts a track only when it differs from the
//! last one broadcast. The subscriber set and the cached payload sit behind
//! the poller's own lock so distinct usernames never contend.
//!
//! Lock order: the hub's registry lock may be held while taking this lock,
//! never the other way round.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::client::{Delivery, Subscriber, SubscriberId, Username};
use crate::source::{Track, TrackSource};

#[derive(Debug, Default)]
struct TopicState {
    subscribers: HashMap<SubscriberId, Subscriber>,
    /// `None` until the first track is observed.
    last_track: Option<Track>,
    /// Serialized form of `last_track`, replayed to late joiners.
    last_payload: Option<WsMessage>,
}

/// The polling cycle and subscriber set for one username.
#[derive(Debug)]
pub struct TopicPoller {
    username: Username,
    cancel: CancellationToken,
    state: Mutex<TopicState>,
}

impl TopicPoller {
    /// Create an idle poller. Nothing is fetched until `start`.
    pub fn new(username: Username) -> Arc<Self> {
        Arc::new(Self {
            username,
            cancel: CancellationToken::new(),
            state: Mutex::new(TopicState::default()),
        })
    }

    /// The normalized username this poller serves.
    pub fn username(&self) -> &Username {
        &self.username
    }

    /// Spawn the polling cycle. The first poll happens right away.
    ///
    /// If the cycle panics the poller is marked stopped and every subscriber
    /// is dropped, which closes their queues and ends their connections.
    pub fn start(self: &Arc<Self>, source: Arc<dyn TrackSource>, interval: Duration) {
        let task = tokio::spawn(Arc::clone(self).run(source, interval));
        let poller = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = task.await {
                error!(username = %poller.username, "poller task failed: {e}");
                poller.abandon();
            }
        });
    }

    /// Cancel the polling cycle. A poll already awaiting the source is left to
    /// finish and its result is discarded.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Whether the polling cycle has been cancelled or has died.
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Number of subscribers currently attached.
    pub fn subscriber_count(&self) -> usize {
        self.lock_state().subscribers.len()
    }

    /// The payload a new subscriber would be replayed, if a track was seen.
    pub fn last_payload(&self) -> Option<WsMessage> {
        self.lock_state().last_payload.clone()
    }

    /// Register a subscriber and replay the cached payload to it, if any.
    pub(crate) fn add_subscriber(&self, subscriber: Subscriber) {
        let mut state = self.lock_state();
        if let Some(payload) = state.last_payload.clone() {
            if subscriber.try_deliver(payload) != Delivery::Queued {
                debug!(
                    username = %self.username,
                    subscriber = %subscriber.id,
                    "initial cached message dropped"
                );
            }
        }
        state.subscribers.insert(subscriber.id.clone(), subscriber);
    }

    /// Remove a subscriber, returning it with the number still registered.
    pub(crate) fn remove_subscriber(&self, id: &SubscriberId) -> (Option<Subscriber>, usize) {
        let mut state = self.lock_state();
        let removed = state.subscribers.remove(id);
        (removed, state.subscribers.len())
    }

    /// Cache `payload` for late joiners and enqueue it for every subscriber
    /// without waiting. Returns how many queues accepted it; a full queue
    /// only loses this message for that subscriber.
    pub fn broadcast(&self, payload: WsMessage) -> usize {
        let mut state = self.lock_state();
        self.fan_out(&mut state, payload)
    }

    /// Broadcast `track` if it differs from the last one. Returns whether a
    /// broadcast happened.
    pub(crate) fn publish(&self, track: Track) -> bool {
        let mut state = self.lock_state();
        if state.last_track.as_ref() == Some(&track) {
            return false;
        }
        let text = match serde_json::to_string(&track) {
            Ok(json) => json,
            Err(e) => {
                error!(username = %self.username, "failed to serialize track: {e}");
                return false;
            }
        };
        state.last_track = Some(track);
        self.fan_out(&mut state, WsMessage::text(text));
        true
    }

    fn fan_out(&self, state: &mut TopicState, payload: WsMessage) -> usize {
        state.last_payload = Some(payload.clone());
        let mut queued = 0;
        for subscriber in state.subscribers.values() {
            match subscriber.try_deliver(payload.clone()) {
                Delivery::Queued => queued += 1,
                Delivery::Full => debug!(
                    username = %self.username,
                    subscriber = %subscriber.id,
                    "send queue full, message dropped"
                ),
                // The reader will unsubscribe it shortly.
                Delivery::Closed => {}
            }
        }
        queued
    }

    fn abandon(&self) {
        self.cancel.cancel();
        let dropped = std::mem::take(&mut self.lock_state().subscribers);
        debug!(
            username = %self.username,
            subscribers = dropped.len(),
            "dropping subscribers of failed poller"
        );
    }

    async fn run(self: Arc<Self>, source: Arc<dyn TrackSource>, interval: Duration) {
        info!(username = %self.username, "poller started");

        if !self.cancel.is_cancelled() {
            self.poll(source.as_ref()).await;
        }

        let mut ticker = time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.poll(source.as_ref()).await,
            }
        }

        info!(username = %self.username, "poller stopped");
    }

    async fn poll(&self, source: &dyn TrackSource) {
        let result = source.latest_track(&self.username).await;
        if self.cancel.is_cancelled() {
            debug!(username = %self.username, "discarding poll result after cancellation");
            return;
        }

        match result {
            Ok(Some(track)) => {
                if self.publish(track) {
                    debug!(username = %self.username, "broadcast new track");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(username = %self.username, "error polling Last.fm: {e}"),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, TopicState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
