//! Helpers shared by the unit tests: a scripted `TrackSource` and small
//! async receive utilities.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::Receiver;
use tungstenite::protocol::Message as WsMessage;

use crate::client::Username;
use crate::source::{Track, TrackSource};
use crate::utils::error::SourceError;

pub fn track(artist: &str, name: &str, now_playing: bool) -> Track {
    Track {
        artist: artist.to_string(),
        track: name.to_string(),
        image_url: format!("https://img.example/{name}.png"),
        track_url: format!("https://www.last.fm/music/{artist}/_/{name}"),
        is_now_playing: now_playing,
        date_uts: if now_playing { 0 } else { 1_700_000_000 },
        date_text: if now_playing {
            String::new()
        } else {
            "14 Nov 2023, 22:13".to_string()
        },
    }
}

pub fn user(name: &str) -> Username {
    Username::parse(name).unwrap()
}

#[derive(Debug, Clone)]
enum Reply {
    Track(Option<Track>),
    Fail,
}

/// Answers every call with the currently scripted reply after `delay`.
#[derive(Debug)]
pub struct ScriptedSource {
    reply: Mutex<Reply>,
    delay: Duration,
    calls: Mutex<HashMap<String, usize>>,
    in_flight: Mutex<HashMap<String, usize>>,
    max_in_flight: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(initial: Option<Track>) -> Arc<Self> {
        Self::with_delay(initial, Duration::ZERO)
    }

    pub fn with_delay(initial: Option<Track>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            reply: Mutex::new(Reply::Track(initial)),
            delay,
            calls: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn set_track(&self, track: Option<Track>) {
        *self.reply.lock().unwrap() = Reply::Track(track);
    }

    pub fn fail(&self) {
        *self.reply.lock().unwrap() = Reply::Fail;
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    pub fn calls_for(&self, username: &str) -> usize {
        self.calls.lock().unwrap().get(username).copied().unwrap_or(0)
    }

    /// Highest number of overlapping calls seen for any single username.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TrackSource for ScriptedSource {
    async fn latest_track(&self, username: &Username) -> Result<Option<Track>, SourceError> {
        let key = username.to_string();
        *self.calls.lock().unwrap().entry(key.clone()).or_default() += 1;
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            let current = in_flight.entry(key.clone()).or_default();
            *current += 1;
            self.max_in_flight.fetch_max(*current, Ordering::SeqCst);
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        *self.in_flight.lock().unwrap().get_mut(&key).unwrap() -= 1;

        let reply = self.reply.lock().unwrap().clone();
        match reply {
            Reply::Track(track) => Ok(track),
            Reply::Fail => Err(SourceError::Status {
                status: 503,
                username: key,
                body: "<empty>".to_string(),
            }),
        }
    }
}

/// Wait up to `ms` for the next message.
pub async fn recv_within(rx: &mut Receiver<WsMessage>, ms: u64) -> Option<WsMessage> {
    tokio::time::timeout(Duration::from_millis(ms), rx.recv())
        .await
        .ok()
        .flatten()
}

pub fn parse_track(msg: &WsMessage) -> Track {
    serde_json::from_str(msg.to_text().unwrap()).unwrap()
}

/// Poll `cond` every 10ms for up to `ms`.
pub async fn eventually(ms: u64, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(ms);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
