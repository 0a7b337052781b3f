use serde::{Deserialize, Serialize};

/// The normalized track relayed to every subscriber of a username.
///
/// This is also the wire format: one JSON object per detected change.
/// Equality covers every field, so a track that stops playing (same song,
/// `is_now_playing` flipped) is still a change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub artist: String,
    pub track: String,
    pub image_url: String,
    pub track_url: String,
    pub is_now_playing: bool,
    /// Seconds since the epoch; `0` while the track is playing.
    pub date_uts: i64,
    /// Human readable scrobble time; empty while the track is playing.
    pub date_text: String,
}
