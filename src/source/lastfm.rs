//! Last.fm client
//!
//! Calls `user.getrecenttracks` with `limit=1` and normalizes the first
//! entry into a `Track`. Response bodies are capped at 1 MiB and error
//! bodies are trimmed to a 1 KiB snippet for the log line.

use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tracing::warn;

use super::{Track, TrackSource};
use crate::client::Username;
use crate::utils::error::SourceError;

pub const DEFAULT_API_URL: &str = "http://ws.audioscrobbler.com/2.0/";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RESPONSE_BYTES: usize = 1 << 20;
const MAX_ERROR_BODY_BYTES: usize = 1024;

#[derive(Clone)]
pub struct LastFm {
    client: Client,
    api_url: String,
    api_key: String,
}

impl LastFm {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, SourceError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            api_url: api_url.into(),
            api_key: api_key.into(),
        })
    }
}

impl std::fmt::Debug for LastFm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LastFm")
            .field("api_url", &self.api_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl TrackSource for LastFm {
    async fn latest_track(&self, username: &Username) -> Result<Option<Track>, SourceError> {
        let resp = self
            .client
            .get(&self.api_url)
            .query(&[
                ("method", "user.getrecenttracks"),
                ("user", username.as_str()),
                ("limit", "1"),
                ("api_key", self.api_key.as_str()),
                ("format", "json"),
            ])
            .send()
            .await?;

        let status = resp.status();
        if status != StatusCode::OK {
            let snippet = read_body(resp, MAX_ERROR_BODY_BYTES, true).await?;
            let text = String::from_utf8_lossy(&snippet).trim().to_string();
            return Err(SourceError::Status {
                status: status.as_u16(),
                username: username.to_string(),
                body: if text.is_empty() { "<empty>".to_string() } else { text },
            });
        }

        let body = read_body(resp, MAX_RESPONSE_BYTES, false).await?;
        parse_recent_tracks(username, &body)
    }
}

/// Read at most `limit` bytes. With `truncate` the excess is discarded,
/// otherwise an oversized body is an error.
async fn read_body(mut resp: Response, limit: usize, truncate: bool) -> Result<Vec<u8>, SourceError> {
    let mut body = Vec::new();
    while let Some(chunk) = resp.chunk().await? {
        let room = limit - body.len();
        if chunk.len() > room {
            if truncate {
                body.extend_from_slice(&chunk[..room]);
                break;
            }
            return Err(SourceError::BodyTooLarge { limit });
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

#[derive(Debug, Default, Deserialize)]
struct RecentTracksResponse {
    #[serde(default)]
    recenttracks: RecentTracks,
}

#[derive(Debug, Default, Deserialize)]
struct RecentTracks {
    #[serde(default)]
    track: Vec<RawTrack>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawTrack {
    artist: TextField,
    name: String,
    image: Vec<RawImage>,
    url: String,
    date: RawDate,
    #[serde(rename = "@attr")]
    attr: RawAttr,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TextField {
    #[serde(rename = "#text")]
    text: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawImage {
    #[serde(rename = "#text")]
    url: String,
    size: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawDate {
    uts: String,
    #[serde(rename = "#text")]
    text: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawAttr {
    nowplaying: String,
}

/// Normalize a `user.getrecenttracks` body. `Ok(None)` when the user has no
/// tracks at all.
pub fn parse_recent_tracks(username: &Username, body: &[u8]) -> Result<Option<Track>, SourceError> {
    let data: RecentTracksResponse = serde_json::from_slice(body)?;
    let Some(raw) = data.recenttracks.track.into_iter().next() else {
        return Ok(None);
    };

    let is_now_playing = raw.attr.nowplaying.trim() == "true";
    let image_url = raw
        .image
        .into_iter()
        .find(|image| image.size == "large")
        .map(|image| image.url)
        .unwrap_or_default();

    let (date_uts, date_text) = if is_now_playing {
        (0, String::new())
    } else {
        let uts = parse_uts(username, &raw.date.uts);
        let text = if raw.date.text.is_empty() && uts != 0 {
            format_scrobble_date(uts)
        } else {
            raw.date.text
        };
        (uts, text)
    };

    Ok(Some(Track {
        artist: raw.artist.text,
        track: raw.name,
        image_url,
        track_url: raw.url,
        is_now_playing,
        date_uts,
        date_text,
    }))
}

fn parse_uts(username: &Username, uts: &str) -> i64 {
    if uts.is_empty() {
        return 0;
    }
    match uts.trim().parse::<i64>() {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(username = %username, uts, "failed to parse date uts: {e}");
            0
        }
    }
}

/// Same layout Last.fm uses for `date["#text"]`, e.g. `05 Mar 2024, 18:02`.
fn format_scrobble_date(uts: i64) -> String {
    DateTime::from_timestamp(uts, 0)
        .map(|dt| dt.format("%d %b %Y, %H:%M").to_string())
        .unwrap_or_default()
}
