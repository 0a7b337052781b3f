//! The `source` module is the boundary to the upstream service.
//!
//! `TrackSource` is the one call the broker makes per poll tick; `LastFm`
//! implements it over HTTP. Keeping the trait here lets the broker be driven
//! by an in-memory source in tests.

pub mod lastfm;
pub mod track;

use async_trait::async_trait;

use crate::client::Username;
use crate::utils::error::SourceError;

pub use lastfm::{LastFm, parse_recent_tracks};
pub use track::Track;

/// Fetches the current (or most recently played) track for a user.
///
/// `Ok(None)` means the user has no recent tracks; errors are transient and
/// only cost the caller one tick.
#[async_trait]
pub trait TrackSource: Send + Sync {
    async fn latest_track(&self, username: &Username) -> Result<Option<Track>, SourceError>;
}
