//! Typed errors for the feed codec and the placement path.

use thiserror::Error;

/// A frame that could not be turned into a `FeedMessage` (or an outbound frame
/// that could not be built). The stream skips the frame and keeps going.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("empty frame")]
    Empty,
    #[error("frame is neither deflated JSON nor plain JSON: {0}")]
    NotJson(#[source] serde_json::Error),
    #[error("frame JSON does not match the feed schema: {0}")]
    Schema(#[source] serde_json::Error),
    #[error("frame compression failed: {0}")]
    Compress(#[from] std::io::Error),
}

/// Failure talking to the session collaborator itself (transport, bad body).
/// Upstream rejections are not errors; they come back as a `PlacementResponse`.
#[derive(Error, Debug)]
pub enum PlacementError {
    #[error("session bridge transport error: {0}")]
    Transport(String),
    #[error("session bridge returned an unreadable body: {0}")]
    Body(String),
    #[error("placement timed out after {0}ms")]
    Timeout(u64),
}

impl From<reqwest::Error> for PlacementError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            PlacementError::Body(err.to_string())
        } else {
            PlacementError::Transport(err.to_string())
        }
    }
}
