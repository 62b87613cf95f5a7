//! # Error Types
//!
//! Failures of a single wallpaper update run. Every collaborator error is
//! converted into [`UpdateError`] at the pipeline boundary; the manager turns
//! it into the human-readable `last_update_error` and never re-raises it.

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::photos::PhotoSourceError;
use crate::sink::SinkError;

/// Why an update run did not change the wallpaper.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("No album selected")]
    NoAlbumSelected,

    /// The album listed items but none survived the size/orientation filters.
    #[error("No photos left after applying filters ({total} in album)")]
    NoCandidatesAfterFilter { total: usize },

    #[error("Network error{}: {message}", .code.map(|c| format!(" (HTTP {c})")).unwrap_or_default())]
    Network { code: Option<u16>, message: String },

    #[error("Not signed in to the photo service: {0}")]
    Auth(String),

    #[error("Photo not found: {0}")]
    NotFound(String),

    #[error("Photo service did not answer within {}s", .0.as_secs())]
    TimedOut(Duration),

    #[error("No display available to apply the wallpaper")]
    DisplayUnavailable,

    #[error("Failed to apply wallpaper: {0}")]
    Apply(String),

    #[error("Filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("Failed to save settings: {0}")]
    Settings(#[from] ConfigError),

    /// Superseded by a newer request. Expected, never surfaced to the user.
    #[error("Update canceled")]
    Canceled,
}

impl UpdateError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

impl From<PhotoSourceError> for UpdateError {
    fn from(err: PhotoSourceError) -> Self {
        match err {
            PhotoSourceError::Network { status, message } => Self::Network { code: status, message },
            PhotoSourceError::Decode(message) => Self::Network { code: None, message },
            PhotoSourceError::Auth(message) => Self::Auth(message),
            PhotoSourceError::NotFound(what) => Self::NotFound(what),
        }
    }
}

impl From<SinkError> for UpdateError {
    fn from(err: SinkError) -> Self {
        match err {
            SinkError::DisplayUnavailable => Self::DisplayUnavailable,
            SinkError::Io(e) => Self::Filesystem(e),
            SinkError::Backend(message) => Self::Apply(message),
        }
    }
}
