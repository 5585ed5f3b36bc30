//! Error taxonomy for the relay.
//!
//! Operator-facing failures (`AlreadyFollowing`, `NotFollowing`,
//! `SourceNotFound`, `SourceProtected`) are permanent and never retried.
//! `DeliveryFailed` is per destination and heals on the next
//! reconciliation because the cursor is left untouched.
//! `UpstreamUnavailable` covers fetch and subscribe failures.
//!
//! A dropped subscription is not an error: the stream simply ends and the
//! consumer reconnects.

use thiserror::Error;

use crate::item::DestinationId;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("already following {handle} in destination {destination}")]
    AlreadyFollowing {
        handle: String,
        destination: DestinationId,
    },

    #[error("not following {handle} in destination {destination}")]
    NotFollowing {
        handle: String,
        destination: DestinationId,
    },

    #[error("source {handle} not found")]
    SourceNotFound { handle: String },

    #[error("source {handle} is protected and cannot be followed")]
    SourceProtected { handle: String },

    #[error("delivery to destination {destination} failed: {reason}")]
    DeliveryFailed {
        destination: DestinationId,
        reason: String,
    },

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Config(String),
}

impl RelayError {
    #[must_use]
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::UpstreamUnavailable(message.into())
    }

    #[must_use]
    pub fn delivery(destination: DestinationId, reason: impl Into<String>) -> Self {
        Self::DeliveryFailed {
            destination,
            reason: reason.into(),
        }
    }

    /// Whether the error is a permanent, operator-facing rejection.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Self::AlreadyFollowing { .. }
                | Self::NotFollowing { .. }
                | Self::SourceNotFound { .. }
                | Self::SourceProtected { .. }
        )
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        Self::UpstreamUnavailable(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
