use thiserror::Error;

/// Configuration errors surfaced synchronously to whoever issued the request.
#[derive(Debug, Error)]
pub enum BusyError {
    /// Upsert of a channel without an id.
    #[error("invalid channel: {0}")]
    Validation(String),
    /// Operation addressed a channel the registry does not know.
    #[error("unknown channel '{0}'")]
    NotFound(String),
    /// The merged snapshot could not be written, so it was not applied.
    #[error("failed to persist settings: {0}")]
    Persistence(#[from] StoreError),
    /// The core loop has shut down and can no longer accept requests.
    #[error("daemon core is not running")]
    CoreUnavailable,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("store encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// A single field of a settings payload that could not be applied.
///
/// These never abort a merge: the offending field is logged and skipped.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MalformedSetting {
    #[error("unrecognized setting key '{0}'")]
    UnknownKey(String),
    #[error("setting '{key}' addresses unknown channel '{channel}'")]
    UnknownChannel { key: String, channel: String },
    #[error("setting '{key}' has invalid value: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Failure reported by a playback gateway for one play request.
#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("sound asset not found: {0}")]
    MissingAsset(String),
    #[error("player binary not found: {0}")]
    PlayerNotFound(String),
    #[error("failed to start player: {0}")]
    Spawn(#[from] std::io::Error),
}
