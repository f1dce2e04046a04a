use thiserror::Error;

/// Errors surfaced by the channel layer to callers.
///
/// Mirrors the taxonomy of `rustlib`'s `SubscriberError`: one variant per
/// broker-protocol step that can fail, plus the semantic errors the facade
/// itself raises (`ChannelFull`, `InvalidPattern`).
#[derive(Error, Debug)]
pub enum ChannelLayerError {
    #[error("channel '{channel}' is full (capacity {capacity})")]
    ChannelFull { channel: String, capacity: u64 },

    #[error("pattern '{pattern}' must end with '!' or '?'")]
    InvalidPattern { pattern: String },

    #[error("failed to connect to broker: {0}")]
    ConnectionFailed(String),

    #[error("channel operation failed: {0}")]
    ChannelOperationFailed(String),

    #[error("timed out waiting for reply: {0}")]
    Timeout(String),

    #[error("session is closed")]
    Closed,

    #[error("failed to encode/decode message: {0}")]
    Codec(String),
}

impl From<lapin::Error> for ChannelLayerError {
    fn from(err: lapin::Error) -> Self {
        ChannelLayerError::ChannelOperationFailed(err.to_string())
    }
}
