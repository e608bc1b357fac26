//! Error kinds the core distinguishes (see §7 of the design doc).
//!
//! Per-recipient delivery errors never propagate as `CoreError` — they are
//! absorbed into the [`crate::pipeline::DeliveryReport`] instead. This enum
//! is for errors that callers (HTTP handlers, background loops) need to act
//! on directly.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("message {0} already processed")]
    DuplicateMessage(String),

    #[error("invalid receiver: {0}")]
    InvalidReceiver(String),

    #[error("encryption failure: {0}")]
    EncryptionFailure(String),

    #[error("serialization failure: {0}")]
    SerializationFailure(#[from] serde_json::Error),

    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("peer returned HTTP {0}")]
    PeerHttpError(u16),

    #[error("peer request timed out")]
    PeerTimeout,

    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    #[error("discovery rebind failed: {0}")]
    DiscoveryRebindFailure(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] rusqlite::Error),

    /// Not one of §7's ten named kinds — the file service (component G)
    /// still needs to surface "path missing/unreadable" distinctly from a
    /// store failure.
    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
