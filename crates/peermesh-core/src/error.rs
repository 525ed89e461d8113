//! Error types for the peermesh core.
//!
//! Components catch and log at their own boundary; only a small set of
//! conditions is ever surfaced to the caller. The namespace engine never
//! propagates an error past its event loop — failures transition state.

use thiserror::Error;

/// Core error type for peermesh operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A signaling endpoint id is already claimed by another peer.
    #[error("signaling address taken")]
    AddressTaken(String),

    /// The signaling service rejected the endpoint id outright.
    #[error("signaling address unavailable")]
    AddressUnavailable(String),

    /// The signaling service (or the network path to it) is unreachable.
    #[error("network down")]
    NetworkDown,

    /// The signaling service is rate limiting endpoint creation.
    #[error("signaling rate limited")]
    SignalingRateLimited,

    /// A transport operation did not complete in time.
    #[error("transport timed out")]
    TransportTimeout,

    /// The remote end closed the channel.
    #[error("channel closed")]
    ChannelClosed,

    /// Signature verification failed.
    #[error("signature verification failed")]
    VerifyFailed,

    /// Authenticated decryption failed.
    #[error("decryption failed")]
    DecryptFailed,

    /// Key derivation or key import failed.
    #[error("invalid key material")]
    KeyDerive(String),

    /// Wire protocol error. Malformed messages are silently dropped.
    #[error("protocol error")]
    Protocol(String),

    /// Storage operation failed.
    #[error("storage error")]
    Storage(String),

    /// Encoding/decoding error.
    #[error("encoding error")]
    Encoding(String),

    /// A contact could not be reached after all direct attempts.
    #[error("contact unreachable")]
    ContactUnreachable(String),

    /// The user has switched the overlay offline.
    #[error("offline mode")]
    OfflineMode,

    /// Referenced contact, group or namespace does not exist.
    #[error("not found")]
    NotFound(String),

    /// The caller lacks the required group role.
    #[error("permission denied")]
    Permission(String),

    /// Operation is invalid in the current state.
    #[error("invalid state")]
    State(String),
}

/// Result type alias using the peermesh [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error should cause a silent drop of the offending
    /// message rather than any state transition.
    pub fn should_silent_drop(&self) -> bool {
        matches!(self, Error::Protocol(_) | Error::Encoding(_))
    }

    /// Whether this is a network-level failure (as opposed to a refusal).
    ///
    /// Network failures pause the engine instead of escalating levels.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Error::NetworkDown | Error::TransportTimeout | Error::SignalingRateLimited
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Encoding(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silent_drop_classification() {
        assert!(Error::Protocol("bad type".into()).should_silent_drop());
        assert!(Error::Encoding("truncated".into()).should_silent_drop());
        assert!(!Error::VerifyFailed.should_silent_drop());
        assert!(!Error::NetworkDown.should_silent_drop());
    }

    #[test]
    fn test_network_classification() {
        assert!(Error::NetworkDown.is_network());
        assert!(Error::TransportTimeout.is_network());
        assert!(!Error::AddressTaken("x".into()).is_network());
    }
}
