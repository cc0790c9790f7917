//! Error types for the group replication protocol

use thiserror::Error;

/// Main error type for group replication operations
#[derive(Error, Debug)]
pub enum GroupError {
    /// Malformed request or arguments
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Payload or key could not be decoded
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Payload could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// No key or context registered for this group id
    #[error("Unknown group id: {0}")]
    UnknownGroupId(String),

    /// Member key not present in the group index
    #[error("Unknown member: {0}")]
    UnknownMember(String),

    /// Device key not present in the group index
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// Signature verification returned false
    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),

    /// Device secret addressed to another member of the group
    #[error("Secret is addressed to another member: {0}")]
    SecretMisdirected(String),

    /// Invariant violation inside the index or a store
    #[error("Internal error: {0}")]
    Internal(String),

    /// Chain already holds its initial entry
    #[error("sig chain already initialized")]
    SigChainAlreadyInitialized,

    /// Chain has no entry yet
    #[error("sig chain has not been initialized yet")]
    SigChainNotInitialized,

    /// Signing key is not currently valid on the chain
    #[error("not allowed to {0} entry")]
    SigChainNotAllowed(&'static str),

    /// Subject key is already valid on the chain
    #[error("pub key is already listed in the sig chain")]
    SigChainKeyAlreadyListed,

    /// Subject key is not valid on the chain
    #[error("pub key is not currently listed in the sig chain")]
    SigChainKeyNotListed,

    /// Chain is empty
    #[error("unable to find first entry")]
    SigChainFirstEntryMissing,

    /// First entry is not an `InitChain` entry
    #[error("invalid type for first entry")]
    SigChainInvalidFirstEntry,

    /// Chain failed custody validation
    #[error("sig chain corrupted at entry {index}: {reason}")]
    SigChainCorrupted {
        /// Position of the offending entry
        index: usize,
        /// What did not hold
        reason: String,
    },

    /// Cryptographic primitive failed (not a plain verification mismatch)
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Decryption failed (wrong key, tampered data, or malformed input)
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Envelope protocol version not supported
    #[error("Envelope version {0} is not supported")]
    EnvelopeVersionUnsupported(u8),

    /// Invitation token malformed or its proof does not verify
    #[error("Invalid invitation: {0}")]
    InvalidInvitation(String),

    /// Admin-only operation attempted by a non-admin
    #[error("Member is not an admin: {0}")]
    NotAdmin(String),

    /// Log substrate rejected or failed an operation
    #[error("Log error: {0}")]
    Log(String),

    /// Operation exceeded its deadline; the write may still propagate
    #[error("Operation timed out after {0} ms")]
    Timeout(u64),

    /// Group context has been closed
    #[error("Group context closed")]
    Closed,

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GroupError {
    /// Whether this error is a per-entry replay failure.
    ///
    /// Replay failures drop the effect of one log entry and never abort the
    /// batch being applied.
    pub fn is_replay_recoverable(&self) -> bool {
        matches!(
            self,
            GroupError::Deserialization(_)
                | GroupError::SignatureInvalid(_)
                | GroupError::SecretMisdirected(_)
                | GroupError::DecryptionFailed(_)
                | GroupError::EnvelopeVersionUnsupported(_)
                | GroupError::InvalidInvitation(_)
                | GroupError::InvalidInput(_)
                | GroupError::UnknownDevice(_)
                | GroupError::UnknownMember(_)
                | GroupError::NotAdmin(_)
                | GroupError::Crypto(_)
                | GroupError::Internal(_)
        )
    }
}

/// Result type alias using GroupError
pub type GroupResult<T> = Result<T, GroupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            GroupError::SigChainFirstEntryMissing.to_string(),
            "unable to find first entry"
        );
        assert_eq!(
            GroupError::SigChainNotAllowed("add").to_string(),
            "not allowed to add entry"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: GroupError = io_err.into();
        assert!(matches!(err, GroupError::Io(_)));
    }

    #[test]
    fn test_replay_recoverable() {
        assert!(GroupError::SecretMisdirected("m".into()).is_replay_recoverable());
        assert!(GroupError::Deserialization("bad".into()).is_replay_recoverable());
        assert!(!GroupError::Timeout(10).is_replay_recoverable());
        assert!(!GroupError::Closed.is_replay_recoverable());
    }
}
