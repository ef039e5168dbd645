//! Error types for Tessera identity operations.
//!
//! Every public operation returns [`IdentityResult`]. Failures at the module
//! boundary arrive as [`TpmError`](crate::transport::TpmError) and are mapped
//! onto the identity taxonomy here.

use crate::marshal::MarshalError;
use crate::transport::TpmError;
use thiserror::Error;

/// Errors that can occur in identity operations.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Slot index outside `[0, MAX_LOGICAL_DEVICE)`
    #[error("slot {slot} out of range (max {max})")]
    SlotOutOfRange { slot: usize, max: usize },

    /// Slot is in range but holds no object of the requested kind
    #[error("slot {slot} has no {what}")]
    NotProvisioned { slot: usize, what: &'static str },

    /// Caller buffer too small; `required` is the exact size needed
    #[error("buffer too small: {required} required")]
    BufferTooSmall { required: usize },

    /// Module missing, locked out, or its context lock was poisoned
    #[error("module unavailable: {0}")]
    TpmUnavailable(String),

    /// A root or persistent object expected at a fixed address is missing
    #[error("object {handle:#010x} not present")]
    ObjectNotPresent { handle: u32 },

    /// Credential activation failed: tamper, wrong device or replay
    #[error("activation failed: {0}")]
    ActivationFailed(String),

    /// Integrity or binding check failed outside activation
    #[error("cryptographic verification failed: {0}")]
    CryptoVerificationFailed(String),

    /// Malformed externally supplied blob or certificate
    #[error("parse failure: {0}")]
    ParseFailure(String),

    /// Transient transport or network error
    #[error("I/O failure: {0}")]
    IoFailure(String),

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("certificate not found: {0}")]
    CertNotFound(String),

    #[error("{what} too large: {len} exceeds {max}")]
    ValueTooLarge {
        what: &'static str,
        len: usize,
        max: usize,
    },

    #[error("expiration {expiry} is not after {now}")]
    InvalidExpiration { expiry: u64, now: u64 },

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Remote certificate issuance did not finish in time
    #[error("certificate issuance timed out after {0:?}")]
    IssuanceTimeout(std::time::Duration),

    /// Certificate authority rejected the request
    #[error("CA error: {0}")]
    CertificateAuthority(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl IdentityError {
    /// Whether the caller may retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IdentityError::BufferTooSmall { .. }
                | IdentityError::IoFailure(_)
                | IdentityError::IssuanceTimeout(_)
        )
    }
}

impl From<TpmError> for IdentityError {
    fn from(err: TpmError) -> Self {
        match err {
            TpmError::Unavailable(reason) => IdentityError::TpmUnavailable(reason),
            TpmError::ObjectNotPresent(handle) => IdentityError::ObjectNotPresent { handle },
            TpmError::IntegrityCheckFailed(reason) => {
                IdentityError::CryptoVerificationFailed(reason)
            }
            TpmError::Rejected(reason) => IdentityError::ParseFailure(reason),
            TpmError::Io(reason) => IdentityError::IoFailure(reason),
        }
    }
}

impl From<MarshalError> for IdentityError {
    fn from(err: MarshalError) -> Self {
        IdentityError::ParseFailure(err.to_string())
    }
}

impl From<std::io::Error> for IdentityError {
    fn from(err: std::io::Error) -> Self {
        IdentityError::IoFailure(err.to_string())
    }
}

impl From<tessera_core::CoreError> for IdentityError {
    fn from(err: tessera_core::CoreError) -> Self {
        match err {
            tessera_core::CoreError::Config(reason) => IdentityError::Config(reason),
            tessera_core::CoreError::Io(err) => IdentityError::IoFailure(err.to_string()),
        }
    }
}

/// Result type for identity operations.
pub type IdentityResult<T> = std::result::Result<T, IdentityError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(IdentityError::BufferTooSmall { required: 4 }.is_retryable());
        assert!(IdentityError::IoFailure("reset".into()).is_retryable());
        assert!(IdentityError::IssuanceTimeout(std::time::Duration::from_secs(1)).is_retryable());

        assert!(!IdentityError::ActivationFailed("tag".into()).is_retryable());
        assert!(!IdentityError::TpmUnavailable("gone".into()).is_retryable());
        assert!(!IdentityError::SlotOutOfRange { slot: 10, max: 10 }.is_retryable());
    }

    #[test]
    fn test_transport_error_mapping() {
        let err: IdentityError = TpmError::ObjectNotPresent(0x8101_0001).into();
        assert!(matches!(
            err,
            IdentityError::ObjectNotPresent { handle: 0x8101_0001 }
        ));

        let err: IdentityError = TpmError::Io("timeout".into()).into();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_marshal_error_is_parse_failure() {
        let err: IdentityError = MarshalError::TrailingData(3).into();
        assert!(matches!(err, IdentityError::ParseFailure(_)));
    }
}
