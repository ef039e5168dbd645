//! Module transport boundary.
//!
//! [`TpmTransport`] is the set of primitive commands the identity components
//! issue. Implementations are the simulated module used in tests and, with
//! the `hardware-tpm` feature, a TSS-backed device. Public areas cross the
//! boundary as marshaled `TPMT_PUBLIC` bytes.

use crate::layout::{NvIndex, PersistentHandle};
use crate::marshal::NvPublic;
use thiserror::Error;
use zeroize::Zeroizing;

/// Errors reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TpmError {
    #[error("module unavailable: {0}")]
    Unavailable(String),

    #[error("object {0:#010x} not present")]
    ObjectNotPresent(u32),

    #[error("integrity check failed: {0}")]
    IntegrityCheckFailed(String),

    #[error("command rejected: {0}")]
    Rejected(String),

    #[error("transport I/O: {0}")]
    Io(String),
}

/// Primary objects created from the standard templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootKind {
    Endorsement,
    StorageRoot,
}

impl RootKind {
    pub fn handle(self) -> PersistentHandle {
        match self {
            RootKind::Endorsement => crate::layout::EK_HANDLE,
            RootKind::StorageRoot => crate::layout::SRK_HANDLE,
        }
    }
}

/// Raw ECDSA signature components as returned by the module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcdsaSignature {
    pub r: Vec<u8>,
    pub s: Vec<u8>,
}

impl EcdsaSignature {
    /// ASN.1 DER encoding.
    pub fn to_der(&self) -> Result<Vec<u8>, TpmError> {
        fn scalar(bytes: &[u8]) -> Result<p256::FieldBytes, TpmError> {
            if bytes.len() > 32 {
                return Err(TpmError::Rejected("signature scalar too long".into()));
            }
            let mut out = p256::FieldBytes::default();
            out[32 - bytes.len()..].copy_from_slice(bytes);
            Ok(out)
        }
        let signature = p256::ecdsa::Signature::from_scalars(scalar(&self.r)?, scalar(&self.s)?)
            .map_err(|err| TpmError::Rejected(err.to_string()))?;
        Ok(signature.to_der().as_bytes().to_vec())
    }
}

/// Primitive module commands.
///
/// Each call is one command; sequencing and exclusion are the caller's
/// business (see [`TpmContext`](crate::context::TpmContext)).
pub trait TpmTransport: Send {
    /// Human-readable backend description for logs.
    fn describe(&self) -> String;

    /// `TPMT_PUBLIC` of a persistent object.
    fn read_public(&mut self, handle: PersistentHandle) -> Result<Vec<u8>, TpmError>;

    /// Create a primary from its standard template and persist it at its
    /// fixed handle. Returns the existing public area when already present.
    fn create_primary(&mut self, kind: RootKind) -> Result<Vec<u8>, TpmError>;

    /// Create an ECDSA P-256 signing key under the SRK and persist it.
    fn create_signing_key(&mut self, handle: PersistentHandle) -> Result<Vec<u8>, TpmError>;

    /// Import an inner-wrapped keyed-hash duplicate under the SRK and persist it.
    fn import_keyed_hash(
        &mut self,
        handle: PersistentHandle,
        public: &[u8],
        duplicate: &[u8],
        encryption_key: &[u8],
    ) -> Result<(), TpmError>;

    fn evict(&mut self, handle: PersistentHandle) -> Result<(), TpmError>;

    /// Sign a SHA-256 digest with a persistent ECDSA key.
    fn sign_digest(
        &mut self,
        handle: PersistentHandle,
        digest: &[u8; 32],
    ) -> Result<EcdsaSignature, TpmError>;

    fn hmac(&mut self, handle: PersistentHandle, data: &[u8]) -> Result<[u8; 32], TpmError>;

    /// `TPM2_ActivateCredential` with the EK as the decrypting key.
    fn activate_credential(
        &mut self,
        activate: PersistentHandle,
        id_object: &[u8],
        encrypted_secret: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, TpmError>;

    /// `TPMS_NV_PUBLIC` of a defined index.
    fn nv_read_public(&mut self, index: NvIndex) -> Result<Vec<u8>, TpmError>;

    fn nv_define(&mut self, public: &NvPublic) -> Result<(), TpmError>;

    fn nv_write(&mut self, index: NvIndex, offset: u16, data: &[u8]) -> Result<(), TpmError>;

    fn nv_read(&mut self, index: NvIndex, offset: u16, len: u16) -> Result<Vec<u8>, TpmError>;

    fn nv_undefine(&mut self, index: NvIndex) -> Result<(), TpmError>;

    /// Release the device. Called once when the owning context is torn down.
    fn close(&mut self) {}
}
