//! Endorsement and storage root accessors.

use crate::context::TpmContext;
use crate::error::{IdentityError, IdentityResult};
use crate::layout::PersistentHandle;
use crate::marshal::{ObjectName, PublicArea};
use crate::transport::RootKind;
use std::sync::Arc;

fn root_public(ctx: &TpmContext, kind: RootKind) -> IdentityResult<PublicArea> {
    ctx.with_module(|module| module.ensure_root(kind))
}

/// Read-only access to the endorsement key.
///
/// The first call on a blank module creates the primary; later calls return
/// the identical public area.
#[derive(Debug, Clone)]
pub struct EndorsementKeyProvider {
    ctx: Arc<TpmContext>,
}

impl EndorsementKeyProvider {
    pub fn new(ctx: Arc<TpmContext>) -> Self {
        Self { ctx }
    }

    pub fn get_public(&self) -> IdentityResult<PublicArea> {
        root_public(&self.ctx, RootKind::Endorsement)
    }

    /// `TPM2B_PUBLIC` of the endorsement key.
    pub fn get_public_bytes(&self) -> IdentityResult<Vec<u8>> {
        Ok(self.get_public()?.to_tpm2b()?)
    }

    /// Provisioning registration id: lowercase hex SHA-256 of the EK public area.
    pub fn registration_id(&self) -> IdentityResult<String> {
        let public = self.get_public()?.marshal()?;
        Ok(hex::encode(crate::crypto::sha256(&public)))
    }
}

/// Read-only access to the storage root key.
#[derive(Debug, Clone)]
pub struct StorageRootKeyProvider {
    ctx: Arc<TpmContext>,
}

impl StorageRootKeyProvider {
    pub fn new(ctx: Arc<TpmContext>) -> Self {
        Self { ctx }
    }

    pub fn get_public(&self) -> IdentityResult<PublicArea> {
        root_public(&self.ctx, RootKind::StorageRoot)
    }

    /// `TPM2B_PUBLIC` of the storage root key.
    pub fn get_public_bytes(&self) -> IdentityResult<Vec<u8>> {
        Ok(self.get_public()?.to_tpm2b()?)
    }
}

/// `TPM2B_PUBLIC` and name of a persistent object.
pub fn key_public(ctx: &TpmContext, handle: PersistentHandle) -> IdentityResult<(Vec<u8>, ObjectName)> {
    let public = ctx
        .with_module(|module| module.public_area(handle))?
        .ok_or(IdentityError::ObjectNotPresent { handle: handle.0 })?;
    Ok((public.to_tpm2b()?, public.name()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{EK_HANDLE, SRK_HANDLE};
    use crate::simulator::SimulatedTpm;

    #[test]
    fn test_root_reads_are_stable() {
        let ctx = TpmContext::initialize(Box::new(SimulatedTpm::with_seed([5; 32]))).unwrap();
        let ek = EndorsementKeyProvider::new(ctx.clone());
        let srk = StorageRootKeyProvider::new(ctx.clone());

        assert_eq!(ek.get_public_bytes().unwrap(), ek.get_public_bytes().unwrap());
        assert_ne!(ek.get_public_bytes().unwrap(), srk.get_public_bytes().unwrap());
        assert_eq!(
            PublicArea::from_tpm2b(&srk.get_public_bytes().unwrap()).unwrap(),
            srk.get_public().unwrap()
        );
    }

    #[test]
    fn test_registration_id_format() {
        let ctx = TpmContext::initialize(Box::new(SimulatedTpm::with_seed([5; 32]))).unwrap();
        let id = EndorsementKeyProvider::new(ctx).registration_id().unwrap();
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn test_key_public_lookup() {
        let ctx = TpmContext::initialize(Box::new(SimulatedTpm::new())).unwrap();
        let (tpm2b, name) = key_public(&ctx, EK_HANDLE).unwrap();
        assert_eq!(PublicArea::from_tpm2b(&tpm2b).unwrap().name().unwrap(), name);

        let missing = key_public(&ctx, PersistentHandle(SRK_HANDLE.0 + 0x300));
        assert!(matches!(missing, Err(IdentityError::ObjectNotPresent { .. })));
    }

    #[test]
    fn test_concurrent_reads() {
        let ctx = TpmContext::initialize(Box::new(SimulatedTpm::new())).unwrap();
        let expected = EndorsementKeyProvider::new(ctx.clone()).get_public_bytes().unwrap();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let provider = EndorsementKeyProvider::new(ctx.clone());
                std::thread::spawn(move || provider.get_public_bytes().unwrap())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), expected);
        }
    }
}
