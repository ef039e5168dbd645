//! Identity and HMAC keys of a slot.
//!
//! The identity key is an ECDSA P-256 key created inside the module and
//! persisted at the slot's identity handle. A slot holding an identity key
//! always holds a certificate for it: either one issued by a CA or a
//! self-signed placeholder generated here.
//!
//! The HMAC key is a keyed-hash object imported from caller-supplied bytes
//! and used for SAS token signatures.

use crate::certificate::{
    self, CertificateProfile, IdentityCertificate, Thumbprint,
};
use crate::context::{Module, TpmContext};
use crate::credential;
use crate::error::{IdentityError, IdentityResult};
use crate::layout::{LogicalDeviceSlot, SYMMETRIC_KEY_SIZE};
use crate::marshal::{KeyedHashSensitive, ObjectName, PublicArea, MAX_SYM_DATA, SHA256_DIGEST_SIZE};
use crate::registry::{load_key, TpmKeyHandle};
use crate::transport::TpmError;
use rand::RngCore;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Identity key algorithm. Only ECDSA over P-256 is provisioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityAlgorithm {
    EcdsaP256,
}

impl IdentityAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityAlgorithm::EcdsaP256 => "ECDSA_P256",
        }
    }
}

impl FromStr for IdentityAlgorithm {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ECDSA" | "ECDSA_P256" | "ECDSA_P256_SHA256" => Ok(IdentityAlgorithm::EcdsaP256),
            _ => Err(IdentityError::UnsupportedAlgorithm(s.to_string())),
        }
    }
}

/// Identity key of a slot together with its bound certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityKey {
    pub certificate: IdentityCertificate,
    /// Uncompressed SEC1 point
    pub public_key: Vec<u8>,
    pub key_name: ObjectName,
}

impl IdentityKey {
    pub fn thumbprint(&self) -> Thumbprint {
        self.certificate.thumbprint
    }
}

/// Signature made with an identity key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentitySignature {
    /// Subject of the certificate bound to the signing key
    pub subject: String,
    /// DER-encoded ECDSA signature over SHA-256 of the data
    pub signature: Vec<u8>,
}

fn not_found(slot: LogicalDeviceSlot, what: &str) -> impl FnOnce(TpmError) -> IdentityError + '_ {
    move |err| match err {
        TpmError::ObjectNotPresent(_) => IdentityError::KeyNotFound(format!("slot {slot} has no {what}")),
        other => other.into(),
    }
}

/// Key lifecycle for the slots of one module.
#[derive(Debug, Clone)]
pub struct IdentityKeyManager {
    ctx: Arc<TpmContext>,
    profile: CertificateProfile,
}

impl IdentityKeyManager {
    pub fn new(ctx: Arc<TpmContext>, profile: CertificateProfile) -> Self {
        Self { ctx, profile }
    }

    pub fn profile(&self) -> &CertificateProfile {
        &self.profile
    }

    /// Return the slot's identity key, creating it on first use.
    ///
    /// A stored certificate that still matches the key is reused. Otherwise
    /// a placeholder certificate is generated and stored. Creation, signing
    /// and storage run as one module sequence; a key created by this call is
    /// evicted again if a later step fails.
    pub fn create_or_import_identity_key(
        &self,
        slot: usize,
        algorithm: &str,
    ) -> IdentityResult<IdentityKey> {
        let slot = LogicalDeviceSlot::new(slot)?;
        let _: IdentityAlgorithm = algorithm.parse()?;
        let handle = slot.identity_key_handle();

        self.ctx.with_module(|module| {
            let (key, created) = match load_key(module, handle)? {
                Some(key) => (key, false),
                None => {
                    let public = module.transport().create_signing_key(handle)?;
                    let public = PublicArea::unmarshal(&public)?;
                    info!(%slot, "identity key created");
                    (TpmKeyHandle { handle, public }, true)
                }
            };
            match self.bind_certificate_locked(module, slot, &key) {
                Ok(identity) => Ok(identity),
                Err(err) => {
                    if created {
                        if let Err(rollback) = module.evict_if_present(handle) {
                            warn!(%slot, error = %rollback, "rollback of identity key failed");
                        }
                    }
                    Err(err)
                }
            }
        })
    }

    fn bind_certificate_locked(
        &self,
        module: &mut Module,
        slot: LogicalDeviceSlot,
        key: &TpmKeyHandle,
    ) -> IdentityResult<IdentityKey> {
        let key_name = key.name()?;
        let public_key = key
            .public
            .ecc()
            .map(|detail| detail.point.to_sec1_uncompressed())
            .ok_or_else(|| IdentityError::UnsupportedAlgorithm("identity key is not ECC".into()))?;

        if let Some(der) = certificate::read_cert_locked(module, slot)? {
            if certificate::certificate_public_key(&der).ok().as_ref() == Some(&public_key) {
                return Ok(IdentityKey {
                    certificate: IdentityCertificate::from_der(der, key_name)?,
                    public_key,
                    key_name,
                });
            }
            debug!(%slot, "stored certificate does not match identity key");
        }

        let common_name = match load_key(module, slot.hmac_key_handle())? {
            Some(hmac_key) => hmac_key.name()?.to_hex(),
            None => key_name.to_hex(),
        };
        let der = certificate::placeholder_certificate(module, key, &common_name, &self.profile)?;
        let certificate = IdentityCertificate::from_der(der, key_name)?;
        certificate::store_cert_locked(module, slot, &certificate.der)?;
        Ok(IdentityKey {
            certificate,
            public_key,
            key_name,
        })
    }

    /// Evict the slot's identity key and its certificate.
    pub fn destroy_identity_key(&self, slot: usize, algorithm: &str) -> IdentityResult<()> {
        let slot = LogicalDeviceSlot::new(slot)?;
        let _: IdentityAlgorithm = algorithm.parse()?;
        let removed = self.ctx.with_module(|module| {
            let key = module.evict_if_present(slot.identity_key_handle())?;
            let cert = module.undefine_if_present(slot.cert_nv_index())?;
            Ok(key || cert)
        })?;
        if removed {
            info!(%slot, "identity key destroyed");
        }
        Ok(())
    }

    /// Import `raw` (1 to 64 bytes) as the slot's HMAC key, replacing any
    /// existing one. Returns the key name.
    pub fn create_hmac_key(&self, slot: usize, raw: &[u8]) -> IdentityResult<ObjectName> {
        let slot = LogicalDeviceSlot::new(slot)?;
        if raw.is_empty() {
            return Err(IdentityError::ParseFailure("empty HMAC key".into()));
        }
        if raw.len() > MAX_SYM_DATA {
            return Err(IdentityError::ValueTooLarge {
                what: "HMAC key",
                len: raw.len(),
                max: MAX_SYM_DATA,
            });
        }

        let mut seed_value = vec![0u8; SHA256_DIGEST_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut seed_value);
        let sensitive = KeyedHashSensitive {
            auth_value: Vec::new(),
            seed_value,
            key: raw.to_vec(),
        };
        let (public, name) = credential::keyed_hash_name(&sensitive)?;
        let mut transport_key = Zeroizing::new([0u8; SYMMETRIC_KEY_SIZE]);
        rand::rngs::OsRng.fill_bytes(transport_key.as_mut_slice());
        let private = credential::wrap_sensitive(&sensitive, &name, transport_key.as_slice())?;
        credential::verify_duplicate(&public, &private, transport_key.as_slice())?;

        let handle = slot.hmac_key_handle();
        self.ctx.with_module(|module| {
            module.evict_if_present(handle)?;
            module.transport().import_keyed_hash(
                handle,
                &public.marshal()?,
                &private,
                transport_key.as_slice(),
            )?;
            Ok(())
        })?;
        info!(%slot, key = %name, "HMAC key created");
        Ok(name)
    }

    /// Evict the slot's HMAC key. Evicting an absent key succeeds.
    pub fn evict_hmac_key(&self, slot: usize) -> IdentityResult<()> {
        let slot = LogicalDeviceSlot::new(slot)?;
        if self
            .ctx
            .with_module(|module| module.evict_if_present(slot.hmac_key_handle()))?
        {
            info!(%slot, "HMAC key evicted");
        }
        Ok(())
    }

    /// HMAC-SHA256 of `data` under the slot's HMAC key.
    pub fn sign_with_hmac_key(&self, slot: usize, data: &[u8]) -> IdentityResult<[u8; 32]> {
        let slot = LogicalDeviceSlot::new(slot)?;
        self.ctx.with_module(|module| {
            module
                .transport()
                .hmac(slot.hmac_key_handle(), data)
                .map_err(not_found(slot, "HMAC key"))
        })
    }

    /// Sign `data` with the identity key bound to the certificate `thumbprint`.
    pub fn sign_with_identity_key(
        &self,
        thumbprint: &Thumbprint,
        data: &[u8],
    ) -> IdentityResult<IdentitySignature> {
        certificate::sign_by_thumbprint(&self.ctx, thumbprint, data)?.ok_or_else(|| {
            IdentityError::KeyNotFound(format!("no identity key for certificate {thumbprint}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::SimulatedTpm;
    use p256::ecdsa::signature::Verifier;

    fn manager() -> IdentityKeyManager {
        let ctx = TpmContext::initialize(Box::new(SimulatedTpm::new())).unwrap();
        IdentityKeyManager::new(ctx, CertificateProfile::default())
    }

    #[test]
    fn test_algorithm_names() {
        assert_eq!(
            "ecdsa".parse::<IdentityAlgorithm>().unwrap(),
            IdentityAlgorithm::EcdsaP256
        );
        assert_eq!(
            "ECDSA_P256_SHA256".parse::<IdentityAlgorithm>().unwrap(),
            IdentityAlgorithm::EcdsaP256
        );
        assert!(matches!(
            "RSA2048".parse::<IdentityAlgorithm>(),
            Err(IdentityError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn test_identity_key_is_idempotent() {
        let manager = manager();
        let first = manager.create_or_import_identity_key(0, "ECDSA").unwrap();
        let second = manager.create_or_import_identity_key(0, "ECDSA").unwrap();
        assert_eq!(first, second);
        assert_eq!(first.public_key.len(), 65);
        assert_eq!(first.public_key[0], 0x04);
    }

    #[test]
    fn test_unsupported_algorithm_creates_nothing() {
        let manager = manager();
        assert!(manager.create_or_import_identity_key(0, "RSA").is_err());
        let registry = crate::registry::LogicalDeviceRegistry::new(manager.ctx.clone());
        assert!(!registry.present(0).unwrap());
    }

    #[test]
    fn test_identity_signature_verifies() {
        let manager = manager();
        let key = manager.create_or_import_identity_key(1, "ECDSA").unwrap();
        let signed = manager
            .sign_with_identity_key(&key.thumbprint(), b"telemetry")
            .unwrap();
        assert_eq!(signed.subject, key.certificate.subject);

        let verifying = p256::ecdsa::VerifyingKey::from_sec1_bytes(&key.public_key).unwrap();
        let signature = p256::ecdsa::Signature::from_der(&signed.signature).unwrap();
        verifying.verify(b"telemetry", &signature).unwrap();
    }

    #[test]
    fn test_destroy_identity_key() {
        let manager = manager();
        let key = manager.create_or_import_identity_key(2, "ECDSA").unwrap();
        manager.destroy_identity_key(2, "ECDSA").unwrap();
        manager.destroy_identity_key(2, "ECDSA").unwrap();
        assert!(matches!(
            manager.sign_with_identity_key(&key.thumbprint(), b"x"),
            Err(IdentityError::KeyNotFound(_))
        ));
    }

    #[test]
    fn test_hmac_key_signs_like_software_hmac() {
        let manager = manager();
        manager.create_hmac_key(3, b"shared-secret").unwrap();
        let tag = manager.sign_with_hmac_key(3, b"payload").unwrap();
        assert_eq!(tag, crate::crypto::hmac_sha256(b"shared-secret", &[b"payload"]));
    }

    #[test]
    fn test_hmac_key_bounds_and_eviction() {
        let manager = manager();
        assert!(manager.create_hmac_key(4, &[]).is_err());
        assert!(matches!(
            manager.create_hmac_key(4, &[1; 65]),
            Err(IdentityError::ValueTooLarge { .. })
        ));
        manager.create_hmac_key(4, &[1; 64]).unwrap();
        manager.evict_hmac_key(4).unwrap();
        manager.evict_hmac_key(4).unwrap();
        assert!(matches!(
            manager.sign_with_hmac_key(4, b"x"),
            Err(IdentityError::KeyNotFound(_))
        ));
    }

    #[test]
    fn test_identity_key_never_observed_without_certificate() {
        let manager = manager();
        let registry = crate::registry::LogicalDeviceRegistry::new(manager.ctx.clone());

        std::thread::scope(|scope| {
            for slot in 0..4 {
                let manager = manager.clone();
                scope.spawn(move || {
                    manager.create_or_import_identity_key(slot, "ECDSA").unwrap();
                });
            }
            for _ in 0..200 {
                for slot in 0..4 {
                    let objects = registry.resolve(slot).unwrap();
                    assert_eq!(objects.identity_key.is_some(), objects.certificate_present);
                }
            }
        });
    }

    #[test]
    fn test_failed_certificate_store_evicts_new_key() {
        let ctx = TpmContext::initialize(Box::new(SimulatedTpm::new().with_nv_capacity(0))).unwrap();
        let manager = IdentityKeyManager::new(ctx.clone(), CertificateProfile::default());
        assert!(manager.create_or_import_identity_key(0, "ECDSA").is_err());

        let registry = crate::registry::LogicalDeviceRegistry::new(ctx);
        assert!(!registry.present(0).unwrap());
    }

    #[test]
    fn test_placeholder_named_after_device_id() {
        let manager = manager();
        let hmac_name = manager.create_hmac_key(5, b"k").unwrap();
        let key = manager.create_or_import_identity_key(5, "ECDSA").unwrap();
        assert!(key.certificate.subject.contains(&hmac_name.to_hex()));
    }
}
