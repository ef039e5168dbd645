//! Hostage keys: secrets only one module can recover.
//!
//! Creation uses only the module's public EK and SRK and can run anywhere,
//! typically in a provisioning service. Activation runs on the module
//! holding the matching EK private key and SRK.
//!
//! A [`HostageBlob`] carries, in order:
//!
//! | field              | contents                                              |
//! |--------------------|-------------------------------------------------------|
//! | `TPM2B_ID_OBJECT`  | encrypted credential and its integrity HMAC           |
//! | `TPM2B_ENCRYPTED_SECRET` | ephemeral ECDH point (the wrapped seed)         |
//! | `TPM2B_PRIVATE`    | HMAC key sensitive area, inner-wrapped by the secret  |
//! | `TPM2B_PUBLIC`     | HMAC key public area                                  |
//! | `TPM2B_DATA`       | `url/deviceName`, sealed under the secret             |

use crate::context::{Module, TpmContext};
use crate::credential::{self, make_credential};
use crate::error::{IdentityError, IdentityResult};
use crate::identity_key::IdentityAlgorithm;
use crate::layout::{
    LogicalDeviceSlot, PersistentHandle, HOSTAGE_HMAC_KEY_SIZE, SRK_HANDLE, SYMMETRIC_KEY_SIZE,
};
use crate::marshal::{
    self, KeyedHashSensitive, ObjectName, PublicArea, TpmReader, TpmWriter, MAX_SYM_DATA,
};
use crate::transport::TpmError;
use rand::RngCore;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// 16-byte symmetric secret recovered by credential activation.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ActivationSecret([u8; SYMMETRIC_KEY_SIZE]);

impl ActivationSecret {
    pub fn generate() -> Self {
        let mut bytes = [0u8; SYMMETRIC_KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; SYMMETRIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SYMMETRIC_KEY_SIZE] {
        &self.0
    }

    fn from_recovered(bytes: &[u8]) -> IdentityResult<Self> {
        let bytes: [u8; SYMMETRIC_KEY_SIZE] = bytes.try_into().map_err(|_| {
            IdentityError::ActivationFailed(format!(
                "recovered secret is {} bytes, expected {SYMMETRIC_KEY_SIZE}",
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for ActivationSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ActivationSecret(<redacted>)")
    }
}

fn read_tpm2b(reader: &mut TpmReader<'_>) -> IdentityResult<Vec<u8>> {
    let inner = reader.get_sized()?;
    let mut writer = TpmWriter::new();
    writer.put_sized(inner)?;
    Ok(writer.into_inner())
}

fn inner_of(tpm2b: &[u8]) -> IdentityResult<&[u8]> {
    let mut reader = TpmReader::new(tpm2b);
    let inner = reader.get_sized()?;
    reader.finish()?;
    Ok(inner)
}

/// Wire form of a hostage key. Every field holds complete `TPM2B` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostageBlob {
    pub id_object: Vec<u8>,
    pub encrypted_secret: Vec<u8>,
    pub private: Vec<u8>,
    pub public: Vec<u8>,
    pub data: Vec<u8>,
}

impl HostageBlob {
    pub fn to_bytes(&self) -> Vec<u8> {
        [
            self.id_object.as_slice(),
            &self.encrypted_secret,
            &self.private,
            &self.public,
            &self.data,
        ]
        .concat()
    }

    pub fn from_bytes(bytes: &[u8]) -> IdentityResult<Self> {
        let mut reader = TpmReader::new(bytes);
        let blob = Self {
            id_object: read_tpm2b(&mut reader)?,
            encrypted_secret: read_tpm2b(&mut reader)?,
            private: read_tpm2b(&mut reader)?,
            public: read_tpm2b(&mut reader)?,
            data: read_tpm2b(&mut reader)?,
        };
        reader.finish()?;
        Ok(blob)
    }

    /// Public area of the HMAC key carried by the blob.
    pub fn key_public(&self) -> IdentityResult<PublicArea> {
        Ok(PublicArea::from_tpm2b(&self.public)?)
    }
}

/// Challenge answerable only by the module holding a named key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeBlob {
    pub id_object: Vec<u8>,
    pub encrypted_secret: Vec<u8>,
}

impl ChallengeBlob {
    pub fn to_bytes(&self) -> Vec<u8> {
        [self.id_object.as_slice(), &self.encrypted_secret].concat()
    }

    pub fn from_bytes(bytes: &[u8]) -> IdentityResult<Self> {
        let mut reader = TpmReader::new(bytes);
        let blob = Self {
            id_object: read_tpm2b(&mut reader)?,
            encrypted_secret: read_tpm2b(&mut reader)?,
        };
        reader.finish()?;
        Ok(blob)
    }
}

/// Wrap a 32-byte HMAC key for the module owning `ek_public` and `srk_public`.
pub fn create_hostage_key(
    ek_public: &PublicArea,
    srk_public: &PublicArea,
    device_name: &str,
    url: &str,
    hmac_key: &[u8; HOSTAGE_HMAC_KEY_SIZE],
    secret: &ActivationSecret,
) -> IdentityResult<HostageBlob> {
    create_hostage_key_ex(ek_public, srk_public, device_name, url, hmac_key, secret)
}

/// [`create_hostage_key`] for an HMAC key of 1 to 64 bytes.
pub fn create_hostage_key_ex(
    ek_public: &PublicArea,
    srk_public: &PublicArea,
    device_name: &str,
    url: &str,
    hmac_key: &[u8],
    secret: &ActivationSecret,
) -> IdentityResult<HostageBlob> {
    if hmac_key.is_empty() {
        return Err(IdentityError::ParseFailure("empty HMAC key".into()));
    }
    if hmac_key.len() > MAX_SYM_DATA {
        return Err(IdentityError::ValueTooLarge {
            what: "HMAC key",
            len: hmac_key.len(),
            max: MAX_SYM_DATA,
        });
    }

    let srk_name = srk_public.name()?;
    let credential = make_credential(ek_public, &srk_name, secret.as_bytes())?;

    let mut seed_value = vec![0u8; marshal::SHA256_DIGEST_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut seed_value);
    let sensitive = KeyedHashSensitive {
        auth_value: Vec::new(),
        seed_value,
        key: hmac_key.to_vec(),
    };
    let (key_public, key_name) = credential::keyed_hash_name(&sensitive)?;
    let private = credential::wrap_sensitive(&sensitive, &key_name, secret.as_bytes())?;

    let uri = format!("{url}/{device_name}");
    let sealed = credential::seal_data(secret.as_bytes(), &key_name, uri.as_bytes())?;
    let mut data = TpmWriter::new();
    data.put_sized(&sealed)?;

    Ok(HostageBlob {
        id_object: credential.id_object.marshal()?,
        encrypted_secret: credential.encrypted_secret_tpm2b()?,
        private,
        public: key_public.to_tpm2b()?,
        data: data.into_inner(),
    })
}

/// Bind `secret` to an existing key named `id_key_name` on the module owning `ek_public`.
///
/// With `secret` absent a fresh one is generated. The returned secret is what
/// a genuine module reports back from activation.
pub fn challenge_identity_cert(
    ek_public: &PublicArea,
    id_key_name: &ObjectName,
    secret: Option<ActivationSecret>,
) -> IdentityResult<(ChallengeBlob, ActivationSecret)> {
    let secret = secret.unwrap_or_else(ActivationSecret::generate);
    let credential = make_credential(ek_public, id_key_name, secret.as_bytes())?;
    let blob = ChallengeBlob {
        id_object: credential.id_object.marshal()?,
        encrypted_secret: credential.encrypted_secret_tpm2b()?,
    };
    Ok((blob, secret))
}

/// Result of importing a hostage key into a slot.
#[derive(Debug)]
pub struct ImportedHostageKey {
    pub secret: ActivationSecret,
    pub hmac_key_name: ObjectName,
    pub uri_nv_name: ObjectName,
}

fn replay_tag(id_object: &[u8]) -> [u8; 32] {
    crate::crypto::sha256(id_object)
}

/// One activation against `activate`, with replay rejection. Does not
/// record the credential as consumed.
fn activate_locked(
    module: &mut Module,
    activate: PersistentHandle,
    id_object: &[u8],
    encrypted_secret: &[u8],
) -> IdentityResult<(ActivationSecret, [u8; 32])> {
    let tag = replay_tag(id_object);
    if module.credential_consumed(&tag) {
        return Err(IdentityError::ActivationFailed(
            "credential already activated".into(),
        ));
    }

    let recovered = module
        .transport()
        .activate_credential(activate, id_object, encrypted_secret)
        .map_err(|err| match err {
            TpmError::IntegrityCheckFailed(reason) | TpmError::Rejected(reason) => {
                IdentityError::ActivationFailed(reason)
            }
            other => other.into(),
        })?;
    Ok((ActivationSecret::from_recovered(&recovered)?, tag))
}

/// Remove the HMAC key and service URI of `slot` after a failed install,
/// so the slot never keeps one without the other.
fn clear_provisioning_locked(module: &mut Module, slot: LogicalDeviceSlot) {
    if let Err(err) = module.evict_if_present(slot.hmac_key_handle()) {
        warn!(%slot, error = %err, "rollback of HMAC key failed");
    }
    if let Err(err) = module.undefine_if_present(slot.uri_nv_index()) {
        warn!(%slot, error = %err, "rollback of service URI failed");
    }
}

/// On-module half of the hostage key protocol.
#[derive(Debug, Clone)]
pub struct HostageKeyProtocol {
    ctx: Arc<TpmContext>,
}

impl HostageKeyProtocol {
    pub fn new(ctx: Arc<TpmContext>) -> Self {
        Self { ctx }
    }

    /// Recover the activation secret of `blob`.
    ///
    /// Fails with `ActivationFailed` when the blob was made for another
    /// module, was tampered with, or has already been activated.
    pub fn activate_hostage_key(
        &self,
        slot: usize,
        blob: &HostageBlob,
    ) -> IdentityResult<ActivationSecret> {
        let slot = LogicalDeviceSlot::new(slot)?;
        let result = self.ctx.with_module(|module| {
            let (secret, tag) =
                activate_locked(module, SRK_HANDLE, &blob.id_object, &blob.encrypted_secret)?;
            module.consume_credential(tag);
            Ok(secret)
        });
        match &result {
            Ok(_) => info!(%slot, "hostage key activated"),
            Err(err) => warn!(%slot, error = %err, "hostage key activation failed"),
        }
        result
    }

    /// Activate `blob`, then install its HMAC key and service URI in `slot`.
    ///
    /// The whole sequence runs under one module lock. Everything carried by
    /// the blob, the wrapped key included, is verified before the slot is
    /// touched, so a rejected blob leaves an existing provisioning intact.
    /// If the module fails after the old key is evicted, the slot's key and
    /// URI are both removed.
    pub fn import_hostage_key(
        &self,
        slot: usize,
        blob: &HostageBlob,
    ) -> IdentityResult<ImportedHostageKey> {
        let slot = LogicalDeviceSlot::new(slot)?;
        let key_public = blob.key_public()?;
        if key_public.keyed_hash().is_none() {
            return Err(IdentityError::ParseFailure(
                "hostage blob does not carry a keyed-hash key".into(),
            ));
        }
        let key_name = key_public.name()?;
        let sealed_uri = inner_of(&blob.data)?.to_vec();

        let result = self.ctx.with_module(|module| {
            let (secret, tag) =
                activate_locked(module, SRK_HANDLE, &blob.id_object, &blob.encrypted_secret)?;

            let uri = credential::open_data(secret.as_bytes(), &key_name, &sealed_uri)
                .map_err(|err| IdentityError::ActivationFailed(err.to_string()))?;
            let uri = String::from_utf8(uri)
                .map_err(|_| IdentityError::ParseFailure("service URI is not UTF-8".into()))?;
            crate::service_uri::check_capacity(&uri)?;
            credential::verify_duplicate(&key_public, &blob.private, secret.as_bytes())
                .map_err(|err| IdentityError::ActivationFailed(err.to_string()))?;
            let public = key_public.marshal()?;

            // nothing in the slot has changed up to here
            let handle = slot.hmac_key_handle();
            module.evict_if_present(handle)?;
            let installed = match module.transport().import_keyed_hash(
                handle,
                &public,
                &blob.private,
                secret.as_bytes(),
            ) {
                Ok(()) => crate::service_uri::store_locked(module, slot, &uri),
                Err(TpmError::IntegrityCheckFailed(reason) | TpmError::Rejected(reason)) => {
                    Err(IdentityError::ActivationFailed(reason))
                }
                Err(other) => Err(other.into()),
            };
            let uri_nv_name = match installed {
                Ok(name) => name,
                Err(err) => {
                    clear_provisioning_locked(module, slot);
                    return Err(err);
                }
            };

            module.consume_credential(tag);
            Ok(ImportedHostageKey {
                secret,
                hmac_key_name: key_name,
                uri_nv_name,
            })
        });

        match &result {
            Ok(imported) => {
                info!(%slot, key = %imported.hmac_key_name, "hostage key imported")
            }
            Err(err) => warn!(%slot, error = %err, "hostage key import failed"),
        }
        result
    }

    /// Answer a [`challenge_identity_cert`] blob with the slot's identity key.
    pub fn activate_identity_cert(
        &self,
        slot: usize,
        algorithm: &str,
        blob: &ChallengeBlob,
    ) -> IdentityResult<ActivationSecret> {
        let slot = LogicalDeviceSlot::new(slot)?;
        let _: IdentityAlgorithm = algorithm.parse()?;
        let handle = slot.identity_key_handle();

        let result = self.ctx.with_module(|module| {
            if module.public_area(handle)?.is_none() {
                return Err(IdentityError::KeyNotFound(format!(
                    "slot {slot} has no identity key"
                )));
            }
            let (secret, tag) =
                activate_locked(module, handle, &blob.id_object, &blob.encrypted_secret)?;
            module.consume_credential(tag);
            Ok(secret)
        });
        if let Err(err) = &result {
            warn!(%slot, error = %err, "identity challenge activation failed");
        }
        result
    }
}
