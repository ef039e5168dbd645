//! Software module.
//!
//! Implements [`TpmTransport`] in memory: deterministic primaries derived
//! from a seed, persistent objects and NV indices in maps, and optional JSON
//! persistence so a provisioned simulated device survives restarts.

use crate::credential::{self, Credential};
use crate::crypto;
use crate::layout::{NvIndex, PersistentHandle, SRK_HANDLE};
use crate::marshal::{EccPoint, IdObject, NvAttributes, NvPublic, ObjectAttributes, PublicArea};
use crate::transport::{EcdsaSignature, RootKind, TpmError, TpmTransport};
use p256::ecdsa::signature::hazmat::PrehashSigner;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ObjectSecret {
    Ecc {
        #[serde(with = "hex_bytes")]
        scalar: Vec<u8>,
    },
    KeyedHash {
        #[serde(with = "hex_bytes")]
        key: Vec<u8>,
    },
}

impl Drop for ObjectSecret {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        match self {
            ObjectSecret::Ecc { scalar } => scalar.zeroize(),
            ObjectSecret::KeyedHash { key } => key.zeroize(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct StoredObject {
    #[serde(with = "hex_bytes")]
    public: Vec<u8>,
    secret: ObjectSecret,
}

#[derive(Clone, Serialize, Deserialize)]
struct StoredNv {
    #[serde(with = "hex_bytes")]
    public: Vec<u8>,
    #[serde(with = "hex_bytes")]
    data: Vec<u8>,
}

#[derive(Clone, Serialize, Deserialize)]
struct SimulatorState {
    #[serde(with = "hex_bytes")]
    seed: Vec<u8>,
    objects: BTreeMap<u32, StoredObject>,
    nv: BTreeMap<u32, StoredNv>,
}

impl SimulatorState {
    fn fresh(seed: [u8; 32]) -> Self {
        Self {
            seed: seed.to_vec(),
            objects: BTreeMap::new(),
            nv: BTreeMap::new(),
        }
    }
}

/// In-memory module implementing [`TpmTransport`].
pub struct SimulatedTpm {
    state: SimulatorState,
    state_path: Option<PathBuf>,
    reachable: bool,
    nv_capacity: Option<usize>,
}

impl Default for SimulatedTpm {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTpm {
    /// Module with a random endorsement seed.
    pub fn new() -> Self {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        Self::with_seed(seed)
    }

    /// Module whose primaries are a pure function of `seed`.
    pub fn with_seed(seed: [u8; 32]) -> Self {
        Self {
            state: SimulatorState::fresh(seed),
            state_path: None,
            reachable: true,
            nv_capacity: None,
        }
    }

    /// Module that fails every command with `Unavailable`.
    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            ..Self::with_seed([0; 32])
        }
    }

    /// Load state from `path`, or start fresh and persist there.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TpmError> {
        let path = path.as_ref();
        let state = match std::fs::read(path) {
            Ok(bytes) => {
                let state: SimulatorState = serde_json::from_slice(&bytes)
                    .map_err(|err| TpmError::Io(format!("{}: {err}", path.display())))?;
                info!(path = %path.display(), objects = state.objects.len(), "loaded simulated module state");
                state
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let mut seed = [0u8; 32];
                rand::rngs::OsRng.fill_bytes(&mut seed);
                debug!(path = %path.display(), "creating simulated module state");
                SimulatorState::fresh(seed)
            }
            Err(err) => return Err(TpmError::Io(format!("{}: {err}", path.display()))),
        };
        let simulator = Self {
            state,
            state_path: Some(path.to_path_buf()),
            reachable: true,
            nv_capacity: None,
        };
        simulator.persist()?;
        Ok(simulator)
    }

    /// Limit the number of NV indices that may be defined.
    pub fn with_nv_capacity(mut self, capacity: usize) -> Self {
        self.nv_capacity = Some(capacity);
        self
    }

    fn persist(&self) -> Result<(), TpmError> {
        let Some(path) = &self.state_path else {
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(&self.state)
            .map_err(|err| TpmError::Io(err.to_string()))?;
        std::fs::write(path, json).map_err(|err| TpmError::Io(format!("{}: {err}", path.display())))
    }

    fn check_reachable(&self) -> Result<(), TpmError> {
        if self.reachable {
            Ok(())
        } else {
            Err(TpmError::Unavailable("simulated module unreachable".into()))
        }
    }

    fn object(&self, handle: PersistentHandle) -> Result<&StoredObject, TpmError> {
        self.state
            .objects
            .get(&handle.0)
            .ok_or(TpmError::ObjectNotPresent(handle.0))
    }

    fn ecc_secret(&self, handle: PersistentHandle) -> Result<p256::SecretKey, TpmError> {
        match &self.object(handle)?.secret {
            ObjectSecret::Ecc { scalar } => p256::SecretKey::from_slice(scalar)
                .map_err(|_| TpmError::Rejected("corrupt ECC object".into())),
            ObjectSecret::KeyedHash { .. } => {
                Err(TpmError::Rejected(format!("{handle} is not an ECC key")))
            }
        }
    }

    fn ensure_free(&self, handle: PersistentHandle) -> Result<(), TpmError> {
        if self.state.objects.contains_key(&handle.0) {
            return Err(TpmError::Rejected(format!("handle {handle} in use")));
        }
        Ok(())
    }

    fn derive_primary(&self, label: &str) -> Result<p256::SecretKey, TpmError> {
        for counter in 0u32..16 {
            let candidate = crypto::kdfa(&self.state.seed, label, &counter.to_be_bytes(), &[], 256);
            if let Ok(key) = p256::SecretKey::from_slice(&candidate) {
                return Ok(key);
            }
        }
        Err(TpmError::Rejected("primary seed produced no valid scalar".into()))
    }

    fn insert_ecc(
        &mut self,
        handle: PersistentHandle,
        template: PublicArea,
        secret: &p256::SecretKey,
    ) -> Result<Vec<u8>, TpmError> {
        let public = template
            .with_point(EccPoint::from_public_key(&secret.public_key()))
            .marshal()
            .map_err(|err| TpmError::Rejected(err.to_string()))?;
        self.state.objects.insert(
            handle.0,
            StoredObject {
                public: public.clone(),
                secret: ObjectSecret::Ecc {
                    scalar: secret.to_bytes().to_vec(),
                },
            },
        );
        self.persist()?;
        Ok(public)
    }
}

impl TpmTransport for SimulatedTpm {
    fn describe(&self) -> String {
        match &self.state_path {
            Some(path) => format!("simulated module ({})", path.display()),
            None => "simulated module (volatile)".to_string(),
        }
    }

    fn read_public(&mut self, handle: PersistentHandle) -> Result<Vec<u8>, TpmError> {
        self.check_reachable()?;
        Ok(self.object(handle)?.public.clone())
    }

    fn create_primary(&mut self, kind: RootKind) -> Result<Vec<u8>, TpmError> {
        self.check_reachable()?;
        let handle = kind.handle();
        if let Ok(existing) = self.object(handle) {
            return Ok(existing.public.clone());
        }
        let (label, template) = match kind {
            RootKind::Endorsement => ("ENDORSEMENT", PublicArea::ek_template()),
            RootKind::StorageRoot => ("STORAGE-ROOT", PublicArea::srk_template()),
        };
        let secret = self.derive_primary(label)?;
        info!(%handle, ?kind, "simulated primary created");
        self.insert_ecc(handle, template, &secret)
    }

    fn create_signing_key(&mut self, handle: PersistentHandle) -> Result<Vec<u8>, TpmError> {
        self.check_reachable()?;
        self.object(SRK_HANDLE)?;
        self.ensure_free(handle)?;
        let secret = p256::SecretKey::random(&mut rand::rngs::OsRng);
        self.insert_ecc(handle, PublicArea::signing_key_template(), &secret)
    }

    fn import_keyed_hash(
        &mut self,
        handle: PersistentHandle,
        public: &[u8],
        duplicate: &[u8],
        encryption_key: &[u8],
    ) -> Result<(), TpmError> {
        self.check_reachable()?;
        self.object(SRK_HANDLE)?;
        self.ensure_free(handle)?;

        let area = PublicArea::unmarshal(public).map_err(|err| TpmError::Rejected(err.to_string()))?;
        let Some(detail) = area.keyed_hash() else {
            return Err(TpmError::Rejected("import expects a keyed-hash object".into()));
        };
        let name = area.name().map_err(|err| TpmError::Rejected(err.to_string()))?;
        let sensitive = credential::unwrap_sensitive(duplicate, &name, encryption_key)?;
        if sensitive.unique() != detail.unique {
            return Err(TpmError::IntegrityCheckFailed(
                "sensitive area does not match public unique".into(),
            ));
        }

        self.state.objects.insert(
            handle.0,
            StoredObject {
                public: public.to_vec(),
                secret: ObjectSecret::KeyedHash {
                    key: sensitive.key.clone(),
                },
            },
        );
        self.persist()
    }

    fn evict(&mut self, handle: PersistentHandle) -> Result<(), TpmError> {
        self.check_reachable()?;
        self.state
            .objects
            .remove(&handle.0)
            .ok_or(TpmError::ObjectNotPresent(handle.0))?;
        self.persist()
    }

    fn sign_digest(
        &mut self,
        handle: PersistentHandle,
        digest: &[u8; 32],
    ) -> Result<EcdsaSignature, TpmError> {
        self.check_reachable()?;
        let public = PublicArea::unmarshal(&self.object(handle)?.public)
            .map_err(|err| TpmError::Rejected(err.to_string()))?;
        if public.attributes.contains(ObjectAttributes::RESTRICTED)
            || !public.attributes.contains(ObjectAttributes::SIGN_ENCRYPT)
        {
            return Err(TpmError::Rejected(format!("{handle} is not a signing key")));
        }
        let secret = self.ecc_secret(handle)?;
        let signing_key = p256::ecdsa::SigningKey::from(&secret);
        let signature: p256::ecdsa::Signature = signing_key
            .sign_prehash(digest)
            .map_err(|err| TpmError::Rejected(err.to_string()))?;
        Ok(EcdsaSignature {
            r: signature.r().to_bytes().to_vec(),
            s: signature.s().to_bytes().to_vec(),
        })
    }

    fn hmac(&mut self, handle: PersistentHandle, data: &[u8]) -> Result<[u8; 32], TpmError> {
        self.check_reachable()?;
        match &self.object(handle)?.secret {
            ObjectSecret::KeyedHash { key } => Ok(crypto::hmac_sha256(key, &[data])),
            ObjectSecret::Ecc { .. } => {
                Err(TpmError::Rejected(format!("{handle} is not an HMAC key")))
            }
        }
    }

    fn activate_credential(
        &mut self,
        activate: PersistentHandle,
        id_object: &[u8],
        encrypted_secret: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, TpmError> {
        self.check_reachable()?;
        let rejected = |err: &dyn std::fmt::Display| TpmError::Rejected(err.to_string());

        let object_name = PublicArea::unmarshal(&self.object(activate)?.public)
            .and_then(|public| public.name())
            .map_err(|e| rejected(&e))?;
        let ek_handle = RootKind::Endorsement.handle();
        let ek_public =
            PublicArea::unmarshal(&self.object(ek_handle)?.public).map_err(|e| rejected(&e))?;
        let ek_secret = self.ecc_secret(ek_handle)?;

        let id_object = IdObject::unmarshal(id_object).map_err(|e| rejected(&e))?;
        let point = Credential::parse_encrypted_secret(encrypted_secret).map_err(|e| rejected(&e))?;

        let result =
            credential::recover_credential(&ek_secret, &ek_public, &object_name, &id_object, &point);
        if let Err(err) = &result {
            warn!(handle = %activate, error = %err, "simulated credential activation failed");
        }
        result
    }

    fn nv_read_public(&mut self, index: NvIndex) -> Result<Vec<u8>, TpmError> {
        self.check_reachable()?;
        self.state
            .nv
            .get(&index.0)
            .map(|nv| nv.public.clone())
            .ok_or(TpmError::ObjectNotPresent(index.0))
    }

    fn nv_define(&mut self, public: &NvPublic) -> Result<(), TpmError> {
        self.check_reachable()?;
        if self.state.nv.contains_key(&public.index) {
            return Err(TpmError::Rejected(format!(
                "NV index {:#010x} already defined",
                public.index
            )));
        }
        if let Some(capacity) = self.nv_capacity {
            if self.state.nv.len() >= capacity {
                return Err(TpmError::Rejected("NV space exhausted".into()));
            }
        }
        let mut defined = public.clone();
        defined.attributes = NvAttributes(defined.attributes.0 & !NvAttributes::WRITTEN);
        let marshaled = defined
            .marshal()
            .map_err(|err| TpmError::Rejected(err.to_string()))?;
        self.state.nv.insert(
            public.index,
            StoredNv {
                public: marshaled,
                data: vec![0; public.data_size as usize],
            },
        );
        self.persist()
    }

    fn nv_write(&mut self, index: NvIndex, offset: u16, data: &[u8]) -> Result<(), TpmError> {
        self.check_reachable()?;
        let nv = self
            .state
            .nv
            .get_mut(&index.0)
            .ok_or(TpmError::ObjectNotPresent(index.0))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > nv.data.len() {
            return Err(TpmError::Rejected(format!(
                "write of {} bytes at {offset} exceeds index {index}",
                data.len()
            )));
        }
        nv.data[start..end].copy_from_slice(data);

        let mut public =
            NvPublic::unmarshal(&nv.public).map_err(|err| TpmError::Rejected(err.to_string()))?;
        if !public.is_written() {
            public.attributes = NvAttributes(public.attributes.0 | NvAttributes::WRITTEN);
            nv.public = public
                .marshal()
                .map_err(|err| TpmError::Rejected(err.to_string()))?;
        }
        self.persist()
    }

    fn nv_read(&mut self, index: NvIndex, offset: u16, len: u16) -> Result<Vec<u8>, TpmError> {
        self.check_reachable()?;
        let nv = self
            .state
            .nv
            .get(&index.0)
            .ok_or(TpmError::ObjectNotPresent(index.0))?;
        let public =
            NvPublic::unmarshal(&nv.public).map_err(|err| TpmError::Rejected(err.to_string()))?;
        if !public.is_written() {
            return Err(TpmError::Rejected(format!("NV index {index} not written")));
        }
        let start = offset as usize;
        let end = start + len as usize;
        nv.data
            .get(start..end)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| TpmError::Rejected(format!("read past end of index {index}")))
    }

    fn nv_undefine(&mut self, index: NvIndex) -> Result<(), TpmError> {
        self.check_reachable()?;
        self.state
            .nv
            .remove(&index.0)
            .ok_or(TpmError::ObjectNotPresent(index.0))?;
        self.persist()
    }

    fn close(&mut self) {
        if let Err(err) = self.persist() {
            warn!(error = %err, "failed to persist simulated module state");
        }
    }
}
