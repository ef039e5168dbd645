//! Transport to a physical or firmware TPM through `tss-esapi`.
//!
//! Public areas travel as `TPMT_PUBLIC` bytes in both directions, so the
//! templates in [`crate::marshal`] drive the hardware unchanged. Object and
//! NV authorization use empty owner and object auth values.

use crate::layout::{PersistentHandle, SRK_HANDLE};
use crate::marshal::{NvAttributes, NvPublic, PublicArea, TpmReader};
use crate::transport::{EcdsaSignature, RootKind, TpmError, TpmTransport};
use std::convert::TryFrom;
use std::str::FromStr;
use tracing::{debug, error, info};
use tss_esapi::attributes::NvIndexAttributesBuilder;
use tss_esapi::constants::tss::{TPM2_RH_NULL, TPM2_ST_HASHCHECK};
use tss_esapi::constants::SessionType;
use tss_esapi::handles::{
    AuthHandle, KeyHandle, NvIndexHandle, NvIndexTpmHandle, ObjectHandle, PersistentTpmHandle,
    SessionHandle, TpmHandle,
};
use tss_esapi::interface_types::algorithm::HashingAlgorithm;
use tss_esapi::interface_types::dynamic_handles::Persistent;
use tss_esapi::interface_types::resource_handles::{Hierarchy, NvAuth, Provision};
use tss_esapi::interface_types::session_handles::{AuthSession, PolicySession};
use tss_esapi::structures::{
    Data, Digest, EncryptedSecret, HashcheckTicket, IdObject, MaxBuffer, MaxNvBuffer,
    NvPublicBuilder, Private, Public, Signature, SignatureScheme, SymmetricDefinition,
    SymmetricDefinitionObject,
};
use tss_esapi::traits::{Marshall, UnMarshall};
use tss_esapi::tss2_esys::{TPM2_ALG_ID, TPMA_NV, TPMT_TK_HASHCHECK};
use tss_esapi::{Context, TctiNameConf};
use zeroize::Zeroizing;

/// Bytes per NV read or write command.
const NV_CHUNK: usize = 512;

fn rejected(err: tss_esapi::Error) -> TpmError {
    debug!(error = %err, "TPM command failed");
    TpmError::Rejected(err.to_string())
}

fn inner_of(tpm2b: &[u8]) -> Result<Vec<u8>, TpmError> {
    let mut reader = TpmReader::new(tpm2b);
    let inner = reader
        .get_sized()
        .map_err(|err| TpmError::Rejected(err.to_string()))?;
    reader
        .finish()
        .map_err(|err| TpmError::Rejected(err.to_string()))?;
    Ok(inner.to_vec())
}

fn tss_public(tpmt: &[u8]) -> Result<Public, TpmError> {
    Public::unmarshall(tpmt).map_err(rejected)
}

/// `TPMT_PUBLIC` of a template.
fn template(public: PublicArea) -> Result<Public, TpmError> {
    let bytes = public
        .marshal()
        .map_err(|err| TpmError::Rejected(err.to_string()))?;
    tss_public(&bytes)
}

/// Module reached through a TCTI such as `device:/dev/tpmrm0`.
pub struct TssTransport {
    ctx: Context,
    tcti: String,
}

impl TssTransport {
    pub fn open(tcti: &str) -> Result<Self, TpmError> {
        let conf = TctiNameConf::from_str(tcti).map_err(|err| {
            error!(tcti, error = %err, "invalid TCTI");
            TpmError::Unavailable(format!("invalid TCTI {tcti}: {err}"))
        })?;
        let mut ctx = Context::new(conf).map_err(|err| {
            error!(tcti, error = %err, "TPM context creation failed");
            TpmError::Unavailable(err.to_string())
        })?;
        ctx.set_sessions((Some(AuthSession::Password), None, None));
        info!(tcti, "TPM transport opened");
        Ok(Self {
            ctx,
            tcti: tcti.to_string(),
        })
    }

    fn object(&mut self, handle: PersistentHandle) -> Result<ObjectHandle, TpmError> {
        let tpm_handle = PersistentTpmHandle::new(handle.0).map_err(rejected)?;
        self.ctx
            .tr_from_tpm_public(TpmHandle::Persistent(tpm_handle))
            .map_err(|_| TpmError::ObjectNotPresent(handle.0))
    }

    fn nv_handle(&mut self, index: u32) -> Result<NvIndexHandle, TpmError> {
        let tpm_handle = NvIndexTpmHandle::new(index).map_err(rejected)?;
        self.ctx
            .tr_from_tpm_public(TpmHandle::NvIndex(tpm_handle))
            .map(NvIndexHandle::from)
            .map_err(|_| TpmError::ObjectNotPresent(index))
    }

    /// Persist a transient object at `handle`, then flush the transient copy.
    fn persist(&mut self, transient: KeyHandle, handle: PersistentHandle) -> Result<(), TpmError> {
        let persistent = PersistentTpmHandle::new(handle.0).map_err(rejected)?;
        let result = self
            .ctx
            .evict_control(
                Provision::Owner,
                transient.into(),
                Persistent::Persistent(persistent),
            )
            .map(|_| ())
            .map_err(rejected);
        if let Err(err) = self.ctx.flush_context(transient.into()) {
            debug!(error = %err, "flush of transient object failed");
        }
        result
    }

    fn public_bytes(&mut self, key: KeyHandle) -> Result<Vec<u8>, TpmError> {
        let (public, _, _) = self.ctx.read_public(key).map_err(rejected)?;
        public.marshall().map_err(rejected)
    }
}

impl TpmTransport for TssTransport {
    fn describe(&self) -> String {
        format!("tpm({})", self.tcti)
    }

    fn read_public(&mut self, handle: PersistentHandle) -> Result<Vec<u8>, TpmError> {
        let object = self.object(handle)?;
        self.public_bytes(object.into())
    }

    fn create_primary(&mut self, kind: RootKind) -> Result<Vec<u8>, TpmError> {
        let handle = kind.handle();
        if let Ok(existing) = self.read_public(handle) {
            return Ok(existing);
        }
        let (hierarchy, public) = match kind {
            RootKind::Endorsement => (Hierarchy::Endorsement, PublicArea::ek_template()),
            RootKind::StorageRoot => (Hierarchy::Owner, PublicArea::srk_template()),
        };
        let created = self
            .ctx
            .create_primary(hierarchy, template(public)?, None, None, None, None)
            .map_err(rejected)?;
        let public = created.out_public.marshall().map_err(rejected)?;
        self.persist(created.key_handle, handle)?;
        info!(%handle, "primary key persisted");
        Ok(public)
    }

    fn create_signing_key(&mut self, handle: PersistentHandle) -> Result<Vec<u8>, TpmError> {
        let parent: KeyHandle = self.object(SRK_HANDLE)?.into();
        let created = self
            .ctx
            .create(
                parent,
                template(PublicArea::signing_key_template())?,
                None,
                None,
                None,
                None,
            )
            .map_err(rejected)?;
        let loaded = self
            .ctx
            .load(parent, created.out_private, created.out_public.clone())
            .map_err(rejected)?;
        self.persist(loaded, handle)?;
        created.out_public.marshall().map_err(rejected)
    }

    fn import_keyed_hash(
        &mut self,
        handle: PersistentHandle,
        public: &[u8],
        duplicate: &[u8],
        encryption_key: &[u8],
    ) -> Result<(), TpmError> {
        let parent = self.object(SRK_HANDLE)?;
        let public = tss_public(public)?;
        let duplicate = Private::try_from(inner_of(duplicate)?).map_err(rejected)?;
        let encryption_key = Data::try_from(encryption_key.to_vec()).map_err(rejected)?;

        let private = self
            .ctx
            .import(
                parent,
                Some(encryption_key),
                public.clone(),
                duplicate,
                EncryptedSecret::default(),
                SymmetricDefinitionObject::AES_128_CFB,
            )
            .map_err(|err| TpmError::IntegrityCheckFailed(err.to_string()))?;
        let loaded = self
            .ctx
            .load(parent.into(), private, public)
            .map_err(rejected)?;
        self.persist(loaded, handle)
    }

    fn evict(&mut self, handle: PersistentHandle) -> Result<(), TpmError> {
        let object = self.object(handle)?;
        let persistent = PersistentTpmHandle::new(handle.0).map_err(rejected)?;
        self.ctx
            .evict_control(Provision::Owner, object, Persistent::Persistent(persistent))
            .map(|_| ())
            .map_err(rejected)
    }

    fn sign_digest(
        &mut self,
        handle: PersistentHandle,
        digest: &[u8; 32],
    ) -> Result<EcdsaSignature, TpmError> {
        let key: KeyHandle = self.object(handle)?.into();
        let digest = Digest::try_from(digest.to_vec()).map_err(rejected)?;
        let validation = HashcheckTicket::try_from(TPMT_TK_HASHCHECK {
            tag: TPM2_ST_HASHCHECK,
            hierarchy: TPM2_RH_NULL,
            digest: Default::default(),
        })
        .map_err(rejected)?;

        match self
            .ctx
            .sign(key, digest, SignatureScheme::Null, validation)
            .map_err(rejected)?
        {
            Signature::EcDsa(signature) => Ok(EcdsaSignature {
                r: signature.signature_r().as_bytes().to_vec(),
                s: signature.signature_s().as_bytes().to_vec(),
            }),
            _ => Err(TpmError::Rejected(format!("{handle} did not produce ECDSA"))),
        }
    }

    fn hmac(&mut self, handle: PersistentHandle, data: &[u8]) -> Result<[u8; 32], TpmError> {
        let key = self.object(handle)?;
        let buffer = MaxBuffer::try_from(data.to_vec()).map_err(rejected)?;
        let digest = self
            .ctx
            .hmac(key, buffer, HashingAlgorithm::Sha256)
            .map_err(rejected)?;
        <[u8; 32]>::try_from(digest.as_bytes())
            .map_err(|_| TpmError::Rejected("HMAC digest is not 32 bytes".into()))
    }

    fn activate_credential(
        &mut self,
        activate: PersistentHandle,
        id_object: &[u8],
        encrypted_secret: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, TpmError> {
        let activate: KeyHandle = self.object(activate)?.into();
        let ek: KeyHandle = self.object(RootKind::Endorsement.handle())?.into();
        let credential = IdObject::try_from(inner_of(id_object)?).map_err(rejected)?;
        let secret = EncryptedSecret::try_from(inner_of(encrypted_secret)?).map_err(rejected)?;

        // the EK is authorized by PolicySecret(endorsement)
        let session = self
            .ctx
            .start_auth_session(
                None,
                None,
                None,
                SessionType::Policy,
                SymmetricDefinition::AES_128_CFB,
                HashingAlgorithm::Sha256,
            )
            .map_err(rejected)?
            .ok_or_else(|| TpmError::Rejected("no policy session".into()))?;
        let policy = PolicySession::try_from(session).map_err(rejected)?;

        let result = self
            .ctx
            .execute_with_nullauth_session(|ctx| {
                ctx.policy_secret(
                    policy,
                    AuthHandle::Endorsement,
                    Default::default(),
                    Default::default(),
                    Default::default(),
                    None,
                )
            })
            .and_then(|_| {
                self.ctx.execute_with_sessions(
                    (Some(AuthSession::Password), Some(session), None),
                    |ctx| ctx.activate_credential(activate, ek, credential, secret),
                )
            })
            .map(|digest| Zeroizing::new(digest.as_bytes().to_vec()))
            .map_err(|err| TpmError::IntegrityCheckFailed(err.to_string()));

        if let Err(err) = self.ctx.flush_context(SessionHandle::from(session).into()) {
            debug!(error = %err, "flush of policy session failed");
        }
        result
    }

    fn nv_read_public(&mut self, index: crate::layout::NvIndex) -> Result<Vec<u8>, TpmError> {
        let handle = self.nv_handle(index.0)?;
        let (public, _) = self.ctx.nv_read_public(handle).map_err(rejected)?;
        let data_size = u16::try_from(public.data_size())
            .map_err(|_| TpmError::Rejected("NV size exceeds u16".into()))?;
        NvPublic {
            index: index.0,
            name_alg: TPM2_ALG_ID::from(public.name_algorithm()),
            attributes: NvAttributes(TPMA_NV::from(public.attributes())),
            auth_policy: public.auth_policy().as_bytes().to_vec(),
            data_size,
        }
        .marshal()
        .map_err(|err| TpmError::Rejected(err.to_string()))
    }

    fn nv_define(&mut self, public: &NvPublic) -> Result<(), TpmError> {
        if public.attributes != NvAttributes::OWNER_DATA {
            return Err(TpmError::Rejected(format!(
                "unsupported NV attributes {:#010x}",
                public.attributes.0
            )));
        }
        let attributes = NvIndexAttributesBuilder::new()
            .with_owner_write(true)
            .with_auth_write(true)
            .with_owner_read(true)
            .with_auth_read(true)
            .with_no_da(true)
            .build()
            .map_err(rejected)?;
        let nv_public = NvPublicBuilder::new()
            .with_nv_index(NvIndexTpmHandle::new(public.index).map_err(rejected)?)
            .with_index_name_algorithm(HashingAlgorithm::Sha256)
            .with_index_attributes(attributes)
            .with_data_area_size(public.data_size as usize)
            .build()
            .map_err(rejected)?;
        self.ctx
            .nv_define_space(Provision::Owner, None, nv_public)
            .map(|_| ())
            .map_err(rejected)
    }

    fn nv_write(
        &mut self,
        index: crate::layout::NvIndex,
        offset: u16,
        data: &[u8],
    ) -> Result<(), TpmError> {
        let handle = self.nv_handle(index.0)?;
        for (i, chunk) in data.chunks(NV_CHUNK).enumerate() {
            let buffer = MaxNvBuffer::try_from(chunk.to_vec()).map_err(rejected)?;
            let at = offset as usize + i * NV_CHUNK;
            let at = u16::try_from(at).map_err(|_| TpmError::Rejected("NV offset overflow".into()))?;
            self.ctx
                .nv_write(NvAuth::Owner, handle, buffer, at)
                .map_err(rejected)?;
        }
        Ok(())
    }

    fn nv_read(
        &mut self,
        index: crate::layout::NvIndex,
        offset: u16,
        len: u16,
    ) -> Result<Vec<u8>, TpmError> {
        let handle = self.nv_handle(index.0)?;
        let mut out = Vec::with_capacity(len as usize);
        while out.len() < len as usize {
            let size = (len as usize - out.len()).min(NV_CHUNK) as u16;
            let at = offset as usize + out.len();
            let at = u16::try_from(at).map_err(|_| TpmError::Rejected("NV offset overflow".into()))?;
            let chunk = self
                .ctx
                .nv_read(NvAuth::Owner, handle, size, at)
                .map_err(rejected)?;
            out.extend_from_slice(chunk.as_bytes());
        }
        Ok(out)
    }

    fn nv_undefine(&mut self, index: crate::layout::NvIndex) -> Result<(), TpmError> {
        let handle = self.nv_handle(index.0)?;
        self.ctx
            .nv_undefine_space(Provision::Owner, handle)
            .map_err(rejected)
    }

    fn close(&mut self) {
        self.ctx.clear_sessions();
        info!(tcti = %self.tcti, "TPM transport closed");
    }
}
