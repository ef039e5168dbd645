//! Device identity façade.
//!
//! Bundles the components of one module context. The `*_into` methods follow
//! the caller-buffer convention of [`crate::buffer`]: byte outputs go into
//! `&mut [u8]`, string outputs into NUL-terminated `&mut [u16]`.

use crate::buffer::{copy_to_buffer, copy_wide_to_buffer};
use crate::certificate::{
    CertificateAuthorityClient, CertificateProfile, IdentityCertificateManager, Thumbprint,
};
use crate::context::TpmContext;
use crate::error::{IdentityError, IdentityResult};
use crate::hostage::{create_hostage_key_ex, ActivationSecret, HostageBlob, HostageKeyProtocol};
use crate::identity_key::IdentityKeyManager;
use crate::layout::{PersistentHandle, SHA1_DIGEST_SIZE, SYMMETRIC_KEY_SIZE};
use crate::marshal::PublicArea;
use crate::registry::LogicalDeviceRegistry;
use crate::roots::{self, EndorsementKeyProvider, StorageRootKeyProvider};
use crate::sas::{unix_now, SasTokenGenerator};
use crate::service_uri::ServiceUriStore;
use crate::transport::TpmTransport;
use std::sync::Arc;
use std::time::Duration;
use tessera_core::{Config, ProvisioningConfig};

/// Every identity component of one module.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    ctx: Arc<TpmContext>,
    registry: LogicalDeviceRegistry,
    endorsement: EndorsementKeyProvider,
    storage_root: StorageRootKeyProvider,
    hostage: HostageKeyProtocol,
    certificates: IdentityCertificateManager,
    service_uri: ServiceUriStore,
    sas: SasTokenGenerator,
    sas_validity: Duration,
}

impl DeviceIdentity {
    /// Initialize a context over `transport`.
    pub fn initialize(
        transport: Box<dyn TpmTransport>,
        provisioning: &ProvisioningConfig,
    ) -> IdentityResult<Self> {
        Ok(Self::from_context(TpmContext::initialize(transport)?, provisioning))
    }

    /// Open the module selected by `config`.
    pub fn open(config: &Config) -> IdentityResult<Self> {
        config.validate()?;
        let ctx = crate::open_module(&config.module)?;
        Ok(Self::from_context(ctx, &config.provisioning))
    }

    pub fn from_context(ctx: Arc<TpmContext>, provisioning: &ProvisioningConfig) -> Self {
        Self {
            registry: LogicalDeviceRegistry::new(ctx.clone()),
            endorsement: EndorsementKeyProvider::new(ctx.clone()),
            storage_root: StorageRootKeyProvider::new(ctx.clone()),
            hostage: HostageKeyProtocol::new(ctx.clone()),
            certificates: IdentityCertificateManager::new(
                ctx.clone(),
                CertificateProfile::from(provisioning),
                Duration::from_millis(provisioning.issuance_timeout_ms),
            ),
            service_uri: ServiceUriStore::new(ctx.clone()),
            sas: SasTokenGenerator::new(ctx.clone()),
            sas_validity: Duration::from_secs(provisioning.sas_validity_secs),
            ctx,
        }
    }

    /// Release the module. Every later call fails with `TpmUnavailable`.
    pub fn deinitialize(&self) {
        self.ctx.deinitialize();
    }

    pub fn context(&self) -> &Arc<TpmContext> {
        &self.ctx
    }

    pub fn registry(&self) -> &LogicalDeviceRegistry {
        &self.registry
    }

    pub fn endorsement_key(&self) -> &EndorsementKeyProvider {
        &self.endorsement
    }

    pub fn storage_root_key(&self) -> &StorageRootKeyProvider {
        &self.storage_root
    }

    pub fn hostage(&self) -> &HostageKeyProtocol {
        &self.hostage
    }

    pub fn keys(&self) -> &IdentityKeyManager {
        self.certificates.keys()
    }

    pub fn certificates(&self) -> &IdentityCertificateManager {
        &self.certificates
    }

    pub fn service_uri(&self) -> &ServiceUriStore {
        &self.service_uri
    }

    pub fn sas(&self) -> &SasTokenGenerator {
        &self.sas
    }

    pub fn is_provisioned(&self, slot: usize) -> IdentityResult<bool> {
        self.registry.present(slot)
    }

    pub fn evict_slot(&self, slot: usize) -> IdentityResult<()> {
        self.registry.evict(slot)
    }

    pub fn clear_all_slots(&self) -> IdentityResult<()> {
        self.registry.clear_all()
    }

    /// Connection string for the slot, valid for the configured SAS lifetime.
    pub fn connection_string(&self, slot: usize, module_id: Option<&str>) -> IdentityResult<String> {
        self.sas.connection_string(slot, self.sas_validity, module_id)
    }

    pub fn read_device_id_into(&self, slot: usize, out: &mut [u16]) -> IdentityResult<usize> {
        copy_wide_to_buffer(&self.registry.read_device_id(slot)?, out)
    }

    pub fn registration_id_into(&self, out: &mut [u16]) -> IdentityResult<usize> {
        copy_wide_to_buffer(&self.endorsement.registration_id()?, out)
    }

    /// `TPM2B_PUBLIC` of the endorsement key.
    pub fn endorsement_key_into(&self, out: &mut [u8]) -> IdentityResult<usize> {
        copy_to_buffer(&self.endorsement.get_public_bytes()?, out)
    }

    /// `TPM2B_PUBLIC` of the storage root key.
    pub fn storage_root_key_into(&self, out: &mut [u8]) -> IdentityResult<usize> {
        copy_to_buffer(&self.storage_root.get_public_bytes()?, out)
    }

    /// `TPM2B_PUBLIC` and name of a persistent object. Returns both lengths.
    pub fn key_public_into(
        &self,
        handle: PersistentHandle,
        public_out: &mut [u8],
        name_out: &mut [u8],
    ) -> IdentityResult<(usize, usize)> {
        let (public, name) = roots::key_public(&self.ctx, handle)?;
        if name_out.len() < name.as_bytes().len() {
            return Err(IdentityError::BufferTooSmall {
                required: name.as_bytes().len(),
            });
        }
        let public_len = copy_to_buffer(&public, public_out)?;
        let name_len = copy_to_buffer(name.as_bytes(), name_out)?;
        Ok((public_len, name_len))
    }

    pub fn read_service_uri_into(&self, slot: usize, out: &mut [u16]) -> IdentityResult<usize> {
        copy_wide_to_buffer(&self.service_uri.read(slot)?, out)
    }

    pub fn sign_with_hmac_key_into(
        &self,
        slot: usize,
        data: &[u8],
        out: &mut [u8],
    ) -> IdentityResult<usize> {
        copy_to_buffer(&self.keys().sign_with_hmac_key(slot, data)?, out)
    }

    /// SAS token for `scope` valid until `expiry` (Unix seconds).
    pub fn sas_token_into(
        &self,
        slot: usize,
        scope: &str,
        expiry: u64,
        out: &mut [u16],
    ) -> IdentityResult<usize> {
        copy_wide_to_buffer(&self.sas.generate(slot, scope, expiry)?.to_string(), out)
    }

    /// SAS token for `scope` valid for the configured lifetime.
    pub fn sas_token_for_validity_into(
        &self,
        slot: usize,
        scope: &str,
        out: &mut [u16],
    ) -> IdentityResult<usize> {
        let expiry = unix_now()?.saturating_add(self.sas_validity.as_secs());
        self.sas_token_into(slot, scope, expiry, out)
    }

    pub fn connection_string_into(
        &self,
        slot: usize,
        module_id: Option<&str>,
        out: &mut [u16],
    ) -> IdentityResult<usize> {
        copy_wide_to_buffer(&self.connection_string(slot, module_id)?, out)
    }

    /// DER of the slot's identity certificate, creating key and placeholder if needed.
    pub fn identity_certificate_into(
        &self,
        slot: usize,
        algorithm: &str,
        out: &mut [u8],
    ) -> IdentityResult<usize> {
        let cert = self
            .certificates
            .read_or_create_identity_key_cert(slot, algorithm)?;
        copy_to_buffer(&cert.der, out)
    }

    /// DER signature over `data` with the key bound to `thumbprint`.
    pub fn sign_with_identity_cert_into(
        &self,
        thumbprint: &Thumbprint,
        data: &[u8],
        out: &mut [u8],
    ) -> IdentityResult<usize> {
        let signed = self.certificates.sign_with_identity_cert(thumbprint, data)?;
        copy_to_buffer(&signed.signature, out)
    }

    /// Wire-format hostage blob for the module whose `TPM2B_PUBLIC` EK and
    /// SRK are given. Needs no module, so it runs on the provisioning side.
    pub fn create_hostage_key_into(
        ek_public: &[u8],
        srk_public: &[u8],
        device_name: &str,
        url: &str,
        hmac_key: &[u8],
        secret: &ActivationSecret,
        out: &mut [u8],
    ) -> IdentityResult<usize> {
        let ek = PublicArea::from_tpm2b(ek_public)?;
        let srk = PublicArea::from_tpm2b(srk_public)?;
        let blob = create_hostage_key_ex(&ek, &srk, device_name, url, hmac_key, secret)?;
        copy_to_buffer(&blob.to_bytes(), out)
    }

    /// Import a wire-format hostage blob into `slot`. Writes the recovered
    /// activation secret to `secret_out`, which must hold 16 bytes; a shorter
    /// buffer fails before the module is touched.
    pub fn import_hostage_key_into(
        &self,
        slot: usize,
        blob: &[u8],
        secret_out: &mut [u8],
    ) -> IdentityResult<usize> {
        if secret_out.len() < SYMMETRIC_KEY_SIZE {
            return Err(IdentityError::BufferTooSmall {
                required: SYMMETRIC_KEY_SIZE,
            });
        }
        let blob = HostageBlob::from_bytes(blob)?;
        let imported = self.hostage.import_hostage_key(slot, &blob)?;
        copy_to_buffer(imported.secret.as_bytes(), secret_out)
    }

    /// Bind `cert_der` to the slot holding its key and write the 20-byte
    /// thumbprint. A short buffer fails before anything is stored.
    pub fn import_identity_cert_into(
        &self,
        cert_der: &[u8],
        thumbprint_out: &mut [u8],
    ) -> IdentityResult<usize> {
        if thumbprint_out.len() < SHA1_DIGEST_SIZE {
            return Err(IdentityError::BufferTooSmall {
                required: SHA1_DIGEST_SIZE,
            });
        }
        let thumbprint = self.certificates.import_identity_cert(cert_der)?;
        copy_to_buffer(thumbprint.as_bytes(), thumbprint_out)
    }

    /// Have `ca` issue a certificate for the key behind `thumbprint` and
    /// write its DER.
    ///
    /// The certificate is stored before it is copied out. After a
    /// `BufferTooSmall`, read it with [`Self::identity_certificate_into`]
    /// instead of issuing again.
    pub async fn issue_certificate_into(
        &self,
        ca: &dyn CertificateAuthorityClient,
        thumbprint: &Thumbprint,
        csr: &[u8],
        device_name: &str,
        issuing_url: &str,
        out: &mut [u8],
    ) -> IdentityResult<usize> {
        let issued = self
            .certificates
            .issue_certificate(ca, thumbprint, csr, device_name, issuing_url)
            .await?;
        copy_to_buffer(&issued.der, out)
    }

    /// Upper-case hex thumbprint of the slot's identity certificate,
    /// creating key and placeholder if needed.
    pub fn thumbprint_into(
        &self,
        slot: usize,
        algorithm: &str,
        out: &mut [u16],
    ) -> IdentityResult<usize> {
        let cert = self
            .certificates
            .read_or_create_identity_key_cert(slot, algorithm)?;
        copy_wide_to_buffer(&cert.thumbprint.to_hex(), out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::EK_HANDLE;
    use crate::certificate::LocalCertificateAuthority;
    use crate::simulator::SimulatedTpm;

    fn identity() -> DeviceIdentity {
        DeviceIdentity::initialize(Box::new(SimulatedTpm::new()), &ProvisioningConfig::default())
            .unwrap()
    }

    #[test]
    fn test_device_id_into_sizes() {
        let identity = identity();
        identity.keys().create_hmac_key(0, b"key").unwrap();

        let mut small = [0u16; 8];
        let required = match identity.read_device_id_into(0, &mut small) {
            Err(IdentityError::BufferTooSmall { required }) => required,
            other => panic!("expected BufferTooSmall, got {other:?}"),
        };
        assert_eq!(required, 69);

        let mut out = vec![0u16; required];
        assert_eq!(identity.read_device_id_into(0, &mut out).unwrap(), 69);
        assert_eq!(out[68], 0);
    }

    #[test]
    fn test_key_public_into() {
        let identity = identity();
        let mut public = [0u8; 512];
        let mut name = [0u8; 34];
        let (public_len, name_len) = identity
            .key_public_into(EK_HANDLE, &mut public, &mut name)
            .unwrap();
        assert_eq!(name_len, 34);
        assert_eq!(
            &public[..public_len],
            identity.endorsement_key().get_public_bytes().unwrap().as_slice()
        );
    }

    #[test]
    fn test_hostage_blob_through_buffers() {
        let identity = identity();
        let ek = identity.endorsement_key().get_public_bytes().unwrap();
        let srk = identity.storage_root_key().get_public_bytes().unwrap();
        let secret = ActivationSecret::generate();

        let mut blob = [0u8; 8];
        let required = match DeviceIdentity::create_hostage_key_into(
            &ek, &srk, "dev", "hub.example", &[4; 32], &secret, &mut blob,
        ) {
            Err(IdentityError::BufferTooSmall { required }) => required,
            other => panic!("expected BufferTooSmall, got {other:?}"),
        };
        let mut blob = vec![0u8; required + 16];
        let len = DeviceIdentity::create_hostage_key_into(
            &ek, &srk, "dev", "hub.example", &[4; 32], &secret, &mut blob,
        )
        .unwrap();
        assert!(len <= required);

        let mut short = [0u8; 15];
        assert!(matches!(
            identity.import_hostage_key_into(0, &blob[..len], &mut short),
            Err(IdentityError::BufferTooSmall { required: 16 })
        ));
        assert!(!identity.is_provisioned(0).unwrap());

        let mut recovered = [0u8; 16];
        assert_eq!(
            identity
                .import_hostage_key_into(0, &blob[..len], &mut recovered)
                .unwrap(),
            16
        );
        assert_eq!(&recovered, secret.as_bytes());
        assert_eq!(identity.service_uri().read(0).unwrap(), "hub.example/dev");
    }

    #[test]
    fn test_thumbprint_and_import_into() {
        let identity = identity();
        let mut wide = [0u16; 41];
        assert_eq!(identity.thumbprint_into(1, "ECDSA", &mut wide).unwrap(), 41);
        let hex = String::from_utf16(&wide[..40]).unwrap();

        let mut der = vec![0u8; 2048];
        let len = identity.identity_certificate_into(1, "ECDSA", &mut der).unwrap();

        let mut short = [0u8; 19];
        assert!(matches!(
            identity.import_identity_cert_into(&der[..len], &mut short),
            Err(IdentityError::BufferTooSmall { required: 20 })
        ));
        let mut thumbprint = [0u8; 20];
        identity
            .import_identity_cert_into(&der[..len], &mut thumbprint)
            .unwrap();
        assert_eq!(hex::encode_upper(thumbprint), hex);
    }

    #[tokio::test]
    async fn test_issue_certificate_into() {
        let identity = identity();
        let placeholder = identity
            .certificates()
            .read_or_create_identity_key_cert(2, "ECDSA")
            .unwrap();
        let ca = LocalCertificateAuthority::new("Test Root", "Tessera", 30).unwrap();

        let mut out = vec![0u8; 4096];
        let len = identity
            .issue_certificate_into(
                &ca,
                &placeholder.thumbprint,
                &[],
                "device-2",
                "https://ca.example",
                &mut out,
            )
            .await
            .unwrap();
        ca.verify_issued(&out[..len]).unwrap();

        let mut stored = vec![0u8; 4096];
        let stored_len = identity
            .identity_certificate_into(2, "ECDSA", &mut stored)
            .unwrap();
        assert_eq!(&stored[..stored_len], &out[..len]);
    }

    #[test]
    fn test_deinitialize_rejects_calls() {
        let identity = identity();
        identity.deinitialize();
        assert!(matches!(
            identity.is_provisioned(0),
            Err(IdentityError::TpmUnavailable(_))
        ));
    }
}
