//! Identity certificates bound to module-resident keys.
//!
//! Each slot stores at most one certificate, DER in a `TPM2B` inside the
//! slot's certificate NV index. A certificate is only ever stored for the
//! slot whose identity key matches its SubjectPublicKeyInfo.
//!
//! Certificate generation signs inside the caller's module sequence through
//! [`sign_in_module`]. Remote issuance runs with the lock released and only
//! the final bind-and-store step holds it.

use crate::context::{Module, TpmContext};
use crate::crypto;
use crate::error::{IdentityError, IdentityResult};
use crate::identity_key::{IdentityAlgorithm, IdentityKeyManager, IdentitySignature};
use crate::layout::{
    LogicalDeviceSlot, CERT_NV_SIZE, MAX_CERT_DER, SHA1_DIGEST_SIZE,
};
use crate::marshal::{NvPublic, ObjectName};
use crate::registry::{load_key, TpmKeyHandle};
use async_trait::async_trait;
use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, RemoteKeyPair, SerialNumber, SignatureAlgorithm,
    PKCS_ECDSA_P256_SHA256,
};
use sha1::{Digest, Sha1};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use ::time::{Duration as TimeDuration, OffsetDateTime};
use tracing::{info, warn};
use x509_parser::prelude::*;

/// SHA-1 of a certificate's DER encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Thumbprint([u8; SHA1_DIGEST_SIZE]);

impl Thumbprint {
    pub fn of(der: &[u8]) -> Self {
        Self(Sha1::digest(der).into())
    }

    pub fn as_bytes(&self) -> &[u8; SHA1_DIGEST_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }
}

impl FromStr for Thumbprint {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)
            .map_err(|err| IdentityError::ParseFailure(format!("thumbprint: {err}")))?;
        let bytes: [u8; SHA1_DIGEST_SIZE] = bytes.try_into().map_err(|_| {
            IdentityError::ParseFailure(format!("thumbprint must be {SHA1_DIGEST_SIZE} bytes"))
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for Thumbprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Thumbprint({})", self.to_hex())
    }
}

impl fmt::Display for Thumbprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// X.509 certificate bound to a module-resident key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityCertificate {
    pub der: Vec<u8>,
    pub thumbprint: Thumbprint,
    pub key_name: ObjectName,
    pub subject: String,
}

impl IdentityCertificate {
    pub fn from_der(der: Vec<u8>, key_name: ObjectName) -> IdentityResult<Self> {
        let subject = {
            let (_, cert) = X509Certificate::from_der(&der)
                .map_err(|err| IdentityError::ParseFailure(format!("certificate: {err}")))?;
            cert.subject().to_string()
        };
        Ok(Self {
            thumbprint: Thumbprint::of(&der),
            der,
            key_name,
            subject,
        })
    }
}

/// Uncompressed EC point from a certificate's SubjectPublicKeyInfo.
pub fn certificate_public_key(der: &[u8]) -> IdentityResult<Vec<u8>> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|err| IdentityError::ParseFailure(format!("certificate: {err}")))?;
    Ok(cert.public_key().subject_public_key.data.to_vec())
}

fn key_point(key: &TpmKeyHandle) -> IdentityResult<Vec<u8>> {
    key.public
        .ecc()
        .map(|detail| detail.point.to_sec1_uncompressed())
        .ok_or_else(|| IdentityError::UnsupportedAlgorithm("identity key is not ECC".into()))
}

pub(crate) fn store_cert_locked(
    module: &mut Module,
    slot: LogicalDeviceSlot,
    der: &[u8],
) -> IdentityResult<()> {
    if der.len() > MAX_CERT_DER {
        return Err(IdentityError::ValueTooLarge {
            what: "certificate",
            len: der.len(),
            max: MAX_CERT_DER,
        });
    }
    let index = slot.cert_nv_index();
    if module.nv_public(index)?.is_none() {
        module
            .transport()
            .nv_define(&NvPublic::owner_data(index.0, CERT_NV_SIZE))?;
    }
    let mut record = Vec::with_capacity(der.len() + 2);
    record.extend_from_slice(&(der.len() as u16).to_be_bytes());
    record.extend_from_slice(der);
    module.transport().nv_write(index, 0, &record)?;
    Ok(())
}

pub(crate) fn read_cert_locked(
    module: &mut Module,
    slot: LogicalDeviceSlot,
) -> IdentityResult<Option<Vec<u8>>> {
    let index = slot.cert_nv_index();
    match module.nv_public(index)? {
        Some(public) if public.is_written() => {}
        _ => return Ok(None),
    }
    let header = module.transport().nv_read(index, 0, 2)?;
    let len = match header.as_slice() {
        [hi, lo] => u16::from_be_bytes([*hi, *lo]),
        _ => return Err(IdentityError::ParseFailure("short certificate header".into())),
    };
    if len as usize > MAX_CERT_DER {
        return Err(IdentityError::ParseFailure(format!(
            "stored certificate length {len} exceeds {MAX_CERT_DER}"
        )));
    }
    Ok(Some(module.transport().nv_read(index, 2, len)?))
}

/// Slot and DER of the stored certificate with `thumbprint`.
pub(crate) fn find_by_thumbprint_locked(
    module: &mut Module,
    thumbprint: &Thumbprint,
) -> IdentityResult<Option<(LogicalDeviceSlot, Vec<u8>)>> {
    for slot in LogicalDeviceSlot::all() {
        if let Some(der) = read_cert_locked(module, slot)? {
            if Thumbprint::of(&der) == *thumbprint {
                return Ok(Some((slot, der)));
            }
        }
    }
    Ok(None)
}

/// Slot whose identity key has the public point `point`.
fn find_key_by_point_locked(
    module: &mut Module,
    point: &[u8],
) -> IdentityResult<Option<(LogicalDeviceSlot, TpmKeyHandle)>> {
    for slot in LogicalDeviceSlot::all() {
        if let Some(key) = load_key(module, slot.identity_key_handle())? {
            if key_point(&key)? == point {
                return Ok(Some((slot, key)));
            }
        }
    }
    Ok(None)
}

/// Sign `data` with the key bound to the certificate `thumbprint`.
pub(crate) fn sign_by_thumbprint(
    ctx: &TpmContext,
    thumbprint: &Thumbprint,
    data: &[u8],
) -> IdentityResult<Option<IdentitySignature>> {
    let digest = crypto::sha256(data);
    ctx.with_module(|module| {
        let Some((slot, der)) = find_by_thumbprint_locked(module, thumbprint)? else {
            return Ok(None);
        };
        let signature = module
            .transport()
            .sign_digest(slot.identity_key_handle(), &digest)
            .map_err(|err| match err {
                crate::transport::TpmError::ObjectNotPresent(_) => {
                    IdentityError::KeyNotFound(format!("slot {slot} has no identity key"))
                }
                other => other.into(),
            })?
            .to_der()?;
        let key = load_key(module, slot.identity_key_handle())?
            .ok_or_else(|| IdentityError::KeyNotFound(format!("slot {slot} has no identity key")))?;
        let certificate = IdentityCertificate::from_der(der, key.name()?)?;
        Ok(Some(IdentitySignature {
            subject: certificate.subject,
            signature,
        }))
    })
}

/// rcgen signer that never touches the module itself.
///
/// Without a signature it records the message rcgen asks it to sign. Given
/// the module's signature over that message, it returns it for the same
/// message and refuses any other.
struct DetachedSigner {
    public_key: Vec<u8>,
    message: Arc<Mutex<Option<Vec<u8>>>>,
    signature: Option<Vec<u8>>,
}

impl RemoteKeyPair for DetachedSigner {
    fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, rcgen::Error> {
        let mut message = self
            .message
            .lock()
            .map_err(|_| rcgen::Error::RemoteKeyError)?;
        match &self.signature {
            None => {
                *message = Some(msg.to_vec());
                Ok(Vec::new())
            }
            Some(signature) if message.as_deref() == Some(msg) => Ok(signature.clone()),
            Some(_) => Err(rcgen::Error::RemoteKeyError),
        }
    }

    fn algorithm(&self) -> &'static SignatureAlgorithm {
        &PKCS_ECDSA_P256_SHA256
    }
}

fn detached_key_pair(
    public_key: Vec<u8>,
    message: &Arc<Mutex<Option<Vec<u8>>>>,
    signature: Option<Vec<u8>>,
) -> IdentityResult<KeyPair> {
    KeyPair::from_remote(Box::new(DetachedSigner {
        public_key,
        message: Arc::clone(message),
        signature,
    }))
    .map_err(|err| IdentityError::CertificateAuthority(err.to_string()))
}

/// Run an rcgen generation whose signature comes from the module key `key`.
///
/// `generate` runs twice: once to capture the to-be-signed bytes, then again
/// with the module's signature over them. Both runs must produce the same
/// to-be-signed bytes. The caller already holds the module, so a sequence
/// that creates a key, certifies it and stores the result never releases it.
pub(crate) fn sign_in_module<T>(
    module: &mut Module,
    key: &TpmKeyHandle,
    mut generate: impl FnMut(&KeyPair) -> Result<T, rcgen::Error>,
) -> IdentityResult<T> {
    let public_key = key_point(key)?;
    let message = Arc::new(Mutex::new(None));

    let capture = detached_key_pair(public_key.clone(), &message, None)?;
    generate(&capture).map_err(|err| IdentityError::CertificateAuthority(err.to_string()))?;
    let tbs = message
        .lock()
        .map_err(|_| IdentityError::CertificateAuthority("signer state poisoned".into()))?
        .clone()
        .ok_or_else(|| IdentityError::CertificateAuthority("nothing to sign".into()))?;

    let signature = module
        .transport()
        .sign_digest(key.handle, &crypto::sha256(&tbs))?
        .to_der()?;
    let replay = detached_key_pair(public_key, &message, Some(signature))?;
    generate(&replay).map_err(|err| match err {
        rcgen::Error::RemoteKeyError => {
            IdentityError::CertificateAuthority("signed contents changed between passes".into())
        }
        other => IdentityError::CertificateAuthority(other.to_string()),
    })
}

/// rcgen key carrying only a public key, for certificates signed by an issuer.
struct PublicOnlyKey {
    public_key: Vec<u8>,
}

impl RemoteKeyPair for PublicOnlyKey {
    fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    fn sign(&self, _msg: &[u8]) -> Result<Vec<u8>, rcgen::Error> {
        Err(rcgen::Error::RemoteKeyError)
    }

    fn algorithm(&self) -> &'static SignatureAlgorithm {
        &PKCS_ECDSA_P256_SHA256
    }
}

/// Subject organization and validity of generated certificates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateProfile {
    pub organization: String,
    pub validity_days: u32,
}

impl Default for CertificateProfile {
    fn default() -> Self {
        Self {
            organization: "Tessera Device".to_string(),
            validity_days: 365,
        }
    }
}

impl From<&tessera_core::ProvisioningConfig> for CertificateProfile {
    fn from(config: &tessera_core::ProvisioningConfig) -> Self {
        Self {
            organization: config.organization.clone(),
            validity_days: config.certificate_validity_days,
        }
    }
}

fn subject_name(common_name: &str, organization: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, organization);
    dn
}

/// Self-signed placeholder certificate for `key`, signed inside the module.
pub(crate) fn placeholder_certificate(
    module: &mut Module,
    key: &TpmKeyHandle,
    common_name: &str,
    profile: &CertificateProfile,
) -> IdentityResult<Vec<u8>> {
    let mut params = CertificateParams::default();
    params.distinguished_name = subject_name(common_name, &profile.organization);

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + TimeDuration::days(profile.validity_days as i64);
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
    let mut serial = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut serial);
    serial[0] &= 0x7F;
    params.serial_number = Some(SerialNumber::from_slice(&serial));

    sign_in_module(module, key, |key_pair| {
        params.clone().self_signed(key_pair).map(|cert| cert.der().to_vec())
    })
}

/// Request handed to a certificate authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuanceRequest {
    /// PKCS#10 DER signed by the module-resident key
    pub csr: Vec<u8>,
    /// Uncompressed EC point the issued certificate must carry
    pub public_key: Vec<u8>,
    pub device_name: String,
    pub url: String,
}

/// Remote certificate authority.
#[async_trait]
pub trait CertificateAuthorityClient: Send + Sync {
    /// Issue a certificate for `request`, returning its DER encoding.
    async fn issue(&self, request: IssuanceRequest) -> IdentityResult<Vec<u8>>;
}

/// Certificate lifecycle for the slots of one module.
#[derive(Debug, Clone)]
pub struct IdentityCertificateManager {
    ctx: Arc<TpmContext>,
    keys: IdentityKeyManager,
    issuance_timeout: Duration,
}

impl IdentityCertificateManager {
    pub fn new(ctx: Arc<TpmContext>, profile: CertificateProfile, issuance_timeout: Duration) -> Self {
        Self {
            keys: IdentityKeyManager::new(Arc::clone(&ctx), profile),
            ctx,
            issuance_timeout,
        }
    }

    /// Existing certificate of the slot, or a new key and placeholder certificate.
    pub fn read_or_create_identity_key_cert(
        &self,
        slot: usize,
        algorithm: &str,
    ) -> IdentityResult<IdentityCertificate> {
        Ok(self.keys.create_or_import_identity_key(slot, algorithm)?.certificate)
    }

    /// Store `cert_der` for the slot whose identity key it certifies.
    pub fn import_identity_cert(&self, cert_der: &[u8]) -> IdentityResult<Thumbprint> {
        let point = certificate_public_key(cert_der)?;
        let thumbprint = Thumbprint::of(cert_der);
        let slot = self.ctx.with_module(|module| {
            let (slot, _) = find_key_by_point_locked(module, &point)?.ok_or_else(|| {
                IdentityError::KeyNotFound("no identity key matches the certificate".into())
            })?;
            store_cert_locked(module, slot, cert_der)?;
            Ok(slot)
        })?;
        info!(%slot, %thumbprint, "identity certificate imported");
        Ok(thumbprint)
    }

    /// Remove the slot's certificate. The identity key stays.
    pub fn destroy_identity_cert(&self, slot: usize, algorithm: &str) -> IdentityResult<()> {
        let slot = LogicalDeviceSlot::new(slot)?;
        let _: IdentityAlgorithm = algorithm.parse()?;
        if self
            .ctx
            .with_module(|module| module.undefine_if_present(slot.cert_nv_index()))?
        {
            info!(%slot, "identity certificate destroyed");
        }
        Ok(())
    }

    /// Have `ca` issue a certificate for the key behind `thumbprint` and bind it.
    ///
    /// An empty `csr` is replaced by one built for `device_name`. The module
    /// lock is not held while waiting for the CA. Timeouts are retryable.
    pub async fn issue_certificate(
        &self,
        ca: &dyn CertificateAuthorityClient,
        thumbprint: &Thumbprint,
        csr: &[u8],
        device_name: &str,
        issuing_url: &str,
    ) -> IdentityResult<IdentityCertificate> {
        let (slot, key) = self.key_for_thumbprint(thumbprint)?;
        let key_name = key.name()?;
        let public_key = key_point(&key)?;
        let csr = if csr.is_empty() {
            self.build_certificate_request(thumbprint, device_name)?
        } else {
            csr.to_vec()
        };

        let request = IssuanceRequest {
            csr,
            public_key: public_key.clone(),
            device_name: device_name.to_string(),
            url: issuing_url.to_string(),
        };
        let issued = tokio::time::timeout(self.issuance_timeout, ca.issue(request))
            .await
            .map_err(|_| {
                warn!(%slot, timeout = ?self.issuance_timeout, "certificate issuance timed out");
                IdentityError::IssuanceTimeout(self.issuance_timeout)
            })??;

        if certificate_public_key(&issued)? != public_key {
            return Err(IdentityError::CryptoVerificationFailed(
                "issued certificate does not carry the identity key".into(),
            ));
        }
        let certificate = IdentityCertificate::from_der(issued, key_name)?;

        self.ctx.with_module(|module| {
            let current = load_key(module, slot.identity_key_handle())?
                .map(|key| key.name())
                .transpose()?;
            if current != Some(key_name) {
                return Err(IdentityError::CryptoVerificationFailed(
                    "identity key changed during issuance".into(),
                ));
            }
            store_cert_locked(module, slot, &certificate.der)
        })?;
        info!(%slot, thumbprint = %certificate.thumbprint, url = issuing_url, "certificate issued");
        Ok(certificate)
    }

    pub fn sign_with_identity_cert(
        &self,
        thumbprint: &Thumbprint,
        data: &[u8],
    ) -> IdentityResult<IdentitySignature> {
        sign_by_thumbprint(&self.ctx, thumbprint, data)?
            .ok_or_else(|| IdentityError::CertNotFound(thumbprint.to_hex()))
    }

    /// PKCS#10 request with `CN=common_name`, signed by the key behind `thumbprint`.
    pub fn build_certificate_request(
        &self,
        thumbprint: &Thumbprint,
        common_name: &str,
    ) -> IdentityResult<Vec<u8>> {
        let mut params = CertificateParams::default();
        params.distinguished_name = subject_name(common_name, &self.keys.profile().organization);

        self.ctx.with_module(|module| {
            let (_, key) = key_for_thumbprint_locked(module, thumbprint)?;
            sign_in_module(module, &key, |key_pair| {
                params.serialize_request(key_pair).map(|csr| csr.der().to_vec())
            })
        })
    }

    /// `TPM2B_PUBLIC` and name of the module key a certificate is bound to.
    pub fn key_public_from_cert(&self, cert_der: &[u8]) -> IdentityResult<(Vec<u8>, ObjectName)> {
        let point = certificate_public_key(cert_der)?;
        let (_, key) = self
            .ctx
            .with_module(|module| find_key_by_point_locked(module, &point))?
            .ok_or_else(|| {
                IdentityError::KeyNotFound("no identity key matches the certificate".into())
            })?;
        Ok((key.public.to_tpm2b()?, key.name()?))
    }

    pub fn keys(&self) -> &IdentityKeyManager {
        &self.keys
    }

    fn key_for_thumbprint(
        &self,
        thumbprint: &Thumbprint,
    ) -> IdentityResult<(LogicalDeviceSlot, TpmKeyHandle)> {
        self.ctx
            .with_module(|module| key_for_thumbprint_locked(module, thumbprint))
    }
}

fn key_for_thumbprint_locked(
    module: &mut Module,
    thumbprint: &Thumbprint,
) -> IdentityResult<(LogicalDeviceSlot, TpmKeyHandle)> {
    let (slot, _) = find_by_thumbprint_locked(module, thumbprint)?
        .ok_or_else(|| IdentityError::CertNotFound(thumbprint.to_hex()))?;
    let key = load_key(module, slot.identity_key_handle())?
        .ok_or_else(|| IdentityError::KeyNotFound(format!("slot {slot} has no identity key")))?;
    Ok((slot, key))
}

/// Software certificate authority for tests and offline provisioning.
pub struct LocalCertificateAuthority {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    organization: String,
    validity_days: u32,
}

impl fmt::Debug for LocalCertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalCertificateAuthority")
            .field("organization", &self.organization)
            .field("validity_days", &self.validity_days)
            .finish_non_exhaustive()
    }
}

impl LocalCertificateAuthority {
    /// New root with a fresh P-256 key.
    pub fn new(common_name: &str, organization: &str, validity_days: u32) -> IdentityResult<Self> {
        let ca_key =
            KeyPair::generate().map_err(|err| IdentityError::CertificateAuthority(err.to_string()))?;

        let mut params = CertificateParams::default();
        params.distinguished_name = subject_name(common_name, organization);
        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + TimeDuration::days(validity_days as i64);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|err| IdentityError::CertificateAuthority(err.to_string()))?;
        Ok(Self {
            ca_cert,
            ca_key,
            organization: organization.to_string(),
            validity_days,
        })
    }

    pub fn certificate_der(&self) -> Vec<u8> {
        self.ca_cert.der().to_vec()
    }

    /// Check that `der` was signed by this authority.
    pub fn verify_issued(&self, der: &[u8]) -> IdentityResult<()> {
        use p256::ecdsa::signature::Verifier;

        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|err| IdentityError::ParseFailure(format!("certificate: {err}")))?;
        let ca_key = p256::ecdsa::VerifyingKey::from_sec1_bytes(self.ca_key.public_key_raw())
            .map_err(|err| IdentityError::CertificateAuthority(err.to_string()))?;
        let signature = p256::ecdsa::Signature::from_der(&cert.signature_value.data)
            .map_err(|err| IdentityError::ParseFailure(format!("signature: {err}")))?;
        ca_key
            .verify(cert.tbs_certificate.as_ref(), &signature)
            .map_err(|_| IdentityError::CryptoVerificationFailed("issuer signature".into()))
    }

    fn issue_from_request(&self, request: &IssuanceRequest) -> IdentityResult<Vec<u8>> {
        use p256::ecdsa::signature::Verifier;

        let (_, csr) = X509CertificationRequest::from_der(&request.csr)
            .map_err(|err| IdentityError::ParseFailure(format!("certificate request: {err}")))?;
        let info = &csr.certification_request_info;
        let requested_key = info.subject_pki.subject_public_key.data.to_vec();
        if requested_key != request.public_key {
            return Err(IdentityError::CertificateAuthority(
                "request key does not match the identity key".into(),
            ));
        }

        let verifying_key = p256::ecdsa::VerifyingKey::from_sec1_bytes(&requested_key)
            .map_err(|_| IdentityError::UnsupportedAlgorithm("request key is not P-256".into()))?;
        let signature = p256::ecdsa::Signature::from_der(&csr.signature_value.data)
            .map_err(|err| IdentityError::ParseFailure(format!("request signature: {err}")))?;
        verifying_key
            .verify(info.raw, &signature)
            .map_err(|_| IdentityError::CryptoVerificationFailed("request signature".into()))?;

        let common_name = info
            .subject
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or(&request.device_name)
            .to_string();

        let mut params = CertificateParams::default();
        params.distinguished_name = subject_name(&common_name, &self.organization);
        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + TimeDuration::days(self.validity_days as i64);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];

        let subject_key = KeyPair::from_remote(Box::new(PublicOnlyKey {
            public_key: requested_key,
        }))
        .map_err(|err| IdentityError::CertificateAuthority(err.to_string()))?;
        let cert = params
            .signed_by(&subject_key, &self.ca_cert, &self.ca_key)
            .map_err(|err| IdentityError::CertificateAuthority(err.to_string()))?;
        Ok(cert.der().to_vec())
    }
}

#[async_trait]
impl CertificateAuthorityClient for LocalCertificateAuthority {
    async fn issue(&self, request: IssuanceRequest) -> IdentityResult<Vec<u8>> {
        let der = self.issue_from_request(&request)?;
        info!(device = %request.device_name, "local CA issued certificate");
        Ok(der)
    }
}
