use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tessera_identity::certificate::certificate_public_key;
use tessera_identity::{
    CertificateAuthorityClient, CertificateProfile, IdentityCertificateManager, IdentityError,
    IdentityResult, IssuanceRequest, LocalCertificateAuthority, SimulatedTpm, TpmContext,
};

fn manager(timeout: Duration) -> IdentityCertificateManager {
    tessera_core::logging::try_init();
    let ctx = TpmContext::initialize(Box::new(SimulatedTpm::new())).unwrap();
    IdentityCertificateManager::new(ctx, CertificateProfile::default(), timeout)
}

struct SlowAuthority {
    inner: LocalCertificateAuthority,
    delay: Duration,
}

#[async_trait]
impl CertificateAuthorityClient for SlowAuthority {
    async fn issue(&self, request: IssuanceRequest) -> IdentityResult<Vec<u8>> {
        tokio::time::sleep(self.delay).await;
        self.inner.issue(request).await
    }
}

/// Issues for whatever key it is given, ignoring the request.
struct ForeignKeyAuthority(LocalCertificateAuthority, Arc<IdentityCertificateManager>);

#[async_trait]
impl CertificateAuthorityClient for ForeignKeyAuthority {
    async fn issue(&self, _request: IssuanceRequest) -> IdentityResult<Vec<u8>> {
        let other = self.1.read_or_create_identity_key_cert(7, "ECDSA")?;
        let request = IssuanceRequest {
            csr: self.1.build_certificate_request(&other.thumbprint, "other")?,
            public_key: certificate_public_key(&other.der)?,
            device_name: "other".into(),
            url: String::new(),
        };
        self.0.issue(request).await
    }
}

#[tokio::test]
async fn test_issue_replaces_placeholder() {
    let manager = manager(Duration::from_secs(5));
    let ca = LocalCertificateAuthority::new("Tessera Test CA", "Tessera", 30).unwrap();

    let placeholder = manager.read_or_create_identity_key_cert(0, "ECDSA").unwrap();
    let issued = manager
        .issue_certificate(&ca, &placeholder.thumbprint, &[], "device0", "https://ca.example")
        .await
        .unwrap();

    assert_ne!(issued.thumbprint, placeholder.thumbprint);
    assert_eq!(issued.key_name, placeholder.key_name);
    assert!(issued.subject.contains("device0"));
    ca.verify_issued(&issued.der).unwrap();

    // the slot now reports the issued certificate
    let current = manager.read_or_create_identity_key_cert(0, "ECDSA").unwrap();
    assert_eq!(current.thumbprint, issued.thumbprint);

    // signing follows the new thumbprint only
    manager
        .sign_with_identity_cert(&issued.thumbprint, b"payload")
        .unwrap();
    assert!(matches!(
        manager.sign_with_identity_cert(&placeholder.thumbprint, b"payload"),
        Err(IdentityError::CertNotFound(_))
    ));
}

#[tokio::test]
async fn test_issue_with_caller_csr() {
    let manager = manager(Duration::from_secs(5));
    let ca = LocalCertificateAuthority::new("Tessera Test CA", "Tessera", 30).unwrap();

    let placeholder = manager.read_or_create_identity_key_cert(1, "ECDSA").unwrap();
    let csr = manager
        .build_certificate_request(&placeholder.thumbprint, "from-csr")
        .unwrap();
    let issued = manager
        .issue_certificate(&ca, &placeholder.thumbprint, &csr, "fallback", "https://ca.example")
        .await
        .unwrap();
    assert!(issued.subject.contains("from-csr"));
}

#[tokio::test]
async fn test_issue_times_out() {
    let manager = manager(Duration::from_millis(50));
    let ca = SlowAuthority {
        inner: LocalCertificateAuthority::new("Slow CA", "Tessera", 30).unwrap(),
        delay: Duration::from_secs(2),
    };

    let placeholder = manager.read_or_create_identity_key_cert(2, "ECDSA").unwrap();
    let err = manager
        .issue_certificate(&ca, &placeholder.thumbprint, &[], "device2", "https://ca.example")
        .await
        .unwrap_err();
    assert!(matches!(err, IdentityError::IssuanceTimeout(_)));
    assert!(err.is_retryable());

    // placeholder untouched
    let current = manager.read_or_create_identity_key_cert(2, "ECDSA").unwrap();
    assert_eq!(current.thumbprint, placeholder.thumbprint);
}

#[tokio::test]
async fn test_issue_rejects_certificate_for_other_key() {
    let manager = Arc::new(manager(Duration::from_secs(5)));
    let ca = ForeignKeyAuthority(
        LocalCertificateAuthority::new("Rogue CA", "Tessera", 30).unwrap(),
        manager.clone(),
    );

    let placeholder = manager.read_or_create_identity_key_cert(3, "ECDSA").unwrap();
    let err = manager
        .issue_certificate(&ca, &placeholder.thumbprint, &[], "device3", "https://ca.example")
        .await
        .unwrap_err();
    assert!(matches!(err, IdentityError::CryptoVerificationFailed(_)));

    let current = manager.read_or_create_identity_key_cert(3, "ECDSA").unwrap();
    assert_eq!(current.thumbprint, placeholder.thumbprint);
}

#[tokio::test]
async fn test_issue_for_unknown_thumbprint() {
    let manager = manager(Duration::from_secs(5));
    let ca = LocalCertificateAuthority::new("Tessera Test CA", "Tessera", 30).unwrap();
    let unknown = "00112233445566778899AABBCCDDEEFF00112233".parse().unwrap();

    assert!(matches!(
        manager
            .issue_certificate(&ca, &unknown, &[], "device", "https://ca.example")
            .await,
        Err(IdentityError::CertNotFound(_))
    ));
}
