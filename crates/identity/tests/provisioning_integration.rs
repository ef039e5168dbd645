//! End-to-end provisioning against the simulated module.

use tessera_core::ProvisioningConfig;
use tessera_identity::{
    challenge_identity_cert, create_hostage_key, crypto, ActivationSecret, DeviceIdentity,
    IdentityError, SasToken, SimulatedTpm,
};

fn device(seed: u8) -> DeviceIdentity {
    tessera_core::logging::try_init();
    DeviceIdentity::initialize(
        Box::new(SimulatedTpm::with_seed([seed; 32])),
        &ProvisioningConfig::default(),
    )
    .expect("simulated module initializes")
}

#[test]
fn test_full_provisioning_flow() {
    let device = device(1);

    // provisioning service side: only public keys leave the device
    let ek = device.endorsement_key().get_public().unwrap();
    let srk = device.storage_root_key().get_public().unwrap();
    let secret = ActivationSecret::generate();
    let hmac_key = [0x5A; 32];
    let blob = create_hostage_key(&ek, &srk, "device0", "hub.example", &hmac_key, &secret).unwrap();
    let wire = blob.to_bytes();

    // device side
    let blob = tessera_identity::HostageBlob::from_bytes(&wire).unwrap();
    let imported = device.hostage().import_hostage_key(0, &blob).unwrap();
    assert_eq!(imported.secret, secret);
    assert!(device.is_provisioned(0).unwrap());

    assert_eq!(device.service_uri().read(0).unwrap(), "hub.example/device0");
    let device_id = device.registry().read_device_id(0).unwrap();
    assert_eq!(device_id, imported.hmac_key_name.to_hex());
    assert_eq!(device_id.len(), 68);

    // HMAC key is the one the service wrapped
    let mac = device.keys().sign_with_hmac_key(0, b"telemetry").unwrap();
    assert_eq!(mac, crypto::hmac_sha256(&hmac_key, &[b"telemetry".as_slice()]));

    // connection string built from the stored URI
    let connection = device.connection_string(0, None).unwrap();
    assert!(connection.starts_with("HostName=hub.example;DeviceId=device0;"));
    let token = SasToken::from_connection_string(&connection).unwrap();
    let expected = crypto::hmac_sha256(&hmac_key, &[token.string_to_sign().as_bytes()]);
    assert_eq!(token.signature_bytes().unwrap(), expected);

    // identity certificate named after the device id
    let cert = device
        .certificates()
        .read_or_create_identity_key_cert(0, "ECDSA")
        .unwrap();
    assert!(cert.subject.contains(&device_id));

    device.evict_slot(0).unwrap();
    assert!(!device.is_provisioned(0).unwrap());
    assert!(matches!(
        device.service_uri().read(0),
        Err(IdentityError::NotProvisioned { .. })
    ));
}

#[test]
fn test_hostage_blob_is_bound_to_one_module() {
    let target = device(2);
    let other = device(3);
    let ek = target.endorsement_key().get_public().unwrap();
    let srk = target.storage_root_key().get_public().unwrap();
    let secret = ActivationSecret::generate();
    let blob = create_hostage_key(&ek, &srk, "d", "hub.example", &[1; 32], &secret).unwrap();

    assert!(matches!(
        other.hostage().activate_hostage_key(0, &blob),
        Err(IdentityError::ActivationFailed(_))
    ));
    assert!(matches!(
        other.hostage().import_hostage_key(0, &blob),
        Err(IdentityError::ActivationFailed(_))
    ));
    assert!(!other.is_provisioned(0).unwrap());

    assert_eq!(target.hostage().activate_hostage_key(0, &blob).unwrap(), secret);
}

#[test]
fn test_replayed_blob_is_rejected() {
    let device = device(4);
    let ek = device.endorsement_key().get_public().unwrap();
    let srk = device.storage_root_key().get_public().unwrap();
    let blob = create_hostage_key(
        &ek,
        &srk,
        "d",
        "hub.example",
        &[1; 32],
        &ActivationSecret::generate(),
    )
    .unwrap();

    device.hostage().import_hostage_key(1, &blob).unwrap();
    let err = device.hostage().import_hostage_key(1, &blob).unwrap_err();
    assert!(matches!(err, IdentityError::ActivationFailed(_)));
    assert!(!err.is_retryable());
}

#[test]
fn test_tampered_blob_leaves_slot_empty() {
    let device = device(5);
    let ek = device.endorsement_key().get_public().unwrap();
    let srk = device.storage_root_key().get_public().unwrap();
    let blob = create_hostage_key(
        &ek,
        &srk,
        "d",
        "hub.example",
        &[1; 32],
        &ActivationSecret::generate(),
    )
    .unwrap();

    let mut tampered = blob.clone();
    let last = tampered.id_object.len() - 1;
    tampered.id_object[last] ^= 0x01;
    assert!(device.hostage().import_hostage_key(2, &tampered).is_err());

    let mut tampered = blob.clone();
    let last = tampered.data.len() - 1;
    tampered.data[last] ^= 0x01;
    assert!(device.hostage().import_hostage_key(2, &tampered).is_err());

    assert!(!device.is_provisioned(2).unwrap());
}

#[test]
fn test_identity_challenge_roundtrip() {
    let device = device(6);
    let key = device
        .keys()
        .create_or_import_identity_key(3, "ECDSA_P256")
        .unwrap();

    // verifier side knows only the EK public and the identity key name
    let ek = device.endorsement_key().get_public().unwrap();
    let (challenge, expected) = challenge_identity_cert(&ek, &key.key_name, None).unwrap();

    let answered = device
        .hostage()
        .activate_identity_cert(3, "ECDSA", &challenge)
        .unwrap();
    assert_eq!(answered, expected);

    // a challenge for another slot's key does not activate here
    let other = device
        .keys()
        .create_or_import_identity_key(4, "ECDSA")
        .unwrap();
    let (challenge, _) = challenge_identity_cert(&ek, &other.key_name, None).unwrap();
    assert!(matches!(
        device.hostage().activate_identity_cert(3, "ECDSA", &challenge),
        Err(IdentityError::ActivationFailed(_))
    ));
}

#[test]
fn test_identity_certificate_is_idempotent() {
    let device = device(7);
    let first = device
        .certificates()
        .read_or_create_identity_key_cert(5, "ECDSA")
        .unwrap();
    let second = device
        .certificates()
        .read_or_create_identity_key_cert(5, "ECDSA")
        .unwrap();
    assert_eq!(first.thumbprint, second.thumbprint);

    let signed = device
        .certificates()
        .sign_with_identity_cert(&first.thumbprint, b"report")
        .unwrap();
    assert_eq!(signed.subject, first.subject);
}

#[test]
fn test_output_buffer_size_query() {
    let device = device(8);

    let required = match device.endorsement_key_into(&mut []) {
        Err(IdentityError::BufferTooSmall { required }) => required,
        other => panic!("expected BufferTooSmall, got {other:?}"),
    };
    let mut out = vec![0u8; required];
    assert_eq!(device.endorsement_key_into(&mut out).unwrap(), required);
    assert_eq!(out, device.endorsement_key().get_public_bytes().unwrap());

    let required = match device.registration_id_into(&mut []) {
        Err(IdentityError::BufferTooSmall { required }) => required,
        other => panic!("expected BufferTooSmall, got {other:?}"),
    };
    assert_eq!(required, 65);
    let mut out = vec![0u16; required];
    assert_eq!(device.registration_id_into(&mut out).unwrap(), 65);
}

#[test]
fn test_sas_token_into_roundtrip() {
    let device = device(9);
    device.keys().create_hmac_key(6, b"hub-key").unwrap();

    let expiry = tessera_identity::sas::unix_now().unwrap() + 600;
    let mut out = vec![0u16; 1024];
    let len = device
        .sas_token_into(6, "device0", expiry, &mut out)
        .unwrap();
    let token: SasToken = String::from_utf16(&out[..len - 1]).unwrap().parse().unwrap();
    assert_eq!(token.expiry, expiry);
    assert_eq!(
        token.signature_bytes().unwrap(),
        crypto::hmac_sha256(b"hub-key", &[token.string_to_sign().as_bytes()])
    );

    assert!(matches!(
        device.sas_token_into(6, "device0", 1, &mut out),
        Err(IdentityError::InvalidExpiration { .. })
    ));
}
