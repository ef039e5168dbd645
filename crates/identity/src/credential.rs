//! Credential binding primitives.
//!
//! `make_credential` needs only public keys and can run anywhere; the
//! matching recovery needs the endorsement private key and therefore only
//! runs inside a module. The same file holds the inner-wrapper used to
//! transport a keyed-hash sensitive area under a symmetric key.

use crate::crypto::{self, LABEL_IDENTITY, LABEL_INTEGRITY, LABEL_STORAGE, LABEL_URI};
use crate::error::{IdentityError, IdentityResult};
use crate::marshal::{
    EccPoint, IdObject, KeyedHashSensitive, ObjectName, PublicArea, TpmReader, TpmWriter,
};
use crate::transport::TpmError;
use zeroize::Zeroizing;

const ZERO_IV: [u8; crypto::AES_BLOCK_SIZE] = [0; crypto::AES_BLOCK_SIZE];

/// Output of make-credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub id_object: IdObject,
    /// Ephemeral point; marshaled it forms the `TPM2B_ENCRYPTED_SECRET`.
    pub encrypted_secret: EccPoint,
}

impl Credential {
    /// `TPM2B_ENCRYPTED_SECRET` bytes.
    pub fn encrypted_secret_tpm2b(&self) -> IdentityResult<Vec<u8>> {
        let mut writer = TpmWriter::new();
        writer.put_sized(&self.encrypted_secret.marshal()?)?;
        Ok(writer.into_inner())
    }

    pub fn parse_encrypted_secret(bytes: &[u8]) -> IdentityResult<EccPoint> {
        let mut reader = TpmReader::new(bytes);
        let inner = reader.get_sized()?;
        reader.finish()?;
        Ok(EccPoint::unmarshal(inner)?)
    }
}

fn ek_point(ek: &PublicArea) -> IdentityResult<(p256::PublicKey, Vec<u8>)> {
    let key = ek.ecc_public_key().ok_or_else(|| {
        IdentityError::UnsupportedAlgorithm("endorsement key is not ECC P-256".into())
    })?;
    let x = ek.ecc().map(|detail| detail.point.x.clone()).unwrap_or_default();
    Ok((key, x))
}

/// Bind `secret` to the module holding `ek`, for activation of `object_name`.
pub fn make_credential(
    ek: &PublicArea,
    object_name: &ObjectName,
    secret: &[u8],
) -> IdentityResult<Credential> {
    if secret.len() > crate::marshal::SHA256_DIGEST_SIZE {
        return Err(IdentityError::ValueTooLarge {
            what: "credential",
            len: secret.len(),
            max: crate::marshal::SHA256_DIGEST_SIZE,
        });
    }

    let (ek_key, ek_x) = ek_point(ek)?;
    let ephemeral = p256::SecretKey::random(&mut rand::rngs::OsRng);
    let encrypted_secret = EccPoint::from_public_key(&ephemeral.public_key());

    let z = crypto::ecdh_x(&ephemeral, &ek_key);
    let seed = crypto::kdfe(&z, LABEL_IDENTITY, &encrypted_secret.x, &ek_x, 256);

    let id_object = protect_credential(&seed, object_name, secret)?;
    Ok(Credential {
        id_object,
        encrypted_secret,
    })
}

fn protect_credential(
    seed: &[u8],
    object_name: &ObjectName,
    secret: &[u8],
) -> IdentityResult<IdObject> {
    let name = object_name.as_bytes();
    let sym_key = crypto::kdfa(seed, LABEL_STORAGE, name, &[], 128);

    let mut writer = TpmWriter::new();
    writer.put_sized(secret)?;
    let mut enc_identity = writer.into_inner();
    crypto::cfb_encrypt(&sym_key, &ZERO_IV, &mut enc_identity)?;

    let hmac_key = crypto::kdfa(seed, LABEL_INTEGRITY, &[], &[], 256);
    let integrity = crypto::hmac_sha256(&hmac_key, &[&enc_identity, name]);

    Ok(IdObject {
        integrity: integrity.to_vec(),
        enc_identity,
    })
}

/// Module-side recovery of a credential.
///
/// `object_name` is the name of the loaded activation object; a credential
/// made for any other name fails the integrity check.
pub fn recover_credential(
    ek_secret: &p256::SecretKey,
    ek: &PublicArea,
    object_name: &ObjectName,
    id_object: &IdObject,
    encrypted_secret: &EccPoint,
) -> Result<Zeroizing<Vec<u8>>, TpmError> {
    let ephemeral = encrypted_secret
        .to_public_key()
        .ok_or_else(|| TpmError::Rejected("encrypted secret is not a P-256 point".into()))?;
    let ek_x = ek
        .ecc()
        .map(|detail| detail.point.x.clone())
        .ok_or_else(|| TpmError::Rejected("endorsement key is not ECC".into()))?;

    let z = crypto::ecdh_x(ek_secret, &ephemeral);
    let seed = crypto::kdfe(&z, LABEL_IDENTITY, &encrypted_secret.x, &ek_x, 256);
    let name = object_name.as_bytes();

    let hmac_key = crypto::kdfa(&seed, LABEL_INTEGRITY, &[], &[], 256);
    if !crypto::hmac_verify(
        &hmac_key,
        &[&id_object.enc_identity, name],
        &id_object.integrity,
    ) {
        return Err(TpmError::IntegrityCheckFailed(
            "credential integrity".into(),
        ));
    }

    let sym_key = crypto::kdfa(&seed, LABEL_STORAGE, name, &[], 128);
    let mut plain = Zeroizing::new(id_object.enc_identity.clone());
    crypto::cfb_decrypt(&sym_key, &ZERO_IV, &mut plain)
        .map_err(|err| TpmError::Rejected(err.to_string()))?;

    let mut reader = TpmReader::new(&plain);
    let secret = reader
        .get_sized()
        .map_err(|err| TpmError::Rejected(err.to_string()))?;
    Ok(Zeroizing::new(secret.to_vec()))
}

/// Inner-wrap a keyed-hash sensitive area as a `TPM2B_PRIVATE` duplicate.
pub fn wrap_sensitive(
    sensitive: &KeyedHashSensitive,
    name: &ObjectName,
    encryption_key: &[u8],
) -> IdentityResult<Vec<u8>> {
    let marshaled = sensitive.marshal()?;
    let mut sized = TpmWriter::new();
    sized.put_sized(&marshaled)?;
    let sized = Zeroizing::new(sized.into_inner());

    let inner_integrity = crypto::sha256(&[sized.as_slice(), name.as_bytes().as_slice()].concat());
    let mut plain = TpmWriter::new();
    plain.put_sized(&inner_integrity)?;
    plain.put_bytes(&sized);
    let mut wrapped = plain.into_inner();
    crypto::cfb_encrypt(encryption_key, &ZERO_IV, &mut wrapped)?;

    let mut private = TpmWriter::new();
    private.put_sized(&wrapped)?;
    Ok(private.into_inner())
}

/// Reverse of [`wrap_sensitive`], checking the inner integrity against `name`.
pub fn unwrap_sensitive(
    private: &[u8],
    name: &ObjectName,
    encryption_key: &[u8],
) -> Result<KeyedHashSensitive, TpmError> {
    let rejected = |err: &dyn std::fmt::Display| TpmError::Rejected(err.to_string());

    let mut reader = TpmReader::new(private);
    let wrapped = reader.get_sized().map_err(|e| rejected(&e))?;
    reader.finish().map_err(|e| rejected(&e))?;

    let mut plain = Zeroizing::new(wrapped.to_vec());
    crypto::cfb_decrypt(encryption_key, &ZERO_IV, &mut plain).map_err(|e| rejected(&e))?;

    let mut reader = TpmReader::new(&plain);
    let integrity = reader.get_sized().map_err(|e| rejected(&e))?;
    let sized = reader.remaining();
    let expected = crypto::sha256(&[sized, name.as_bytes().as_slice()].concat());
    if integrity != expected.as_slice() {
        return Err(TpmError::IntegrityCheckFailed("duplicate inner integrity".into()));
    }

    let mut reader = TpmReader::new(sized);
    let marshaled = reader.get_sized().map_err(|e| rejected(&e))?;
    reader.finish().map_err(|e| rejected(&e))?;
    KeyedHashSensitive::unmarshal(marshaled).map_err(|e| rejected(&e))
}

/// Check that `private` unwraps under `encryption_key` to the sensitive area
/// of the keyed-hash object `public`, without involving the module.
pub fn verify_duplicate(
    public: &PublicArea,
    private: &[u8],
    encryption_key: &[u8],
) -> IdentityResult<()> {
    let detail = public.keyed_hash().ok_or_else(|| {
        IdentityError::ParseFailure("duplicate is not a keyed-hash object".into())
    })?;
    let sensitive = unwrap_sensitive(private, &public.name()?, encryption_key)?;
    if sensitive.unique() != detail.unique {
        return Err(IdentityError::CryptoVerificationFailed(
            "sensitive area does not match public unique".into(),
        ));
    }
    Ok(())
}

/// Encrypt small data under `secret`, bound to `key_name`: `TPM2B(tag) || ciphertext`.
pub fn seal_data(secret: &[u8], key_name: &ObjectName, data: &[u8]) -> IdentityResult<Vec<u8>> {
    let name = key_name.as_bytes();
    let sym_key = crypto::kdfa(secret, LABEL_URI, name, &[], 128);
    let mut ciphertext = data.to_vec();
    crypto::cfb_encrypt(&sym_key, &ZERO_IV, &mut ciphertext)?;

    let mac_key = crypto::kdfa(secret, LABEL_INTEGRITY, name, &[], 256);
    let tag = crypto::hmac_sha256(&mac_key, &[&ciphertext]);

    let mut writer = TpmWriter::new();
    writer.put_sized(&tag)?;
    writer.put_bytes(&ciphertext);
    Ok(writer.into_inner())
}

/// Reverse of [`seal_data`].
pub fn open_data(secret: &[u8], key_name: &ObjectName, sealed: &[u8]) -> IdentityResult<Vec<u8>> {
    let name = key_name.as_bytes();
    let mut reader = TpmReader::new(sealed);
    let tag = reader.get_sized()?;
    let ciphertext = reader.remaining();

    let mac_key = crypto::kdfa(secret, LABEL_INTEGRITY, name, &[], 256);
    if !crypto::hmac_verify(&mac_key, &[ciphertext], tag) {
        return Err(IdentityError::CryptoVerificationFailed(
            "sealed data integrity".into(),
        ));
    }

    let sym_key = crypto::kdfa(secret, LABEL_URI, name, &[], 128);
    let mut plain = ciphertext.to_vec();
    crypto::cfb_decrypt(&sym_key, &ZERO_IV, &mut plain)?;
    Ok(plain)
}

/// Name of a keyed-hash object built from `sensitive`, as the module computes it.
pub fn keyed_hash_name(sensitive: &KeyedHashSensitive) -> IdentityResult<(PublicArea, ObjectName)> {
    let public = PublicArea::hmac_key(sensitive.unique());
    let name = public.name()?;
    Ok((public, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ek_pair() -> (p256::SecretKey, PublicArea) {
        let secret = p256::SecretKey::random(&mut rand::rngs::OsRng);
        let public = PublicArea::ek_template()
            .with_point(EccPoint::from_public_key(&secret.public_key()));
        (secret, public)
    }

    #[test]
    fn test_credential_roundtrip() {
        let (ek_secret, ek) = ek_pair();
        let name = PublicArea::srk_template().name().unwrap();
        let credential = make_credential(&ek, &name, &[0x42; 16]).unwrap();

        let recovered = recover_credential(
            &ek_secret,
            &ek,
            &name,
            &credential.id_object,
            &credential.encrypted_secret,
        )
        .unwrap();
        assert_eq!(recovered.as_slice(), &[0x42; 16]);
    }

    #[test]
    fn test_credential_rejects_other_module() {
        let (_, ek) = ek_pair();
        let (other_secret, other_ek) = ek_pair();
        let name = PublicArea::srk_template().name().unwrap();
        let credential = make_credential(&ek, &name, &[1; 16]).unwrap();

        let result = recover_credential(
            &other_secret,
            &other_ek,
            &name,
            &credential.id_object,
            &credential.encrypted_secret,
        );
        assert!(matches!(result, Err(TpmError::IntegrityCheckFailed(_))));
    }

    #[test]
    fn test_credential_rejects_other_object() {
        let (ek_secret, ek) = ek_pair();
        let name = PublicArea::srk_template().name().unwrap();
        let other = PublicArea::hmac_key(vec![0; 32]).name().unwrap();
        let credential = make_credential(&ek, &name, &[1; 16]).unwrap();

        let result = recover_credential(
            &ek_secret,
            &ek,
            &other,
            &credential.id_object,
            &credential.encrypted_secret,
        );
        assert!(matches!(result, Err(TpmError::IntegrityCheckFailed(_))));
    }

    #[test]
    fn test_encrypted_secret_framing() {
        let (_, ek) = ek_pair();
        let name = PublicArea::srk_template().name().unwrap();
        let credential = make_credential(&ek, &name, &[1; 16]).unwrap();
        let bytes = credential.encrypted_secret_tpm2b().unwrap();
        assert_eq!(
            Credential::parse_encrypted_secret(&bytes).unwrap(),
            credential.encrypted_secret
        );
    }

    #[test]
    fn test_sensitive_wrap_roundtrip() {
        let sensitive = KeyedHashSensitive {
            auth_value: Vec::new(),
            seed_value: vec![9; 32],
            key: vec![7; 32],
        };
        let (_, name) = keyed_hash_name(&sensitive).unwrap();
        let private = wrap_sensitive(&sensitive, &name, &[3; 16]).unwrap();

        let recovered = unwrap_sensitive(&private, &name, &[3; 16]).unwrap();
        assert_eq!(recovered.key, sensitive.key);

        let wrong_key = unwrap_sensitive(&private, &name, &[4; 16]);
        assert!(wrong_key.is_err());
    }

    #[test]
    fn test_sealed_data_detects_tamper() {
        let name = PublicArea::hmac_key(vec![0; 32]).name().unwrap();
        let mut sealed = seal_data(&[8; 16], &name, b"hub.example/dev").unwrap();
        assert_eq!(open_data(&[8; 16], &name, &sealed).unwrap(), b"hub.example/dev");

        let last = sealed.len() - 1;
        sealed[last] ^= 1;
        assert!(matches!(
            open_data(&[8; 16], &name, &sealed),
            Err(IdentityError::CryptoVerificationFailed(_))
        ));
    }

    #[test]
    fn test_verify_duplicate_detects_tamper() {
        let sensitive = KeyedHashSensitive {
            auth_value: Vec::new(),
            seed_value: vec![3; 32],
            key: vec![4; 32],
        };
        let (public, name) = keyed_hash_name(&sensitive).unwrap();
        let private = wrap_sensitive(&sensitive, &name, &[5; 16]).unwrap();
        verify_duplicate(&public, &private, &[5; 16]).unwrap();

        let mut tampered = private.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        assert!(verify_duplicate(&public, &tampered, &[5; 16]).is_err());
        assert!(verify_duplicate(&public, &private, &[6; 16]).is_err());
    }
}
