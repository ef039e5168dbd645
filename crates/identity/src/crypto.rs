//! Key derivation and symmetric primitives shared by the credential protocol.
//!
//! KDFa and KDFe follow TPM 2.0 Part 1 §11.4.10: labels are NUL terminated
//! and the requested output size is in bits.

use crate::error::{IdentityError, IdentityResult};
use aes::Aes128;
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;
type Aes128CfbEnc = cfb_mode::Encryptor<Aes128>;
type Aes128CfbDec = cfb_mode::Decryptor<Aes128>;

pub const LABEL_IDENTITY: &str = "IDENTITY";
pub const LABEL_STORAGE: &str = "STORAGE";
pub const LABEL_INTEGRITY: &str = "INTEGRITY";
pub const LABEL_URI: &str = "URI";
pub const LABEL_PAYLOAD_ENC: &str = "PAYLOAD-ENC";
pub const LABEL_PAYLOAD_MAC: &str = "PAYLOAD-MAC";

pub const AES_BLOCK_SIZE: usize = 16;

fn label_bytes(label: &str) -> Vec<u8> {
    let mut bytes = label.as_bytes().to_vec();
    bytes.push(0);
    bytes
}

fn new_mac(key: &[u8]) -> HmacSha256 {
    // HMAC accepts keys of any length
    match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC-SHA256 accepts arbitrary key lengths"),
    }
}

/// SP800-108 counter-mode KDF with HMAC-SHA256.
pub fn kdfa(
    key: &[u8],
    label: &str,
    context_u: &[u8],
    context_v: &[u8],
    bits: u32,
) -> Zeroizing<Vec<u8>> {
    let bytes = (bits as usize).div_ceil(8);
    let label = label_bytes(label);
    let mut out = Zeroizing::new(Vec::with_capacity(bytes + 32));
    let mut counter: u32 = 0;
    while out.len() < bytes {
        counter += 1;
        let mut mac = new_mac(key);
        mac.update(&counter.to_be_bytes());
        mac.update(&label);
        mac.update(context_u);
        mac.update(context_v);
        mac.update(&bits.to_be_bytes());
        out.extend_from_slice(&mac.finalize().into_bytes());
    }
    out.truncate(bytes);
    out
}

/// SP800-56A concatenation KDF with SHA-256.
pub fn kdfe(
    z: &[u8],
    label: &str,
    party_u: &[u8],
    party_v: &[u8],
    bits: u32,
) -> Zeroizing<Vec<u8>> {
    let bytes = (bits as usize).div_ceil(8);
    let label = label_bytes(label);
    let mut out = Zeroizing::new(Vec::with_capacity(bytes + 32));
    let mut counter: u32 = 0;
    while out.len() < bytes {
        counter += 1;
        let mut hasher = Sha256::new();
        hasher.update(counter.to_be_bytes());
        hasher.update(z);
        hasher.update(&label);
        hasher.update(party_u);
        hasher.update(party_v);
        out.extend_from_slice(&hasher.finalize());
    }
    out.truncate(bytes);
    out
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut mac = new_mac(key);
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// Constant-time tag comparison.
pub fn hmac_verify(key: &[u8], parts: &[&[u8]], tag: &[u8]) -> bool {
    let mut mac = new_mac(key);
    for part in parts {
        mac.update(part);
    }
    mac.verify_slice(tag).is_ok()
}

/// AES-128-CFB encryption in place.
pub fn cfb_encrypt(key: &[u8], iv: &[u8; AES_BLOCK_SIZE], buf: &mut [u8]) -> IdentityResult<()> {
    let cipher = Aes128CfbEnc::new_from_slices(key, iv)
        .map_err(|_| IdentityError::CryptoVerificationFailed("invalid AES-128 key".into()))?;
    cipher.encrypt(buf);
    Ok(())
}

/// AES-128-CFB decryption in place.
pub fn cfb_decrypt(key: &[u8], iv: &[u8; AES_BLOCK_SIZE], buf: &mut [u8]) -> IdentityResult<()> {
    let cipher = Aes128CfbDec::new_from_slices(key, iv)
        .map_err(|_| IdentityError::CryptoVerificationFailed("invalid AES-128 key".into()))?;
    cipher.decrypt(buf);
    Ok(())
}

/// x-coordinate of the ECDH shared point.
pub fn ecdh_x(secret: &p256::SecretKey, peer: &p256::PublicKey) -> Zeroizing<Vec<u8>> {
    let shared = p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());
    Zeroizing::new(shared.raw_secret_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kdfa_output_length() {
        assert_eq!(kdfa(b"key", LABEL_STORAGE, b"u", b"", 128).len(), 16);
        assert_eq!(kdfa(b"key", LABEL_INTEGRITY, b"", b"", 256).len(), 32);
        assert_eq!(kdfa(b"key", LABEL_INTEGRITY, b"", b"", 384).len(), 48);
    }

    #[test]
    fn test_kdfa_first_block_matches_definition() {
        let out = kdfa(b"seed", LABEL_STORAGE, b"name", b"", 256);
        let expected = hmac_sha256(
            b"seed",
            &[
                &1u32.to_be_bytes(),
                b"STORAGE\0",
                b"name",
                &256u32.to_be_bytes(),
            ],
        );
        assert_eq!(out.as_slice(), &expected);
    }

    #[test]
    fn test_kdfa_prefix_depends_on_size() {
        // the bit count is part of every block, so 128 is not a prefix of 256
        let short = kdfa(b"seed", LABEL_STORAGE, b"", b"", 128);
        let long = kdfa(b"seed", LABEL_STORAGE, b"", b"", 256);
        assert_ne!(short.as_slice(), &long[..16]);
    }

    #[test]
    fn test_kdfe_first_block_matches_definition() {
        let out = kdfe(b"z", LABEL_IDENTITY, b"u", b"v", 256);
        let mut hasher = Sha256::new();
        hasher.update(1u32.to_be_bytes());
        hasher.update(b"z");
        hasher.update(b"IDENTITY\0");
        hasher.update(b"u");
        hasher.update(b"v");
        assert_eq!(out.as_slice(), hasher.finalize().as_slice());
    }

    #[test]
    fn test_hmac_verify() {
        let tag = hmac_sha256(b"k", &[b"a", b"b"]);
        assert_eq!(tag, hmac_sha256(b"k", &[b"ab"]));
        assert!(hmac_verify(b"k", &[b"ab"], &tag));
        assert!(!hmac_verify(b"k", &[b"ac"], &tag));
        assert!(!hmac_verify(b"k", &[b"ab"], &tag[..31]));
    }

    #[test]
    fn test_cfb_roundtrip_odd_length() {
        let key = [5u8; 16];
        let iv = [0u8; 16];
        let mut buf = b"twenty-one bytes long".to_vec();
        cfb_encrypt(&key, &iv, &mut buf).unwrap();
        assert_ne!(buf, b"twenty-one bytes long");
        cfb_decrypt(&key, &iv, &mut buf).unwrap();
        assert_eq!(buf, b"twenty-one bytes long");
    }

    #[test]
    fn test_cfb_rejects_wrong_key_size() {
        let mut buf = vec![0u8; 4];
        assert!(cfb_encrypt(&[0u8; 15], &[0u8; 16], &mut buf).is_err());
    }

    #[test]
    fn test_ecdh_agreement() {
        let a = p256::SecretKey::random(&mut rand::rngs::OsRng);
        let b = p256::SecretKey::random(&mut rand::rngs::OsRng);
        let ab = ecdh_x(&a, &b.public_key());
        let ba = ecdh_x(&b, &a.public_key());
        assert_eq!(ab.as_slice(), ba.as_slice());
        assert_eq!(ab.len(), 32);
    }
}
