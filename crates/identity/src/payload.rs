//! Symmetric payload protection under an activation secret.
//!
//! Layout: `IV (16) || AES-128-CFB ciphertext || HMAC-SHA256 tag (32)`.
//! Encryption and MAC keys are derived from the 16-byte key with KDFa;
//! the tag covers IV and ciphertext.

use crate::crypto::{self, AES_BLOCK_SIZE, LABEL_PAYLOAD_ENC, LABEL_PAYLOAD_MAC};
use crate::error::{IdentityError, IdentityResult};
use crate::layout::{SHA256_DIGEST_SIZE, SYMMETRIC_KEY_SIZE};
use rand::RngCore;
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::debug;
use zeroize::Zeroizing;

const OVERHEAD: usize = AES_BLOCK_SIZE + SHA256_DIGEST_SIZE;

struct PayloadKeys {
    enc: Zeroizing<Vec<u8>>,
    mac: Zeroizing<Vec<u8>>,
}

impl PayloadKeys {
    fn derive(key: &[u8; SYMMETRIC_KEY_SIZE]) -> Self {
        Self {
            enc: crypto::kdfa(key, LABEL_PAYLOAD_ENC, &[], &[], 128),
            mac: crypto::kdfa(key, LABEL_PAYLOAD_MAC, &[], &[], 256),
        }
    }
}

/// Encrypt and authenticate `plaintext`.
pub fn protect(key: &[u8; SYMMETRIC_KEY_SIZE], plaintext: &[u8]) -> IdentityResult<Vec<u8>> {
    let keys = PayloadKeys::derive(key);
    let mut iv = [0u8; AES_BLOCK_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut iv);

    let mut ciphertext = plaintext.to_vec();
    crypto::cfb_encrypt(&keys.enc, &iv, &mut ciphertext)?;
    let tag = crypto::hmac_sha256(&keys.mac, &[iv.as_slice(), ciphertext.as_slice()]);

    let mut out = Vec::with_capacity(plaintext.len() + OVERHEAD);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    out.extend_from_slice(&tag);
    Ok(out)
}

/// Verify and decrypt a [`protect`]ed payload.
pub fn unprotect(
    key: &[u8; SYMMETRIC_KEY_SIZE],
    protected: &[u8],
) -> IdentityResult<Zeroizing<Vec<u8>>> {
    if protected.len() < OVERHEAD {
        return Err(IdentityError::ParseFailure(format!(
            "protected payload of {} bytes is shorter than {OVERHEAD}",
            protected.len()
        )));
    }
    let (iv, rest) = protected.split_at(AES_BLOCK_SIZE);
    let (ciphertext, tag) = rest.split_at(rest.len() - SHA256_DIGEST_SIZE);

    let keys = PayloadKeys::derive(key);
    if !crypto::hmac_verify(&keys.mac, &[iv, ciphertext], tag) {
        return Err(IdentityError::CryptoVerificationFailed(
            "payload integrity".into(),
        ));
    }

    let mut iv_block = [0u8; AES_BLOCK_SIZE];
    iv_block.copy_from_slice(iv);
    let mut plaintext = Zeroizing::new(ciphertext.to_vec());
    crypto::cfb_decrypt(&keys.enc, &iv_block, &mut plaintext)?;
    Ok(plaintext)
}

fn replace_file(path: &Path, contents: &[u8]) -> IdentityResult<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut staging = NamedTempFile::new_in(parent)?;
    staging.write_all(contents)?;
    staging.as_file().sync_all()?;
    staging.persist(path).map_err(|err| err.error)?;
    Ok(())
}

/// Protect the file at `path` in place.
pub fn protect_file(key: &[u8; SYMMETRIC_KEY_SIZE], path: impl AsRef<Path>) -> IdentityResult<()> {
    let path = path.as_ref();
    let plaintext = Zeroizing::new(fs::read(path)?);
    replace_file(path, &protect(key, &plaintext)?)?;
    debug!(path = %path.display(), "file protected");
    Ok(())
}

/// Reverse [`protect_file`]. A file failing verification is left untouched.
pub fn unprotect_file(
    key: &[u8; SYMMETRIC_KEY_SIZE],
    path: impl AsRef<Path>,
) -> IdentityResult<()> {
    let path = path.as_ref();
    let protected = fs::read(path)?;
    let plaintext = unprotect(key, &protected)?;
    replace_file(path, &plaintext)?;
    debug!(path = %path.display(), "file unprotected");
    Ok(())
}
