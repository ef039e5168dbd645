//! TPM 2.0 wire structures.
//!
//! Big-endian marshaling for the subset of TPM structures the identity
//! protocol exchanges with the module and with remote provisioning services.
//! Object names are always derived from the marshaled public area, so a
//! name can never drift from the key it identifies.

use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

pub const TPM_ALG_HMAC: u16 = 0x0005;
pub const TPM_ALG_AES: u16 = 0x0006;
pub const TPM_ALG_KEYEDHASH: u16 = 0x0008;
pub const TPM_ALG_SHA256: u16 = 0x000B;
pub const TPM_ALG_NULL: u16 = 0x0010;
pub const TPM_ALG_ECDSA: u16 = 0x0018;
pub const TPM_ALG_ECC: u16 = 0x0023;
pub const TPM_ALG_CFB: u16 = 0x0043;
pub const TPM_ECC_NIST_P256: u16 = 0x0003;

/// SHA-256 digest size.
pub const SHA256_DIGEST_SIZE: usize = 32;
/// Name size: 2-byte algorithm tag followed by a SHA-256 digest.
pub const OBJECT_NAME_SIZE: usize = 2 + SHA256_DIGEST_SIZE;
/// Largest sensitive value a keyed-hash object may carry.
pub const MAX_SYM_DATA: usize = 64;

/// PolicySecret(TPM_RH_ENDORSEMENT), the standard EK authorization policy.
pub const EK_AUTH_POLICY: [u8; 32] = [
    0x83, 0x71, 0x97, 0x67, 0x44, 0x84, 0xb3, 0xf8, 0x1a, 0x90, 0xcc, 0x8d, 0x46, 0xa5, 0xd7,
    0x24, 0xfd, 0x52, 0xd7, 0x6e, 0x06, 0x52, 0x0b, 0x64, 0xf2, 0xa1, 0xda, 0x1b, 0x33, 0x14,
    0x69, 0xaa,
];

/// Errors raised while reading or writing wire structures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MarshalError {
    #[error("unexpected end of data at offset {0}")]
    Underflow(usize),

    #[error("{0} trailing bytes")]
    TrailingData(usize),

    #[error("unsupported value {value:#06x} for {field}")]
    Unsupported { field: &'static str, value: u32 },

    #[error("{0} does not fit a sized buffer")]
    TooLarge(&'static str),
}

/// Append-only writer for TPM structures.
#[derive(Debug, Default)]
pub struct TpmWriter {
    buf: Vec<u8>,
}

impl TpmWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Write a `TPM2B_*`: 16-bit size followed by the bytes.
    pub fn put_sized(&mut self, bytes: &[u8]) -> Result<(), MarshalError> {
        let size = u16::try_from(bytes.len()).map_err(|_| MarshalError::TooLarge("TPM2B"))?;
        self.put_u16(size);
        self.put_bytes(bytes);
        Ok(())
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a marshaled TPM structure.
#[derive(Debug)]
pub struct TpmReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> TpmReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], MarshalError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(MarshalError::Underflow(self.pos))?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    pub fn get_u16(&mut self) -> Result<u16, MarshalError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32, MarshalError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn get_sized(&mut self) -> Result<&'a [u8], MarshalError> {
        let size = self.get_u16()? as usize;
        self.take(size)
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    /// Fail unless every byte has been consumed.
    pub fn finish(self) -> Result<(), MarshalError> {
        match self.data.len() - self.pos {
            0 => Ok(()),
            n => Err(MarshalError::TrailingData(n)),
        }
    }
}

fn sized(bytes: &[u8]) -> Result<Vec<u8>, MarshalError> {
    let mut writer = TpmWriter::new();
    writer.put_sized(bytes)?;
    Ok(writer.into_inner())
}

fn tpm2b_inner(bytes: &[u8]) -> Result<&[u8], MarshalError> {
    let mut reader = TpmReader::new(bytes);
    let inner = reader.get_sized()?;
    reader.finish()?;
    Ok(inner)
}

/// `TPMA_OBJECT` bit field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectAttributes(pub u32);

impl ObjectAttributes {
    pub const FIXED_TPM: u32 = 1 << 1;
    pub const ST_CLEAR: u32 = 1 << 2;
    pub const FIXED_PARENT: u32 = 1 << 4;
    pub const SENSITIVE_DATA_ORIGIN: u32 = 1 << 5;
    pub const USER_WITH_AUTH: u32 = 1 << 6;
    pub const ADMIN_WITH_POLICY: u32 = 1 << 7;
    pub const NO_DA: u32 = 1 << 10;
    pub const ENCRYPTED_DUPLICATION: u32 = 1 << 11;
    pub const RESTRICTED: u32 = 1 << 16;
    pub const DECRYPT: u32 = 1 << 17;
    pub const SIGN_ENCRYPT: u32 = 1 << 18;

    pub fn contains(self, bits: u32) -> bool {
        self.0 & bits == bits
    }
}

/// `TPMT_SYM_DEF_OBJECT` for a non-null algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymmetricObject {
    pub algorithm: u16,
    pub key_bits: u16,
    pub mode: u16,
}

impl SymmetricObject {
    pub const AES_128_CFB: Self = Self {
        algorithm: TPM_ALG_AES,
        key_bits: 128,
        mode: TPM_ALG_CFB,
    };
}

/// Scheme selector with its hash algorithm (`TPMT_ECC_SCHEME`, `TPMT_KDF_SCHEME`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashScheme {
    pub scheme: u16,
    pub hash: u16,
}

/// `TPMS_ECC_POINT`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EccPoint {
    pub x: Vec<u8>,
    pub y: Vec<u8>,
}

impl EccPoint {
    fn write(&self, writer: &mut TpmWriter) -> Result<(), MarshalError> {
        writer.put_sized(&self.x)?;
        writer.put_sized(&self.y)
    }

    fn read(reader: &mut TpmReader<'_>) -> Result<Self, MarshalError> {
        let x = reader.get_sized()?.to_vec();
        let y = reader.get_sized()?.to_vec();
        Ok(Self { x, y })
    }

    pub fn marshal(&self) -> Result<Vec<u8>, MarshalError> {
        let mut writer = TpmWriter::new();
        self.write(&mut writer)?;
        Ok(writer.into_inner())
    }

    pub fn unmarshal(bytes: &[u8]) -> Result<Self, MarshalError> {
        let mut reader = TpmReader::new(bytes);
        let point = Self::read(&mut reader)?;
        reader.finish()?;
        Ok(point)
    }

    /// Build from a P-256 public key.
    pub fn from_public_key(key: &p256::PublicKey) -> Self {
        use p256::elliptic_curve::sec1::ToEncodedPoint;
        let encoded = key.to_encoded_point(false);
        Self {
            x: encoded.x().map(|x| x.to_vec()).unwrap_or_default(),
            y: encoded.y().map(|y| y.to_vec()).unwrap_or_default(),
        }
    }

    /// Interpret the coordinates as a P-256 point.
    pub fn to_public_key(&self) -> Option<p256::PublicKey> {
        if self.x.len() != 32 || self.y.len() != 32 {
            return None;
        }
        let mut sec1 = Vec::with_capacity(65);
        sec1.push(0x04);
        sec1.extend_from_slice(&self.x);
        sec1.extend_from_slice(&self.y);
        p256::PublicKey::from_sec1_bytes(&sec1).ok()
    }

    /// Uncompressed SEC1 encoding, as carried in an X.509 SubjectPublicKeyInfo.
    pub fn to_sec1_uncompressed(&self) -> Vec<u8> {
        let mut sec1 = Vec::with_capacity(1 + self.x.len() + self.y.len());
        sec1.push(0x04);
        sec1.extend_from_slice(&self.x);
        sec1.extend_from_slice(&self.y);
        sec1
    }
}

/// ECC-specific part of a public area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EccDetail {
    pub symmetric: Option<SymmetricObject>,
    pub scheme: Option<HashScheme>,
    pub curve: u16,
    pub kdf: Option<HashScheme>,
    pub point: EccPoint,
}

/// Keyed-hash-specific part of a public area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyedHashDetail {
    /// Hash algorithm of the HMAC scheme, `None` for a sealed data object.
    pub hmac_hash: Option<u16>,
    /// `H(seedValue || sensitive)`.
    pub unique: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicDetail {
    Ecc(EccDetail),
    KeyedHash(KeyedHashDetail),
}

/// `TPMT_PUBLIC` for ECC and keyed-hash objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicArea {
    pub name_alg: u16,
    pub attributes: ObjectAttributes,
    pub auth_policy: Vec<u8>,
    pub detail: PublicDetail,
}

impl PublicArea {
    /// Standard ECC P-256 endorsement key template.
    pub fn ek_template() -> Self {
        Self {
            name_alg: TPM_ALG_SHA256,
            attributes: ObjectAttributes(
                ObjectAttributes::FIXED_TPM
                    | ObjectAttributes::FIXED_PARENT
                    | ObjectAttributes::SENSITIVE_DATA_ORIGIN
                    | ObjectAttributes::ADMIN_WITH_POLICY
                    | ObjectAttributes::RESTRICTED
                    | ObjectAttributes::DECRYPT,
            ),
            auth_policy: EK_AUTH_POLICY.to_vec(),
            detail: PublicDetail::Ecc(EccDetail {
                symmetric: Some(SymmetricObject::AES_128_CFB),
                scheme: None,
                curve: TPM_ECC_NIST_P256,
                kdf: None,
                point: EccPoint {
                    x: vec![0; 32],
                    y: vec![0; 32],
                },
            }),
        }
    }

    /// ECC P-256 storage root key template.
    pub fn srk_template() -> Self {
        Self {
            name_alg: TPM_ALG_SHA256,
            attributes: ObjectAttributes(
                ObjectAttributes::FIXED_TPM
                    | ObjectAttributes::FIXED_PARENT
                    | ObjectAttributes::SENSITIVE_DATA_ORIGIN
                    | ObjectAttributes::USER_WITH_AUTH
                    | ObjectAttributes::NO_DA
                    | ObjectAttributes::RESTRICTED
                    | ObjectAttributes::DECRYPT,
            ),
            auth_policy: Vec::new(),
            detail: PublicDetail::Ecc(EccDetail {
                symmetric: Some(SymmetricObject::AES_128_CFB),
                scheme: None,
                curve: TPM_ECC_NIST_P256,
                kdf: None,
                point: EccPoint::default(),
            }),
        }
    }

    /// Unrestricted ECDSA P-256 signing key created inside the module.
    pub fn signing_key_template() -> Self {
        Self {
            name_alg: TPM_ALG_SHA256,
            attributes: ObjectAttributes(
                ObjectAttributes::FIXED_TPM
                    | ObjectAttributes::FIXED_PARENT
                    | ObjectAttributes::SENSITIVE_DATA_ORIGIN
                    | ObjectAttributes::USER_WITH_AUTH
                    | ObjectAttributes::SIGN_ENCRYPT,
            ),
            auth_policy: Vec::new(),
            detail: PublicDetail::Ecc(EccDetail {
                symmetric: None,
                scheme: Some(HashScheme {
                    scheme: TPM_ALG_ECDSA,
                    hash: TPM_ALG_SHA256,
                }),
                curve: TPM_ECC_NIST_P256,
                kdf: None,
                point: EccPoint::default(),
            }),
        }
    }

    /// HMAC-SHA256 key whose sensitive value originates outside the module.
    pub fn hmac_key(unique: Vec<u8>) -> Self {
        Self {
            name_alg: TPM_ALG_SHA256,
            attributes: ObjectAttributes(
                ObjectAttributes::USER_WITH_AUTH
                    | ObjectAttributes::NO_DA
                    | ObjectAttributes::SIGN_ENCRYPT,
            ),
            auth_policy: Vec::new(),
            detail: PublicDetail::KeyedHash(KeyedHashDetail {
                hmac_hash: Some(TPM_ALG_SHA256),
                unique,
            }),
        }
    }

    /// Copy of this template carrying the given ECC point.
    pub fn with_point(&self, point: EccPoint) -> Self {
        let mut public = self.clone();
        if let PublicDetail::Ecc(detail) = &mut public.detail {
            detail.point = point;
        }
        public
    }

    pub fn ecc(&self) -> Option<&EccDetail> {
        match &self.detail {
            PublicDetail::Ecc(detail) => Some(detail),
            PublicDetail::KeyedHash(_) => None,
        }
    }

    pub fn keyed_hash(&self) -> Option<&KeyedHashDetail> {
        match &self.detail {
            PublicDetail::KeyedHash(detail) => Some(detail),
            PublicDetail::Ecc(_) => None,
        }
    }

    /// P-256 public key of an ECC object.
    pub fn ecc_public_key(&self) -> Option<p256::PublicKey> {
        self.ecc()
            .filter(|detail| detail.curve == TPM_ECC_NIST_P256)
            .and_then(|detail| detail.point.to_public_key())
    }

    /// Marshal as `TPMT_PUBLIC`.
    pub fn marshal(&self) -> Result<Vec<u8>, MarshalError> {
        let mut writer = TpmWriter::new();
        match &self.detail {
            PublicDetail::Ecc(_) => writer.put_u16(TPM_ALG_ECC),
            PublicDetail::KeyedHash(_) => writer.put_u16(TPM_ALG_KEYEDHASH),
        }
        writer.put_u16(self.name_alg);
        writer.put_u32(self.attributes.0);
        writer.put_sized(&self.auth_policy)?;

        match &self.detail {
            PublicDetail::Ecc(detail) => {
                match detail.symmetric {
                    Some(sym) => {
                        writer.put_u16(sym.algorithm);
                        writer.put_u16(sym.key_bits);
                        writer.put_u16(sym.mode);
                    }
                    None => writer.put_u16(TPM_ALG_NULL),
                }
                write_hash_scheme(&mut writer, detail.scheme);
                writer.put_u16(detail.curve);
                write_hash_scheme(&mut writer, detail.kdf);
                detail.point.write(&mut writer)?;
            }
            PublicDetail::KeyedHash(detail) => {
                match detail.hmac_hash {
                    Some(hash) => {
                        writer.put_u16(TPM_ALG_HMAC);
                        writer.put_u16(hash);
                    }
                    None => writer.put_u16(TPM_ALG_NULL),
                }
                writer.put_sized(&detail.unique)?;
            }
        }
        Ok(writer.into_inner())
    }

    /// Parse a `TPMT_PUBLIC`.
    pub fn unmarshal(bytes: &[u8]) -> Result<Self, MarshalError> {
        let mut reader = TpmReader::new(bytes);
        let public = Self::read(&mut reader)?;
        reader.finish()?;
        Ok(public)
    }

    fn read(reader: &mut TpmReader<'_>) -> Result<Self, MarshalError> {
        let object_type = reader.get_u16()?;
        let name_alg = reader.get_u16()?;
        if name_alg != TPM_ALG_SHA256 {
            return Err(MarshalError::Unsupported {
                field: "nameAlg",
                value: name_alg as u32,
            });
        }
        let attributes = ObjectAttributes(reader.get_u32()?);
        let auth_policy = reader.get_sized()?.to_vec();

        let detail = match object_type {
            TPM_ALG_ECC => {
                let algorithm = reader.get_u16()?;
                let symmetric = if algorithm == TPM_ALG_NULL {
                    None
                } else {
                    Some(SymmetricObject {
                        algorithm,
                        key_bits: reader.get_u16()?,
                        mode: reader.get_u16()?,
                    })
                };
                let scheme = read_hash_scheme(reader, "eccScheme")?;
                let curve = reader.get_u16()?;
                let kdf = read_hash_scheme(reader, "kdfScheme")?;
                let point = EccPoint::read(reader)?;
                PublicDetail::Ecc(EccDetail {
                    symmetric,
                    scheme,
                    curve,
                    kdf,
                    point,
                })
            }
            TPM_ALG_KEYEDHASH => {
                let scheme = reader.get_u16()?;
                let hmac_hash = match scheme {
                    TPM_ALG_NULL => None,
                    TPM_ALG_HMAC => Some(reader.get_u16()?),
                    other => {
                        return Err(MarshalError::Unsupported {
                            field: "keyedHashScheme",
                            value: other as u32,
                        })
                    }
                };
                let unique = reader.get_sized()?.to_vec();
                PublicDetail::KeyedHash(KeyedHashDetail { hmac_hash, unique })
            }
            other => {
                return Err(MarshalError::Unsupported {
                    field: "type",
                    value: other as u32,
                })
            }
        };

        Ok(Self {
            name_alg,
            attributes,
            auth_policy,
            detail,
        })
    }

    /// Marshal as `TPM2B_PUBLIC`.
    pub fn to_tpm2b(&self) -> Result<Vec<u8>, MarshalError> {
        sized(&self.marshal()?)
    }

    /// Parse a `TPM2B_PUBLIC`.
    pub fn from_tpm2b(bytes: &[u8]) -> Result<Self, MarshalError> {
        Self::unmarshal(tpm2b_inner(bytes)?)
    }

    /// Algorithm-tagged digest of the marshaled public area.
    pub fn name(&self) -> Result<ObjectName, MarshalError> {
        Ok(ObjectName::from_marshaled(&self.marshal()?))
    }
}

fn write_hash_scheme(writer: &mut TpmWriter, scheme: Option<HashScheme>) {
    match scheme {
        Some(scheme) => {
            writer.put_u16(scheme.scheme);
            writer.put_u16(scheme.hash);
        }
        None => writer.put_u16(TPM_ALG_NULL),
    }
}

fn read_hash_scheme(
    reader: &mut TpmReader<'_>,
    field: &'static str,
) -> Result<Option<HashScheme>, MarshalError> {
    let scheme = reader.get_u16()?;
    if scheme == TPM_ALG_NULL {
        return Ok(None);
    }
    if scheme == 0x001A {
        // ECDAA carries a commit counter this codec does not model.
        return Err(MarshalError::Unsupported {
            field,
            value: scheme as u32,
        });
    }
    Ok(Some(HashScheme {
        scheme,
        hash: reader.get_u16()?,
    }))
}

/// `TPMT_SENSITIVE` of a keyed-hash object.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyedHashSensitive {
    pub auth_value: Vec<u8>,
    pub seed_value: Vec<u8>,
    pub key: Vec<u8>,
}

impl fmt::Debug for KeyedHashSensitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedHashSensitive")
            .field("key_len", &self.key.len())
            .finish_non_exhaustive()
    }
}

impl zeroize::Zeroize for KeyedHashSensitive {
    fn zeroize(&mut self) {
        self.auth_value.zeroize();
        self.seed_value.zeroize();
        self.key.zeroize();
    }
}

impl Drop for KeyedHashSensitive {
    fn drop(&mut self) {
        zeroize::Zeroize::zeroize(self);
    }
}

impl KeyedHashSensitive {
    /// `unique` value of the matching public area: `H(seedValue || key)`.
    pub fn unique(&self) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(&self.seed_value);
        hasher.update(&self.key);
        hasher.finalize().to_vec()
    }

    pub fn marshal(&self) -> Result<zeroize::Zeroizing<Vec<u8>>, MarshalError> {
        let mut writer = TpmWriter::new();
        writer.put_u16(TPM_ALG_KEYEDHASH);
        writer.put_sized(&self.auth_value)?;
        writer.put_sized(&self.seed_value)?;
        writer.put_sized(&self.key)?;
        Ok(zeroize::Zeroizing::new(writer.into_inner()))
    }

    pub fn unmarshal(bytes: &[u8]) -> Result<Self, MarshalError> {
        let mut reader = TpmReader::new(bytes);
        let sensitive_type = reader.get_u16()?;
        if sensitive_type != TPM_ALG_KEYEDHASH {
            return Err(MarshalError::Unsupported {
                field: "sensitiveType",
                value: sensitive_type as u32,
            });
        }
        let auth_value = reader.get_sized()?.to_vec();
        let seed_value = reader.get_sized()?.to_vec();
        let key = reader.get_sized()?.to_vec();
        reader.finish()?;
        Ok(Self {
            auth_value,
            seed_value,
            key,
        })
    }
}

/// `TPMA_NV` bit field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NvAttributes(pub u32);

impl NvAttributes {
    pub const OWNER_WRITE: u32 = 1 << 1;
    pub const AUTH_WRITE: u32 = 1 << 2;
    pub const OWNER_READ: u32 = 1 << 17;
    pub const AUTH_READ: u32 = 1 << 18;
    pub const NO_DA: u32 = 1 << 25;
    pub const WRITTEN: u32 = 1 << 29;

    /// Ordinary owner-controlled data index.
    pub const OWNER_DATA: Self = Self(
        Self::OWNER_WRITE | Self::AUTH_WRITE | Self::OWNER_READ | Self::AUTH_READ | Self::NO_DA,
    );

    pub fn contains(self, bits: u32) -> bool {
        self.0 & bits == bits
    }
}

/// `TPMS_NV_PUBLIC`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvPublic {
    pub index: u32,
    pub name_alg: u16,
    pub attributes: NvAttributes,
    pub auth_policy: Vec<u8>,
    pub data_size: u16,
}

impl NvPublic {
    pub fn owner_data(index: u32, data_size: u16) -> Self {
        Self {
            index,
            name_alg: TPM_ALG_SHA256,
            attributes: NvAttributes::OWNER_DATA,
            auth_policy: Vec::new(),
            data_size,
        }
    }

    pub fn is_written(&self) -> bool {
        self.attributes.contains(NvAttributes::WRITTEN)
    }

    pub fn marshal(&self) -> Result<Vec<u8>, MarshalError> {
        let mut writer = TpmWriter::new();
        writer.put_u32(self.index);
        writer.put_u16(self.name_alg);
        writer.put_u32(self.attributes.0);
        writer.put_sized(&self.auth_policy)?;
        writer.put_u16(self.data_size);
        Ok(writer.into_inner())
    }

    pub fn unmarshal(bytes: &[u8]) -> Result<Self, MarshalError> {
        let mut reader = TpmReader::new(bytes);
        let index = reader.get_u32()?;
        let name_alg = reader.get_u16()?;
        let attributes = NvAttributes(reader.get_u32()?);
        let auth_policy = reader.get_sized()?.to_vec();
        let data_size = reader.get_u16()?;
        reader.finish()?;
        Ok(Self {
            index,
            name_alg,
            attributes,
            auth_policy,
            data_size,
        })
    }

    pub fn name(&self) -> Result<ObjectName, MarshalError> {
        Ok(ObjectName::from_marshaled(&self.marshal()?))
    }
}

/// Canonical external identifier of a module object: `0x000B || SHA-256(public)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectName([u8; OBJECT_NAME_SIZE]);

impl ObjectName {
    fn from_marshaled(public: &[u8]) -> Self {
        let mut name = [0u8; OBJECT_NAME_SIZE];
        name[..2].copy_from_slice(&TPM_ALG_SHA256.to_be_bytes());
        name[2..].copy_from_slice(&Sha256::digest(public));
        Self(name)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MarshalError> {
        if bytes.len() != OBJECT_NAME_SIZE {
            return Err(MarshalError::Underflow(bytes.len()));
        }
        let tag = u16::from_be_bytes([bytes[0], bytes[1]]);
        if tag != TPM_ALG_SHA256 {
            return Err(MarshalError::Unsupported {
                field: "nameAlg",
                value: tag as u32,
            });
        }
        let mut name = [0u8; OBJECT_NAME_SIZE];
        name.copy_from_slice(bytes);
        Ok(Self(name))
    }

    pub fn as_bytes(&self) -> &[u8; OBJECT_NAME_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }
}

impl fmt::Debug for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectName({})", self.to_hex())
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// `TPM2B_ID_OBJECT`: credential integrity HMAC plus the encrypted credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdObject {
    pub integrity: Vec<u8>,
    pub enc_identity: Vec<u8>,
}

impl IdObject {
    pub fn marshal(&self) -> Result<Vec<u8>, MarshalError> {
        let mut inner = TpmWriter::new();
        inner.put_sized(&self.integrity)?;
        inner.put_bytes(&self.enc_identity);
        sized(&inner.into_inner())
    }

    pub fn unmarshal(bytes: &[u8]) -> Result<Self, MarshalError> {
        let mut reader = TpmReader::new(tpm2b_inner(bytes)?);
        let integrity = reader.get_sized()?.to_vec();
        let enc_identity = reader.remaining().to_vec();
        Ok(Self {
            integrity,
            enc_identity,
        })
    }
}

/// Concatenation of `TPM2B` fields, the framing used by hostage and challenge blobs.
pub fn join_sized(fields: &[&[u8]]) -> Result<Vec<u8>, MarshalError> {
    let mut writer = TpmWriter::new();
    for field in fields {
        writer.put_sized(field)?;
    }
    Ok(writer.into_inner())
}

/// Split exactly `count` `TPM2B` fields.
pub fn split_sized(bytes: &[u8], count: usize) -> Result<Vec<&[u8]>, MarshalError> {
    let mut reader = TpmReader::new(bytes);
    let mut fields = Vec::with_capacity(count);
    for _ in 0..count {
        fields.push(reader.get_sized()?);
    }
    reader.finish()?;
    Ok(fields)
}
