//! Fixed object addressing and size constants.
//!
//! Handles and NV indices are pure functions of the slot index. Provisioned
//! devices in the field depend on these exact values.

use crate::error::{IdentityError, IdentityResult};
use std::fmt;

pub const SHA1_DIGEST_SIZE: usize = 20;
pub const SHA256_DIGEST_SIZE: usize = 32;
pub const SYMMETRIC_KEY_SIZE: usize = 16;
pub const KEY_NAME_SIZE: usize = 2 + SHA256_DIGEST_SIZE;
pub const MAX_LOGICAL_DEVICE: usize = 10;
/// Generic string buffer, in UTF-16 code units.
pub const STRING_BUFFER_UNITS: usize = 512;
/// Connection-string buffer, in UTF-16 code units.
pub const CONNECTION_STRING_UNITS: usize = 1024;
/// Raw HMAC key length accepted by `create_hostage_key`.
pub const HOSTAGE_HMAC_KEY_SIZE: usize = 32;

pub const SRK_HANDLE: PersistentHandle = PersistentHandle(0x8100_0001);
pub const EK_HANDLE: PersistentHandle = PersistentHandle(0x8101_0001);

const PERSISTENT_SLOT_BASE: u32 = 0x8100_0100;
const IDENTITY_KEY_OFFSET: u32 = 0x80;
const OWNER_NV_BASE: u32 = 0x0140_0000;
const URI_NV_OFFSET: u32 = 0x100;
const CERT_NV_OFFSET: u32 = 0x200;

/// URI index size in bytes: 512 UTF-16LE code units including the terminator.
pub const URI_NV_SIZE: u16 = (STRING_BUFFER_UNITS * 2) as u16;
/// Certificate index size in bytes: 2-byte length prefix plus DER.
pub const CERT_NV_SIZE: u16 = 2 + MAX_CERT_DER as u16;
pub const MAX_CERT_DER: usize = 2048;

/// Persistent object handle in the `0x81xxxxxx` range.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PersistentHandle(pub u32);

impl fmt::Debug for PersistentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl fmt::Display for PersistentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Owner-space NV index in the `0x01xxxxxx` range.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NvIndex(pub u32);

impl fmt::Debug for NvIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl fmt::Display for NvIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Bounds-checked logical device index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogicalDeviceSlot(u8);

impl LogicalDeviceSlot {
    pub fn new(index: usize) -> IdentityResult<Self> {
        if index >= MAX_LOGICAL_DEVICE {
            return Err(IdentityError::SlotOutOfRange {
                slot: index,
                max: MAX_LOGICAL_DEVICE,
            });
        }
        Ok(Self(index as u8))
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn all() -> impl Iterator<Item = LogicalDeviceSlot> {
        (0..MAX_LOGICAL_DEVICE as u8).map(LogicalDeviceSlot)
    }

    pub fn hmac_key_handle(self) -> PersistentHandle {
        PersistentHandle(PERSISTENT_SLOT_BASE + self.0 as u32)
    }

    pub fn identity_key_handle(self) -> PersistentHandle {
        PersistentHandle(PERSISTENT_SLOT_BASE + IDENTITY_KEY_OFFSET + self.0 as u32)
    }

    pub fn uri_nv_index(self) -> NvIndex {
        NvIndex(OWNER_NV_BASE + URI_NV_OFFSET + self.0 as u32)
    }

    pub fn cert_nv_index(self) -> NvIndex {
        NvIndex(OWNER_NV_BASE + CERT_NV_OFFSET + self.0 as u32)
    }

    /// Slot owning a persistent identity-key handle, if any.
    pub fn from_identity_key_handle(handle: PersistentHandle) -> Option<Self> {
        let base = PERSISTENT_SLOT_BASE + IDENTITY_KEY_OFFSET;
        handle
            .0
            .checked_sub(base)
            .and_then(|offset| Self::new(offset as usize).ok())
    }
}

impl fmt::Display for LogicalDeviceSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
