//! Per-slot service URI in NV storage.
//!
//! Each slot owns a fixed 1024-byte owner index holding the URI as
//! NUL-terminated UTF-16LE, the layout existing devices were provisioned with.

use crate::context::{Module, TpmContext};
use crate::error::{IdentityError, IdentityResult};
use crate::layout::{LogicalDeviceSlot, STRING_BUFFER_UNITS, URI_NV_SIZE};
use crate::marshal::{NvPublic, ObjectName};
use std::sync::Arc;
use tracing::info;

/// Fail with `ValueTooLarge` unless `uri` and its terminator fit the index.
pub(crate) fn check_capacity(uri: &str) -> IdentityResult<Vec<u16>> {
    let units: Vec<u16> = uri.encode_utf16().collect();
    if units.len() >= STRING_BUFFER_UNITS {
        return Err(IdentityError::ValueTooLarge {
            what: "service URI",
            len: units.len(),
            max: STRING_BUFFER_UNITS - 1,
        });
    }
    Ok(units)
}

fn encode(units: &[u16]) -> Vec<u8> {
    let mut bytes = vec![0u8; URI_NV_SIZE as usize];
    for (chunk, unit) in bytes.chunks_exact_mut(2).zip(units) {
        chunk.copy_from_slice(&unit.to_le_bytes());
    }
    bytes
}

fn decode(bytes: &[u8]) -> IdentityResult<String> {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|unit| *unit != 0)
        .collect();
    String::from_utf16(&units)
        .map_err(|_| IdentityError::ParseFailure("service URI is not valid UTF-16".into()))
}

/// Write `uri` to the slot's index, defining it if needed. Returns the NV name.
pub(crate) fn store_locked(
    module: &mut Module,
    slot: LogicalDeviceSlot,
    uri: &str,
) -> IdentityResult<ObjectName> {
    let units = check_capacity(uri)?;
    let index = slot.uri_nv_index();

    match module.nv_public(index)? {
        Some(public) if public.data_size == URI_NV_SIZE => {}
        Some(_) => {
            module.undefine_if_present(index)?;
            module
                .transport()
                .nv_define(&NvPublic::owner_data(index.0, URI_NV_SIZE))?;
        }
        None => {
            module
                .transport()
                .nv_define(&NvPublic::owner_data(index.0, URI_NV_SIZE))?;
        }
    }
    module.transport().nv_write(index, 0, &encode(&units))?;

    let public = module
        .nv_public(index)?
        .ok_or(IdentityError::ObjectNotPresent { handle: index.0 })?;
    Ok(public.name()?)
}

pub(crate) fn read_locked(module: &mut Module, slot: LogicalDeviceSlot) -> IdentityResult<String> {
    let index = slot.uri_nv_index();
    let not_provisioned = IdentityError::NotProvisioned {
        slot: slot.index(),
        what: "service URI",
    };
    let public = match module.nv_public(index)? {
        Some(public) if public.is_written() => public,
        _ => return Err(not_provisioned),
    };
    let bytes = module.transport().nv_read(index, 0, public.data_size)?;
    decode(&bytes)
}

/// Service URI persistence.
#[derive(Debug, Clone)]
pub struct ServiceUriStore {
    ctx: Arc<TpmContext>,
}

impl ServiceUriStore {
    pub fn new(ctx: Arc<TpmContext>) -> Self {
        Self { ctx }
    }

    /// Persist `uri` for the slot and return the name of the NV index.
    pub fn store(&self, slot: usize, uri: &str) -> IdentityResult<ObjectName> {
        let slot = LogicalDeviceSlot::new(slot)?;
        let name = self.ctx.with_module(|module| store_locked(module, slot, uri))?;
        info!(%slot, nv = %name, "service URI stored");
        Ok(name)
    }

    pub fn read(&self, slot: usize) -> IdentityResult<String> {
        let slot = LogicalDeviceSlot::new(slot)?;
        self.ctx.with_module(|module| read_locked(module, slot))
    }

    /// Remove the slot's URI. Removing an absent URI succeeds.
    pub fn destroy(&self, slot: usize) -> IdentityResult<()> {
        let slot = LogicalDeviceSlot::new(slot)?;
        self.ctx
            .with_module(|module| module.undefine_if_present(slot.uri_nv_index()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::SimulatedTpm;

    fn store() -> ServiceUriStore {
        ServiceUriStore::new(TpmContext::initialize(Box::new(SimulatedTpm::new())).unwrap())
    }

    #[test]
    fn test_store_and_read() {
        let store = store();
        let name = store.store(0, "hub.example.net/device-0").unwrap();
        assert_eq!(&name.as_bytes()[..2], &[0x00, 0x0B]);
        assert_eq!(store.read(0).unwrap(), "hub.example.net/device-0");

        store.store(0, "other.example").unwrap();
        assert_eq!(store.read(0).unwrap(), "other.example");
    }

    #[test]
    fn test_non_ascii_roundtrip() {
        let store = store();
        store.store(1, "hub.example/gerät-😀").unwrap();
        assert_eq!(store.read(1).unwrap(), "hub.example/gerät-😀");
    }

    #[test]
    fn test_capacity_boundary() {
        let store = store();
        let fits = "a".repeat(STRING_BUFFER_UNITS - 1);
        store.store(2, &fits).unwrap();
        assert_eq!(store.read(2).unwrap(), fits);

        let too_long = "a".repeat(STRING_BUFFER_UNITS);
        assert!(matches!(
            store.store(3, &too_long),
            Err(IdentityError::ValueTooLarge { len: 512, .. })
        ));
        // no partial write
        assert!(matches!(
            store.read(3),
            Err(IdentityError::NotProvisioned { .. })
        ));
    }

    #[test]
    fn test_read_empty_and_destroy() {
        let store = store();
        assert!(matches!(
            store.read(5),
            Err(IdentityError::NotProvisioned { slot: 5, .. })
        ));
        store.store(5, "hub").unwrap();
        store.destroy(5).unwrap();
        store.destroy(5).unwrap();
        assert!(store.read(5).is_err());
    }
}
