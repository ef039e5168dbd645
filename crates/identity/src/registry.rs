//! Logical device registry.
//!
//! Maps a slot index to the module objects it owns. Addresses come from
//! [`LogicalDeviceSlot`]; presence comes from the module itself, so the
//! registry keeps no bookkeeping of its own.

use crate::context::{Module, TpmContext};
use crate::error::{IdentityError, IdentityResult};
use crate::layout::{LogicalDeviceSlot, NvIndex, PersistentHandle};
use crate::marshal::{ObjectName, PublicArea};
use std::sync::Arc;
use tracing::info;

/// Module-resident key: handle plus the public area read from the module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmKeyHandle {
    pub handle: PersistentHandle,
    pub public: PublicArea,
}

impl TpmKeyHandle {
    /// Name recomputed from the public area.
    pub fn name(&self) -> IdentityResult<ObjectName> {
        Ok(self.public.name()?)
    }
}

/// Objects owned by one slot. Absent objects are `None`/`false`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotObjects {
    pub slot: LogicalDeviceSlot,
    pub identity_key: Option<TpmKeyHandle>,
    pub hmac_key: Option<TpmKeyHandle>,
    pub uri_nv_index: NvIndex,
    pub uri_present: bool,
    pub certificate_present: bool,
}

impl SlotObjects {
    /// Whether any object of the slot exists.
    pub fn is_provisioned(&self) -> bool {
        self.identity_key.is_some()
            || self.hmac_key.is_some()
            || self.uri_present
            || self.certificate_present
    }
}

pub(crate) fn load_key(
    module: &mut Module,
    handle: PersistentHandle,
) -> IdentityResult<Option<TpmKeyHandle>> {
    Ok(module
        .public_area(handle)?
        .map(|public| TpmKeyHandle { handle, public }))
}

pub(crate) fn resolve_locked(
    module: &mut Module,
    slot: LogicalDeviceSlot,
) -> IdentityResult<SlotObjects> {
    Ok(SlotObjects {
        slot,
        identity_key: load_key(module, slot.identity_key_handle())?,
        hmac_key: load_key(module, slot.hmac_key_handle())?,
        uri_nv_index: slot.uri_nv_index(),
        uri_present: module.nv_public(slot.uri_nv_index())?.is_some(),
        certificate_present: module.nv_public(slot.cert_nv_index())?.is_some(),
    })
}

/// Remove every object of `slot`. Returns whether anything was removed.
pub(crate) fn evict_locked(module: &mut Module, slot: LogicalDeviceSlot) -> IdentityResult<bool> {
    let mut removed = module.evict_if_present(slot.hmac_key_handle())?;
    removed |= module.evict_if_present(slot.identity_key_handle())?;
    removed |= module.undefine_if_present(slot.uri_nv_index())?;
    removed |= module.undefine_if_present(slot.cert_nv_index())?;
    Ok(removed)
}

/// Slot-to-object resolution.
#[derive(Debug, Clone)]
pub struct LogicalDeviceRegistry {
    ctx: Arc<TpmContext>,
}

impl LogicalDeviceRegistry {
    pub fn new(ctx: Arc<TpmContext>) -> Self {
        Self { ctx }
    }

    pub fn resolve(&self, slot: usize) -> IdentityResult<SlotObjects> {
        let slot = LogicalDeviceSlot::new(slot)?;
        self.ctx.with_module(|module| resolve_locked(module, slot))
    }

    pub fn present(&self, slot: usize) -> IdentityResult<bool> {
        Ok(self.resolve(slot)?.is_provisioned())
    }

    /// Evict every object of the slot. Evicting an empty slot succeeds.
    pub fn evict(&self, slot: usize) -> IdentityResult<()> {
        let slot = LogicalDeviceSlot::new(slot)?;
        let removed = self.ctx.with_module(|module| evict_locked(module, slot))?;
        if removed {
            info!(%slot, "logical device evicted");
        }
        Ok(())
    }

    /// Evict every slot.
    pub fn clear_all(&self) -> IdentityResult<()> {
        self.ctx.with_module(|module| {
            for slot in LogicalDeviceSlot::all() {
                evict_locked(module, slot)?;
            }
            Ok(())
        })?;
        info!("all logical devices cleared");
        Ok(())
    }

    /// Device id: uppercase hex of the slot's HMAC key name.
    pub fn read_device_id(&self, slot: usize) -> IdentityResult<String> {
        let slot = LogicalDeviceSlot::new(slot)?;
        let key = self
            .ctx
            .with_module(|module| load_key(module, slot.hmac_key_handle()))?
            .ok_or(IdentityError::NotProvisioned {
                slot: slot.index(),
                what: "HMAC key",
            })?;
        Ok(key.name()?.to_hex())
    }
}
