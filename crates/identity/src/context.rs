//! Module context.
//!
//! The module is one serial resource. [`TpmContext`] owns the transport
//! behind a single mutex, and every component runs a whole command sequence
//! inside one [`TpmContext::with_module`] call so sequences never interleave.

use crate::error::{IdentityError, IdentityResult};
use crate::layout::{NvIndex, PersistentHandle};
use crate::marshal::{NvPublic, PublicArea};
use crate::transport::{RootKind, TpmError, TpmTransport};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Exclusive view of the module for the duration of one command sequence.
pub struct Module {
    transport: Box<dyn TpmTransport>,
    consumed_credentials: HashSet<[u8; 32]>,
}

impl Module {
    pub fn transport(&mut self) -> &mut dyn TpmTransport {
        self.transport.as_mut()
    }

    /// Parsed public area of a persistent object, or `None` when absent.
    pub fn public_area(&mut self, handle: PersistentHandle) -> IdentityResult<Option<PublicArea>> {
        match self.transport.read_public(handle) {
            Ok(bytes) => Ok(Some(PublicArea::unmarshal(&bytes)?)),
            Err(TpmError::ObjectNotPresent(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Parsed NV public area, or `None` when the index is not defined.
    pub fn nv_public(&mut self, index: NvIndex) -> IdentityResult<Option<NvPublic>> {
        match self.transport.nv_read_public(index) {
            Ok(bytes) => Ok(Some(NvPublic::unmarshal(&bytes)?)),
            Err(TpmError::ObjectNotPresent(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Evict a persistent object; absent objects are not an error.
    pub fn evict_if_present(&mut self, handle: PersistentHandle) -> IdentityResult<bool> {
        match self.transport.evict(handle) {
            Ok(()) => {
                info!(%handle, "evicted persistent object");
                Ok(true)
            }
            Err(TpmError::ObjectNotPresent(_)) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Undefine an NV index; undefined indices are not an error.
    pub fn undefine_if_present(&mut self, index: NvIndex) -> IdentityResult<bool> {
        match self.transport.nv_undefine(index) {
            Ok(()) => {
                info!(%index, "undefined NV index");
                Ok(true)
            }
            Err(TpmError::ObjectNotPresent(_)) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Root public area, creating the primary on first use.
    pub fn ensure_root(&mut self, kind: RootKind) -> IdentityResult<PublicArea> {
        if let Some(public) = self.public_area(kind.handle())? {
            return Ok(public);
        }
        debug!(?kind, "creating primary object");
        let bytes = self.transport.create_primary(kind)?;
        Ok(PublicArea::unmarshal(&bytes)?)
    }

    pub(crate) fn credential_consumed(&self, tag: &[u8; 32]) -> bool {
        self.consumed_credentials.contains(tag)
    }

    pub(crate) fn consume_credential(&mut self, tag: [u8; 32]) {
        self.consumed_credentials.insert(tag);
    }
}

/// Process-wide handle to one module.
pub struct TpmContext {
    module: Mutex<Option<Module>>,
    description: String,
}

impl std::fmt::Debug for TpmContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TpmContext")
            .field("module", &self.description)
            .finish()
    }
}

impl TpmContext {
    /// Take ownership of a transport and check the module is reachable.
    ///
    /// Startup reads (or creates) the EK and SRK; an unreachable module
    /// fails with `TpmUnavailable`.
    pub fn initialize(transport: Box<dyn TpmTransport>) -> IdentityResult<Arc<Self>> {
        let description = transport.describe();
        let mut module = Module {
            transport,
            consumed_credentials: HashSet::new(),
        };

        let roots = module
            .ensure_root(RootKind::Endorsement)
            .and_then(|_| module.ensure_root(RootKind::StorageRoot));
        if let Err(err) = roots {
            warn!(module = %description, error = %err, "module startup check failed");
            module.transport.close();
            return Err(match err {
                IdentityError::IoFailure(reason) => IdentityError::TpmUnavailable(reason),
                other => other,
            });
        }

        info!(module = %description, "module context initialized");
        Ok(Arc::new(Self {
            module: Mutex::new(Some(module)),
            description,
        }))
    }

    /// Run one command sequence with exclusive access to the module.
    pub fn with_module<T>(
        &self,
        sequence: impl FnOnce(&mut Module) -> IdentityResult<T>,
    ) -> IdentityResult<T> {
        let mut guard = self
            .module
            .lock()
            .map_err(|_| IdentityError::TpmUnavailable("module lock poisoned".into()))?;
        let module = guard
            .as_mut()
            .ok_or_else(|| IdentityError::TpmUnavailable("context deinitialized".into()))?;
        sequence(module)
    }

    /// Release the transport. Later calls through any clone of the context
    /// fail with `TpmUnavailable`.
    pub fn deinitialize(&self) {
        if let Ok(mut guard) = self.module.lock() {
            if let Some(mut module) = guard.take() {
                module.transport.close();
                info!(module = %self.description, "module context released");
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.module
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl Drop for TpmContext {
    fn drop(&mut self) {
        self.deinitialize();
    }
}
