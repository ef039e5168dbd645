//! Hardware-rooted device identity for Tessera.
//!
//! A module (TPM) hosts up to [`MAX_LOGICAL_DEVICE`] logical device slots.
//! Each slot can own an HMAC key for SAS tokens, an ECDSA identity key with
//! its X.509 certificate, and a service URI in NV storage. Provisioning
//! delivers the HMAC key and URI as a hostage blob that only the target
//! module's endorsement key can unlock.
//!
//! # Components
//!
//! - [`LogicalDeviceRegistry`]: slot addressing, presence and eviction
//! - [`EndorsementKeyProvider`] / [`StorageRootKeyProvider`]: root public keys
//! - [`HostageKeyProtocol`]: credential activation and hostage key import
//! - [`IdentityKeyManager`]: identity and HMAC key lifecycle
//! - [`IdentityCertificateManager`]: certificate binding and CA issuance
//! - [`ServiceUriStore`]: per-slot service URI
//! - [`SasTokenGenerator`]: shared access signature tokens
//! - [`DeviceIdentity`]: all of the above over one context, with
//!   caller-buffer variants
//!
//! Every component shares one [`TpmContext`]; each operation holds the
//! module lock for exactly one command sequence.

pub mod api;
pub mod buffer;
pub mod certificate;
pub mod context;
pub mod credential;
pub mod crypto;
pub mod error;
#[cfg(feature = "hardware-tpm")]
pub mod hardware;
pub mod hostage;
pub mod identity_key;
pub mod layout;
pub mod marshal;
pub mod payload;
pub mod registry;
pub mod roots;
pub mod sas;
pub mod service_uri;
pub mod simulator;
pub mod transport;

pub use api::DeviceIdentity;
pub use certificate::{
    CertificateAuthorityClient, CertificateProfile, IdentityCertificate,
    IdentityCertificateManager, IssuanceRequest, LocalCertificateAuthority, Thumbprint,
};
pub use context::TpmContext;
pub use error::{IdentityError, IdentityResult};
pub use hostage::{
    challenge_identity_cert, create_hostage_key, create_hostage_key_ex, ActivationSecret,
    ChallengeBlob, HostageBlob, HostageKeyProtocol, ImportedHostageKey,
};
pub use identity_key::{IdentityAlgorithm, IdentityKey, IdentityKeyManager, IdentitySignature};
pub use layout::{LogicalDeviceSlot, NvIndex, PersistentHandle, MAX_LOGICAL_DEVICE};
pub use marshal::{ObjectName, PublicArea};
pub use registry::{LogicalDeviceRegistry, SlotObjects, TpmKeyHandle};
pub use roots::{EndorsementKeyProvider, StorageRootKeyProvider};
pub use sas::{SasToken, SasTokenGenerator};
pub use service_uri::ServiceUriStore;
pub use simulator::SimulatedTpm;
pub use transport::{TpmError, TpmTransport};

use std::sync::Arc;
use tessera_core::{ModuleBackend, ModuleConfig};

/// Open the module selected by `config` and return an initialized context.
pub fn open_module(config: &ModuleConfig) -> IdentityResult<Arc<TpmContext>> {
    let transport: Box<dyn TpmTransport> = match config.backend {
        ModuleBackend::Simulated => match &config.state_path {
            Some(path) => Box::new(SimulatedTpm::open(path)?),
            None => Box::new(SimulatedTpm::new()),
        },
        #[cfg(feature = "hardware-tpm")]
        ModuleBackend::Hardware => Box::new(hardware::TssTransport::open(&config.tcti)?),
        #[cfg(not(feature = "hardware-tpm"))]
        ModuleBackend::Hardware => {
            return Err(IdentityError::Config(
                "hardware backend requires the hardware-tpm feature".into(),
            ))
        }
    };
    TpmContext::initialize(transport)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_simulated_module() {
        let config = ModuleConfig {
            backend: ModuleBackend::Simulated,
            tcti: String::new(),
            state_path: None,
        };
        let ctx = open_module(&config).unwrap();
        assert!(ctx.is_initialized());
    }

    #[cfg(not(feature = "hardware-tpm"))]
    #[test]
    fn test_hardware_backend_needs_feature() {
        let config = ModuleConfig {
            backend: ModuleBackend::Hardware,
            tcti: "device:/dev/tpmrm0".into(),
            state_path: None,
        };
        assert!(matches!(open_module(&config), Err(IdentityError::Config(_))));
    }
}
