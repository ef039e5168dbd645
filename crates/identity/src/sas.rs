//! Shared access signature tokens signed by a slot's HMAC key.
//!
//! ```text
//! SharedAccessSignature sr=<urlenc(scope)>&sig=<urlenc(base64(mac))>&se=<expiry>
//! mac = HMAC-SHA256(key, urlenc(scope) + "\n" + expiry)
//! ```
//!
//! Tokens are derived on demand and never persisted.

use crate::context::TpmContext;
use crate::error::{IdentityError, IdentityResult};
use crate::layout::{LogicalDeviceSlot, CONNECTION_STRING_UNITS};
use crate::transport::TpmError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

const TOKEN_PREFIX: &str = "SharedAccessSignature ";

/// Seconds since the Unix epoch.
pub fn unix_now() -> IdentityResult<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .map_err(|err| IdentityError::IoFailure(format!("system clock before epoch: {err}")))
}

/// Message the HMAC key signs for `scope` and `expiry`.
pub fn string_to_sign(scope: &str, expiry: u64) -> String {
    format!("{}\n{expiry}", urlencoding::encode(scope))
}

/// Parsed SAS token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SasToken {
    pub scope: String,
    /// Base64 MAC, not URL-encoded
    pub signature: String,
    pub expiry: u64,
}

impl SasToken {
    pub fn signature_bytes(&self) -> IdentityResult<Vec<u8>> {
        BASE64
            .decode(&self.signature)
            .map_err(|err| IdentityError::ParseFailure(format!("token signature: {err}")))
    }

    pub fn string_to_sign(&self) -> String {
        string_to_sign(&self.scope, self.expiry)
    }

    /// Token embedded in a full connection string.
    ///
    /// Older tooling returned `HostName=…;DeviceId=…;SharedAccessSignature=<token>`
    /// where only the token was asked for.
    pub fn from_connection_string(connection_string: &str) -> IdentityResult<Self> {
        let start = connection_string
            .find("SharedAccessSignature sr")
            .ok_or_else(|| {
                IdentityError::ParseFailure("no SharedAccessSignature in connection string".into())
            })?;
        let token = &connection_string[start..];
        let end = token.find(';').unwrap_or(token.len());
        token[..end].trim_end().parse()
    }
}

impl fmt::Display for SasToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{TOKEN_PREFIX}sr={}&sig={}&se={}",
            urlencoding::encode(&self.scope),
            urlencoding::encode(&self.signature),
            self.expiry
        )
    }
}

impl FromStr for SasToken {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields = s
            .strip_prefix(TOKEN_PREFIX)
            .ok_or_else(|| IdentityError::ParseFailure("missing SharedAccessSignature prefix".into()))?;

        let mut scope = None;
        let mut signature = None;
        let mut expiry = None;
        for field in fields.split('&') {
            let (key, value) = field
                .split_once('=')
                .ok_or_else(|| IdentityError::ParseFailure(format!("malformed token field {field:?}")))?;
            let value = decode(value)?;
            match key {
                "sr" => scope = Some(value.into_owned()),
                "sig" => signature = Some(value.into_owned()),
                "se" => {
                    expiry = Some(value.parse::<u64>().map_err(|_| {
                        IdentityError::ParseFailure(format!("token expiry {value:?}"))
                    })?)
                }
                _ => {}
            }
        }

        match (scope, signature, expiry) {
            (Some(scope), Some(signature), Some(expiry)) => Ok(Self {
                scope,
                signature,
                expiry,
            }),
            _ => Err(IdentityError::ParseFailure(
                "token needs sr, sig and se".into(),
            )),
        }
    }
}

fn decode(value: &str) -> IdentityResult<Cow<'_, str>> {
    urlencoding::decode(value)
        .map_err(|_| IdentityError::ParseFailure(format!("token field {value:?} is not UTF-8")))
}

/// Builds SAS tokens and connection strings from slot keys.
#[derive(Debug, Clone)]
pub struct SasTokenGenerator {
    ctx: Arc<TpmContext>,
}

impl SasTokenGenerator {
    pub fn new(ctx: Arc<TpmContext>) -> Self {
        Self { ctx }
    }

    /// Token for `scope` valid until `expiry` (Unix seconds).
    pub fn generate(&self, slot: usize, scope: &str, expiry: u64) -> IdentityResult<SasToken> {
        self.generate_at(slot, scope, expiry, unix_now()?)
    }

    /// [`generate`](Self::generate) against an explicit clock reading.
    pub fn generate_at(
        &self,
        slot: usize,
        scope: &str,
        expiry: u64,
        now: u64,
    ) -> IdentityResult<SasToken> {
        let slot = LogicalDeviceSlot::new(slot)?;
        if expiry <= now {
            return Err(IdentityError::InvalidExpiration { expiry, now });
        }

        let message = string_to_sign(scope, expiry);
        let mac = self.ctx.with_module(|module| {
            module
                .transport()
                .hmac(slot.hmac_key_handle(), message.as_bytes())
                .map_err(|err| match err {
                    TpmError::ObjectNotPresent(_) => {
                        IdentityError::KeyNotFound(format!("slot {slot} has no HMAC key"))
                    }
                    other => other.into(),
                })
        })?;
        debug!(%slot, expiry, "SAS token generated");

        Ok(SasToken {
            scope: scope.to_string(),
            signature: BASE64.encode(mac),
            expiry,
        })
    }

    /// `HostName=…;DeviceId=…[;ModuleId=…];SharedAccessSignature=…` for the
    /// slot's stored `host/device` URI, valid for `validity` from now.
    pub fn connection_string(
        &self,
        slot: usize,
        validity: Duration,
        module_id: Option<&str>,
    ) -> IdentityResult<String> {
        let slot_index = LogicalDeviceSlot::new(slot)?;
        let uri = self
            .ctx
            .with_module(|module| crate::service_uri::read_locked(module, slot_index))?;
        let (host, device) = uri.split_once('/').ok_or_else(|| {
            IdentityError::ParseFailure(format!("service URI {uri:?} is not host/device"))
        })?;

        let mut scope = format!("{host}/devices/{device}");
        if let Some(module_id) = module_id {
            scope.push_str("/modules/");
            scope.push_str(module_id);
        }
        let expiry = unix_now()?.saturating_add(validity.as_secs().max(1));
        let token = self.generate(slot, &scope, expiry)?;

        let mut connection = format!("HostName={host};DeviceId={device}");
        if let Some(module_id) = module_id {
            connection.push_str(";ModuleId=");
            connection.push_str(module_id);
        }
        connection.push_str(";SharedAccessSignature=");
        connection.push_str(&token.to_string());

        let units = connection.encode_utf16().count();
        if units > CONNECTION_STRING_UNITS {
            return Err(IdentityError::ValueTooLarge {
                what: "connection string",
                len: units,
                max: CONNECTION_STRING_UNITS,
            });
        }
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::CertificateProfile;
    use crate::identity_key::IdentityKeyManager;
    use crate::service_uri::ServiceUriStore;
    use crate::simulator::SimulatedTpm;

    fn provisioned(slot: usize, key: &[u8]) -> Arc<TpmContext> {
        let ctx = TpmContext::initialize(Box::new(SimulatedTpm::new())).unwrap();
        IdentityKeyManager::new(ctx.clone(), CertificateProfile::default())
            .create_hmac_key(slot, key)
            .unwrap();
        ctx
    }

    #[test]
    fn test_token_signature_recomputes() {
        let ctx = provisioned(0, b"hub-key");
        let token = SasTokenGenerator::new(ctx)
            .generate_at(0, "hub.example/devices/device0", 2_000, 1_000)
            .unwrap();

        let expected = crate::crypto::hmac_sha256(
            b"hub-key",
            &[b"hub.example%2Fdevices%2Fdevice0\n2000"],
        );
        assert_eq!(token.signature_bytes().unwrap(), expected);
        assert_eq!(token.to_string().parse::<SasToken>().unwrap(), token);
    }

    #[test]
    fn test_expiry_must_be_in_future() {
        let ctx = provisioned(0, b"hub-key");
        let generator = SasTokenGenerator::new(ctx);
        assert!(matches!(
            generator.generate_at(0, "device0", 1_000, 1_000),
            Err(IdentityError::InvalidExpiration { expiry: 1_000, now: 1_000 })
        ));
        assert!(matches!(
            generator.generate(0, "device0", 1),
            Err(IdentityError::InvalidExpiration { .. })
        ));
    }

    #[test]
    fn test_missing_hmac_key() {
        let ctx = TpmContext::initialize(Box::new(SimulatedTpm::new())).unwrap();
        let result = SasTokenGenerator::new(ctx).generate_at(3, "device0", 10, 1);
        assert!(matches!(result, Err(IdentityError::KeyNotFound(_))));
    }

    #[test]
    fn test_token_from_connection_string() {
        let connection = "HostName=hub.example;DeviceId=device0;SharedAccessSignature=\
            SharedAccessSignature sr=hub.example%2fdevices%2fdevice0&sig=dPmo%2f%3d&se=1486606191";
        let token = SasToken::from_connection_string(connection).unwrap();
        assert_eq!(token.scope, "hub.example/devices/device0");
        assert_eq!(token.signature, "dPmo/=");
        assert_eq!(token.expiry, 1_486_606_191);

        assert!(SasToken::from_connection_string("HostName=hub").is_err());
    }

    #[test]
    fn test_connection_string_uses_stored_uri() {
        let ctx = provisioned(2, b"hub-key");
        ServiceUriStore::new(ctx.clone())
            .store(2, "hub.example/device2")
            .unwrap();

        let connection = SasTokenGenerator::new(ctx)
            .connection_string(2, Duration::from_secs(3600), Some("telemetry"))
            .unwrap();
        assert!(connection.starts_with("HostName=hub.example;DeviceId=device2;ModuleId=telemetry;"));
        let token = SasToken::from_connection_string(&connection).unwrap();
        assert_eq!(token.scope, "hub.example/devices/device2/modules/telemetry");
    }
}
