//! Configuration management for Tessera.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::CoreError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub module: ModuleConfig,
    #[serde(default)]
    pub provisioning: ProvisioningConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Output format of the process-wide subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            format: LogFormat::default(),
        }
    }
}

/// Which module implementation backs the device identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleBackend {
    /// Software module, used for development and tests.
    Simulated,
    /// Physical or firmware TPM reached through a TCTI.
    Hardware,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub backend: ModuleBackend,
    /// TCTI connection string, e.g. `device:/dev/tpmrm0`.
    #[serde(default = "default_tcti")]
    pub tcti: String,
    /// Where the simulated module keeps its state between runs.
    #[serde(default)]
    pub state_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    #[serde(default = "default_sas_validity_secs")]
    pub sas_validity_secs: u64,
    #[serde(default = "default_issuance_timeout_ms")]
    pub issuance_timeout_ms: u64,
    #[serde(default = "default_certificate_validity_days")]
    pub certificate_validity_days: u32,
    #[serde(default = "default_organization")]
    pub organization: String,
}

fn default_tcti() -> String {
    "device:/dev/tpmrm0".to_string()
}

fn default_sas_validity_secs() -> u64 {
    3600
}

fn default_issuance_timeout_ms() -> u64 {
    30_000
}

fn default_certificate_validity_days() -> u32 {
    365
}

fn default_organization() -> String {
    "Tessera Device".to_string()
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            sas_validity_secs: default_sas_validity_secs(),
            issuance_timeout_ms: default_issuance_timeout_ms(),
            certificate_validity_days: default_certificate_validity_days(),
            organization: default_organization(),
        }
    }
}

impl Config {
    #[cfg(feature = "toml")]
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    #[cfg(feature = "toml")]
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make provisioning unusable.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.provisioning.sas_validity_secs == 0 {
            return Err(CoreError::Config(
                "sas_validity_secs must be greater than zero".to_string(),
            ));
        }
        if self.provisioning.issuance_timeout_ms == 0 {
            return Err(CoreError::Config(
                "issuance_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.provisioning.certificate_validity_days == 0 {
            return Err(CoreError::Config(
                "certificate_validity_days must be greater than zero".to_string(),
            ));
        }
        if self.module.backend == ModuleBackend::Hardware && self.module.tcti.is_empty() {
            return Err(CoreError::Config(
                "hardware backend requires a tcti".to_string(),
            ));
        }
        Ok(())
    }

    pub fn default_config() -> Self {
        Self {
            module: ModuleConfig {
                backend: ModuleBackend::Simulated,
                tcti: default_tcti(),
                state_path: None,
            },
            provisioning: ProvisioningConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn state_path(&self) -> Option<&Path> {
        self.module.state_path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.module.backend, ModuleBackend::Simulated);
        assert_eq!(config.provisioning.sas_validity_secs, 3600);
    }

    #[cfg(feature = "toml")]
    #[test]
    fn test_parse_minimal_toml() {
        let config = Config::from_toml_str(
            r#"
            [module]
            backend = "hardware"
            tcti = "mssim:host=localhost,port=2321"
            "#,
        )
        .unwrap();

        assert_eq!(config.module.backend, ModuleBackend::Hardware);
        assert_eq!(config.module.tcti, "mssim:host=localhost,port=2321");
        assert_eq!(config.provisioning.issuance_timeout_ms, 30_000);
        assert_eq!(config.logging.format, LogFormat::Text);
        assert!(config.state_path().is_none());
    }

    #[cfg(feature = "toml")]
    #[test]
    fn test_parse_logging_section() {
        let config = Config::from_toml_str(
            r#"
            [module]
            backend = "simulated"

            [logging]
            filter = "tessera_identity=debug"
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.logging.filter, "tessera_identity=debug");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[cfg(feature = "toml")]
    #[test]
    fn test_reject_zero_validity() {
        let result = Config::from_toml_str(
            r#"
            [module]
            backend = "simulated"

            [provisioning]
            sas_validity_secs = 0
            "#,
        );
        assert!(result.is_err());
    }

    #[cfg(feature = "toml")]
    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tessera.toml");
        std::fs::write(
            &path,
            "[module]\nbackend = \"simulated\"\nstate_path = \"/var/lib/tessera/module.json\"\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(
            config.state_path(),
            Some(Path::new("/var/lib/tessera/module.json"))
        );
    }
}
