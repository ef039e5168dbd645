//! Core functionality shared by the Tessera device-identity workspace.
//!
//! This crate provides the configuration model, logging initialization
//! and base error type used by every member crate.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{Config, LogFormat, LoggingConfig, ModuleBackend, ModuleConfig, ProvisioningConfig};
pub use error::{CoreError, Result};
