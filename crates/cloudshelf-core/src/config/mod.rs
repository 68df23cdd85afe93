//! Application configuration schemas.
//!
//! All configuration structs are deserialized from TOML via the `config`
//! crate, with `CLOUDSHELF__`-prefixed environment variables layered on top.

pub mod logging;
pub mod provider;
pub mod transfer;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use validator::Validate;

use self::logging::LoggingConfig;
use self::provider::ProviderConfig;
use self::transfer::TransferConfig;

use crate::error::AppError;
use crate::result::AppResult;

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Transfer and preview tuning.
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Profile used when none is named explicitly.
    #[serde(default)]
    pub default_profile: Option<String>,
    /// Named storage profiles.
    #[serde(default)]
    pub profiles: BTreeMap<String, ProviderConfig>,
}

impl AppConfig {
    /// Load configuration from a TOML file (optional) and the environment.
    pub fn load(path: &str) -> AppResult<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("CLOUDSHELF")
                    .separator("__")
                    .try_parsing(true),
            );
        Self::finish(builder)
    }

    /// Parse configuration from an in-memory TOML document.
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml));
        Self::finish(builder)
    }

    fn finish(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> AppResult<Self> {
        let config: Self = builder
            .build()
            .map_err(|e| AppError::configuration(format!("Failed to build config: {e}")))?
            .try_deserialize()
            .map_err(|e| AppError::configuration(format!("Failed to deserialize config: {e}")))?;

        config
            .transfer
            .validate()
            .map_err(|e| AppError::configuration(format!("Invalid [transfer] section: {e}")))?;

        Ok(config)
    }

    /// Look up a profile by name and return its normalized configuration.
    pub fn profile(&self, name: &str) -> AppResult<ProviderConfig> {
        let profile = self
            .profiles
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::not_found(format!("Profile '{name}' is not configured")))?;
        profile.normalize().map_err(|e| {
            AppError::validation(format!("Profile '{name}': {}", e.message))
        })
    }

    /// Name of the profile to use when none is given: the configured default,
    /// else the only profile if exactly one exists.
    pub fn default_profile_name(&self) -> AppResult<String> {
        if let Some(name) = &self.default_profile {
            return Ok(name.clone());
        }
        match self.profiles.len() {
            1 => Ok(self.profiles.keys().next().cloned().unwrap_or_default()),
            0 => Err(AppError::configuration("No storage profiles configured")),
            _ => Err(AppError::configuration(
                "Several profiles are configured; pick one with --profile or set default_profile",
            )),
        }
    }
}
