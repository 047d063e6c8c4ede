//! Layered configuration.
//!
//! Values are merged in order, later layers winning:
//!
//! 1. Built-in defaults.
//! 2. An optional config file, TOML, YAML or JSON by extension.
//! 3. Environment variables prefixed `MIRAGE_`, with nested keys separated by
//!    a double underscore (`MIRAGE_TRANSFER__MAX_ATTEMPTS=3`).

pub mod error;
mod sections;

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use std::path::{Path, PathBuf};

pub use crate::sections::{ApplicationConfig, CacheConfig, Config, TransferConfig};

pub const ENV_PREFIX: &str = "MIRAGE_";

/// `config.toml` in the platform's configuration directory, if there is one.
pub fn default_config_file() -> Option<PathBuf> {
    sections::project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Every layer, merged but not yet extracted.
pub fn figment(file: Option<&Path>) -> Result<Figment> {
    let mut figment = Figment::from(Serialized::defaults(Config::default()));
    if let Some(file) = file {
        if !file.is_file() {
            exn::bail!(ErrorKind::FileNotFound(file.to_path_buf()));
        }
        let extension = file.extension().and_then(|ext| ext.to_str()).map(str::to_ascii_lowercase);
        figment = match extension.as_deref() {
            Some("toml") => figment.merge(Toml::file_exact(file)),
            Some("yaml" | "yml") => figment.merge(Yaml::file_exact(file)),
            Some("json") => figment.merge(Json::file_exact(file)),
            _ => exn::bail!(ErrorKind::UnsupportedFormat(file.to_path_buf())),
        };
    }
    Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
}

/// Loads and validates configuration from `file` plus the environment.
pub fn load(file: Option<&Path>) -> Result<Config> {
    let config: Config = figment(file)?.extract().or_raise(|| ErrorKind::Extract)?;
    config.validate()?;
    tracing::debug!(file = ?file, "configuration loaded");
    Ok(config)
}

/// [`load`] with the default config file, when it exists.
pub fn load_default() -> Result<Config> {
    let file = default_config_file().filter(|file| file.is_file());
    load(file.as_deref())
}
