use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use mirage_sync::{ApplicationSettings, ApplyOrdering, Thresholds};
use mirage_transfer::TransferSettings;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub(crate) fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "mirage")
}

/// Everything mirage can be configured with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub transfer: TransferConfig,
    pub application: ApplicationConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Where content files are stored.
    pub root: PathBuf,
    /// Optional secondary location lookups may prefer.
    pub substitute_root: Option<PathBuf>,
    /// SQLite file holding the content index.
    pub index: PathBuf,
    pub prefer_substitute: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let data = project_dirs().map_or_else(|| PathBuf::from(".mirage"), |dirs| dirs.data_dir().to_path_buf());
        Self { root: data.join("content"), substitute_root: None, index: data.join("index.sqlite"), prefer_substitute: false }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub max_parallel_downloads: usize,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    /// Content larger than this many bytes is never downloaded.
    pub max_file_size: Option<u64>,
    pub max_failures_per_hash: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_parallel_downloads: 4,
            max_attempts: 10,
            retry_backoff_ms: 2_000,
            max_file_size: None,
            max_failures_per_hash: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    pub defer_in_combat: bool,
    pub defer_in_performance: bool,
    pub ordering: ApplyOrdering,
    pub thresholds: Thresholds,
    pub poll_interval_ms: u64,
    pub transition_timeout_ms: u64,
    pub revert_timeout_ms: u64,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            defer_in_combat: true,
            defer_in_performance: true,
            ordering: ApplyOrdering::default(),
            thresholds: Thresholds::default(),
            poll_interval_ms: 250,
            transition_timeout_ms: 30_000,
            revert_timeout_ms: 60_000,
        }
    }
}

impl Config {
    /// Rejects values that would stall or spin the pipeline.
    pub fn validate(&self) -> Result<()> {
        let invalid = |field, reason| exn::Exn::from(ErrorKind::Invalid { field, reason });
        if self.transfer.max_attempts == 0 {
            return Err(invalid("transfer.max_attempts", "must be at least 1"));
        }
        if self.transfer.max_parallel_downloads == 0 {
            return Err(invalid("transfer.max_parallel_downloads", "must be at least 1"));
        }
        if self.transfer.max_failures_per_hash == 0 {
            return Err(invalid("transfer.max_failures_per_hash", "must be at least 1"));
        }
        if self.application.poll_interval_ms == 0 {
            return Err(invalid("application.poll_interval_ms", "must be greater than zero"));
        }
        if self.cache.substitute_root.as_ref().is_some_and(|substitute| *substitute == self.cache.root) {
            return Err(invalid("cache.substitute_root", "must differ from cache.root"));
        }
        if self.cache.prefer_substitute && self.cache.substitute_root.is_none() {
            tracing::warn!("cache.prefer_substitute is set without a cache.substitute_root");
        }
        Ok(())
    }

    pub fn transfer_settings(&self) -> TransferSettings {
        TransferSettings {
            max_parallel_downloads: self.transfer.max_parallel_downloads,
            max_file_size: self.transfer.max_file_size,
            max_failures_per_hash: self.transfer.max_failures_per_hash,
            prefer_substitute: self.cache.prefer_substitute,
        }
    }

    pub fn application_settings(&self) -> ApplicationSettings {
        let application = &self.application;
        ApplicationSettings {
            defer_in_combat: application.defer_in_combat,
            defer_in_performance: application.defer_in_performance,
            ordering: application.ordering,
            thresholds: application.thresholds,
            poll_interval: Duration::from_millis(application.poll_interval_ms),
            transition_timeout: Duration::from_millis(application.transition_timeout_ms),
            revert_timeout: Duration::from_millis(application.revert_timeout_ms),
            max_attempts: self.transfer.max_attempts,
            retry_backoff: Duration::from_millis(self.transfer.retry_backoff_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_defaults_match_runtime_defaults() {
        let config = Config::default();
        assert_eq!(config.transfer_settings(), TransferSettings::default());
        assert_eq!(config.application_settings(), ApplicationSettings::default());
        config.validate().unwrap();
    }

    #[rstest]
    #[case::attempts(|c: &mut Config| c.transfer.max_attempts = 0, "transfer.max_attempts")]
    #[case::parallel(|c: &mut Config| c.transfer.max_parallel_downloads = 0, "transfer.max_parallel_downloads")]
    #[case::failures(|c: &mut Config| c.transfer.max_failures_per_hash = 0, "transfer.max_failures_per_hash")]
    #[case::poll(|c: &mut Config| c.application.poll_interval_ms = 0, "application.poll_interval_ms")]
    #[case::substitute(|c: &mut Config| c.cache.substitute_root = Some(c.cache.root.clone()), "cache.substitute_root")]
    fn test_validation(#[case] change: fn(&mut Config), #[case] expected: &str) {
        let mut config = Config::default();
        change(&mut config);
        let error = config.validate().unwrap_err();
        let ErrorKind::Invalid { field, .. } = &*error else {
            panic!("unexpected error: {error:?}");
        };
        assert_eq!(*field, expected);
    }
}
