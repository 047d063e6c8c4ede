use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How capability adapter calls within one apply pass are scheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOrdering {
    /// One call at a time, in capability order.
    #[default]
    Serialized,
    /// Target-affine calls stay serialized on the target executor; the rest
    /// run concurrently alongside them.
    Concurrent,
}

/// Resource limits a snapshot must stay within to be applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    pub max_total_bytes: Option<u64>,
    pub max_file_count: Option<usize>,
}

impl Thresholds {
    /// Describes the first limit exceeded, if any.
    pub fn check(&self, total_bytes: u64, file_count: usize) -> Option<String> {
        if let Some(max) = self.max_total_bytes.filter(|max| total_bytes > *max) {
            return Some(format!("{total_bytes} bytes of content exceeds the limit of {max}"));
        }
        if let Some(max) = self.max_file_count.filter(|max| file_count > *max) {
            return Some(format!("{file_count} files exceeds the limit of {max}"));
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationSettings {
    pub defer_in_combat: bool,
    pub defer_in_performance: bool,
    pub ordering: ApplyOrdering,
    pub thresholds: Thresholds,
    /// How often a waiting session checks whether it may proceed.
    pub poll_interval: Duration,
    /// Longest wait for the target to finish a zone transition.
    pub transition_timeout: Duration,
    pub revert_timeout: Duration,
    /// Resolve/fetch rounds before a session gives up on missing content.
    pub max_attempts: u32,
    pub retry_backoff: Duration,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            defer_in_combat: true,
            defer_in_performance: true,
            ordering: ApplyOrdering::Serialized,
            thresholds: Thresholds::default(),
            poll_interval: Duration::from_millis(250),
            transition_timeout: Duration::from_secs(30),
            revert_timeout: Duration::from_secs(60),
            max_attempts: 10,
            retry_backoff: Duration::from_secs(2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Thresholds::default(), 1 << 40, 100_000, false)]
    #[case(Thresholds { max_total_bytes: Some(100), max_file_count: None }, 100, 5, false)]
    #[case(Thresholds { max_total_bytes: Some(100), max_file_count: None }, 101, 5, true)]
    #[case(Thresholds { max_total_bytes: None, max_file_count: Some(2) }, 0, 3, true)]
    fn test_thresholds(#[case] thresholds: Thresholds, #[case] bytes: u64, #[case] files: usize, #[case] breach: bool) {
        assert_eq!(thresholds.check(bytes, files).is_some(), breach);
    }
}
