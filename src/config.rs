use crate::jobs::DEFAULT_RETAINED_JOBS;
use std::env;
use std::str::FromStr;

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// What the duplicate resolver loads from the target before parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicateStrategy {
    /// Only the key columns of stored rows.
    #[default]
    Keys,
    /// Every user column of stored rows.
    Snapshot,
}

impl FromStr for DuplicateStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "keys" => Ok(DuplicateStrategy::Keys),
            "snapshot" => Ok(DuplicateStrategy::Snapshot),
            other => Err(format!("unknown duplicate strategy '{other}'")),
        }
    }
}

/// Runtime configuration for import and export jobs.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub max_parallel_batches: usize,
    pub duplicate_strategy: DuplicateStrategy,
    pub max_upload_bytes: u64,
    pub default_actor: String,
    /// Finished jobs kept in the job registry.
    pub retained_jobs: usize,
}

impl LoaderConfig {
    pub fn from_env() -> Self {
        let duplicate_strategy = env::var("LOADER_DUPLICATE_STRATEGY")
            .ok()
            .and_then(|value| match DuplicateStrategy::from_str(&value) {
                Ok(strategy) => Some(strategy),
                Err(err) => {
                    log::warn!("{}, using keys", err);
                    None
                }
            })
            .unwrap_or_default();

        Self {
            batch_size: env_usize("LOADER_BATCH_SIZE", 1_000),
            max_parallel_batches: env_usize("LOADER_MAX_PARALLEL_BATCHES", 4),
            duplicate_strategy,
            max_upload_bytes: env_u64("LOADER_MAX_UPLOAD_BYTES", 1 << 30),
            default_actor: env_string("LOADER_DEFAULT_ACTOR", "system"),
            retained_jobs: env_usize("LOADER_RETAINED_JOBS", DEFAULT_RETAINED_JOBS),
        }
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 1_000,
            max_parallel_batches: 4,
            duplicate_strategy: DuplicateStrategy::Keys,
            max_upload_bytes: 1 << 30,
            default_actor: "system".to_string(),
            retained_jobs: DEFAULT_RETAINED_JOBS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_strategy_parsing() {
        assert_eq!("Keys".parse::<DuplicateStrategy>(), Ok(DuplicateStrategy::Keys));
        assert_eq!(
            " snapshot ".parse::<DuplicateStrategy>(),
            Ok(DuplicateStrategy::Snapshot)
        );
        assert!("all".parse::<DuplicateStrategy>().is_err());
    }

    #[test]
    fn test_defaults() {
        let config = LoaderConfig::default();
        assert_eq!(config.batch_size, 1_000);
        assert_eq!(config.max_parallel_batches, 4);
        assert_eq!(config.max_upload_bytes, 1_073_741_824);
        assert_eq!(config.retained_jobs, 100);
    }
}
