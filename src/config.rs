#![allow(dead_code)]
//! Runtime configuration, loaded from environment variables (with an
//! optional `.env` file via `dotenvy`), matching this codebase's existing
//! env-first configuration rather than a config file format. Every key has
//! a default from §6, so a bare `Settings::from_env()` always produces
//! something usable.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

/// All recognised configuration keys and their effects (§6).
#[derive(Debug, Clone)]
pub struct Settings {
    pub cache_l1_capacity: usize,
    pub cache_l2_dir: PathBuf,
    pub template_similarity_threshold: f64,
    pub template_confidence_threshold: f64,
    pub template_min_samples: u32,
    pub template_max_per_label: usize,
    pub batch_max_workers: usize,
    pub llm_timeout: Duration,
    pub llm_max_retries: u32,
    pub parser_timeout: Duration,
    pub disk_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache_l1_capacity: 100,
            cache_l2_dir: PathBuf::from("data/cache_l2"),
            template_similarity_threshold: 0.70,
            template_confidence_threshold: 0.80,
            template_min_samples: 2,
            template_max_per_label: 16,
            batch_max_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .max(1),
            llm_timeout: Duration::from_secs(120),
            llm_max_retries: 1,
            parser_timeout: Duration::from_secs(30),
            disk_timeout: Duration::from_secs(5),
        }
    }
}

impl Settings {
    /// Load settings from the process environment, falling back to the
    /// §6 defaults for any key that is unset or unparsable. Loads `.env`
    /// first (ignored if absent) so local development matches the
    /// teacher's `dotenvy::dotenv().ok()` bring-up.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        Ok(Self {
            cache_l1_capacity: env_usize("EXTRACTOR_CACHE_L1_CAPACITY", defaults.cache_l1_capacity),
            cache_l2_dir: env::var("EXTRACTOR_CACHE_L2_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_l2_dir),
            template_similarity_threshold: env_f64(
                "EXTRACTOR_TEMPLATE_SIMILARITY_THRESHOLD",
                defaults.template_similarity_threshold,
            ),
            template_confidence_threshold: env_f64(
                "EXTRACTOR_TEMPLATE_CONFIDENCE_THRESHOLD",
                defaults.template_confidence_threshold,
            ),
            template_min_samples: env_u32(
                "EXTRACTOR_TEMPLATE_MIN_SAMPLES",
                defaults.template_min_samples,
            ),
            template_max_per_label: env_usize(
                "EXTRACTOR_TEMPLATE_MAX_PER_LABEL",
                defaults.template_max_per_label,
            ),
            batch_max_workers: env_usize("EXTRACTOR_BATCH_MAX_WORKERS", defaults.batch_max_workers),
            llm_timeout: Duration::from_secs(env_u64(
                "EXTRACTOR_LLM_TIMEOUT_S",
                defaults.llm_timeout.as_secs(),
            )),
            llm_max_retries: env_u32("EXTRACTOR_LLM_MAX_RETRIES", defaults.llm_max_retries),
            parser_timeout: Duration::from_secs(env_u64(
                "EXTRACTOR_PARSER_TIMEOUT_S",
                defaults.parser_timeout.as_secs(),
            )),
            disk_timeout: Duration::from_secs(env_u64(
                "EXTRACTOR_DISK_TIMEOUT_S",
                defaults.disk_timeout.as_secs(),
            )),
        })
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let s = Settings::default();
        assert_eq!(s.cache_l1_capacity, 100);
        assert!((s.template_similarity_threshold - 0.70).abs() < f64::EPSILON);
        assert!((s.template_confidence_threshold - 0.80).abs() < f64::EPSILON);
        assert_eq!(s.template_min_samples, 2);
        assert_eq!(s.template_max_per_label, 16);
    }
}
