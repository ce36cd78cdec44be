//! Configuration loading from `~/.mnemos/config.toml` with defaults.
//!
//! Environment variables are applied on top of the file:
//! `MNEMOS_HOME`, `MNEMOS_STORE_PATH`, `MNEMOS_RATE_LIMIT`,
//! `MNEMOS_QUERY_CACHE_TTL_SECS` and `MNEMOS_EMBEDDING_CACHE_PATH`.

use crate::error::{KernelError, KernelResult};
use mnemos_types::config::{default_home_dir, RecallConfig};
use mnemos_types::error::MnemosError;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const ENV_HOME: &str = "MNEMOS_HOME";
pub const ENV_STORE_PATH: &str = "MNEMOS_STORE_PATH";
pub const ENV_RATE_LIMIT: &str = "MNEMOS_RATE_LIMIT";
pub const ENV_QUERY_CACHE_TTL: &str = "MNEMOS_QUERY_CACHE_TTL_SECS";
pub const ENV_EMBEDDING_CACHE_PATH: &str = "MNEMOS_EMBEDDING_CACHE_PATH";

/// Load configuration from the process environment and a TOML file.
///
/// With `path = None` the default file is used, and a missing or broken
/// default file falls back to built-in defaults. An explicitly requested
/// file that does not exist is an error.
pub fn load_config(path: Option<&Path>) -> KernelResult<RecallConfig> {
    load_config_with(path, |key| std::env::var(key).ok())
}

/// [`load_config`] with an injectable environment lookup.
pub fn load_config_with<F>(path: Option<&Path>, env: F) -> KernelResult<RecallConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let home_override = env(ENV_HOME).filter(|h| !h.trim().is_empty()).map(PathBuf::from);

    let mut config = match path {
        Some(p) => {
            if !p.exists() {
                return Err(KernelError::Mnemos(MnemosError::Config(format!(
                    "config file not found: {}",
                    p.display()
                ))));
            }
            read_or_default(p)
        }
        None => {
            let default_path = home_override
                .as_ref()
                .map(|h| h.join("config.toml"))
                .unwrap_or_else(default_config_path);
            if default_path.exists() {
                read_or_default(&default_path)
            } else {
                info!(
                    path = %default_path.display(),
                    "Config file not found, using defaults"
                );
                RecallConfig::default()
            }
        }
    };

    if let Some(home) = home_override {
        config.home_dir = home;
    }
    apply_env_overrides(&mut config, &env);
    config.validate()?;
    Ok(config)
}

fn read_or_default(config_path: &Path) -> RecallConfig {
    match std::fs::read_to_string(config_path) {
        Ok(contents) => match toml::from_str::<RecallConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                RecallConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            RecallConfig::default()
        }
    }
}

/// Apply the path and tuning overrides. Unparsable numbers are ignored with
/// a warning.
pub fn apply_env_overrides<F>(config: &mut RecallConfig, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = env(ENV_STORE_PATH).filter(|p| !p.trim().is_empty()) {
        config.store.path = PathBuf::from(path);
    }
    if let Some(path) = env(ENV_EMBEDDING_CACHE_PATH).filter(|p| !p.trim().is_empty()) {
        config.cache.disk_path = PathBuf::from(path);
    }
    if let Some(raw) = env(ENV_RATE_LIMIT) {
        match raw.trim().parse::<u32>() {
            Ok(rate) => config.embedding.rate_limit_per_sec = rate,
            Err(e) => warn!(
                var = ENV_RATE_LIMIT,
                value = %raw,
                error = %e,
                "Ignoring invalid override"
            ),
        }
    }
    if let Some(raw) = env(ENV_QUERY_CACHE_TTL) {
        match raw.trim().parse::<u64>() {
            Ok(ttl) => config.cache.query_ttl_secs = ttl,
            Err(e) => warn!(
                var = ENV_QUERY_CACHE_TTL,
                value = %raw,
                error = %e,
                "Ignoring invalid override"
            ),
        }
    }
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    default_home_dir().join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_missing_default_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().to_str().unwrap().to_string();
        let config = load_config_with(None, env_of(&[(ENV_HOME, &home)])).unwrap();
        assert_eq!(config.recall.max_results, 7);
        assert_eq!(config.home_dir, dir.path());
    }

    #[test]
    fn test_explicit_missing_file_is_fatal() {
        let err = load_config_with(Some(Path::new("/nonexistent/mnemos.toml")), env_of(&[]))
            .unwrap_err();
        assert!(matches!(err, KernelError::Mnemos(MnemosError::Config(_))));
    }

    #[test]
    fn test_file_values_are_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "[recall]\nmax_results = 3\n\n[cache]\nquery_ttl_secs = 10").unwrap();
        drop(f);

        let config = load_config_with(Some(&path), env_of(&[])).unwrap();
        assert_eq!(config.recall.max_results, 3);
        assert_eq!(config.cache.query_ttl_secs, 10);
    }

    #[test]
    fn test_broken_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[recall\nmax_results = ").unwrap();
        let config = load_config_with(Some(&path), env_of(&[])).unwrap();
        assert_eq!(config.recall.max_results, 7);
    }

    #[test]
    fn test_env_overrides_apply_after_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[embedding]\nrate_limit_per_sec = 4\n").unwrap();

        let config = load_config_with(
            Some(&path),
            env_of(&[
                (ENV_RATE_LIMIT, "25"),
                (ENV_QUERY_CACHE_TTL, "0"),
                (ENV_STORE_PATH, "/tmp/other.sqlite"),
                (ENV_EMBEDDING_CACHE_PATH, "cache/emb.db"),
            ]),
        )
        .unwrap();
        assert_eq!(config.embedding.rate_limit_per_sec, 25);
        assert_eq!(config.cache.query_ttl_secs, 0);
        assert_eq!(config.store.path, PathBuf::from("/tmp/other.sqlite"));
        assert_eq!(config.cache.disk_path, PathBuf::from("cache/emb.db"));
    }

    #[test]
    fn test_invalid_env_number_is_ignored() {
        let mut config = RecallConfig::default();
        apply_env_overrides(&mut config, env_of(&[(ENV_RATE_LIMIT, "fast")]));
        assert_eq!(config.embedding.rate_limit_per_sec, 10);
    }

    #[test]
    fn test_invalid_values_fail_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[store]\npool_size = 0\n").unwrap();
        assert!(load_config_with(Some(&path), env_of(&[])).is_err());
    }
}
