//! Repository configuration types
//!
//! Persisted as pretty JSON at `.dvx/config.json`. Every section has a
//! default so partially written files still load.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::types::Scheme;
use crate::{Error, Result};

/// Main repository configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    /// Core settings
    pub core: CoreConfig,

    /// Object cache settings
    pub cache: CacheConfig,

    /// Named remotes used for push/pull and as external caches
    pub remotes: BTreeMap<String, RemoteConfig>,

    /// Storage transfer settings
    pub storage: StorageConfig,

    /// Experiment settings
    pub experiments: ExperimentConfig,
}

/// Core configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Remote used by push/pull when none is given
    pub default_remote: Option<String>,

    /// Hash algorithm for content addressing
    pub hash_algorithm: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            default_remote: None,
            hash_algorithm: "sha256".to_string(),
        }
    }
}

/// Object cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Local cache directory, relative to `.dvx/` unless absolute
    pub dir: String,

    /// Remote serving as external cache, per storage scheme
    pub external: BTreeMap<Scheme, String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: "cache".to_string(),
            external: BTreeMap::new(),
        }
    }
}

/// A named remote location
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Location URL (`s3://bucket/prefix`, `/mnt/store`, ...)
    pub url: String,

    /// Custom endpoint for S3-compatible services
    pub endpoint: Option<String>,

    /// Region for S3 remotes
    pub region: Option<String>,

    /// Force path-style S3 addressing (MinIO)
    pub force_path_style: bool,
}

impl RemoteConfig {
    /// Create a remote pointing at a URL with default settings
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Storage scheme of this remote's URL
    pub fn scheme(&self) -> Result<Scheme> {
        url_scheme(&self.url)
    }
}

/// Storage transfer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Maximum concurrent object transfers
    pub max_concurrent_ops: usize,

    /// Retry configuration
    pub retry: RetryConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_concurrent_ops: 16,
            retry: RetryConfig::default(),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries
    pub max_retries: u32,

    /// Initial delay before first retry
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Backoff delay before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt as i32);
        let millis = (self.initial_delay.as_millis() as f64 * factor) as u64;
        Duration::from_millis(millis).min(self.max_delay)
    }
}

/// Experiment configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// How often the runner looks for a checkpoint signal
    #[serde(with = "humantime_serde")]
    pub signal_poll_interval: Duration,

    /// Stage run by `exp run` when none is named
    pub default_stage: Option<String>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            signal_poll_interval: Duration::from_millis(500),
            default_stage: None,
        }
    }
}

impl RepoConfig {
    /// Load configuration from a file, falling back to defaults when absent
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(data) => {
                let config: RepoConfig = serde_json::from_slice(&data)?;
                debug!(path = %path.display(), "Loaded repository config");
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Write configuration atomically (temp file, then rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let data = serde_json::to_vec_pretty(self)?;
        let temp = path.with_extension("json.tmp");
        std::fs::write(&temp, data)?;
        std::fs::rename(&temp, path)?;
        Ok(())
    }

    /// Look up a remote by name
    pub fn remote(&self, name: &str) -> Result<&RemoteConfig> {
        self.remotes.get(name).ok_or_else(|| Error::RemoteNotFound {
            name: name.to_string(),
        })
    }

    /// Resolve an explicit remote name or the configured default
    pub fn resolve_remote<'a>(&'a self, name: Option<&'a str>) -> Result<(&'a str, &'a RemoteConfig)> {
        let name = match name {
            Some(name) => name,
            None => self
                .core
                .default_remote
                .as_deref()
                .ok_or(Error::NoDefaultRemote)?,
        };
        Ok((name, self.remote(name)?))
    }

    /// Remote acting as the external cache for a scheme
    pub fn external_cache(&self, scheme: Scheme) -> Result<(&str, &RemoteConfig)> {
        let name = self
            .cache
            .external
            .get(&scheme)
            .ok_or_else(|| Error::ExternalCacheNotConfigured {
                scheme: scheme.to_string(),
            })?;
        Ok((name.as_str(), self.remote(name)?))
    }

    /// Check cross-section invariants
    ///
    /// An external cache must exist, match its scheme, and never be the
    /// push/pull remote: objects from two different sources would otherwise
    /// share one hash namespace.
    pub fn validate(&self) -> Result<()> {
        if let Some(default) = &self.core.default_remote {
            self.remote(default).map_err(|_| Error::InvalidConfig {
                message: format!("default remote '{}' is not defined", default),
            })?;
        }

        if self.storage.max_concurrent_ops == 0 {
            return Err(Error::InvalidConfig {
                message: "storage.max_concurrent_ops must be at least 1".to_string(),
            });
        }

        for (scheme, name) in &self.cache.external {
            let remote = self.remote(name).map_err(|_| Error::InvalidConfig {
                message: format!("external cache for {} names unknown remote '{}'", scheme, name),
            })?;

            let remote_scheme = remote.scheme()?;
            if remote_scheme != *scheme {
                return Err(Error::InvalidConfig {
                    message: format!(
                        "external cache for {} points at a {} remote '{}'",
                        scheme, remote_scheme, name
                    ),
                });
            }

            if let Some(default) = &self.core.default_remote {
                let default_url = &self.remote(default)?.url;
                if default == name || normalize_url(default_url) == normalize_url(&remote.url) {
                    return Err(Error::InvalidConfig {
                        message: format!(
                            "external cache '{}' must differ from the push/pull remote '{}'",
                            name, default
                        ),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Storage scheme of a URL or plain path
pub fn url_scheme(url: &str) -> Result<Scheme> {
    match url.split_once("://") {
        Some((scheme, _)) => scheme.parse(),
        None => Ok(Scheme::Local),
    }
}

fn normalize_url(url: &str) -> &str {
    url.trim_end_matches('/')
}

/// Duration serialization helper for human-readable formats
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_remotes() -> RepoConfig {
        let mut config = RepoConfig::default();
        config
            .remotes
            .insert("storage".to_string(), RemoteConfig::new("s3://team-bucket/dvx"));
        config
            .remotes
            .insert("s3cache".to_string(), RemoteConfig::new("s3://team-bucket/cache"));
        config.core.default_remote = Some("storage".to_string());
        config
    }

    #[test]
    fn test_default_config() {
        let config = RepoConfig::default();
        assert_eq!(config.cache.dir, "cache");
        assert_eq!(config.storage.max_concurrent_ops, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let mut config = config_with_remotes();
        config.cache.external.insert(Scheme::S3, "s3cache".to_string());
        let json = serde_json::to_string(&config).unwrap();
        let parsed: RepoConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: RepoConfig =
            serde_json::from_str(r#"{"experiments": {"signal_poll_interval": 50}}"#).unwrap();
        assert_eq!(
            parsed.experiments.signal_poll_interval,
            Duration::from_millis(50)
        );
        assert_eq!(parsed.storage.retry.max_retries, 3);
    }

    #[test]
    fn test_external_cache_must_differ_from_default_remote() {
        let mut config = config_with_remotes();
        config.cache.external.insert(Scheme::S3, "storage".to_string());
        assert!(matches!(config.validate(), Err(Error::InvalidConfig { .. })));

        config.cache.external.insert(Scheme::S3, "s3cache".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_external_cache_scheme_must_match() {
        let mut config = config_with_remotes();
        config.cache.external.insert(Scheme::Ssh, "s3cache".to_string());
        assert!(matches!(config.validate(), Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn test_external_cache_lookup() {
        let mut config = config_with_remotes();
        assert!(matches!(
            config.external_cache(Scheme::S3),
            Err(Error::ExternalCacheNotConfigured { .. })
        ));
        config.cache.external.insert(Scheme::S3, "s3cache".to_string());
        let (name, remote) = config.external_cache(Scheme::S3).unwrap();
        assert_eq!(name, "s3cache");
        assert_eq!(remote.url, "s3://team-bucket/cache");
    }

    #[test]
    fn test_retry_backoff_is_capped() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for(0), Duration::from_millis(100));
        assert_eq!(retry.delay_for(1), Duration::from_millis(200));
        assert_eq!(retry.delay_for(20), Duration::from_secs(10));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        assert_eq!(RepoConfig::load(&path).unwrap(), RepoConfig::default());

        let config = config_with_remotes();
        config.save(&path).unwrap();
        assert_eq!(RepoConfig::load(&path).unwrap(), config);
    }
}
