//! Service configuration, loaded from a YAML file.
//!
//! Field names follow the operator-facing camelCase convention of the
//! deployment manifests.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, ServerError};

/// Instance id returned for aidc codes with no configured mapping.
pub const AIDC_FALLBACK: &str = "other";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub server: ServerConfig,
    pub db: DbConfig,
    pub cache: CacheConfig,
    pub scheduler: SchedulerConfig,
    pub retry: RetryConfig,
    pub avatar: AvatarConfig,
    pub oss: OssConfig,
    /// aidcCode -> instance_id.
    pub aidc: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub metrics: bool,
    pub hub_scheme: String,
    pub hub_net_loc: String,
    pub ssl: SslConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8090,
            metrics: false,
            hub_scheme: "https".to_string(),
            hub_net_loc: "huggingface.co".to_string(),
            ssl: SslConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SslConfig {
    #[serde(alias = "enableCA")]
    pub enable_ca: bool,
    pub crt_file: String,
    pub key_file: String,
    pub ca_file: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DbConfig {
    pub url: String,
    pub max_conn: u32,
    pub max_idle_conn: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_conn: 20,
            max_idle_conn: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    /// Seconds a speed-node endpoint entry stays hot.
    pub speed_expiration_secs: u64,
    /// Seconds for general read-through entries (cards, scheduler locks).
    pub default_expiration_secs: u64,
    /// Seconds a cache-job request lock stays registered.
    pub job_lock_expiration_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            speed_expiration_secs: 5 * 60,
            default_expiration_secs: 30 * 60,
            job_lock_expiration_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerConfig {
    /// gRPC listen port for speed nodes.
    pub port: u16,
    /// Seconds a node stays "fresh" after its last register/heartbeat.
    pub heartbeat_gap_secs: u64,
    pub persist_repo: PersistRepoConfig,
    /// Fallback bearer token for speed-node calls when the token table is empty.
    pub global_token: String,
    /// Bounded concurrency for the operator HTTP surface.
    pub http_queue_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            port: 8091,
            heartbeat_gap_secs: 5 * 60,
            persist_repo: PersistRepoConfig::default(),
            global_token: String::new(),
            http_queue_limit: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistRepoConfig {
    pub enabled: bool,
    /// Six-field cron expression, e.g. `0 */10 * * * *`.
    pub cron: String,
    /// Comma-separated instance ids swept by the periodic persist.
    pub instance_ids: String,
}

impl PersistRepoConfig {
    pub fn instance_id_list(&self) -> Vec<String> {
        self.instance_ids
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub delay_secs: u64,
    pub attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            delay_secs: 1,
            attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AvatarConfig {
    /// Local directory org avatars are downloaded into.
    pub path: String,
}

impl Default for AvatarConfig {
    fn default() -> Self {
        Self {
            path: "./avatars".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct OssConfig {
    /// URL prefix prepended to stored icon keys in API responses.
    pub path: String,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let cfg: Config = serde_yaml::from_str(&raw)
            .map_err(|e| ServerError::InvalidParam(format!("config parse error: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.server.hub_scheme != "http" && self.server.hub_scheme != "https" {
            return Err(ServerError::InvalidParam(format!(
                "server.hubScheme must be http or https, got {}",
                self.server.hub_scheme
            )));
        }
        if self.retry.attempts == 0 || self.retry.attempts > 5 {
            return Err(ServerError::InvalidParam(
                "retry.attempts must be between 1 and 5".to_string(),
            ));
        }
        if self.retry.delay_secs > 60 {
            return Err(ServerError::InvalidParam(
                "retry.delaySecs must be at most 60".to_string(),
            ));
        }
        if self.scheduler.persist_repo.enabled && self.scheduler.persist_repo.cron.is_empty() {
            return Err(ServerError::InvalidParam(
                "scheduler.persistRepo.cron is required when enabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn hub_url_base(&self) -> String {
        format!("{}://{}", self.server.hub_scheme, self.server.hub_net_loc)
    }

    pub fn heartbeat_gap(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.scheduler.heartbeat_gap_secs as i64)
    }

    pub fn speed_expiration(&self) -> Duration {
        Duration::from_secs(self.cache.speed_expiration_secs)
    }

    pub fn cache_expiration(&self) -> Duration {
        Duration::from_secs(self.cache.default_expiration_secs)
    }

    pub fn job_lock_expiration(&self) -> Duration {
        Duration::from_secs(self.cache.job_lock_expiration_secs)
    }

    /// Maps an operator-facing aidc code to an instance id. Empty codes are
    /// a caller error; unknown codes fall back to [`AIDC_FALLBACK`].
    pub fn resolve_aidc(&self, aidc_code: &str) -> Result<String> {
        if aidc_code.is_empty() {
            return Err(ServerError::InvalidParam("aidcCode is required".to_string()));
        }
        Ok(self
            .aidc
            .get(aidc_code)
            .cloned()
            .unwrap_or_else(|| AIDC_FALLBACK.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.server.port, 8090);
        assert_eq!(cfg.scheduler.heartbeat_gap_secs, 300);
        assert_eq!(cfg.retry.attempts, 3);
        assert_eq!(cfg.hub_url_base(), "https://huggingface.co");
    }

    #[test]
    fn test_aidc_resolution() {
        let cfg: Config = serde_yaml::from_str("aidc:\n  dc-east: instance-1\n").unwrap();
        assert_eq!(cfg.resolve_aidc("dc-east").unwrap(), "instance-1");
        assert_eq!(cfg.resolve_aidc("dc-unknown").unwrap(), AIDC_FALLBACK);
        assert!(cfg.resolve_aidc("").is_err());
    }

    #[test]
    fn test_instance_id_list() {
        let p = PersistRepoConfig {
            enabled: true,
            cron: "0 */10 * * * *".to_string(),
            instance_ids: "a, b,,c".to_string(),
        };
        assert_eq!(p.instance_id_list(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_validate_rejects_bad_scheme() {
        let cfg: Config = serde_yaml::from_str("server:\n  hubScheme: ftp\n").unwrap();
        assert!(cfg.validate().is_err());
    }
}
