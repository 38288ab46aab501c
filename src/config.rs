//! Configuration: serde structs layered via figment.
//!
//! Precedence (lowest to highest): built-in defaults, the TOML config file,
//! `TAILDASH_`-prefixed environment variables (nested keys separated by
//! `__`, e.g. `TAILDASH_DAEMON__CACHE__TTL_SECS=3`). The remote API key may
//! also come from the conventional `TAILSCALE_API_KEY` variable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub daemon: DaemonConfig,
    /// Named daemon targets for `taildash query --node NAME`.
    pub nodes: HashMap<String, NodeTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeTarget {
    pub url: String,
}

impl Default for NodeTarget {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:9400".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// HTTP listen address for REST + GraphQL.
    pub http_addr: String,
    /// Default tracing filter when RUST_LOG is unset.
    pub log_level: String,
    pub agent: AgentConfig,
    pub cache: CacheConfig,
    pub remote: RemoteConfig,
    pub store: StoreConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            http_addr: "127.0.0.1:9400".to_string(),
            log_level: "info".to_string(),
            agent: AgentConfig::default(),
            cache: CacheConfig::default(),
            remote: RemoteConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Explicit path to the tailscale binary; auto-detected when unset.
    pub binary_path: Option<PathBuf>,
    /// Hard timeout for a single agent invocation.
    pub timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary_path: None,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// How long a committed snapshot counts as fresh.
    pub ttl_secs: u64,
    /// Watchdog bound on a whole refresh cycle (attempt + retry).
    pub refresh_timeout_secs: u64,
    /// Base backoff before the single retry; jitter is added on top.
    pub retry_backoff_ms: u64,
    /// Background refresher period. 0 disables the refresher.
    pub refresh_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 5,
            refresh_timeout_secs: 20,
            retry_backoff_ms: 250,
            refresh_interval_secs: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub api_base_url: String,
    /// Bearer token for the admin API. Absent → local-only mode.
    pub api_key: Option<String>,
    /// Tailnet name; "-" means the key's default tailnet.
    pub tailnet: String,
    pub probe_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.tailscale.com".to_string(),
            api_key: None,
            tailnet: "-".to_string(),
            probe_timeout_secs: 2,
            request_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Where the last good snapshot is persisted. Unset → the default
    /// location under the user cache directory. Empty string disables
    /// persistence.
    pub cache_file: Option<PathBuf>,
}

impl StoreConfig {
    /// Resolve the snapshot file path, `None` when persistence is disabled.
    pub fn resolved_path(&self) -> Option<PathBuf> {
        match &self.cache_file {
            Some(path) if path.as_os_str().is_empty() => None,
            Some(path) => Some(path.clone()),
            None => dirs::cache_dir().map(|d| d.join("taildash").join("snapshot.json")),
        }
    }
}

impl Config {
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("could not determine config directory")?;
        Ok(config_dir.join("taildash").join("config.toml"))
    }
}

/// Load configuration: defaults → TOML file → environment, later layers
/// winning.
///
/// A missing file is fine (defaults + env apply); a malformed file is an
/// error.
pub fn load(path: Option<&Path>) -> Result<Config> {
    let file = match path {
        Some(p) => p.to_path_buf(),
        None => Config::default_path()?,
    };

    let mut config: Config = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(&file))
        .merge(Env::prefixed("TAILDASH_").split("__"))
        .extract()
        .with_context(|| format!("loading config from {}", file.display()))?;

    // Conventional fallback used by most tailscale tooling.
    if config.daemon.remote.api_key.is_none() {
        if let Ok(key) = std::env::var("TAILSCALE_API_KEY") {
            if !key.is_empty() {
                config.daemon.remote.api_key = Some(key);
            }
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.daemon.http_addr, "127.0.0.1:9400");
        assert_eq!(cfg.daemon.cache.ttl_secs, 5);
        assert!(cfg.daemon.cache.refresh_interval_secs <= cfg.daemon.cache.ttl_secs);
        assert!(cfg.daemon.remote.api_key.is_none());
        assert!(cfg.nodes.is_empty());
    }

    #[test]
    fn toml_overrides_defaults_and_keeps_the_rest() {
        let cfg: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string(
                r#"
                [daemon]
                http_addr = "0.0.0.0:8080"

                [daemon.cache]
                ttl_secs = 3

                [daemon.remote]
                api_key = "tskey-api-test"
                tailnet = "example.com"

                [nodes.gateway]
                url = "http://10.0.0.2:9400"
                "#,
            ))
            .extract()
            .unwrap();

        assert_eq!(cfg.daemon.http_addr, "0.0.0.0:8080");
        assert_eq!(cfg.daemon.cache.ttl_secs, 3);
        // Untouched section keeps its default
        assert_eq!(cfg.daemon.cache.retry_backoff_ms, 250);
        assert_eq!(cfg.daemon.remote.api_key.as_deref(), Some("tskey-api-test"));
        assert_eq!(cfg.daemon.remote.tailnet, "example.com");
        assert_eq!(cfg.nodes["gateway"].url, "http://10.0.0.2:9400");
    }

    #[test]
    fn empty_cache_file_disables_persistence() {
        let store = StoreConfig {
            cache_file: Some(PathBuf::new()),
        };
        assert!(store.resolved_path().is_none());

        let explicit = StoreConfig {
            cache_file: Some(PathBuf::from("/tmp/snap.json")),
        };
        assert_eq!(
            explicit.resolved_path(),
            Some(PathBuf::from("/tmp/snap.json"))
        );
    }
}
