//! Status collection pipeline and the service facade.
//!
//! `StatusCollector` is one full collection cycle: arbitrate the source
//! mode, run the agent, parse strictly, normalize, and merge remote data
//! when augmented. `StatusService` wires the collector into the cache and
//! is the one handle the HTTP surfaces and CLI one-shots talk to.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::agent::{self, AgentBinary, AgentRunner};
use crate::config::DaemonConfig;
use crate::error::{Result, StatusError};
use crate::remote::{ModeArbiter, RemoteClient};

use super::cache::{CachePolicy, SnapshotCache, SnapshotSource};
use super::model::{AgentInfo, CacheHealth, DaemonHealth, Snapshot, SourceMode};
use super::normalize;
use super::raw;
use super::store::SnapshotStore;

pub struct StatusCollector {
    runner: Option<AgentRunner>,
    arbiter: ModeArbiter,
}

impl StatusCollector {
    pub fn new(agent: &AgentBinary, timeout: Duration, arbiter: ModeArbiter) -> Self {
        let runner = match (&agent.path, agent.installed) {
            (Some(path), true) => Some(AgentRunner::new(path.clone(), timeout)),
            _ => None,
        };
        Self { runner, arbiter }
    }

    /// One collection cycle. The mode is decided up front and holds for
    /// the whole cycle; a failed augmentation downgrades the result to
    /// local-only instead of failing it.
    pub async fn collect(&self, generation: u64) -> Result<Snapshot> {
        let runner = self.runner.as_ref().ok_or(StatusError::AgentNotFound)?;
        let mode = self.arbiter.select_mode().await;
        let output = runner.status_json().await?;
        let parsed = raw::parse_status(&output)?;
        let snapshot = normalize::normalize(parsed, generation)?;
        match (mode, self.arbiter.remote()) {
            (SourceMode::Augmented, Some(remote)) => Ok(remote.augment(snapshot).await),
            _ => Ok(snapshot),
        }
    }
}

#[async_trait]
impl SnapshotSource for StatusCollector {
    async fn fetch(&self, generation: u64) -> Result<Snapshot> {
        self.collect(generation).await
    }
}

/// Shared daemon state: the cache, the collector behind it, and enough
/// metadata to answer health queries. Cloning shares everything.
#[derive(Clone)]
pub struct StatusService {
    cache: SnapshotCache,
    collector: Arc<StatusCollector>,
    agent: AgentBinary,
    store: Option<Arc<SnapshotStore>>,
    started_at: std::time::Instant,
}

impl StatusService {
    pub fn new(config: &DaemonConfig) -> Result<Self> {
        let agent = agent::detect(config.agent.binary_path.as_deref());
        match (&agent.path, agent.installed) {
            (Some(path), true) => info!(path = %path.display(), "tailscale binary resolved"),
            (Some(path), false) => {
                warn!(path = %path.display(), "configured tailscale binary does not exist")
            }
            _ => warn!("tailscale binary not found, status requests will fail until installed"),
        }

        let remote = RemoteClient::from_config(&config.remote)?.map(Arc::new);
        if remote.is_some() {
            info!("remote augmentation enabled");
        } else {
            debug!("no API credential configured, running local-only");
        }

        let collector = Arc::new(StatusCollector::new(
            &agent,
            Duration::from_secs(config.agent.timeout_secs),
            ModeArbiter::new(remote),
        ));
        let store = config
            .store
            .resolved_path()
            .map(|path| Arc::new(SnapshotStore::new(path)));
        let cache = SnapshotCache::new(
            collector.clone(),
            store.clone(),
            CachePolicy::from_config(&config.cache),
        );

        Ok(Self {
            cache,
            collector,
            agent,
            store,
            started_at: std::time::Instant::now(),
        })
    }

    /// Serve from cache, refreshing when needed. The hot path.
    pub async fn get_snapshot(&self) -> Result<Arc<Snapshot>> {
        self.cache.get().await
    }

    /// Refresh now regardless of freshness.
    pub async fn refresh(&self) -> Result<Arc<Snapshot>> {
        self.cache.force_refresh().await
    }

    /// Drop freshness so the next read re-collects.
    pub async fn invalidate(&self) {
        self.cache.invalidate().await;
    }

    /// One uncached collection, bypassing the cache entirely. Generation 0
    /// marks the snapshot as a one-shot.
    pub async fn collect_once(&self) -> Result<Snapshot> {
        self.collector.collect(0).await
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.cache
    }

    /// Seed the cache from the persisted snapshot, if one is readable.
    /// Restored data is always stale; the first read still refreshes.
    pub async fn restore_from_disk(&self) {
        let Some(store) = &self.store else {
            return;
        };
        if !store.exists() {
            debug!(path = %store.path().display(), "no persisted snapshot to restore");
            return;
        }
        match store.read().await {
            Ok(stored) => {
                let age = stored.age_secs();
                info!(
                    generation = stored.snapshot.generation,
                    age_secs = age,
                    path = %store.path().display(),
                    "restored persisted snapshot"
                );
                self.cache
                    .seed(stored.snapshot, format!("restored from disk cache ({age}s old)"))
                    .await;
            }
            Err(e) => warn!(error = %e, "ignoring unreadable persisted snapshot"),
        }
    }

    pub async fn health(&self) -> DaemonHealth {
        let cached = self.cache.cached().await;
        let state = self.cache.state().await;
        let cache = match &cached {
            Some(snapshot) => CacheHealth {
                state,
                generation: Some(snapshot.generation),
                captured_at: Some(snapshot.captured_at),
                age_secs: Some(
                    Utc::now()
                        .signed_duration_since(snapshot.captured_at)
                        .num_seconds(),
                ),
                source_mode: Some(snapshot.source_mode),
                stale: Some(snapshot.stale),
            },
            None => CacheHealth {
                state,
                generation: None,
                captured_at: None,
                age_secs: None,
                source_mode: None,
                stale: None,
            },
        };

        DaemonHealth {
            status: if self.agent.installed { "ok" } else { "degraded" }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            hostname: current_hostname(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            agent: AgentInfo {
                installed: self.agent.installed,
                binary_path: self.agent.path.as_ref().map(|p| p.display().to_string()),
                version: cached
                    .as_ref()
                    .map(|s| s.agent_version.clone())
                    .filter(|v| !v.is_empty()),
            },
            cache,
        }
    }

    /// Readiness: a snapshot exists, fresh or stale. A refresh in flight
    /// on an empty slot is not readiness.
    pub async fn ready(&self) -> bool {
        self.cache.cached().await.is_some()
    }
}

fn current_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}
