//! Admin API client and per-cycle mode arbitration.
//!
//! Augmentation is never load-bearing: every failure path here either
//! downgrades the cycle to local-only (arbiter) or returns the snapshot
//! unchanged (augment). Callers never see a remote error.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use crate::config::RemoteConfig;
use crate::domain::model::{Snapshot, SourceMode};
use crate::domain::normalize::merge_remote;
use crate::domain::raw::{parse_api_devices, RawApiDevice};
use crate::error::{Result, StatusError};

pub struct RemoteClient {
    http: Client,
    base_url: String,
    api_key: String,
    tailnet: String,
    probe_timeout: Duration,
}

impl RemoteClient {
    /// Build a client when a credential is configured. `None` keeps the
    /// daemon in local-only mode for its whole lifetime.
    pub fn from_config(config: &RemoteConfig) -> Result<Option<Self>> {
        let Some(api_key) = config.api_key.clone() else {
            return Ok(None);
        };
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| StatusError::Internal(format!("building HTTP client: {e}")))?;
        Ok(Some(Self {
            http,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            api_key,
            tailnet: config.tailnet.clone(),
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
        }))
    }

    /// Reachability probe with its own short timeout. Any HTTP response
    /// counts as reachable; only transport failures count against the
    /// probe.
    pub async fn probe(&self) -> Result<()> {
        self.http
            .head(&self.base_url)
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| StatusError::RemoteUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn fetch_devices(&self) -> Result<Vec<RawApiDevice>> {
        let url = format!(
            "{}/api/v2/tailnet/{}/devices?fields=all",
            self.base_url, self.tailnet
        );
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| StatusError::RemoteUnavailable(e.to_string()))?;

        match resp.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(StatusError::RemoteUnauthorized {
                    status: resp.status().as_u16(),
                });
            }
            status if !status.is_success() => {
                return Err(StatusError::RemoteUnavailable(format!(
                    "{url} returned {status}"
                )));
            }
            _ => {}
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| StatusError::RemoteUnavailable(e.to_string()))?;
        // A body that does not parse is a remote defect, not an agent
        // schema mismatch; keep it in the remote error class.
        parse_api_devices(&body).map_err(|_| {
            StatusError::RemoteUnavailable("unexpected devices response body".to_string())
        })
    }

    /// Strictly additive augmentation: on any failure the local snapshot
    /// comes back unchanged and the failure is only logged.
    pub async fn augment(&self, snapshot: Snapshot) -> Snapshot {
        match self.fetch_devices().await {
            Ok(devices) => {
                debug!(devices = devices.len(), "merged admin API data into snapshot");
                merge_remote(snapshot, devices)
            }
            Err(e) => {
                warn!(error = %e, "remote augmentation failed, serving local-only data");
                snapshot
            }
        }
    }
}

/// Decides `local_only` vs `augmented` once per refresh cycle, never per
/// request, which bounds mode flapping to refresh granularity.
pub struct ModeArbiter {
    remote: Option<Arc<RemoteClient>>,
}

impl ModeArbiter {
    pub fn new(remote: Option<Arc<RemoteClient>>) -> Self {
        Self { remote }
    }

    pub async fn select_mode(&self) -> SourceMode {
        let Some(remote) = &self.remote else {
            return SourceMode::LocalOnly;
        };
        match remote.probe().await {
            Ok(()) => SourceMode::Augmented,
            Err(e) => {
                warn!(error = %e, "remote probe failed, downgrading to local-only for this cycle");
                SourceMode::LocalOnly
            }
        }
    }

    pub fn remote(&self) -> Option<&Arc<RemoteClient>> {
        self.remote.as_ref()
    }
}
