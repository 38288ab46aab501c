//! Typed HTTP client for the taildash daemon REST API.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use reqwest::Client;

use crate::config::NodeTarget;
use crate::domain::model::{DaemonHealth, Device, RouteAdvertisement, Snapshot};

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:9400";

pub struct TaildashClient {
    base_url: String,
    http: Client,
}

impl TaildashClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    /// Resolve a client from the nodes map.
    /// `None` name → localhost default. `Some(name)` → look up in nodes map.
    pub fn from_node(
        name: Option<&str>,
        nodes: &HashMap<String, NodeTarget>,
    ) -> Result<Self> {
        match name {
            None => Self::new(DEFAULT_BASE_URL),
            Some(n) => match nodes.get(n) {
                Some(target) => Self::new(&target.url),
                None => bail!(
                    "node '{}' not found in config. Available nodes: {}",
                    n,
                    if nodes.is_empty() {
                        "(none configured)".to_string()
                    } else {
                        nodes.keys().cloned().collect::<Vec<_>>().join(", ")
                    }
                ),
            },
        }
    }

    pub async fn health(&self) -> Result<DaemonHealth> {
        self.get("/health").await
    }

    pub async fn status(&self) -> Result<Snapshot> {
        self.get("/api/v1/status").await
    }

    pub async fn self_device(&self) -> Result<Device> {
        self.get("/api/v1/self").await
    }

    pub async fn peers(&self) -> Result<Vec<Device>> {
        self.get("/api/v1/peers").await
    }

    pub async fn peer(&self, id: &str) -> Result<Device> {
        self.get(&format!("/api/v1/peers/{id}")).await
    }

    pub async fn routes(&self) -> Result<Vec<RouteAdvertisement>> {
        self.get("/api/v1/routes").await
    }

    pub async fn exit_nodes(&self) -> Result<Vec<Device>> {
        self.get("/api/v1/exit-nodes").await
    }

    pub async fn refresh(&self) -> Result<Snapshot> {
        self.post("/api/v1/refresh").await
    }

    /// Invalidate returns no body, just 204.
    pub async fn invalidate(&self) -> Result<()> {
        let url = format!("{}/api/v1/invalidate", self.base_url);
        let resp = self
            .http
            .post(&url)
            .send()
            .await
            .with_context(|| format!("POST {}", url))?;

        if !resp.status().is_success() {
            bail!("{} returned {}", url, resp.status());
        }
        Ok(())
    }

    // ── Internal helpers ───────────────────────────────────

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {}", url))?;

        if !resp.status().is_success() {
            bail!("{} returned {}", url, resp.status());
        }

        resp.json()
            .await
            .with_context(|| format!("parsing response from {}", url))
    }

    async fn post<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .post(&url)
            .send()
            .await
            .with_context(|| format!("POST {}", url))?;

        if !resp.status().is_success() {
            bail!("{} returned {}", url, resp.status());
        }

        resp.json()
            .await
            .with_context(|| format!("parsing response from {}", url))
    }
}
