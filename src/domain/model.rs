//! Canonical tailnet entities — the contract all consumers use instead of
//! raw agent or API output.
//!
//! A `Snapshot` is produced by the normalizer, committed by the cache, and
//! never mutated afterwards. Consumers (REST, GraphQL, CLI, diffing) only
//! ever see these types.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use async_graphql::{ComplexObject, Enum, SimpleObject};
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

// ── Routes ─────────────────────────────────────────────────

/// An IP prefix held in canonical form: host bits cleared, so two spellings
/// of the same route compare equal (`192.168.1.5/24` == `192.168.1.0/24`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Cidr(IpNet);

async_graphql::scalar!(Cidr);

impl Cidr {
    /// Canonicalize a prefix. Idempotent: truncating a truncated net is a
    /// no-op.
    pub fn new(net: IpNet) -> Self {
        Cidr(net.trunc())
    }

    pub fn is_ipv4(&self) -> bool {
        matches!(self.0, IpNet::V4(_))
    }

    pub fn prefix_len(&self) -> u8 {
        self.0.prefix_len()
    }

    /// The all-traffic route for its family: `0.0.0.0/0` or `::/0`.
    pub fn is_default_route(&self) -> bool {
        self.prefix_len() == 0
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Cidr {
    type Err = ipnet::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<IpNet>().map(Cidr::new)
    }
}

impl<'de> Deserialize<'de> for Cidr {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        IpNet::deserialize(deserializer).map(Cidr::new)
    }
}

// ── Derived enums ──────────────────────────────────────────

/// Exit-node offering state, derived from two underlying agent fields and
/// never collapsed to a boolean:
/// - `disabled`: the device does not offer itself as an exit node.
/// - `pending`: offered, but the default routes are not approved yet.
/// - `active`: offered and both `0.0.0.0/0` and `::/0` are allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Enum)]
#[serde(rename_all = "snake_case")]
pub enum ExitNodeStatus {
    Disabled,
    Pending,
    Active,
}

impl ExitNodeStatus {
    pub fn classify(exit_node_option: bool, allowed_routes: &BTreeSet<Cidr>) -> Self {
        if !exit_node_option {
            return ExitNodeStatus::Disabled;
        }
        let v4_default = allowed_routes
            .iter()
            .any(|c| c.is_ipv4() && c.is_default_route());
        let v6_default = allowed_routes
            .iter()
            .any(|c| !c.is_ipv4() && c.is_default_route());
        if v4_default && v6_default {
            ExitNodeStatus::Active
        } else {
            ExitNodeStatus::Pending
        }
    }
}

/// Where a snapshot's data came from. `local_only` means the agent CLI
/// alone; `augmented` means admin-API fields were merged in as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Enum)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    LocalOnly,
    Augmented,
}

// ── Devices ────────────────────────────────────────────────

/// One device in the tailnet, local agent view plus optional admin-API
/// augmentation. The augmented fields stay `None` in `local_only` mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, SimpleObject)]
pub struct Device {
    /// Stable node id (the admin API's nodeId).
    pub id: String,
    pub hostname: String,
    pub dns_name: String,
    pub os: String,
    /// Overlay addresses in agent order.
    pub addresses: Vec<String>,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    /// Whether the device offers itself as an exit node.
    pub exit_node_capable: bool,
    pub exit_node_status: ExitNodeStatus,
    pub advertised_routes: BTreeSet<Cidr>,
    pub allowed_routes: BTreeSet<Cidr>,
    pub tags: BTreeSet<String>,
    // Admin API augmentation.
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub authorized: Option<bool>,
    #[serde(default)]
    pub update_available: Option<bool>,
    #[serde(default)]
    pub client_version: Option<String>,
}

// ── Snapshot ───────────────────────────────────────────────

/// One immutable view of the tailnet. Created only by the normalizer;
/// generations are strictly increasing across successful refreshes so
/// consumers can order and diff snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, SimpleObject)]
#[graphql(complex)]
pub struct Snapshot {
    #[serde(rename = "self")]
    pub self_device: Device,
    /// Peers keyed by device id; never contains the self device.
    #[graphql(skip)]
    pub peers: BTreeMap<String, Device>,
    pub captured_at: DateTime<Utc>,
    pub source_mode: SourceMode,
    pub generation: u64,
    pub stale: bool,
    pub stale_reason: Option<String>,
    pub agent_version: String,
    pub backend_state: String,
    pub tailnet: Option<String>,
    pub magic_dns_suffix: Option<String>,
    /// Health messages reported by the agent itself.
    pub health: Vec<String>,
}

#[ComplexObject]
impl Snapshot {
    /// Peers ordered by device id.
    async fn peers(&self) -> Vec<&Device> {
        self.peers.values().collect()
    }

    async fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

impl Snapshot {
    /// Mark a snapshot as stale with a reason, for re-serving after a
    /// failed refresh. Device data is untouched.
    pub fn with_stale(mut self, reason: impl Into<String>) -> Self {
        self.stale = true;
        self.stale_reason = Some(reason.into());
        self
    }

    /// Self plus all peers.
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        std::iter::once(&self.self_device).chain(self.peers.values())
    }

    pub fn online_peers(&self) -> usize {
        self.peers.values().filter(|d| d.online).count()
    }

    /// Devices offering themselves as exit nodes (pending or active).
    pub fn exit_nodes(&self) -> Vec<&Device> {
        self.devices()
            .filter(|d| d.exit_node_status != ExitNodeStatus::Disabled)
            .collect()
    }

    /// Aggregate advertised routes across the tailnet: who advertises each
    /// route and whether it is approved (present in the advertiser's
    /// allowed routes).
    pub fn route_summary(&self) -> Vec<RouteAdvertisement> {
        let mut routes: BTreeMap<Cidr, RouteAdvertisement> = BTreeMap::new();
        for device in self.devices() {
            for route in &device.advertised_routes {
                let entry = routes.entry(*route).or_insert_with(|| RouteAdvertisement {
                    route: *route,
                    advertised_by: Vec::new(),
                    approved: false,
                });
                entry.advertised_by.push(DeviceRef {
                    id: device.id.clone(),
                    hostname: device.hostname.clone(),
                });
                if device.allowed_routes.contains(route) {
                    entry.approved = true;
                }
            }
        }
        routes.into_values().collect()
    }
}

/// One advertised route and the devices advertising it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, SimpleObject)]
pub struct RouteAdvertisement {
    pub route: Cidr,
    pub advertised_by: Vec<DeviceRef>,
    /// Whether at least one advertiser has the route approved.
    pub approved: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, SimpleObject)]
pub struct DeviceRef {
    pub id: String,
    pub hostname: String,
}

// ── Daemon health ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Enum)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
    Empty,
    Fresh,
    Stale,
    Refreshing,
}

#[derive(Debug, Clone, Serialize, Deserialize, SimpleObject)]
pub struct AgentInfo {
    pub installed: bool,
    pub binary_path: Option<String>,
    /// Agent version as reported by the most recent snapshot.
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, SimpleObject)]
pub struct CacheHealth {
    pub state: CacheState,
    pub generation: Option<u64>,
    pub captured_at: Option<DateTime<Utc>>,
    pub age_secs: Option<i64>,
    pub source_mode: Option<SourceMode>,
    pub stale: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, SimpleObject)]
pub struct DaemonHealth {
    pub status: String,
    pub version: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub uptime_secs: u64,
    pub agent: AgentInfo,
    pub cache: CacheHealth,
}
