//! Raw wire structures: `tailscale status --json` (ipnstate) and the admin
//! API devices payload.
//!
//! Deserialization is schema-validated and fails closed: a document missing
//! `Self` or a node missing its `ID` is a `ParseError`, never a partially
//! filled struct. Collection fields accept `null` because the agent is a Go
//! program and nil slices marshal as `null`. Unknown fields are ignored so
//! newer agent versions keep parsing.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::{Result, StatusError};

// ── Agent CLI output ───────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawStatus {
    pub version: String,
    #[serde(default)]
    pub backend_state: String,
    #[serde(rename = "Self")]
    pub self_node: RawNode,
    #[serde(rename = "MagicDNSSuffix", default)]
    pub magic_dns_suffix: String,
    #[serde(default)]
    pub current_tailnet: Option<RawTailnet>,
    #[serde(default)]
    pub health: Option<Vec<String>>,
    /// Keyed by node public key in the agent output; re-keyed by device id
    /// during normalization.
    #[serde(default)]
    pub peer: Option<BTreeMap<String, RawNode>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawTailnet {
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawNode {
    #[serde(rename = "ID")]
    pub id: String,
    pub host_name: String,
    #[serde(rename = "DNSName", default)]
    pub dns_name: String,
    #[serde(rename = "OS", default)]
    pub os: String,
    #[serde(rename = "TailscaleIPs", default)]
    pub tailscale_ips: Option<Vec<String>>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    /// Subnet routes this node currently serves.
    #[serde(default)]
    pub primary_routes: Option<Vec<String>>,
    /// Every prefix the tailnet will route to this node: its own addresses,
    /// approved subnet routes, and the default routes when it is an active
    /// exit node.
    #[serde(rename = "AllowedIPs", default)]
    pub allowed_ips: Option<Vec<String>>,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_node_option: bool,
}

/// Parse the agent's status document. Fails closed on schema mismatch.
pub fn parse_status(bytes: &[u8]) -> Result<RawStatus> {
    serde_json::from_slice(bytes).map_err(|source| StatusError::Parse {
        context: "agent status output",
        source,
    })
}

// ── Admin API payload ──────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RawApiDevices {
    #[serde(default)]
    pub devices: Vec<RawApiDevice>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawApiDevice {
    pub node_id: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub client_version: String,
    #[serde(default)]
    pub update_available: bool,
    #[serde(default)]
    pub authorized: bool,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    /// Routes the device asks to advertise, per the admin panel.
    #[serde(default)]
    pub advertised_routes: Option<Vec<String>>,
}

/// Parse the `GET /api/v2/tailnet/{tailnet}/devices` response body.
pub fn parse_api_devices(bytes: &[u8]) -> Result<Vec<RawApiDevice>> {
    let payload: RawApiDevices =
        serde_json::from_slice(bytes).map_err(|source| StatusError::Parse {
            context: "admin API devices response",
            source,
        })?;
    Ok(payload.devices)
}

/// Realistic agent document shared by parser, normalizer, and service
/// tests.
#[cfg(test)]
pub(crate) const STATUS_FIXTURE: &str = r#"{
        "Version": "1.86.2",
        "TUN": true,
        "BackendState": "Running",
        "HaveNodeKey": true,
        "AuthURL": "",
        "TailscaleIPs": ["100.64.0.1", "fd7a:115c:a1e0::1"],
        "Self": {
            "ID": "nTEST1self",
            "PublicKey": "nodekey:aa11",
            "HostName": "workstation",
            "DNSName": "workstation.tail1234.ts.net.",
            "OS": "linux",
            "UserID": 1001,
            "TailscaleIPs": ["100.64.0.1", "fd7a:115c:a1e0::1"],
            "AllowedIPs": ["100.64.0.1/32", "fd7a:115c:a1e0::1/128"],
            "Online": true,
            "ExitNode": false,
            "ExitNodeOption": false,
            "Capabilities": ["https://tailscale.com/cap/is-admin"]
        },
        "Health": [],
        "MagicDNSSuffix": "tail1234.ts.net",
        "CurrentTailnet": {
            "Name": "example.com",
            "MagicDNSSuffix": "tail1234.ts.net",
            "MagicDNSEnabled": true
        },
        "Peer": {
            "nodekey:bb22": {
                "ID": "nTEST2gw",
                "PublicKey": "nodekey:bb22",
                "HostName": "gateway",
                "DNSName": "gateway.tail1234.ts.net.",
                "OS": "linux",
                "TailscaleIPs": ["100.64.0.2"],
                "Tags": ["tag:infra"],
                "PrimaryRoutes": ["10.0.0.0/24"],
                "AllowedIPs": ["100.64.0.2/32", "10.0.0.0/24", "0.0.0.0/0", "::/0"],
                "Online": true,
                "LastSeen": "2024-11-02T09:30:00Z",
                "ExitNode": false,
                "ExitNodeOption": true
            },
            "nodekey:cc33": {
                "ID": "nTEST3lap",
                "PublicKey": "nodekey:cc33",
                "HostName": "laptop",
                "DNSName": "laptop.tail1234.ts.net.",
                "OS": "macOS",
                "TailscaleIPs": ["100.64.0.3"],
                "AllowedIPs": ["100.64.0.3/32"],
                "Online": false,
                "LastSeen": "0001-01-01T00:00:00Z",
                "ExitNode": false,
                "ExitNodeOption": false
            }
        }
    }"#;
