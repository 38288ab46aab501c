//! Normalizer: raw agent/API structures → canonical `Snapshot`.
//!
//! Local agent output is load-bearing, so malformed addresses or routes
//! fail closed. Admin-API values are additive only; malformed entries are
//! skipped with a warning instead of poisoning the snapshot.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;

use chrono::Utc;
use tracing::warn;

use crate::error::{Result, StatusError};

use super::model::{Cidr, Device, ExitNodeStatus, Snapshot, SourceMode};
use super::raw::{RawApiDevice, RawNode, RawStatus};

/// Build a `local_only` snapshot from the agent's status document. The
/// generation is assigned by the cache when it installs the refresh.
pub fn normalize(raw: RawStatus, generation: u64) -> Result<Snapshot> {
    let self_device = normalize_node(&raw.self_node)?;

    let mut peers = BTreeMap::new();
    for node in raw.peer.unwrap_or_default().values() {
        let device = normalize_node(node)?;
        // The agent can list the local node among peers in some states.
        if device.id == self_device.id {
            continue;
        }
        peers.insert(device.id.clone(), device);
    }

    Ok(Snapshot {
        self_device,
        peers,
        captured_at: Utc::now(),
        source_mode: SourceMode::LocalOnly,
        generation,
        stale: false,
        stale_reason: None,
        agent_version: raw.version,
        backend_state: raw.backend_state,
        tailnet: raw.current_tailnet.map(|t| t.name),
        magic_dns_suffix: none_if_empty(raw.magic_dns_suffix),
        health: raw.health.unwrap_or_default(),
    })
}

fn normalize_node(raw: &RawNode) -> Result<Device> {
    let mut addresses = Vec::new();
    for addr in raw.tailscale_ips.as_deref().unwrap_or_default() {
        if addr.parse::<IpAddr>().is_err() {
            return Err(StatusError::InvalidValue {
                kind: "address",
                value: addr.clone(),
            });
        }
        addresses.push(addr.clone());
    }

    let advertised_routes = canon_routes(raw.primary_routes.as_deref().unwrap_or_default())?;
    let allowed_routes = canon_routes(raw.allowed_ips.as_deref().unwrap_or_default())?;
    let exit_node_status = ExitNodeStatus::classify(raw.exit_node_option, &allowed_routes);

    Ok(Device {
        id: raw.id.clone(),
        hostname: raw.host_name.clone(),
        dns_name: raw.dns_name.trim_end_matches('.').to_string(),
        os: raw.os.clone(),
        addresses,
        online: raw.online,
        // The agent reports never-seen as its zero timestamp.
        last_seen: raw.last_seen.filter(|ts| ts.timestamp() > 0),
        exit_node_capable: raw.exit_node_option,
        exit_node_status,
        advertised_routes,
        allowed_routes,
        tags: raw
            .tags
            .as_deref()
            .unwrap_or_default()
            .iter()
            .cloned()
            .collect(),
        owner: None,
        authorized: None,
        update_available: None,
        client_version: None,
    })
}

/// Parse and canonicalize a route list. Dedup falls out of the set: two
/// spellings of one route truncate to the same prefix.
fn canon_routes(specs: &[String]) -> Result<BTreeSet<Cidr>> {
    let mut routes = BTreeSet::new();
    for spec in specs {
        let cidr = spec.parse::<Cidr>().map_err(|_| StatusError::InvalidValue {
            kind: "route",
            value: spec.clone(),
        })?;
        routes.insert(cidr);
    }
    Ok(routes)
}

fn none_if_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Merge admin-API devices into a local snapshot, joined by node id.
///
/// Strictly additive: fills the augmentation-only fields and unions
/// admin-advertised routes and tags. `allowed_routes` and the exit-node
/// fields come from local data only; augmentation never touches them.
pub fn merge_remote(mut snapshot: Snapshot, devices: Vec<RawApiDevice>) -> Snapshot {
    let by_id: HashMap<&str, &RawApiDevice> = devices
        .iter()
        .map(|d| (d.node_id.as_str(), d))
        .collect();

    if let Some(api) = by_id.get(snapshot.self_device.id.as_str()) {
        apply_api_fields(&mut snapshot.self_device, api);
    }
    for peer in snapshot.peers.values_mut() {
        if let Some(api) = by_id.get(peer.id.as_str()) {
            apply_api_fields(peer, api);
        }
    }

    snapshot.source_mode = SourceMode::Augmented;
    snapshot
}

fn apply_api_fields(device: &mut Device, api: &RawApiDevice) {
    if !api.user.is_empty() {
        device.owner = Some(api.user.clone());
    }
    device.authorized = Some(api.authorized);
    device.update_available = Some(api.update_available);
    if !api.client_version.is_empty() {
        device.client_version = Some(api.client_version.clone());
    }

    for tag in api.tags.as_deref().unwrap_or_default() {
        device.tags.insert(tag.clone());
    }

    for spec in api.advertised_routes.as_deref().unwrap_or_default() {
        match spec.parse::<Cidr>() {
            Ok(cidr) => {
                device.advertised_routes.insert(cidr);
            }
            Err(_) => {
                warn!(
                    route = %spec,
                    device = %device.id,
                    "skipping malformed route from admin API"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::raw::{parse_status, STATUS_FIXTURE};

    fn fixture_snapshot() -> Snapshot {
        let raw = parse_status(STATUS_FIXTURE.as_bytes()).unwrap();
        normalize(raw, 1).unwrap()
    }

    #[test]
    fn normalizes_the_full_document() {
        let snapshot = fixture_snapshot();

        assert_eq!(snapshot.generation, 1);
        assert_eq!(snapshot.source_mode, SourceMode::LocalOnly);
        assert!(!snapshot.stale);
        assert_eq!(snapshot.agent_version, "1.86.2");
        assert_eq!(snapshot.backend_state, "Running");
        assert_eq!(snapshot.tailnet.as_deref(), Some("example.com"));
        assert_eq!(snapshot.magic_dns_suffix.as_deref(), Some("tail1234.ts.net"));

        assert_eq!(snapshot.self_device.id, "nTEST1self");
        // Trailing dot trimmed from the MagicDNS name.
        assert_eq!(snapshot.self_device.dns_name, "workstation.tail1234.ts.net");
        assert_eq!(snapshot.peers.len(), 2);
        assert!(snapshot.peers.contains_key("nTEST2gw"));
        assert!(snapshot.peers.contains_key("nTEST3lap"));
    }

    #[test]
    fn peers_never_contain_self() {
        let doc = r#"{
            "Version": "1.86.2",
            "Self": {"ID": "nDUP", "HostName": "workstation"},
            "Peer": {
                "nodekey:dd44": {"ID": "nDUP", "HostName": "workstation"},
                "nodekey:ee55": {"ID": "nOTHER", "HostName": "other"}
            }
        }"#;
        let snapshot = normalize(parse_status(doc.as_bytes()).unwrap(), 7).unwrap();
        assert_eq!(snapshot.peers.len(), 1);
        assert!(!snapshot.peers.contains_key("nDUP"));
    }

    #[test]
    fn classifies_exit_nodes_from_allowed_routes() {
        let snapshot = fixture_snapshot();
        // Gateway offers the option and has both default routes allowed.
        assert_eq!(
            snapshot.peers["nTEST2gw"].exit_node_status,
            ExitNodeStatus::Active
        );
        assert!(snapshot.peers["nTEST2gw"].exit_node_capable);
        // Laptop neither offers nor routes.
        assert_eq!(
            snapshot.peers["nTEST3lap"].exit_node_status,
            ExitNodeStatus::Disabled
        );
        // Exit-node list: gateway only.
        let exit_ids: Vec<&str> = snapshot.exit_nodes().iter().map(|d| d.id.as_str()).collect();
        assert_eq!(exit_ids, vec!["nTEST2gw"]);
    }

    #[test]
    fn pending_when_default_routes_not_yet_allowed() {
        let doc = r#"{
            "Version": "1.86.2",
            "Self": {"ID": "nSELF", "HostName": "ws"},
            "Peer": {
                "nodekey:ff66": {
                    "ID": "nWAIT",
                    "HostName": "wannabe-exit",
                    "AllowedIPs": ["100.64.0.9/32"],
                    "ExitNodeOption": true
                }
            }
        }"#;
        let snapshot = normalize(parse_status(doc.as_bytes()).unwrap(), 1).unwrap();
        assert_eq!(
            snapshot.peers["nWAIT"].exit_node_status,
            ExitNodeStatus::Pending
        );
    }

    #[test]
    fn routes_are_canonicalized_before_dedup() {
        let doc = r#"{
            "Version": "1.86.2",
            "Self": {
                "ID": "nSELF",
                "HostName": "ws",
                "PrimaryRoutes": ["192.168.1.5/24", "192.168.1.0/24", "10.0.0.0/8"]
            }
        }"#;
        let snapshot = normalize(parse_status(doc.as_bytes()).unwrap(), 1).unwrap();
        let advertised = &snapshot.self_device.advertised_routes;
        // Both spellings collapse to one canonical route.
        assert_eq!(advertised.len(), 2);
        assert!(advertised.contains(&"192.168.1.0/24".parse().unwrap()));
    }

    #[test]
    fn zero_timestamp_means_never_seen() {
        let snapshot = fixture_snapshot();
        assert!(snapshot.peers["nTEST2gw"].last_seen.is_some());
        assert!(snapshot.peers["nTEST3lap"].last_seen.is_none());
    }

    #[test]
    fn malformed_local_route_fails_closed() {
        let doc = r#"{
            "Version": "1.86.2",
            "Self": {"ID": "nSELF", "HostName": "ws", "AllowedIPs": ["not-a-route"]}
        }"#;
        let err = normalize(parse_status(doc.as_bytes()).unwrap(), 1).unwrap_err();
        assert!(err.is_parse());
    }

    #[test]
    fn malformed_local_address_fails_closed() {
        let doc = r#"{
            "Version": "1.86.2",
            "Self": {"ID": "nSELF", "HostName": "ws", "TailscaleIPs": ["100.64.0.999"]}
        }"#;
        assert!(normalize(parse_status(doc.as_bytes()).unwrap(), 1).is_err());
    }

    #[test]
    fn merge_fills_augmented_fields_only() {
        let local = fixture_snapshot();
        let api = vec![RawApiDevice {
            node_id: "nTEST2gw".to_string(),
            user: "ops@example.com".to_string(),
            client_version: "1.86.2".to_string(),
            update_available: true,
            authorized: true,
            tags: Some(vec!["tag:prod".to_string()]),
            advertised_routes: Some(vec![
                "10.0.0.0/24".to_string(),
                "10.1.0.0/24".to_string(),
                "garbage-route".to_string(),
            ]),
        }];

        let merged = merge_remote(local.clone(), api);
        assert_eq!(merged.source_mode, SourceMode::Augmented);

        let gw_before = &local.peers["nTEST2gw"];
        let gw = &merged.peers["nTEST2gw"];
        assert_eq!(gw.owner.as_deref(), Some("ops@example.com"));
        assert_eq!(gw.authorized, Some(true));
        assert_eq!(gw.update_available, Some(true));
        assert_eq!(gw.client_version.as_deref(), Some("1.86.2"));
        // Tag and route unions are additive; the malformed route is skipped.
        assert!(gw.tags.contains("tag:infra"));
        assert!(gw.tags.contains("tag:prod"));
        assert!(gw.advertised_routes.contains(&"10.1.0.0/24".parse().unwrap()));
        // Local-only fields are untouched by the merge.
        assert_eq!(gw.allowed_routes, gw_before.allowed_routes);
        assert_eq!(gw.exit_node_status, gw_before.exit_node_status);
        assert_eq!(gw.addresses, gw_before.addresses);
        assert_eq!(gw.online, gw_before.online);
        assert_eq!(gw.last_seen, gw_before.last_seen);

        // Devices absent from the API payload are left fully local.
        assert_eq!(merged.peers["nTEST3lap"].owner, None);
        assert_eq!(merged.peers["nTEST3lap"], local.peers["nTEST3lap"]);
    }

    #[test]
    fn route_summary_reports_approval() {
        let snapshot = fixture_snapshot();
        let summary = snapshot.route_summary();
        // Only the gateway advertises a subnet route in the fixture.
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].route, "10.0.0.0/24".parse().unwrap());
        assert_eq!(summary[0].advertised_by.len(), 1);
        assert_eq!(summary[0].advertised_by[0].hostname, "gateway");
        assert!(summary[0].approved);
    }
}
