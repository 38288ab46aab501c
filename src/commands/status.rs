//! `taildash status` — one-shot tailnet status, served from the daemon
//! cache when one is running, falling back to a direct agent collection.

use anyhow::Result;
use colored::Colorize;

use crate::client::TaildashClient;
use crate::config;
use crate::domain::model::{Device, ExitNodeStatus, Snapshot, SourceMode};
use crate::domain::service::StatusService;

pub fn run(format: &str, fresh: bool) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_async(format, fresh))
}

async fn run_async(format: &str, fresh: bool) -> Result<()> {
    let cfg = config::load(None)?;

    let snapshot = if fresh {
        collect_direct(&cfg).await?
    } else {
        // Prefer the daemon cache; collect directly when no daemon runs.
        match try_daemon_cache(&cfg).await {
            Ok(snapshot) => snapshot,
            Err(_) => collect_direct(&cfg).await?,
        }
    };

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&snapshot)?),
        _ => print_table(&snapshot),
    }
    Ok(())
}

async fn try_daemon_cache(cfg: &config::Config) -> Result<Snapshot> {
    let client = TaildashClient::from_node(None, &cfg.nodes)?;
    client.status().await
}

/// Run the collection pipeline in-process, no daemon required.
async fn collect_direct(cfg: &config::Config) -> Result<Snapshot> {
    let service = StatusService::new(&cfg.daemon)?;
    Ok(service.collect_once().await?)
}

fn print_table(snapshot: &Snapshot) {
    println!("{}", "═══ Tailnet Status ═══".cyan().bold());
    println!("  Hostname:   {}", snapshot.self_device.hostname.bold());
    let backend = if snapshot.backend_state == "Running" {
        snapshot.backend_state.green().to_string()
    } else {
        snapshot.backend_state.yellow().to_string()
    };
    println!("  Backend:    {}", backend);
    if let Some(ref tailnet) = snapshot.tailnet {
        println!("  Tailnet:    {}", tailnet);
    }
    if let Some(ref suffix) = snapshot.magic_dns_suffix {
        println!("  MagicDNS:   {}", suffix);
    }
    println!("  Agent:      {}", snapshot.agent_version);
    println!(
        "  Mode:       {}",
        match snapshot.source_mode {
            SourceMode::LocalOnly => "local-only",
            SourceMode::Augmented => "augmented",
        }
    );
    if snapshot.generation > 0 {
        println!("  Generation: {}", snapshot.generation);
    }
    if snapshot.stale {
        println!(
            "  {} {}",
            "STALE:".red().bold(),
            snapshot.stale_reason.as_deref().unwrap_or("refresh failing")
        );
    }

    if !snapshot.health.is_empty() {
        println!();
        println!("{}", "── Health ──".yellow());
        for message in &snapshot.health {
            println!("  {} {}", "!".red(), message);
        }
    }

    println!();
    println!("{}", "── Self ──".yellow());
    print_device(&snapshot.self_device);

    println!();
    println!(
        "{}",
        format!(
            "── Peers ({}, {} online) ──",
            snapshot.peers.len(),
            snapshot.online_peers()
        )
        .yellow()
    );
    for peer in snapshot.peers.values() {
        print_device(peer);
    }

    let routes = snapshot.route_summary();
    if !routes.is_empty() {
        println!();
        println!("{}", "── Subnet Routes ──".yellow());
        for route in &routes {
            let advertisers: Vec<&str> = route
                .advertised_by
                .iter()
                .map(|d| d.hostname.as_str())
                .collect();
            let mark = if route.approved {
                "approved".green().to_string()
            } else {
                "awaiting approval".yellow().to_string()
            };
            println!(
                "  {:<20} {}  via {}",
                route.route.to_string(),
                mark,
                advertisers.join(", ")
            );
        }
    }

    println!();
    println!(
        "{} {}",
        "Captured at:".dimmed(),
        snapshot.captured_at.to_rfc3339()
    );
}

fn print_device(device: &Device) {
    let state = if device.online {
        "online".green().to_string()
    } else {
        "offline".dimmed().to_string()
    };
    println!("  {} ({})", device.hostname.bold(), state);
    if !device.addresses.is_empty() {
        println!("    Addresses:  {}", device.addresses.join(", "));
    }
    if !device.dns_name.is_empty() {
        println!("    DNS:        {}", device.dns_name);
    }
    println!("    OS:         {}", device.os);
    if let Some(last_seen) = device.last_seen {
        if !device.online {
            println!("    Last Seen:  {}", fmt_ago(last_seen));
        }
    }
    if !device.tags.is_empty() {
        let tags: Vec<&str> = device.tags.iter().map(String::as_str).collect();
        println!("    Tags:       {}", tags.join(", "));
    }
    match device.exit_node_status {
        ExitNodeStatus::Active => println!("    Exit Node:  {}", "active".green()),
        ExitNodeStatus::Pending => {
            println!("    Exit Node:  {}", "awaiting approval".yellow())
        }
        ExitNodeStatus::Disabled => {}
    }
    if !device.advertised_routes.is_empty() {
        let routes: Vec<String> = device
            .advertised_routes
            .iter()
            .map(|r| r.to_string())
            .collect();
        println!("    Routes:     {}", routes.join(", "));
    }
    if let Some(ref owner) = device.owner {
        println!("    Owner:      {}", owner);
    }
    if device.update_available == Some(true) {
        println!("    Update:     {}", "available".yellow());
    }
}

fn fmt_ago(ts: chrono::DateTime<chrono::Utc>) -> String {
    let secs = chrono::Utc::now()
        .signed_duration_since(ts)
        .num_seconds()
        .max(0);
    let days = secs / 86400;
    let hours = (secs % 86400) / 3600;
    let mins = (secs % 3600) / 60;
    if days > 0 {
        format!("{}d ago", days)
    } else if hours > 0 {
        format!("{}h ago", hours)
    } else if mins > 0 {
        format!("{}m ago", mins)
    } else {
        "just now".to_string()
    }
}
