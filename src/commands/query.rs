//! `taildash query` — query a taildash daemon via its REST API.

use anyhow::Result;
use clap::Subcommand;

use crate::client::TaildashClient;
use crate::config;

#[derive(Subcommand)]
pub enum QueryCommands {
    /// Daemon health check
    Health,
    /// Full tailnet snapshot
    Status,
    /// This daemon's own device
    #[command(name = "self")]
    SelfInfo,
    /// All peer devices
    Peers,
    /// One peer by stable node id
    Peer {
        /// Stable node id, e.g. nA1B2C3D4
        id: String,
    },
    /// Subnet routes advertised across the tailnet
    Routes,
    /// Devices offering themselves as exit nodes
    ExitNodes,
    /// Force a cache refresh and print the result
    Refresh,
    /// Drop cache freshness
    Invalidate,
}

pub fn run(node: Option<&str>, format: &str, command: &QueryCommands) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_async(node, format, command))
}

async fn run_async(node: Option<&str>, format: &str, command: &QueryCommands) -> Result<()> {
    let cfg = config::load(None)?;
    let client = TaildashClient::from_node(node, &cfg.nodes)?;

    match command {
        QueryCommands::Health => {
            let data = client.health().await?;
            print_output(format, &data)
        }
        QueryCommands::Status => {
            let data = client.status().await?;
            print_output(format, &data)
        }
        QueryCommands::SelfInfo => {
            let data = client.self_device().await?;
            print_output(format, &data)
        }
        QueryCommands::Peers => {
            let data = client.peers().await?;
            print_output(format, &data)
        }
        QueryCommands::Peer { id } => {
            let data = client.peer(id).await?;
            print_output(format, &data)
        }
        QueryCommands::Routes => {
            let data = client.routes().await?;
            print_output(format, &data)
        }
        QueryCommands::ExitNodes => {
            let data = client.exit_nodes().await?;
            print_output(format, &data)
        }
        QueryCommands::Refresh => {
            let data = client.refresh().await?;
            print_output(format, &data)
        }
        QueryCommands::Invalidate => {
            client.invalidate().await?;
            println!("cache invalidated");
            Ok(())
        }
    }
}

fn print_output<T: serde::Serialize>(format: &str, data: &T) -> Result<()> {
    match format {
        "json" => {
            let json = serde_json::to_string_pretty(data)?;
            println!("{}", json);
        }
        _ => {
            // Table format: recursive key-value from serde_json::Value
            let value = serde_json::to_value(data)?;
            print_value(&value, 0);
        }
    }
    Ok(())
}

fn print_value(value: &serde_json::Value, indent: usize) {
    let pad = "  ".repeat(indent);
    match value {
        serde_json::Value::Object(map) => {
            for (key, val) in map {
                match val {
                    serde_json::Value::Object(_) => {
                        println!("{}{}:", pad, key);
                        print_value(val, indent + 1);
                    }
                    serde_json::Value::Array(arr) => {
                        if arr.is_empty() {
                            println!("{}{}: []", pad, key);
                        } else if arr.iter().all(|v| !v.is_object() && !v.is_array()) {
                            // Simple array: print inline
                            let items: Vec<String> =
                                arr.iter().map(|v| format_scalar(v)).collect();
                            println!("{}{}: {}", pad, key, items.join(", "));
                        } else {
                            println!("{}{}:", pad, key);
                            for (i, item) in arr.iter().enumerate() {
                                if item.is_object() {
                                    println!("{}  [{}]:", pad, i);
                                    print_value(item, indent + 2);
                                } else {
                                    println!("{}  - {}", pad, format_scalar(item));
                                }
                            }
                        }
                    }
                    _ => {
                        println!("{}{}: {}", pad, key, format_scalar(val));
                    }
                }
            }
        }
        serde_json::Value::Array(arr) => {
            for (i, item) in arr.iter().enumerate() {
                if item.is_object() {
                    println!("{}[{}]:", pad, i);
                    print_value(item, indent + 1);
                } else {
                    println!("{}- {}", pad, format_scalar(item));
                }
            }
        }
        _ => {
            println!("{}{}", pad, format_scalar(value));
        }
    }
}

fn format_scalar(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => "null".to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}
