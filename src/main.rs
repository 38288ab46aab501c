mod agent;
mod api;
mod client;
mod commands;
mod config;
mod domain;
mod error;
mod refresher;
mod remote;
mod server;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "taildash",
    version,
    about = "Self-hosted tailnet status daemon and CLI"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the taildash daemon (REST + GraphQL)
    Daemon {
        /// HTTP listen address (overrides config)
        #[arg(long)]
        http_addr: Option<String>,

        /// Log level (overrides config)
        #[arg(long)]
        log_level: Option<String>,

        /// Path to config file (default: ~/.config/taildash/config.toml)
        #[arg(long)]
        config: Option<String>,
    },

    /// Show tailnet status (daemon cache or direct collection)
    Status {
        /// Output format (table or json)
        #[arg(long, default_value = "table")]
        format: String,

        /// Bypass the daemon cache and collect directly from the agent
        #[arg(long)]
        fresh: bool,
    },

    /// Check that the tailscale agent and daemon are usable
    Check {
        /// Required agent version (semver range, e.g. ">=1.80")
        #[arg(long)]
        version: Option<String>,
    },

    /// Query a taildash daemon's REST API
    Query {
        /// Target node name (from config nodes map; defaults to localhost)
        #[arg(long, global = true)]
        node: Option<String>,

        /// Output format (table or json)
        #[arg(long, global = true, default_value = "table")]
        format: String,

        #[command(subcommand)]
        command: commands::query::QueryCommands,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon {
            http_addr,
            log_level,
            config,
        } => commands::daemon::run(http_addr, log_level, config),
        Commands::Status { format, fresh } => commands::status::run(&format, fresh),
        Commands::Check { version } => {
            let required = version
                .map(|v| v.parse::<semver::VersionReq>())
                .transpose()?;
            commands::check::run(required)
        }
        Commands::Query {
            node,
            format,
            command,
        } => commands::query::run(node.as_deref(), &format, &command),
    }
}
