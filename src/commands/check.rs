//! `taildash check` — verify the tailscale agent and daemon are usable.

use anyhow::Result;
use colored::Colorize;

use crate::agent::{self, AgentRunner};
use crate::client::TaildashClient;
use crate::config;
use crate::domain::model::DaemonHealth;

pub fn run(required_version: Option<semver::VersionReq>) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_async(required_version))
}

async fn run_async(required_version: Option<semver::VersionReq>) -> Result<()> {
    let cfg = config::load(None)?;
    let binary = agent::detect(cfg.daemon.agent.binary_path.as_deref());

    println!("{}", "taildash check".bold());

    let Some(path) = binary.path.clone().filter(|_| binary.installed) else {
        println!("  agent:    {}", "not installed".red());
        println!("  hint:     install tailscale, or set daemon.agent.binary_path");
        std::process::exit(1);
    };

    println!("  agent:    {}", "installed".green());
    println!("  path:     {}", path.display());

    let runner = AgentRunner::new(
        path,
        std::time::Duration::from_secs(cfg.daemon.agent.timeout_secs),
    );
    let version = match runner.version().await {
        Ok(v) => {
            println!("  version:  {}", v);
            Some(v)
        }
        Err(e) => {
            println!("  version:  {} ({})", "unknown".yellow(), e);
            None
        }
    };

    if let Some(required) = &required_version {
        match evaluate_requirement(required, version.as_deref()) {
            Ok(actual) => {
                println!("  required: {} (have {})", "satisfied".green(), actual);
            }
            Err(reason) => {
                println!("  required: {} ({})", "not satisfied".red(), reason);
                std::process::exit(2);
            }
        }
    }

    match daemon_health(&cfg).await {
        Ok(health) => {
            println!(
                "  daemon:   {} (v{}, cache {})",
                "running".green(),
                health.version,
                format!("{:?}", health.cache.state).to_lowercase()
            );
        }
        Err(_) => println!("  daemon:   {}", "not running".dimmed()),
    }

    Ok(())
}

async fn daemon_health(cfg: &config::Config) -> Result<DaemonHealth> {
    TaildashClient::from_node(None, &cfg.nodes)?.health().await
}

/// Evaluate the agent version against a semver range. `Err` carries the
/// text for the failure row.
fn evaluate_requirement(
    required: &semver::VersionReq,
    version: Option<&str>,
) -> std::result::Result<semver::Version, String> {
    match version.map(semver::Version::parse) {
        Some(Ok(actual)) if required.matches(&actual) => Ok(actual),
        Some(Ok(actual)) => Err(format!("need {required}, have {actual}")),
        _ => Err("agent version unreadable".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_gate_uses_range_semantics() {
        let req: semver::VersionReq = ">=1.80".parse().unwrap();
        assert!(evaluate_requirement(&req, Some("1.86.2")).is_ok());
        let reason = evaluate_requirement(&req, Some("1.79.0")).unwrap_err();
        assert!(reason.contains("need >=1.80"));

        // A bare version is a caret range, as cargo reads them.
        let caret: semver::VersionReq = "1.80".parse().unwrap();
        assert!(evaluate_requirement(&caret, Some("1.86.2")).is_ok());
    }

    #[test]
    fn unreadable_agent_version_never_satisfies() {
        let req: semver::VersionReq = ">=1.80".parse().unwrap();
        assert!(evaluate_requirement(&req, None).is_err());
        assert!(evaluate_requirement(&req, Some("not-a-version")).is_err());
    }
}
