//! Agent binary resolution and bounded subprocess execution.
//!
//! The binary path is resolved once at daemon startup, never per call. Each
//! `run` spawns exactly one OS process under a hard timeout; a hung agent
//! is killed, never left running. Retry policy lives in the cache, not
//! here.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Result, StatusError};

/// Result of startup binary resolution.
#[derive(Debug, Clone, Serialize)]
pub struct AgentBinary {
    pub installed: bool,
    pub path: Option<PathBuf>,
}

/// Locate the tailscale binary. A configured path is authoritative;
/// detection (PATH, then well-known install locations) only runs when no
/// path is configured.
pub fn detect(configured: Option<&Path>) -> AgentBinary {
    if let Some(path) = configured {
        return AgentBinary {
            installed: path.is_file(),
            path: Some(path.to_path_buf()),
        };
    }

    if let Some(path) = find_in_path("tailscale") {
        return AgentBinary {
            installed: true,
            path: Some(path),
        };
    }

    let well_known = [
        "/usr/bin/tailscale",
        "/usr/sbin/tailscale",
        "/usr/local/bin/tailscale",
        "/opt/homebrew/bin/tailscale",
        "/Applications/Tailscale.app/Contents/MacOS/Tailscale",
    ];

    for location in &well_known {
        let path = PathBuf::from(location);
        if path.is_file() {
            return AgentBinary {
                installed: true,
                path: Some(path),
            };
        }
    }

    AgentBinary {
        installed: false,
        path: None,
    }
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(name))
            .find(|path| path.is_file())
    })
}

/// Executes agent commands against a resolved binary.
pub struct AgentRunner {
    binary: PathBuf,
    timeout: Duration,
}

impl AgentRunner {
    pub fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self { binary, timeout }
    }

    /// Run the agent with `args`, returning stdout on success.
    ///
    /// Exactly one process per call. On timeout the unfinished future is
    /// dropped, which hard-kills the child via `kill_on_drop`.
    pub async fn run(&self, args: &[&str]) -> Result<Vec<u8>> {
        let command = format!("{} {}", self.binary.display(), args.join(" "));
        debug!(command = %command, "running agent command");

        let child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(StatusError::ExecTimeout {
                    command,
                    timeout_secs: self.timeout.as_secs(),
                });
            }
        };

        if !output.status.success() {
            return Err(StatusError::ExecFailure {
                command,
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(output.stdout)
    }

    /// The status pipeline's data source.
    pub async fn status_json(&self) -> Result<Vec<u8>> {
        self.run(&["status", "--json"]).await
    }

    /// First line of `tailscale version`, e.g. "1.86.2".
    pub async fn version(&self) -> Result<String> {
        let stdout = self.run(&["version"]).await?;
        let text = String::from_utf8_lossy(&stdout);
        Ok(text.lines().next().unwrap_or_default().trim().to_string())
    }
}
