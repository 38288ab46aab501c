//! Error taxonomy for the status pipeline.
//!
//! Core modules (executor, parser, normalizer, cache) return `StatusError`
//! so callers can tell failure classes apart; command-line and server entry
//! points wrap these in `anyhow` with context.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StatusError>;

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("tailscale binary not found; install tailscale or set agent.binary_path")]
    AgentNotFound,

    #[error("agent command `{command}` timed out after {timeout_secs}s")]
    ExecTimeout { command: String, timeout_secs: u64 },

    #[error("agent command `{command}` failed (exit {}): {stderr}", .exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string()))]
    ExecFailure {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("failed to parse {context}: {source}")]
    Parse {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid {kind} `{value}` in agent output")]
    InvalidValue { kind: &'static str, value: String },

    #[error("remote API unreachable: {0}")]
    RemoteUnavailable(String),

    #[error("remote API rejected the configured credential (HTTP {status})")]
    RemoteUnauthorized { status: u16 },

    #[error("refresh timed out after {timeout_secs}s")]
    RefreshTimeout { timeout_secs: u64 },

    #[error("no snapshot available: {reason}")]
    ColdStart { reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl StatusError {
    /// Whether the cache may retry the refresh once before falling back to
    /// stale serving. Parse failures signal a schema mismatch a retry
    /// cannot fix, so they are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StatusError::ExecTimeout { .. }
                | StatusError::ExecFailure { .. }
                | StatusError::Io(_)
        )
    }

    /// Whether this is a parse-class failure (schema mismatch with the
    /// installed agent version). Logged at error level by the cache.
    pub fn is_parse(&self) -> bool {
        matches!(
            self,
            StatusError::Parse { .. } | StatusError::InvalidValue { .. }
        )
    }
}
