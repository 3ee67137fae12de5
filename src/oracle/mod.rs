//! Repair oracles: external authorities that propose fixed file contents.
//!
//! Two backends are provided:
//! - HTTP: an OpenAI-compatible chat completions endpoint
//! - Command: an agent CLI that reads the prompt on stdin (e.g. `claude -p`)
//!
//! The backend is selected via `[oracle].provider` in mender.toml. Callers
//! never talk to a backend directly; they go through [`RepairClient`], which
//! adds the timeout and retry policy.

mod client;
mod command;
mod error;
mod http;
#[cfg(test)]
pub(crate) mod mock;
mod prompt;

pub use client::RepairClient;
pub use command::CommandOracle;
pub use error::OracleError;
pub use http::HttpOracle;
pub use prompt::{build_prompt, extract_code, SYSTEM_PROMPT};

use async_trait::async_trait;

use crate::model::{ErrorCategory, ExecutionResult, SourceUnit};

/// Everything an oracle gets to see about a failure.
#[derive(Debug, Clone, Copy)]
pub struct FixRequest<'a> {
    /// The unit as it was executed.
    pub unit: &'a SourceUnit,
    /// Classified failure.
    pub category: ErrorCategory,
    /// The failing execution.
    pub result: &'a ExecutionResult,
}

/// Trait for repair oracle backends.
///
/// Oracles are stateless per call and may answer identical requests
/// differently.
#[async_trait]
pub trait RepairOracle: Send + Sync {
    /// Returns the backend name for display.
    fn name(&self) -> &'static str;

    /// Proposes revised contents for the unit. `Ok(None)` means the oracle declined.
    async fn propose_fix(&self, request: &FixRequest<'_>) -> Result<Option<String>, OracleError>;
}

/// Supported oracle backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Provider {
    /// OpenAI-compatible HTTP endpoint.
    #[default]
    Http,
    /// Agent CLI fed through stdin.
    Command,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Command => write!(f, "command"),
        }
    }
}

impl std::str::FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "command" | "cli" => Ok(Self::Command),
            _ => anyhow::bail!("Unknown oracle provider: '{s}'. Supported: http, command"),
        }
    }
}
