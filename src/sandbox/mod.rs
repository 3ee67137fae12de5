//! Isolated execution of source units.
//!
//! Provides container-based isolation with resource limits, network
//! revocation and guaranteed cleanup of every provisioned sandbox.

mod docker;
mod error;
mod language;
#[cfg(test)]
pub(crate) mod mock;

pub use docker::DockerSandbox;
pub use error::SandboxError;
pub use language::RuntimeStrategy;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::model::{ExecutionResult, RuntimeSpec, SourceUnit};

/// An isolation backend able to run one source unit per call.
///
/// Implementations provision a fresh sandbox for every `execute` call and
/// release it before returning, on every path.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Returns the backend name for display.
    fn name(&self) -> &'static str;

    /// Checks that the backend is reachable.
    async fn ping(&self) -> Result<(), SandboxError>;

    /// Removes sandboxes left behind by earlier runs. Returns how many were removed.
    async fn cleanup_orphaned(&self) -> Result<u32, SandboxError>;

    /// Executes a unit's current content.
    ///
    /// Code failures, including timeouts, are reported through the returned
    /// `ExecutionResult`. `Err` is reserved for backend failures and
    /// cancellation.
    async fn execute(
        &self,
        unit: &SourceUnit,
        spec: &RuntimeSpec,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, SandboxError>;
}
