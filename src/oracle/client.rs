//! Timeout and retry policy around a repair oracle.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{FixRequest, RepairOracle};
use crate::model::{ErrorCategory, ExecutionResult, SourceUnit};

/// Total calls per fix request: the first try plus one retry.
const MAX_CALLS: u32 = 2;

/// Wraps an oracle with a request timeout and a single retry on transient failure.
///
/// Never fails: every definitive error, exhausted retry or refusal comes back
/// as `None`, which the repair loop treats as "no fix available".
#[derive(Clone)]
pub struct RepairClient {
    oracle: Arc<dyn RepairOracle>,
    request_timeout: Duration,
    retry_delay: Duration,
}

impl RepairClient {
    /// Creates a client with the given per-request timeout.
    pub fn new(oracle: Arc<dyn RepairOracle>, request_timeout: Duration) -> Self {
        Self {
            oracle,
            request_timeout,
            retry_delay: Duration::from_secs(1),
        }
    }

    /// Sets the pause before the retry.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Name of the wrapped oracle.
    pub fn oracle_name(&self) -> &'static str {
        self.oracle.name()
    }

    /// Requests a revised version of `unit`. Does not modify the unit.
    pub async fn request_fix(
        &self,
        unit: &SourceUnit,
        category: ErrorCategory,
        result: &ExecutionResult,
    ) -> Option<String> {
        let request = FixRequest {
            unit,
            category,
            result,
        };

        for call in 1..=MAX_CALLS {
            if call > 1 {
                debug!(
                    "Oracle retry for {} after {}ms delay",
                    unit.path,
                    self.retry_delay.as_millis()
                );
                tokio::time::sleep(self.retry_delay).await;
            }

            let outcome =
                tokio::time::timeout(self.request_timeout, self.oracle.propose_fix(&request)).await;

            match outcome {
                Ok(Ok(Some(revised))) => return accept_revision(unit, revised),
                Ok(Ok(None)) => {
                    info!("{} oracle declined to fix {}", self.oracle.name(), unit.path);
                    return None;
                }
                Ok(Err(e)) if e.is_transient() && call < MAX_CALLS => {
                    warn!("Transient oracle failure for {}: {}", unit.path, e);
                }
                Ok(Err(e)) => {
                    warn!("Oracle failed for {}: {}", unit.path, e);
                    return None;
                }
                Err(_) if call < MAX_CALLS => {
                    warn!(
                        "Oracle request for {} timed out after {}s",
                        unit.path,
                        self.request_timeout.as_secs()
                    );
                }
                Err(_) => {
                    warn!(
                        "Oracle request for {} timed out after {}s, giving up",
                        unit.path,
                        self.request_timeout.as_secs()
                    );
                    return None;
                }
            }
        }

        None
    }
}

/// An empty or unchanged revision is a refusal in disguise.
fn accept_revision(unit: &SourceUnit, revised: String) -> Option<String> {
    if revised.trim().is_empty() {
        info!("Oracle returned an empty revision for {}", unit.path);
        return None;
    }
    if revised.trim_end() == unit.content.trim_end() {
        info!("Oracle returned {} unchanged", unit.path);
        return None;
    }
    Some(revised)
}
