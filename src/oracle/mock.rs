//! Mock repair oracle for testing.
//!
//! Returns scripted answers and counts invocations so repair loop tests can
//! run without a network or an agent CLI.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::{FixRequest, OracleError, RepairOracle};

/// A single scripted oracle answer.
#[derive(Debug, Clone)]
pub(crate) enum MockFix {
    /// Return this content as the revision.
    Revise(String),
    /// Decline to fix.
    Decline,
    /// Fail with a retryable error.
    Transient(String),
    /// Fail definitively.
    Reject(String),
    /// Never answer.
    Hang,
}

/// Scripted oracle. Cycles through its answers when invoked more times than scripted.
#[derive(Debug, Clone)]
pub(crate) struct MockOracle {
    responses: Arc<Vec<MockFix>>,
    invocation_count: Arc<AtomicUsize>,
}

impl MockOracle {
    pub fn new(responses: Vec<MockFix>) -> Self {
        Self {
            responses: Arc::new(responses),
            invocation_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Always proposes `content`.
    pub fn always_fix(content: &str) -> Self {
        Self::new(vec![MockFix::Revise(content.to_string())])
    }

    /// Always declines.
    pub fn always_decline() -> Self {
        Self::new(vec![MockFix::Decline])
    }

    /// Proposes the failing content with `marker` removed. Each call gets a
    /// distinct trailing comment so the revision is never "unchanged".
    pub fn strip_marker(marker: &str) -> StripMarkerOracle {
        StripMarkerOracle {
            marker: marker.to_string(),
            invocation_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn invocation_count(&self) -> usize {
        self.invocation_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RepairOracle for MockOracle {
    fn name(&self) -> &'static str {
        "Mock"
    }

    async fn propose_fix(&self, _request: &FixRequest<'_>) -> Result<Option<String>, OracleError> {
        let count = self.invocation_count.fetch_add(1, Ordering::SeqCst);
        match &self.responses[count % self.responses.len()] {
            MockFix::Revise(content) => Ok(Some(content.clone())),
            MockFix::Decline => Ok(None),
            MockFix::Transient(msg) => Err(OracleError::transient(msg.clone())),
            MockFix::Reject(msg) => Err(OracleError::rejected(msg.clone())),
            MockFix::Hang => {
                std::future::pending::<()>().await;
                Ok(None)
            }
        }
    }
}

/// Oracle that repairs by deleting a marker from the failing content.
#[derive(Debug, Clone)]
pub(crate) struct StripMarkerOracle {
    marker: String,
    invocation_count: Arc<AtomicUsize>,
}

impl StripMarkerOracle {
    pub fn invocation_count(&self) -> usize {
        self.invocation_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RepairOracle for StripMarkerOracle {
    fn name(&self) -> &'static str {
        "Mock"
    }

    async fn propose_fix(&self, request: &FixRequest<'_>) -> Result<Option<String>, OracleError> {
        let count = self.invocation_count.fetch_add(1, Ordering::SeqCst);
        let fixed = request.unit.content.replace(&self.marker, "");
        Ok(Some(format!("{}\n# fix {}\n", fixed.trim_end(), count + 1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ErrorCategory, ExecutionResult, Language, SourceUnit};
    use std::time::Duration;

    fn request_parts() -> (SourceUnit, ExecutionResult) {
        (
            SourceUnit::new("a.py", "BROKEN\nprint(1)\n", Language::Python),
            ExecutionResult::from_output(1, "", "Error: broken\n", Duration::ZERO),
        )
    }

    #[tokio::test]
    async fn test_mock_oracle_cycles_responses() {
        let (unit, result) = request_parts();
        let request = FixRequest {
            unit: &unit,
            category: ErrorCategory::UnknownRuntimeError,
            result: &result,
        };
        let oracle = MockOracle::new(vec![MockFix::Revise("one".to_string()), MockFix::Decline]);

        assert_eq!(oracle.propose_fix(&request).await.unwrap().as_deref(), Some("one"));
        assert_eq!(oracle.propose_fix(&request).await.unwrap(), None);
        assert_eq!(oracle.propose_fix(&request).await.unwrap().as_deref(), Some("one"));
        assert_eq!(oracle.invocation_count(), 3);
    }

    #[tokio::test]
    async fn test_mock_oracle_errors() {
        let (unit, result) = request_parts();
        let request = FixRequest {
            unit: &unit,
            category: ErrorCategory::UnknownRuntimeError,
            result: &result,
        };
        let oracle = MockOracle::new(vec![
            MockFix::Transient("busy".to_string()),
            MockFix::Reject("no".to_string()),
        ]);
        assert!(oracle.propose_fix(&request).await.unwrap_err().is_transient());
        assert!(!oracle.propose_fix(&request).await.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_strip_marker_oracle() {
        let (unit, result) = request_parts();
        let request = FixRequest {
            unit: &unit,
            category: ErrorCategory::UnknownRuntimeError,
            result: &result,
        };
        let oracle = MockOracle::strip_marker("BROKEN");
        let fixed = oracle.propose_fix(&request).await.unwrap().unwrap();
        assert!(!fixed.contains("BROKEN"));
        assert!(fixed.contains("print(1)"));
        assert_eq!(oracle.invocation_count(), 1);
    }
}
