//! Scripted sandbox for testing without Docker.
//!
//! Tracks live sandboxes so tests can assert that every attempt releases
//! what it provisioned and that concurrency stays within bounds.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{Sandbox, SandboxError};
use crate::model::{ExecutionResult, RuntimeSpec, SourceUnit};

/// What a single mocked execution does.
#[derive(Debug, Clone)]
pub(crate) enum MockRun {
    /// Exit 0 with no diagnostics.
    Pass,
    /// Exit 1 with the given stderr.
    Fail(String),
    /// Hit the time budget.
    Timeout,
    /// The backend cannot provision a sandbox.
    Unavailable,
    /// Block until cancelled.
    Hang,
}

type Behavior = dyn Fn(&SourceUnit) -> MockRun + Send + Sync;

#[derive(Debug, Default)]
struct Stats {
    live: AtomicUsize,
    peak: AtomicUsize,
    provisioned: AtomicUsize,
    executions: Mutex<Vec<String>>,
}

/// A sandbox whose outcomes are decided by a closure over the unit.
#[derive(Clone)]
pub(crate) struct MockSandbox {
    behavior: Arc<Behavior>,
    reachable: bool,
    delay: Duration,
    stats: Arc<Stats>,
}

impl MockSandbox {
    /// Creates a sandbox that runs `behavior` for every execution.
    pub fn new(behavior: impl Fn(&SourceUnit) -> MockRun + Send + Sync + 'static) -> Self {
        Self {
            behavior: Arc::new(behavior),
            reachable: true,
            delay: Duration::ZERO,
            stats: Arc::new(Stats::default()),
        }
    }

    /// Every execution succeeds.
    pub fn always_pass() -> Self {
        Self::new(|_| MockRun::Pass)
    }

    /// Fails with `stderr` while the content contains `marker`.
    pub fn failing_while(marker: &'static str, stderr: &'static str) -> Self {
        Self::new(move |unit| {
            if unit.content.contains(marker) {
                MockRun::Fail(stderr.to_string())
            } else {
                MockRun::Pass
            }
        })
    }

    /// The backend cannot be reached at all.
    pub fn unreachable() -> Self {
        let mut sandbox = Self::new(|_| MockRun::Unavailable);
        sandbox.reachable = false;
        sandbox
    }

    /// Holds each sandbox for `delay` before finishing.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sandboxes currently provisioned.
    pub fn live(&self) -> usize {
        self.stats.live.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously provisioned sandboxes.
    pub fn peak(&self) -> usize {
        self.stats.peak.load(Ordering::SeqCst)
    }

    /// Total sandboxes provisioned.
    pub fn provisioned(&self) -> usize {
        self.stats.provisioned.load(Ordering::SeqCst)
    }

    /// Number of executions started for a path.
    pub fn executions_for(&self, path: &str) -> usize {
        self.stats
            .executions
            .lock()
            .map(|e| e.iter().filter(|p| p.as_str() == path).count())
            .unwrap_or(0)
    }
}

/// Decrements the live count however the execution ends.
struct Slot<'a> {
    stats: &'a Stats,
}

impl<'a> Slot<'a> {
    fn acquire(stats: &'a Stats) -> Self {
        stats.provisioned.fetch_add(1, Ordering::SeqCst);
        let live = stats.live.fetch_add(1, Ordering::SeqCst) + 1;
        stats.peak.fetch_max(live, Ordering::SeqCst);
        Self { stats }
    }
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        self.stats.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Sandbox for MockSandbox {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn ping(&self) -> Result<(), SandboxError> {
        if self.reachable {
            Ok(())
        } else {
            Err(SandboxError::unavailable("mock backend unreachable"))
        }
    }

    async fn cleanup_orphaned(&self) -> Result<u32, SandboxError> {
        Ok(0)
    }

    async fn execute(
        &self,
        unit: &SourceUnit,
        spec: &RuntimeSpec,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, SandboxError> {
        let run = (self.behavior)(unit);
        if matches!(run, MockRun::Unavailable) {
            return Err(SandboxError::unavailable("mock backend unreachable"));
        }

        let _slot = Slot::acquire(&self.stats);
        if let Ok(mut executions) = self.stats.executions.lock() {
            executions.push(unit.path.clone());
        }

        if !self.delay.is_zero() {
            tokio::select! {
                () = cancel.cancelled() => return Err(SandboxError::Cancelled),
                () = tokio::time::sleep(self.delay) => {}
            }
        }

        match run {
            MockRun::Pass => Ok(ExecutionResult::from_output(
                0,
                "ok\n",
                "",
                self.delay,
            )),
            MockRun::Fail(stderr) => Ok(ExecutionResult::from_output(1, "", &stderr, self.delay)),
            MockRun::Timeout => Ok(ExecutionResult::timed_out(
                spec.timeout(),
                "",
                "",
                spec.timeout(),
            )),
            MockRun::Hang => {
                cancel.cancelled().await;
                Err(SandboxError::Cancelled)
            }
            MockRun::Unavailable => Err(SandboxError::unavailable("mock backend unreachable")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Language;

    fn unit(content: &str) -> SourceUnit {
        SourceUnit::new("main.py", content, Language::Python).as_entrypoint()
    }

    #[tokio::test]
    async fn test_mock_pass_and_fail() {
        let sandbox = MockSandbox::failing_while("BUG", "NameError: name 'x' is not defined");
        let cancel = CancellationToken::new();
        let spec = RuntimeSpec::default();

        let ok = sandbox.execute(&unit("print(1)"), &spec, &cancel).await.unwrap();
        assert!(ok.success);

        let bad = sandbox.execute(&unit("BUG"), &spec, &cancel).await.unwrap();
        assert!(!bad.success);
        assert_eq!(sandbox.executions_for("main.py"), 2);
        assert_eq!(sandbox.live(), 0);
    }

    #[tokio::test]
    async fn test_mock_unreachable() {
        let sandbox = MockSandbox::unreachable();
        assert!(sandbox.ping().await.is_err());
        let result = sandbox
            .execute(&unit("x"), &RuntimeSpec::default(), &CancellationToken::new())
            .await;
        assert!(result.unwrap_err().is_unavailable());
        assert_eq!(sandbox.provisioned(), 0);
    }

    #[tokio::test]
    async fn test_mock_hang_releases_on_cancel() {
        let sandbox = MockSandbox::new(|_| MockRun::Hang);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let result = sandbox
            .execute(&unit("x"), &RuntimeSpec::default(), &cancel)
            .await;
        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(sandbox.live(), 0);
        assert_eq!(sandbox.provisioned(), 1);
    }

    #[test]
    fn test_mock_sandbox_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<MockSandbox>();
    }
}
