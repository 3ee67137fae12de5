//! Per-file repair state machine.
//!
//! Drives one source unit through execute, classify and fix cycles:
//!
//! ```text
//! Pending -> Running -> Succeeded | Failed | Exhausted | SystemError | Cancelled
//! ```
//!
//! Every execution appends exactly one [`RepairAttempt`]. The loop is bounded
//! by `max_fix_attempts` executions whatever the error category.

use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::classify::classify;
use crate::events::{EventSink, RunEvent};
use crate::model::{RepairAttempt, RepairSession, RuntimeSpec, SessionStatus, SourceUnit};
use crate::oracle::RepairClient;
use crate::sandbox::{Sandbox, SandboxError};

/// Default bound on executions per unit.
pub const DEFAULT_MAX_FIX_ATTEMPTS: u32 = 3;

/// Shared, cheaply clonable driver for repair sessions.
#[derive(Clone)]
pub struct RepairMachine {
    sandbox: Arc<dyn Sandbox>,
    client: RepairClient,
    sink: Arc<dyn EventSink>,
    spec: Arc<RuntimeSpec>,
    max_fix_attempts: u32,
    run_id: Arc<str>,
}

impl RepairMachine {
    /// Creates a driver for sessions of run `run_id`.
    pub fn new(
        sandbox: Arc<dyn Sandbox>,
        client: RepairClient,
        sink: Arc<dyn EventSink>,
        spec: Arc<RuntimeSpec>,
        max_fix_attempts: u32,
        run_id: &str,
    ) -> Self {
        Self {
            sandbox,
            client,
            sink,
            spec,
            max_fix_attempts,
            run_id: Arc::from(run_id),
        }
    }

    /// Execution budget per session.
    pub fn max_fix_attempts(&self) -> u32 {
        self.max_fix_attempts
    }

    /// Runs the repair loop for `unit` until it reaches a terminal status.
    ///
    /// Never fails: backend errors end the session in `SystemError`, a
    /// cancelled token ends it in `Cancelled`.
    pub async fn drive(&self, mut unit: SourceUnit, cancel: &CancellationToken) -> RepairSession {
        let started = Instant::now();
        let mut session = RepairSession::new(&unit);

        if cancel.is_cancelled() {
            return self.finish(
                session,
                SessionStatus::Cancelled,
                Some("cancelled before the first execution".to_string()),
                started,
            );
        }

        session.status = SessionStatus::Running;

        for attempt_number in 1..=self.max_fix_attempts {
            debug!("Executing {} (attempt {})", unit.path, attempt_number);

            let result = match self.sandbox.execute(&unit, &self.spec, cancel).await {
                Ok(result) => result,
                Err(SandboxError::Cancelled) => {
                    return self.finish(
                        session,
                        SessionStatus::Cancelled,
                        Some("cancelled during execution".to_string()),
                        started,
                    );
                }
                Err(e) => {
                    tracing::error!(
                        event = "error",
                        path = %unit.path,
                        attempt = attempt_number,
                        error = %e,
                    );
                    return self.finish(session, SessionStatus::SystemError, Some(e.to_string()), started);
                }
            };

            if result.success {
                self.record(
                    &mut session,
                    RepairAttempt {
                        attempt_number,
                        pre_fix_result: result,
                        error_category: None,
                        fix_applied: false,
                        post_fix_content: None,
                    },
                );
                return self.finish(session, SessionStatus::Succeeded, None, started);
            }

            let category = classify(&result);

            if attempt_number == self.max_fix_attempts {
                self.record(
                    &mut session,
                    RepairAttempt {
                        attempt_number,
                        pre_fix_result: result,
                        error_category: Some(category),
                        fix_applied: false,
                        post_fix_content: None,
                    },
                );
                let detail = format!(
                    "still failing ({category}) after {} attempts",
                    self.max_fix_attempts
                );
                return self.finish(session, SessionStatus::Exhausted, Some(detail), started);
            }

            let answer = tokio::select! {
                () = cancel.cancelled() => None,
                fix = self.client.request_fix(&unit, category, &result) => Some(fix),
            };

            let Some(fix) = answer else {
                self.record(
                    &mut session,
                    RepairAttempt {
                        attempt_number,
                        pre_fix_result: result,
                        error_category: Some(category),
                        fix_applied: false,
                        post_fix_content: None,
                    },
                );
                return self.finish(
                    session,
                    SessionStatus::Cancelled,
                    Some("cancelled while waiting for a fix".to_string()),
                    started,
                );
            };

            match fix {
                Some(revised) => {
                    unit.content.clone_from(&revised);
                    session.final_content.clone_from(&revised);
                    self.record(
                        &mut session,
                        RepairAttempt {
                            attempt_number,
                            pre_fix_result: result,
                            error_category: Some(category),
                            fix_applied: true,
                            post_fix_content: Some(revised),
                        },
                    );
                }
                None => {
                    self.record(
                        &mut session,
                        RepairAttempt {
                            attempt_number,
                            pre_fix_result: result,
                            error_category: Some(category),
                            fix_applied: false,
                            post_fix_content: None,
                        },
                    );
                    let detail = format!("no fix available for {category} failure");
                    return self.finish(session, SessionStatus::Failed, Some(detail), started);
                }
            }
        }

        // Only reachable with a zero budget
        self.finish(
            session,
            SessionStatus::Exhausted,
            Some("no attempts permitted".to_string()),
            started,
        )
    }

    fn record(&self, session: &mut RepairSession, attempt: RepairAttempt) {
        tracing::info!(
            event = "attempt_complete",
            path = %session.path,
            attempt = attempt.attempt_number,
            success = attempt.pre_fix_result.success,
            exit_code = attempt.pre_fix_result.exit_code,
            category = ?attempt.error_category,
            fix_applied = attempt.fix_applied,
        );
        if let Err(e) = self
            .sink
            .append(&RunEvent::attempt(&self.run_id, &session.path, &attempt))
        {
            warn!("Failed to record attempt for {}: {}", session.path, e);
        }
        session.attempts.push(attempt);
    }

    fn finish(
        &self,
        mut session: RepairSession,
        status: SessionStatus,
        detail: Option<String>,
        started: Instant,
    ) -> RepairSession {
        session.status = status;
        session.detail = detail;
        session.duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        tracing::info!(
            event = "session_end",
            path = %session.path,
            status = %session.status,
            attempts = session.attempts.len(),
            fixes_applied = session.fixes_applied(),
        );
        if let Err(e) = self.sink.append(&RunEvent::session(&self.run_id, &session)) {
            warn!("Failed to record session for {}: {}", session.path, e);
        }
        session
    }
}
