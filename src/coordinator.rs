//! Execution coordinator: fans repair sessions out with bounded concurrency
//! and folds the terminal sessions into a [`RunReport`].
//!
//! Units are independent. A failing, panicking or cancelled session never
//! affects the others, and the coordinator itself never retries anything.

use futures_util::FutureExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{EventSink, RunEvent};
use crate::model::{RepairSession, RunReport, RuntimeSpec, SessionStatus, SourceUnit};
use crate::oracle::RepairClient;
use crate::repair::RepairMachine;
use crate::sandbox::{Sandbox, SandboxError};

/// What a repair task yields: the terminal session, or a fallback after a caught panic.
type SessionOutcome = Result<RepairSession, RepairSession>;

/// Upper bound on the derived default concurrency.
const MAX_DEFAULT_CONCURRENCY: usize = 8;

/// Errors that stop a run before any unit is driven.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// The isolation backend failed its preflight check.
    #[error("Isolation backend unavailable: {source}")]
    BackendUnavailable {
        /// The failed preflight check.
        #[source]
        source: SandboxError,
    },

    /// The run contained no source units.
    #[error("Nothing to run: no source units were provided")]
    EmptyRun,

    /// Two units share a path.
    #[error("Duplicate source unit path: {path}")]
    DuplicatePath {
        /// The repeated path.
        path: String,
    },

    /// `max_fix_attempts` was zero.
    #[error("max_fix_attempts must be at least 1 (got {value})")]
    InvalidBudget {
        /// The rejected value.
        value: u32,
    },
}

impl RunError {
    /// Returns true if the run failed because the backend is unreachable.
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. })
    }
}

/// Knobs for a coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Maximum sessions in flight. `None` derives a default from host parallelism.
    pub max_concurrency: Option<usize>,
    /// Ping the backend before fanning out; failure is run-level fatal.
    pub preflight: bool,
    /// Remove containers left behind by earlier runs before starting.
    pub cleanup_orphans: bool,
    /// Run id to use instead of a generated one.
    pub run_id: Option<String>,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            preflight: true,
            cleanup_orphans: true,
            run_id: None,
        }
    }
}

/// Generates a fresh run id.
pub fn new_run_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("run-{}", &id[..12])
}

/// Concurrency used when none is configured.
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(4)
        .min(MAX_DEFAULT_CONCURRENCY)
}

/// Drives one repair session per unit.
pub struct Coordinator {
    sandbox: Arc<dyn Sandbox>,
    client: RepairClient,
    sink: Arc<dyn EventSink>,
    options: CoordinatorOptions,
    cancel: CancellationToken,
    unit_tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl Coordinator {
    /// Creates a coordinator with default options.
    pub fn new(sandbox: Arc<dyn Sandbox>, client: RepairClient, sink: Arc<dyn EventSink>) -> Self {
        Self {
            sandbox,
            client,
            sink,
            options: CoordinatorOptions::default(),
            cancel: CancellationToken::new(),
            unit_tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Replaces the options.
    #[must_use]
    pub fn with_options(mut self, options: CoordinatorOptions) -> Self {
        self.options = options;
        self
    }

    /// Effective concurrency limit.
    pub fn concurrency(&self) -> usize {
        self.options
            .max_concurrency
            .unwrap_or_else(default_concurrency)
            .max(1)
    }

    /// Cancels every session of the current (and any later) run.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token cancelled by [`Coordinator::cancel`], for wiring up signal handlers.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancels a single unit of the running run. Returns false if no such unit is in flight.
    pub fn cancel_unit(&self, path: &str) -> bool {
        let Ok(tokens) = self.unit_tokens.lock() else {
            return false;
        };
        match tokens.get(path) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Runs every unit to a terminal status and aggregates the outcome.
    ///
    /// Only invalid input and an unreachable backend fail the run; everything
    /// else is recorded per session.
    pub async fn run(
        &self,
        units: Vec<SourceUnit>,
        spec: RuntimeSpec,
        max_fix_attempts: u32,
    ) -> Result<RunReport, RunError> {
        validate(&units, max_fix_attempts)?;

        if self.options.preflight {
            self.sandbox
                .ping()
                .await
                .map_err(|source| RunError::BackendUnavailable { source })?;
        }

        if self.options.cleanup_orphans {
            if let Err(e) = self.sandbox.cleanup_orphaned().await {
                warn!("Failed to clean up orphaned sandboxes: {}", e);
            }
        }

        let started = Instant::now();
        let run_id = self.options.run_id.clone().unwrap_or_else(new_run_id);
        let concurrency = self.concurrency().min(units.len());
        let paths: Vec<String> = units.iter().map(|u| u.path.clone()).collect();

        tracing::info!(
            event = "run_start",
            run_id = %run_id,
            units = units.len(),
            max_fix_attempts,
            concurrency,
            sandbox = self.sandbox.name(),
            oracle = self.client.oracle_name(),
        );
        self.record(&RunEvent::RunStarted {
            run_id: run_id.clone(),
            timestamp: chrono::Utc::now(),
            units: paths,
            max_fix_attempts,
            concurrency,
            oracle: self.client.oracle_name().to_string(),
        });

        let machine = RepairMachine::new(
            Arc::clone(&self.sandbox),
            self.client.clone(),
            Arc::clone(&self.sink),
            Arc::new(spec),
            max_fix_attempts,
            &run_id,
        );
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut tasks = JoinSet::new();
        let mut pending = HashMap::with_capacity(units.len());

        for unit in units {
            let token = self.cancel.child_token();
            if let Ok(mut tokens) = self.unit_tokens.lock() {
                tokens.insert(unit.path.clone(), token.clone());
            }

            let machine = machine.clone();
            let semaphore = Arc::clone(&semaphore);
            let placeholder = RepairSession::new(&unit);
            let handle = tasks.spawn(async move {
                let mut fallback = RepairSession::new(&unit);

                // Units queued behind the limit stay Pending until a permit frees up
                let _permit = tokio::select! {
                    () = token.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };

                match AssertUnwindSafe(machine.drive(unit, &token))
                    .catch_unwind()
                    .await
                {
                    Ok(session) => Ok(session),
                    Err(panic) => {
                        fallback.status = SessionStatus::SystemError;
                        fallback.detail = Some(format!(
                            "repair task panicked: {}",
                            panic_message(panic.as_ref())
                        ));
                        Err(fallback)
                    }
                }
            });
            pending.insert(handle.id(), placeholder);
        }

        let sessions = self.join_sessions(&run_id, tasks, pending).await;

        if let Ok(mut tokens) = self.unit_tokens.lock() {
            tokens.clear();
        }

        let report = RunReport::new(run_id, sessions, started.elapsed());
        tracing::info!(
            event = "run_end",
            run_id = %report.run_id,
            overall_success = report.overall_success,
            succeeded = report.count(SessionStatus::Succeeded),
            total = report.sessions.len(),
        );
        self.record(&RunEvent::run_finished(&report));
        info!(
            "Run {} finished in {:.1}s",
            report.run_id,
            report.total_duration_ms / 1000.0
        );

        Ok(report)
    }

    /// Collects every task's session. A task that fails to join still yields a
    /// `SystemError` session for its unit, built from the `pending` placeholder.
    async fn join_sessions(
        &self,
        run_id: &str,
        mut tasks: JoinSet<SessionOutcome>,
        mut pending: HashMap<task::Id, RepairSession>,
    ) -> BTreeMap<String, RepairSession> {
        let mut sessions = BTreeMap::new();
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((id, Ok(session))) => {
                    pending.remove(&id);
                    debug!("{} finished: {}", session.path, session.status);
                    sessions.insert(session.path.clone(), session);
                }
                Ok((id, Err(session))) => {
                    pending.remove(&id);
                    warn!(
                        "Session for {} aborted: {}",
                        session.path,
                        session.detail.as_deref().unwrap_or("unknown")
                    );
                    self.record(&RunEvent::session(run_id, &session));
                    sessions.insert(session.path.clone(), session);
                }
                Err(e) => {
                    let Some(mut session) = pending.remove(&e.id()) else {
                        warn!("Repair task failed to join: {}", e);
                        continue;
                    };
                    warn!("Repair task for {} failed to join: {}", session.path, e);
                    session.status = SessionStatus::SystemError;
                    session.detail = Some(format!("repair task failed: {e}"));
                    self.record(&RunEvent::session(run_id, &session));
                    sessions.insert(session.path.clone(), session);
                }
            }
        }
        sessions
    }

    fn record(&self, event: &RunEvent) {
        if let Err(e) = self.sink.append(event) {
            warn!("Failed to record run event: {}", e);
        }
    }
}

fn validate(units: &[SourceUnit], max_fix_attempts: u32) -> Result<(), RunError> {
    if units.is_empty() {
        return Err(RunError::EmptyRun);
    }
    if max_fix_attempts == 0 {
        return Err(RunError::InvalidBudget {
            value: max_fix_attempts,
        });
    }
    let mut seen = HashSet::new();
    for unit in units {
        if !seen.insert(unit.path.as_str()) {
            return Err(RunError::DuplicatePath {
                path: unit.path.clone(),
            });
        }
    }
    Ok(())
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
