//! Sandboxed execution and self-healing repair of generated source files.
//!
//! A run takes a set of [`SourceUnit`]s, executes each one in an isolated
//! container and, when it fails, asks a repair oracle for a revised version
//! until the file runs cleanly or its attempt budget is spent. Units are
//! driven concurrently by the [`Coordinator`] and reported in a [`RunReport`].

pub mod classify;
pub mod config;
pub mod coordinator;
pub mod events;
pub mod format;
pub mod manifest;
pub mod model;
pub mod oracle;
pub mod repair;
pub mod sandbox;

pub use classify::classify;
pub use config::Config;
pub use coordinator::{Coordinator, CoordinatorOptions, RunError};
pub use events::{EventSink, JsonlEventLog, RunEvent};
pub use manifest::Manifest;
pub use model::{
    ErrorCategory, ExecutionResult, Language, RepairAttempt, RepairSession, RunReport,
    RuntimeSpec, SessionStatus, SourceUnit,
};
pub use oracle::{RepairClient, RepairOracle};
pub use repair::RepairMachine;
pub use sandbox::{DockerSandbox, Sandbox, SandboxError};
