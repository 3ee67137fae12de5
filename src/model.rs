//! Data model shared by the sandbox, the repair loop and the coordinator.
//!
//! Every type here is plain data: results are created once per attempt and
//! never mutated afterwards, sessions only grow by appending attempts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Exit code recorded when the sandbox kills a process for exceeding its time budget.
pub const TIMEOUT_EXIT_CODE: i64 = -1;

/// Prefix of the error line recorded for a timed out execution.
pub const TIMEOUT_ERROR_PREFIX: &str = "execution timed out after";

/// Upper bound on captured bytes per output stream.
const MAX_STREAM_BYTES: usize = 64 * 1024;

/// Upper bound on extracted error or warning lines.
const MAX_DIAGNOSTIC_LINES: usize = 50;

// -----------------------------------------------------------------------------
// Language
// -----------------------------------------------------------------------------

/// Languages the sandbox knows how to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// Python scripts.
    Python,
    /// Plain JavaScript run on Node.
    JavaScript,
    /// TypeScript run on Node with type stripping.
    TypeScript,
    /// POSIX shell / bash scripts.
    Shell,
}

impl Language {
    /// All supported languages, in strategy-table order.
    pub const ALL: [Self; 4] = [Self::Python, Self::JavaScript, Self::TypeScript, Self::Shell];

    /// Infers the language from a file extension.
    pub fn from_path(path: &str) -> Option<Self> {
        let ext = Path::new(path).extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "py" => Some(Self::Python),
            "js" | "mjs" | "cjs" => Some(Self::JavaScript),
            "ts" | "mts" | "cts" => Some(Self::TypeScript),
            "sh" | "bash" => Some(Self::Shell),
            _ => None,
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Python => write!(f, "python"),
            Self::JavaScript => write!(f, "javascript"),
            Self::TypeScript => write!(f, "typescript"),
            Self::Shell => write!(f, "shell"),
        }
    }
}

impl std::str::FromStr for Language {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "python" | "py" => Ok(Self::Python),
            "javascript" | "js" | "node" => Ok(Self::JavaScript),
            "typescript" | "ts" => Ok(Self::TypeScript),
            "shell" | "sh" | "bash" => Ok(Self::Shell),
            _ => anyhow::bail!(
                "Unknown language: '{s}'. Supported: python, javascript, typescript, shell"
            ),
        }
    }
}

// -----------------------------------------------------------------------------
// Inputs
// -----------------------------------------------------------------------------

/// One generated file under management.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceUnit {
    /// Unique logical identifier, usually the relative file path.
    pub path: String,
    /// Current source text. Replaced in place when a fix is accepted.
    pub content: String,
    /// Runtime used to execute the file.
    pub language: Language,
    /// Whether this file is the program actually invoked.
    #[serde(default)]
    pub entrypoint: bool,
}

impl SourceUnit {
    /// Creates a non-entrypoint unit.
    pub fn new(path: impl Into<String>, content: impl Into<String>, language: Language) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            language,
            entrypoint: false,
        }
    }

    /// Marks the unit as the program entrypoint.
    #[must_use]
    pub fn as_entrypoint(mut self) -> Self {
        self.entrypoint = true;
        self
    }
}

/// Execution configuration, fixed for the duration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSpec {
    /// Image used for every unit, overriding per-language images.
    pub image: Option<String>,
    /// Per-language image overrides.
    pub images: BTreeMap<Language, String>,
    /// Wall-clock budget for one execution.
    pub timeout_seconds: u64,
    /// Memory ceiling in bytes.
    pub memory_limit: u64,
    /// Whether executed code may reach the network.
    pub network_enabled: bool,
    /// CPU quota in cores.
    pub cpus: f64,
    /// Maximum number of processes inside the sandbox.
    pub pids_limit: i64,
    /// Wall-clock budget for dependency installation.
    pub install_timeout_seconds: u64,
    /// Packages installed before each execution, per language.
    pub dependencies: BTreeMap<Language, Vec<String>>,
}

impl Default for RuntimeSpec {
    fn default() -> Self {
        Self {
            image: None,
            images: BTreeMap::new(),
            timeout_seconds: 30,
            memory_limit: 512 * 1024 * 1024,
            network_enabled: false,
            cpus: 1.0,
            pids_limit: 256,
            install_timeout_seconds: 120,
            dependencies: BTreeMap::new(),
        }
    }
}

impl RuntimeSpec {
    /// Resolves the image for a language: run-wide override, then
    /// per-language override, then the built-in default.
    pub fn image_for(&self, language: Language) -> String {
        self.image
            .clone()
            .or_else(|| self.images.get(&language).cloned())
            .unwrap_or_else(|| language.strategy().default_image.to_string())
    }

    /// Packages declared for `language`; other languages' packages are never installed.
    pub fn dependencies_for(&self, language: Language) -> &[String] {
        self.dependencies.get(&language).map_or(&[], Vec::as_slice)
    }

    /// Execution budget as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Installation budget as a `Duration`.
    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_seconds)
    }
}

// -----------------------------------------------------------------------------
// Execution results
// -----------------------------------------------------------------------------

/// Outcome of one sandbox invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// `exit_code == 0` and no error lines were found.
    pub success: bool,
    /// Process exit code, or [`TIMEOUT_EXIT_CODE`].
    pub exit_code: i64,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Wall-clock duration of the execution.
    pub duration_ms: f64,
    /// Error lines, in output order.
    pub errors: Vec<String>,
    /// Warning lines, in output order.
    pub warnings: Vec<String>,
}

impl ExecutionResult {
    /// Builds a result from a finished process, extracting diagnostics from stderr.
    pub fn from_output(exit_code: i64, stdout: &str, stderr: &str, elapsed: Duration) -> Self {
        let (mut errors, warnings) = extract_diagnostics(stderr, exit_code == 0);
        if exit_code != 0 && errors.is_empty() {
            errors.push(format!("process exited with code {exit_code}"));
        }
        Self::assemble(exit_code, stdout, stderr, elapsed, errors, warnings)
    }

    /// Builds the result for an execution killed at its time budget.
    pub fn timed_out(timeout: Duration, stdout: &str, stderr: &str, elapsed: Duration) -> Self {
        let (_, warnings) = extract_diagnostics(stderr, false);
        let errors = vec![format!("{TIMEOUT_ERROR_PREFIX} {}s", timeout.as_secs())];
        Self::assemble(TIMEOUT_EXIT_CODE, stdout, stderr, elapsed, errors, warnings)
    }

    /// Builds the result for a failed dependency installation.
    pub fn install_failed(exit_code: i64, stdout: &str, stderr: &str, elapsed: Duration) -> Self {
        let (found, warnings) = extract_diagnostics(stderr, false);
        let mut errors = vec![format!(
            "dependency installation failed (exit code {exit_code})"
        )];
        errors.extend(found);
        let exit_code = if exit_code == 0 { 1 } else { exit_code };
        Self::assemble(exit_code, stdout, stderr, elapsed, errors, warnings)
    }

    fn assemble(
        exit_code: i64,
        stdout: &str,
        stderr: &str,
        elapsed: Duration,
        errors: Vec<String>,
        warnings: Vec<String>,
    ) -> Self {
        Self {
            success: exit_code == 0 && errors.is_empty(),
            exit_code,
            stdout: truncate_output(stdout),
            stderr: truncate_output(stderr),
            duration_ms: elapsed.as_secs_f64() * 1000.0,
            errors,
            warnings,
        }
    }

    /// Returns true if this is the sandbox's timeout sentinel.
    pub fn is_timeout(&self) -> bool {
        self.exit_code == TIMEOUT_EXIT_CODE
            && self
                .errors
                .first()
                .is_some_and(|e| e.starts_with(TIMEOUT_ERROR_PREFIX))
    }

    /// Last `n` non-empty lines of stderr.
    pub fn stderr_tail(&self, n: usize) -> String {
        let lines: Vec<&str> = self.stderr.lines().filter(|l| !l.trim().is_empty()).collect();
        lines[lines.len().saturating_sub(n)..].join("\n")
    }
}

/// Splits stderr into error and warning lines.
///
/// With `clean_exit`, only named exceptions count as errors: programs that
/// exit 0 routinely log lines like `ERROR:root:retrying` or `errors: 0`.
fn extract_diagnostics(stderr: &str, clean_exit: bool) -> (Vec<String>, Vec<String>) {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    for line in stderr.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let is_error = if clean_exit {
            is_named_exception(trimmed)
        } else {
            is_error_line(trimmed)
        };
        if is_error {
            if errors.len() < MAX_DIAGNOSTIC_LINES {
                errors.push(trimmed.to_string());
            }
        } else if trimmed.to_lowercase().contains("warning") && warnings.len() < MAX_DIAGNOSTIC_LINES
        {
            warnings.push(trimmed.to_string());
        }
    }

    (errors, warnings)
}

fn is_error_line(line: &str) -> bool {
    let lower = line.to_lowercase();
    if lower.starts_with("error")
        || lower.starts_with("fatal")
        || lower.starts_with("npm err!")
        || lower.contains("command not found")
        || lower.contains("syntax error")
    {
        return true;
    }

    // `NameError: ...`, `TypeError [ERR_X]: ...`, `pkg.CustomException: ...`
    line.split_whitespace().next().is_some_and(|head| {
        let head = head.trim_end_matches(':');
        head.ends_with("Error") || head.ends_with("Exception")
    })
}

/// `NameError: ...` or `pkg.CustomException: ...`, but not a bare `Error:` or `ERROR:root:...`.
fn is_named_exception(line: &str) -> bool {
    let Some(head) = line.split_whitespace().next() else {
        return false;
    };
    let Some(name) = head.strip_suffix(':') else {
        return false;
    };
    let name = name.rsplit('.').next().unwrap_or(name);
    let is_identifier = name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    is_identifier
        && ((name.len() > "Error".len() && name.ends_with("Error"))
            || (name.len() > "Exception".len() && name.ends_with("Exception")))
}

/// Keeps the tail of oversized output; the end of a stream holds the failure.
fn truncate_output(output: &str) -> String {
    if output.len() <= MAX_STREAM_BYTES {
        return output.to_string();
    }
    let mut start = output.len() - MAX_STREAM_BYTES;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    format!("[truncated]\n{}", &output[start..])
}

// -----------------------------------------------------------------------------
// Repair history
// -----------------------------------------------------------------------------

/// Failure categories used to steer the repair oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The source could not be parsed or compiled.
    Syntax,
    /// A module, package or command could not be resolved.
    MissingDependency,
    /// A name, attribute or type was used incorrectly.
    TypeOrNameError,
    /// The execution exceeded its time budget.
    Timeout,
    /// Any other runtime failure.
    UnknownRuntimeError,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Syntax => write!(f, "syntax"),
            Self::MissingDependency => write!(f, "missing_dependency"),
            Self::TypeOrNameError => write!(f, "type_or_name_error"),
            Self::Timeout => write!(f, "timeout"),
            Self::UnknownRuntimeError => write!(f, "unknown_runtime_error"),
        }
    }
}

/// One iteration of the per-file repair loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairAttempt {
    /// 1-based, strictly increasing within a session.
    pub attempt_number: u32,
    /// Result of executing the content current at the start of this attempt.
    pub pre_fix_result: ExecutionResult,
    /// Classification of a failed execution; `None` when it succeeded.
    pub error_category: Option<ErrorCategory>,
    /// Whether a revision was applied after this execution.
    pub fix_applied: bool,
    /// The applied revision, if any.
    pub post_fix_content: Option<String>,
}

/// Lifecycle of a repair session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Queued, no execution started.
    Pending,
    /// Executing or waiting for a fix.
    Running,
    /// The last execution succeeded.
    Succeeded,
    /// The oracle could not provide a fix.
    Failed,
    /// The attempt budget was consumed without success.
    Exhausted,
    /// The sandbox itself could not be used.
    SystemError,
    /// The run or the unit was cancelled.
    Cancelled,
}

impl SessionStatus {
    /// Returns true once the session can no longer change.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Exhausted => write!(f, "exhausted"),
            Self::SystemError => write!(f, "system_error"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Attempt history and outcome for one source unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairSession {
    /// Path of the unit this session drives.
    pub path: String,
    /// Current status; terminal once the session is returned.
    pub status: SessionStatus,
    /// Attempts in execution order.
    pub attempts: Vec<RepairAttempt>,
    /// Content after the last accepted fix.
    pub final_content: String,
    /// Reason for a system error or cancellation.
    pub detail: Option<String>,
    /// Wall-clock time spent on this unit.
    pub duration_ms: f64,
}

impl RepairSession {
    /// Creates a pending session for a unit.
    pub fn new(unit: &SourceUnit) -> Self {
        Self {
            path: unit.path.clone(),
            status: SessionStatus::Pending,
            attempts: Vec::new(),
            final_content: unit.content.clone(),
            detail: None,
            duration_ms: 0.0,
        }
    }

    /// Returns true if the session ended in success.
    pub fn succeeded(&self) -> bool {
        self.status == SessionStatus::Succeeded
    }

    /// The most recent attempt, if any.
    pub fn last_attempt(&self) -> Option<&RepairAttempt> {
        self.attempts.last()
    }

    /// Number of fixes that were applied.
    pub fn fixes_applied(&self) -> usize {
        self.attempts.iter().filter(|a| a.fix_applied).count()
    }
}

/// Aggregate result of one coordinator run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Identifier shared by every event of this run.
    pub run_id: String,
    /// Terminal sessions keyed by unit path.
    pub sessions: BTreeMap<String, RepairSession>,
    /// True iff every session succeeded.
    pub overall_success: bool,
    /// Wall-clock duration of the whole run.
    pub total_duration_ms: f64,
}

impl RunReport {
    /// Assembles a report, deriving `overall_success` from the sessions.
    pub fn new(run_id: String, sessions: BTreeMap<String, RepairSession>, elapsed: Duration) -> Self {
        let overall_success = !sessions.is_empty() && sessions.values().all(RepairSession::succeeded);
        Self {
            run_id,
            sessions,
            overall_success,
            total_duration_ms: elapsed.as_secs_f64() * 1000.0,
        }
    }

    /// Number of sessions with the given status.
    pub fn count(&self, status: SessionStatus) -> usize {
        self.sessions.values().filter(|s| s.status == status).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_from_path() {
        assert_eq!(Language::from_path("src/main.py"), Some(Language::Python));
        assert_eq!(Language::from_path("index.mjs"), Some(Language::JavaScript));
        assert_eq!(Language::from_path("app.TS"), Some(Language::TypeScript));
        assert_eq!(Language::from_path("run.sh"), Some(Language::Shell));
        assert_eq!(Language::from_path("README.md"), None);
        assert_eq!(Language::from_path("Makefile"), None);
    }

    #[test]
    fn test_language_from_str() {
        assert_eq!("Python".parse::<Language>().unwrap(), Language::Python);
        assert_eq!("node".parse::<Language>().unwrap(), Language::JavaScript);
        assert_eq!("bash".parse::<Language>().unwrap(), Language::Shell);
        assert!("cobol".parse::<Language>().is_err());
    }

    #[test]
    fn test_success_requires_zero_exit_and_no_errors() {
        let ok = ExecutionResult::from_output(0, "hi\n", "", Duration::from_millis(5));
        assert!(ok.success);
        assert!(ok.errors.is_empty());

        let nonzero = ExecutionResult::from_output(2, "", "", Duration::ZERO);
        assert!(!nonzero.success);
        assert_eq!(nonzero.errors, vec!["process exited with code 2"]);

        let error_line = ExecutionResult::from_output(
            1,
            "",
            "Error: something went wrong\n",
            Duration::ZERO,
        );
        assert!(!error_line.success);
        assert_eq!(error_line.errors, vec!["Error: something went wrong"]);

        let exception_on_clean_exit = ExecutionResult::from_output(
            0,
            "",
            "Traceback (most recent call last):\nValueError: bad input\n",
            Duration::ZERO,
        );
        assert!(!exception_on_clean_exit.success);
        assert_eq!(exception_on_clean_exit.errors, vec!["ValueError: bad input"]);
    }

    #[test]
    fn test_clean_exit_ignores_log_noise() {
        for stderr in [
            "errors: 0\n",
            "ERROR:root:retrying connection\n",
            "Fatal flaw avoided, continuing\n",
            "Error: transient, recovered\n",
            "error count reset\n",
        ] {
            let result = ExecutionResult::from_output(0, "done\n", stderr, Duration::ZERO);
            assert!(result.success, "clean exit with {stderr:?} should succeed");
            assert!(result.errors.is_empty());
        }
    }

    #[test]
    fn test_failed_exit_keeps_loose_markers() {
        let result =
            ExecutionResult::from_output(1, "", "fatal: not a git repository\n", Duration::ZERO);
        assert_eq!(result.errors, vec!["fatal: not a git repository"]);
    }

    #[test]
    fn test_python_traceback_extraction() {
        let stderr = "Traceback (most recent call last):\n  File \"/workspace/main.py\", line 3, in <module>\n    print(x)\nNameError: name 'x' is not defined\n";
        let result = ExecutionResult::from_output(1, "", stderr, Duration::ZERO);
        assert_eq!(result.errors, vec!["NameError: name 'x' is not defined"]);
    }

    #[test]
    fn test_warnings_do_not_fail_execution() {
        let stderr = "/workspace/main.py:1: DeprecationWarning: old api\n";
        let result = ExecutionResult::from_output(0, "", stderr, Duration::ZERO);
        assert!(result.success);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_timed_out_sentinel() {
        let result = ExecutionResult::timed_out(
            Duration::from_secs(30),
            "partial",
            "",
            Duration::from_secs(30),
        );
        assert!(!result.success);
        assert!(result.is_timeout());
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert_eq!(result.errors, vec!["execution timed out after 30s"]);
    }

    #[test]
    fn test_install_failed_never_succeeds() {
        let result = ExecutionResult::install_failed(0, "", "", Duration::ZERO);
        assert!(!result.success);
        assert!(result.errors[0].starts_with("dependency installation failed"));
    }

    #[test]
    fn test_truncate_output_keeps_tail() {
        let big = format!("{}END", "x".repeat(MAX_STREAM_BYTES + 10));
        let truncated = truncate_output(&big);
        assert!(truncated.starts_with("[truncated]"));
        assert!(truncated.ends_with("END"));
    }

    #[test]
    fn test_stderr_tail() {
        let result = ExecutionResult::from_output(1, "", "a\n\nb\nc\n", Duration::ZERO);
        assert_eq!(result.stderr_tail(2), "b\nc");
        assert_eq!(result.stderr_tail(10), "a\nb\nc");
    }

    #[test]
    fn test_runtime_spec_image_resolution() {
        let mut spec = RuntimeSpec::default();
        assert_eq!(spec.image_for(Language::Python), "python:3.12-slim");

        spec.images
            .insert(Language::Python, "python:3.11".to_string());
        assert_eq!(spec.image_for(Language::Python), "python:3.11");

        spec.image = Some("custom:latest".to_string());
        assert_eq!(spec.image_for(Language::Python), "custom:latest");
        assert_eq!(spec.image_for(Language::Shell), "custom:latest");
    }

    #[test]
    fn test_dependencies_are_per_language() {
        let spec = RuntimeSpec {
            dependencies: BTreeMap::from([(
                Language::Python,
                vec!["requests".to_string(), "flask==3.0".to_string()],
            )]),
            ..RuntimeSpec::default()
        };
        assert_eq!(spec.dependencies_for(Language::Python), ["requests", "flask==3.0"]);
        assert!(spec.dependencies_for(Language::JavaScript).is_empty());
        assert!(spec.dependencies_for(Language::Shell).is_empty());
    }

    #[test]
    fn test_runtime_spec_defaults() {
        let spec = RuntimeSpec::default();
        assert_eq!(spec.timeout_seconds, 30);
        assert_eq!(spec.memory_limit, 512 * 1024 * 1024);
        assert!(!spec.network_enabled);
    }

    #[test]
    fn test_session_status_terminal() {
        assert!(!SessionStatus::Pending.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());
        assert!(SessionStatus::Succeeded.is_terminal());
        assert!(SessionStatus::Cancelled.is_terminal());
        assert_eq!(SessionStatus::SystemError.to_string(), "system_error");
    }

    #[test]
    fn test_report_overall_success() {
        let unit = SourceUnit::new("a.py", "print(1)", Language::Python);
        let mut ok = RepairSession::new(&unit);
        ok.status = SessionStatus::Succeeded;
        let mut bad = RepairSession::new(&SourceUnit::new("b.py", "x", Language::Python));
        bad.status = SessionStatus::Failed;

        let all_ok = RunReport::new(
            "r1".to_string(),
            BTreeMap::from([("a.py".to_string(), ok.clone())]),
            Duration::ZERO,
        );
        assert!(all_ok.overall_success);

        let mixed = RunReport::new(
            "r2".to_string(),
            BTreeMap::from([("a.py".to_string(), ok), ("b.py".to_string(), bad)]),
            Duration::ZERO,
        );
        assert!(!mixed.overall_success);
        assert_eq!(mixed.count(SessionStatus::Failed), 1);
    }
}
