//! Formatting functions for CLI output.
//!
//! Pure functions returning strings; the commands decide where to print them.

use chrono::{DateTime, Utc};
use colored::{ColoredString, Colorize};
use std::fmt::Write;

use crate::events::RunEvent;
use crate::model::{RepairSession, RunReport, SessionStatus};

/// Banner information for display at run start.
#[derive(Debug, Clone)]
pub struct BannerInfo {
    /// Id of the run.
    pub run_id: String,
    /// Number of units submitted.
    pub units: usize,
    /// Oracle backend name.
    pub oracle: String,
    /// Execution budget per unit.
    pub max_fix_attempts: u32,
    /// Effective concurrency limit.
    pub concurrency: usize,
    /// Per-execution timeout.
    pub timeout_seconds: u64,
    /// Whether code under test may use the network.
    pub network_enabled: bool,
}

/// Formats a duration in milliseconds for display (e.g., "350ms", "4.2s", "2m 5s").
pub fn format_duration_ms(ms: f64) -> String {
    if ms < 1000.0 {
        return format!("{ms:.0}ms");
    }
    let seconds = ms / 1000.0;
    if seconds < 60.0 {
        return format!("{seconds:.1}s");
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let total = seconds.round() as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m {secs}s")
    } else {
        format!("{minutes}m {secs}s")
    }
}

/// Colored status label.
pub fn format_status(status: SessionStatus) -> ColoredString {
    let label = status.to_string();
    match status {
        SessionStatus::Succeeded => label.green().bold(),
        SessionStatus::Failed | SessionStatus::Exhausted => label.red().bold(),
        SessionStatus::SystemError => label.magenta().bold(),
        SessionStatus::Cancelled => label.yellow(),
        SessionStatus::Pending | SessionStatus::Running => label.dimmed(),
    }
}

/// Formats the startup banner for display.
pub fn format_banner(info: &BannerInfo) -> String {
    let mut out = String::new();

    let _ = writeln!(&mut out, "\n{}", "━".repeat(50).dimmed());
    let _ = writeln!(&mut out, "{}", "   🩹 Mender Run Starting".yellow().bold());
    let _ = writeln!(&mut out, "{}", "━".repeat(50).dimmed());
    let _ = writeln!(&mut out, "  Run:        {}", info.run_id.cyan().bold());
    let _ = writeln!(&mut out, "  Files:      {}", info.units.to_string().cyan());
    let _ = writeln!(&mut out, "  Oracle:     {}", info.oracle.cyan());
    let _ = writeln!(
        &mut out,
        "  Attempts:   {} per file",
        info.max_fix_attempts.to_string().cyan()
    );
    let _ = writeln!(
        &mut out,
        "  Parallel:   {}",
        info.concurrency.to_string().cyan()
    );
    let _ = writeln!(&mut out, "  Timeout:    {}s", info.timeout_seconds.to_string().cyan());
    let network = if info.network_enabled {
        "enabled".yellow()
    } else {
        "disabled".green()
    };
    let _ = writeln!(&mut out, "  Network:    {network}");
    let _ = writeln!(&mut out, "{}", "━".repeat(50).dimmed());
    let _ = writeln!(&mut out, "\n  {} to cancel\n", "Ctrl+C".dimmed());

    out
}

fn format_session_line(session: &RepairSession) -> String {
    let mut line = format!(
        "  {:<14} {}  ({} attempt{}, {} fix{}, {})",
        format_status(session.status),
        session.path.bold(),
        session.attempts.len(),
        if session.attempts.len() == 1 { "" } else { "s" },
        session.fixes_applied(),
        if session.fixes_applied() == 1 { "" } else { "es" },
        format_duration_ms(session.duration_ms)
    );

    if session.status != SessionStatus::Succeeded {
        if let Some(attempt) = session.last_attempt() {
            if let Some(category) = attempt.error_category {
                let _ = write!(line, "\n      last error: {}", category.to_string().yellow());
            }
            if let Some(first) = attempt.pre_fix_result.errors.first() {
                let _ = write!(line, "\n      {}", first.dimmed());
            }
        }
        if let Some(detail) = &session.detail {
            let _ = write!(line, "\n      {}", detail.dimmed());
        }
    }

    line
}

/// Formats the final report of a run.
pub fn format_report(report: &RunReport) -> String {
    let mut out = String::new();

    let _ = writeln!(
        &mut out,
        "\n{} Run {}",
        "━".repeat(10).dimmed(),
        report.run_id.cyan().bold()
    );
    for session in report.sessions.values() {
        let _ = writeln!(&mut out, "{}", format_session_line(session));
    }

    let succeeded = report.count(SessionStatus::Succeeded);
    let total = report.sessions.len();
    let headline = if report.overall_success {
        format!("✅ All {total} files run cleanly").green().bold()
    } else {
        format!("❌ {succeeded}/{total} files run cleanly").red().bold()
    };
    let _ = writeln!(&mut out, "\n{headline}");

    let breakdown: Vec<String> = [
        SessionStatus::Failed,
        SessionStatus::Exhausted,
        SessionStatus::SystemError,
        SessionStatus::Cancelled,
    ]
    .into_iter()
    .filter_map(|status| {
        let n = report.count(status);
        (n > 0).then(|| format!("{n} {status}"))
    })
    .collect();
    if !breakdown.is_empty() {
        let _ = writeln!(&mut out, "  {}", breakdown.join(", ").dimmed());
    }
    let _ = writeln!(
        &mut out,
        "  Total time: {}",
        format_duration_ms(report.total_duration_ms).cyan()
    );

    out
}

// -----------------------------------------------------------------------------
// History
// -----------------------------------------------------------------------------

/// One run reconstructed from the event log.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Id of the run.
    pub run_id: String,
    /// Time of the start record, if it was logged.
    pub started_at: Option<DateTime<Utc>>,
    /// Oracle backend name.
    pub oracle: Option<String>,
    /// Number of units submitted.
    pub units: usize,
    /// Path, terminal status and attempt count of each logged session.
    pub sessions: Vec<(String, SessionStatus, usize)>,
    /// Attempt records seen for the run.
    pub attempts: usize,
    /// Outcome, if the run finished.
    pub finished: Option<RunOutcome>,
}

/// Terminal record of a run.
#[derive(Debug, Clone, Copy)]
pub struct RunOutcome {
    /// True when every session succeeded.
    pub overall_success: bool,
    /// Sessions that ended in `Succeeded`.
    pub succeeded: usize,
    /// Sessions in the run.
    pub total: usize,
    /// Wall time of the run.
    pub total_duration_ms: f64,
}

/// Groups events by run, in order of first appearance.
pub fn summarize_runs(events: &[RunEvent]) -> Vec<RunSummary> {
    let mut runs: Vec<RunSummary> = Vec::new();

    for event in events {
        let index = match runs.iter().position(|r| r.run_id == event.run_id()) {
            Some(index) => index,
            None => {
                runs.push(RunSummary {
                    run_id: event.run_id().to_string(),
                    ..RunSummary::default()
                });
                runs.len() - 1
            }
        };
        let run = &mut runs[index];

        match event {
            RunEvent::RunStarted {
                timestamp,
                units,
                oracle,
                ..
            } => {
                run.started_at = Some(*timestamp);
                run.units = units.len();
                run.oracle = Some(oracle.clone());
            }
            RunEvent::Attempt { .. } => run.attempts += 1,
            RunEvent::Session {
                path,
                status,
                attempts,
                ..
            } => run.sessions.push((path.clone(), *status, *attempts)),
            RunEvent::RunFinished {
                overall_success,
                succeeded,
                total,
                total_duration_ms,
                ..
            } => {
                run.finished = Some(RunOutcome {
                    overall_success: *overall_success,
                    succeeded: *succeeded,
                    total: *total,
                    total_duration_ms: *total_duration_ms,
                });
            }
        }
    }

    runs
}

fn format_run_headline(run: &RunSummary) -> String {
    let started = run.started_at.map_or_else(
        || "unknown start".to_string(),
        |t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    );
    let outcome = match run.finished {
        Some(o) if o.overall_success => format!("✅ {}/{}", o.succeeded, o.total).green(),
        Some(o) => format!("❌ {}/{}", o.succeeded, o.total).red(),
        None => "⏳ incomplete".yellow(),
    };
    let duration = run
        .finished
        .map(|o| format_duration_ms(o.total_duration_ms))
        .unwrap_or_default();

    format!(
        "  {}  {}  {}  {}",
        run.run_id.cyan(),
        started.dimmed(),
        outcome,
        duration.dimmed()
    )
}

/// Formats the run history, or the details of one run.
pub fn format_history(runs: &[RunSummary], run_filter: Option<&str>) -> String {
    let mut out = String::new();

    if let Some(run_id) = run_filter {
        let Some(run) = runs.iter().find(|r| r.run_id == run_id) else {
            let _ = writeln!(&mut out, "No events recorded for run {}", run_id.yellow());
            return out;
        };
        let _ = writeln!(&mut out, "{}", format_run_headline(run));
        if let Some(oracle) = &run.oracle {
            let _ = writeln!(&mut out, "  Oracle:   {oracle}");
        }
        let _ = writeln!(&mut out, "  Attempts: {}", run.attempts);
        for (path, status, attempts) in &run.sessions {
            let _ = writeln!(
                &mut out,
                "    {:<14} {} ({} attempts)",
                format_status(*status),
                path,
                attempts
            );
        }
        return out;
    }

    if runs.is_empty() {
        let _ = writeln!(&mut out, "No runs recorded yet.");
        return out;
    }

    let _ = writeln!(&mut out, "{}", format!("{} runs recorded", runs.len()).bold());
    for run in runs {
        let _ = writeln!(&mut out, "{}", format_run_headline(run));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExecutionResult, Language, RepairAttempt, SourceUnit};
    use std::collections::BTreeMap;
    use std::time::Duration;

    /// Strip ANSI color codes so assertions hold with or without a terminal.
    fn strip_ansi_codes(s: &str) -> String {
        let mut result = String::new();
        let mut chars = s.chars().peekable();
        while let Some(ch) = chars.next() {
            if ch == '\x1b' && chars.peek() == Some(&'[') {
                chars.next();
                while let Some(c) = chars.next() {
                    if c.is_ascii_alphabetic() {
                        break;
                    }
                }
            } else {
                result.push(ch);
            }
        }
        result
    }

    fn session(path: &str, status: SessionStatus, stderr: &str) -> RepairSession {
        let mut session = RepairSession::new(&SourceUnit::new(path, "", Language::Python));
        session.status = status;
        session.attempts.push(RepairAttempt {
            attempt_number: 1,
            pre_fix_result: ExecutionResult::from_output(
                i64::from(!stderr.is_empty()),
                "",
                stderr,
                Duration::ZERO,
            ),
            error_category: (!stderr.is_empty())
                .then_some(crate::model::ErrorCategory::TypeOrNameError),
            fix_applied: false,
            post_fix_content: None,
        });
        session
    }

    #[test]
    fn test_format_duration_ms() {
        assert_eq!(format_duration_ms(350.0), "350ms");
        assert_eq!(format_duration_ms(4200.0), "4.2s");
        assert_eq!(format_duration_ms(125_000.0), "2m 5s");
        assert_eq!(format_duration_ms(3_665_000.0), "1h 1m 5s");
    }

    #[test]
    fn test_format_banner() {
        let banner = BannerInfo {
            run_id: "run-abc".to_string(),
            units: 4,
            oracle: "http".to_string(),
            max_fix_attempts: 3,
            concurrency: 2,
            timeout_seconds: 30,
            network_enabled: false,
        };
        let output = strip_ansi_codes(&format_banner(&banner));
        assert!(output.contains("Mender Run Starting"));
        assert!(output.contains("run-abc"));
        assert!(output.contains("3 per file"));
        assert!(output.contains("30s"));
        assert!(output.contains("disabled"));
    }

    #[test]
    fn test_format_report_mixed() {
        let sessions = BTreeMap::from([
            ("a.py".to_string(), session("a.py", SessionStatus::Succeeded, "")),
            (
                "b.py".to_string(),
                session(
                    "b.py",
                    SessionStatus::Failed,
                    "NameError: name 'x' is not defined\n",
                ),
            ),
        ]);
        let report = RunReport::new("run-1".to_string(), sessions, Duration::from_millis(1500));

        let output = strip_ansi_codes(&format_report(&report));
        assert!(output.contains("succeeded"));
        assert!(output.contains("a.py"));
        assert!(output.contains("failed"));
        assert!(output.contains("last error: type_or_name_error"));
        assert!(output.contains("NameError: name 'x' is not defined"));
        assert!(output.contains("1/2 files run cleanly"));
        assert!(output.contains("1 failed"));
        assert!(output.contains("1.5s"));
    }

    #[test]
    fn test_format_report_all_ok() {
        let sessions = BTreeMap::from([(
            "a.py".to_string(),
            session("a.py", SessionStatus::Succeeded, ""),
        )]);
        let report = RunReport::new("run-2".to_string(), sessions, Duration::ZERO);
        let output = strip_ansi_codes(&format_report(&report));
        assert!(output.contains("All 1 files run cleanly"));
        assert!(output.contains("1 attempt,"));
    }

    #[test]
    fn test_summarize_and_format_history() {
        let ok = session("a.py", SessionStatus::Succeeded, "");
        let report = RunReport::new(
            "run-1".to_string(),
            BTreeMap::from([("a.py".to_string(), ok.clone())]),
            Duration::from_secs(2),
        );
        let events = vec![
            RunEvent::RunStarted {
                run_id: "run-1".to_string(),
                timestamp: Utc::now(),
                units: vec!["a.py".to_string()],
                max_fix_attempts: 3,
                concurrency: 1,
                oracle: "Mock".to_string(),
            },
            RunEvent::attempt("run-1", "a.py", &ok.attempts[0]),
            RunEvent::session("run-1", &ok),
            RunEvent::run_finished(&report),
            RunEvent::attempt("run-2", "b.py", &ok.attempts[0]),
        ];

        let runs = summarize_runs(&events);
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].units, 1);
        assert_eq!(runs[0].attempts, 1);
        assert!(runs[0].finished.is_some_and(|o| o.overall_success));
        assert!(runs[1].finished.is_none());

        let listing = strip_ansi_codes(&format_history(&runs, None));
        assert!(listing.contains("2 runs recorded"));
        assert!(listing.contains("run-1"));
        assert!(listing.contains("incomplete"));

        let detail = strip_ansi_codes(&format_history(&runs, Some("run-1")));
        assert!(detail.contains("Oracle:   Mock"));
        assert!(detail.contains("a.py (1 attempts)"));

        let missing = strip_ansi_codes(&format_history(&runs, Some("run-x")));
        assert!(missing.contains("No events recorded"));
    }

    #[test]
    fn test_format_history_empty() {
        assert!(format_history(&[], None).contains("No runs recorded yet."));
    }
}
