//! `mender run`: execute and repair the files of an upstream manifest.

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use mender::config::Config;
use mender::coordinator::{new_run_id, Coordinator, CoordinatorOptions};
use mender::events::{EventSink, JsonlEventLog};
use mender::format::{format_banner, format_report, BannerInfo};
use mender::manifest::Manifest;
use mender::model::RunReport;
use mender::oracle::{CommandOracle, HttpOracle, Provider, RepairClient, RepairOracle};
use mender::sandbox::{DockerSandbox, Sandbox};

/// Arguments of `mender run`.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Manifest of generated files (JSON)
    pub manifest: PathBuf,

    /// Executions per file before giving up (overrides [repair].max_fix_attempts)
    #[arg(short, long)]
    pub max_fix_attempts: Option<u32>,

    /// Files repaired in parallel (overrides [repair].max_concurrency)
    #[arg(short, long)]
    pub concurrency: Option<usize>,

    /// Execution timeout in seconds (overrides [sandbox].timeout_seconds)
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Repair oracle: http or command (overrides MENDER_ORACLE and config)
    #[arg(long)]
    pub oracle: Option<String>,

    /// Directory to write the final content of every file to
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Print the report as JSON instead of text
    #[arg(long)]
    pub json: bool,
}

/// Runs the command. Returns whether every file ended up running cleanly.
pub async fn run(args: RunArgs, config_path: Option<&Path>) -> Result<bool> {
    let mut config = super::load_config(config_path)?;
    apply_overrides(&mut config, &args)?;

    let manifest = Manifest::load(&args.manifest)?;
    let (units, dependencies) = manifest.into_parts()?;
    if units.is_empty() {
        bail!("No runnable source files in {}", args.manifest.display());
    }
    let spec = config.runtime_spec(dependencies)?;
    debug!("Loaded {} files from {}", units.len(), args.manifest.display());

    let provider = config.resolve_provider(args.oracle.as_deref())?;
    let client = build_client(&config, provider);

    let run_id = new_run_id();
    let sandbox: Arc<dyn Sandbox> = Arc::new(
        DockerSandbox::connect()
            .context("Failed to connect to Docker")?
            .with_run_id(&run_id),
    );

    let events_path = config.events_path()?;
    let sink: Arc<dyn EventSink> = Arc::new(JsonlEventLog::open(&events_path)?);
    info!("Recording events to {}", events_path.display());

    let coordinator = Coordinator::new(sandbox, client, sink).with_options(CoordinatorOptions {
        max_concurrency: config.repair.max_concurrency,
        run_id: Some(run_id.clone()),
        ..CoordinatorOptions::default()
    });

    if !args.json {
        print!(
            "{}",
            format_banner(&BannerInfo {
                run_id: run_id.clone(),
                units: units.len(),
                oracle: provider.to_string(),
                max_fix_attempts: config.repair.max_fix_attempts,
                concurrency: coordinator.concurrency().min(units.len()),
                timeout_seconds: spec.timeout_seconds,
                network_enabled: spec.network_enabled,
            })
        );
    }

    let token = coordinator.cancellation_token();
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            token.cancel();
        }
    });

    let result = coordinator
        .run(units, spec, config.repair.max_fix_attempts)
        .await;
    signal.abort();
    let report = result?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize report")?
        );
    } else {
        print!("{}", format_report(&report));
    }

    if let Some(dir) = &args.output {
        let written = write_outputs(&report, dir)?;
        if !args.json {
            println!(
                "  Wrote {} files to {}",
                written.to_string().cyan(),
                dir.display().to_string().cyan()
            );
        }
    }

    Ok(report.overall_success)
}

fn apply_overrides(config: &mut Config, args: &RunArgs) -> Result<()> {
    if let Some(max) = args.max_fix_attempts {
        if max == 0 {
            bail!("--max-fix-attempts must be at least 1");
        }
        config.repair.max_fix_attempts = max;
    }
    if let Some(concurrency) = args.concurrency {
        if concurrency == 0 {
            bail!("--concurrency must be at least 1");
        }
        config.repair.max_concurrency = Some(concurrency);
    }
    if let Some(timeout) = args.timeout {
        config.sandbox.timeout_seconds = timeout;
    }
    Ok(())
}

fn build_client(config: &Config, provider: Provider) -> RepairClient {
    let oracle: Arc<dyn RepairOracle> = match provider {
        Provider::Http => Arc::new(HttpOracle::new(config.oracle.http.clone())),
        Provider::Command => Arc::new(CommandOracle::new(config.oracle.command.clone())),
    };
    RepairClient::new(
        oracle,
        Duration::from_secs(config.oracle.request_timeout_seconds),
    )
    .with_retry_delay(Duration::from_millis(config.oracle.retry_delay_ms))
}

/// Writes the final content of every session below `dir`. Returns the number of files written.
fn write_outputs(report: &RunReport, dir: &Path) -> Result<usize> {
    for session in report.sessions.values() {
        let target = dir.join(safe_relative_path(&session.path)?);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        fs::write(&target, &session.final_content)
            .with_context(|| format!("Failed to write {}", target.display()))?;
    }
    Ok(report.sessions.len())
}

/// Rejects unit paths that would land outside the output directory.
fn safe_relative_path(path: &str) -> Result<PathBuf> {
    let path = Path::new(path);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || path.as_os_str().is_empty() {
        bail!(
            "Refusing to write '{}' outside the output directory",
            path.display()
        );
    }
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mender::model::{Language, RepairSession, SessionStatus, SourceUnit};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn args() -> RunArgs {
        RunArgs {
            manifest: PathBuf::from("manifest.json"),
            max_fix_attempts: None,
            concurrency: None,
            timeout: None,
            oracle: None,
            output: None,
            json: false,
        }
    }

    #[test]
    fn test_apply_overrides() {
        let mut config = Config::default();
        let mut a = args();
        a.max_fix_attempts = Some(5);
        a.concurrency = Some(2);
        a.timeout = Some(10);

        apply_overrides(&mut config, &a).unwrap();
        assert_eq!(config.repair.max_fix_attempts, 5);
        assert_eq!(config.repair.max_concurrency, Some(2));
        assert_eq!(config.sandbox.timeout_seconds, 10);
    }

    #[test]
    fn test_apply_overrides_rejects_zero() {
        let mut config = Config::default();
        let mut a = args();
        a.max_fix_attempts = Some(0);
        assert!(apply_overrides(&mut config, &a).is_err());

        let mut a = args();
        a.concurrency = Some(0);
        assert!(apply_overrides(&mut config, &a).is_err());
    }

    #[test]
    fn test_safe_relative_path() {
        assert!(safe_relative_path("src/main.py").is_ok());
        assert!(safe_relative_path("./main.py").is_ok());
        assert!(safe_relative_path("../main.py").is_err());
        assert!(safe_relative_path("/etc/passwd").is_err());
        assert!(safe_relative_path("").is_err());
    }

    #[test]
    fn test_write_outputs() {
        let dir = TempDir::new().unwrap();
        let mut session = RepairSession::new(&SourceUnit::new(
            "pkg/main.py",
            "print(1)\n",
            Language::Python,
        ));
        session.status = SessionStatus::Succeeded;
        let report = RunReport::new(
            "run-1".to_string(),
            BTreeMap::from([("pkg/main.py".to_string(), session)]),
            Duration::ZERO,
        );

        assert_eq!(write_outputs(&report, dir.path()).unwrap(), 1);
        let written = fs::read_to_string(dir.path().join("pkg/main.py")).unwrap();
        assert_eq!(written, "print(1)\n");
    }
}
