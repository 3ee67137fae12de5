use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;
mod templates;

#[derive(Parser)]
#[command(name = "mender")]
#[command(
    author,
    version,
    about = "Run generated source files in sandboxes and repair them until they work"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to mender.toml (default: ./mender.toml)
    #[arg(long, global = true, env = "MENDER_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default mender.toml in the current directory
    Init {
        /// Force overwrite existing files
        #[arg(short, long)]
        force: bool,
    },

    /// Execute the files of a manifest and repair the ones that fail
    Run(commands::run::RunArgs),

    /// Summarize past runs from the event log
    History {
        /// Show the details of one run
        #[arg(long)]
        run: Option<String>,

        /// Event log to read (default: [events].log from the config)
        #[arg(long)]
        log: Option<PathBuf>,
    },
}

/// Installs the stderr subscriber, plus a JSON file layer when a log file is configured.
fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = if verbose {
        EnvFilter::new("mender=debug")
    } else {
        EnvFilter::new("mender=info")
    };

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            if let Some(dir) = dir {
                fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            }
            let file_name = path
                .file_name()
                .with_context(|| format!("Invalid log file path: {}", path.display()))?;
            let appender =
                tracing_appender::rolling::never(dir.unwrap_or_else(|| Path::new(".")), file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // A broken config is reported by the command that needs it.
    let log_file = commands::load_config(cli.config.as_deref())
        .ok()
        .and_then(|config| config.log_file().ok().flatten());
    let _guard = init_logging(cli.verbose, log_file.as_deref())?;

    match cli.command {
        Commands::Init { force } => {
            commands::init::run(force)?;
        }
        Commands::Run(args) => {
            let success = commands::run::run(args, cli.config.as_deref()).await?;
            if !success {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::History { run, log } => {
            commands::history::run(run.as_deref(), log, cli.config.as_deref())?;
        }
    }

    Ok(ExitCode::SUCCESS)
}
