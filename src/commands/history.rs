//! `mender history`: summarize past runs from the event log.

use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::debug;

use mender::events::read_events;
use mender::format::{format_history, summarize_runs};

pub fn run(run_id: Option<&str>, log: Option<PathBuf>, config_path: Option<&Path>) -> Result<()> {
    let path = match log {
        Some(path) => path,
        None => super::load_config(config_path)?.events_path()?,
    };
    debug!("Reading events from {}", path.display());

    let events = read_events(&path)?;
    let runs = summarize_runs(&events);
    print!("{}", format_history(&runs, run_id));

    Ok(())
}
