//! CLI command implementations.

pub mod history;
pub mod init;
pub mod run;

use anyhow::{Context, Result};
use std::path::Path;

use mender::config::Config;

/// Loads `--config` when given, otherwise `mender.toml` from the working directory.
pub(crate) fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_file(path),
        None => {
            let cwd = std::env::current_dir().context("Failed to get current directory")?;
            Config::load(&cwd)
        }
    }
}
