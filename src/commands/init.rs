//! Initialize Mender files in a project directory.
//!
//! Filesystem access goes through closures so the core logic can be tested
//! without touching the disk.

use anyhow::{Context, Result};
use colored::Colorize;
use std::fmt::Write;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::templates;

/// Runs the init command, creating Mender project files.
pub(crate) fn run(force: bool) -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;

    info!("Initializing Mender in {}", cwd.display());

    let files = init_files();

    let results = init_project(
        &files,
        force,
        |path| cwd.join(path).exists(),
        |path| {
            fs::create_dir_all(cwd.join(path))
                .with_context(|| format!("Failed to create directory: {}", path.display()))
        },
        |path, content| {
            fs::write(cwd.join(path), content)
                .with_context(|| format!("Failed to write {}", path.display()))
        },
    )?;

    print!("{}", format_results(&results, &files));

    Ok(())
}

/// File to be written during init.
#[derive(Debug, Clone, PartialEq, Eq)]
struct InitFile {
    path: PathBuf,
    content: &'static str,
    description: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteResult {
    Created,
    Overwritten,
    Skipped,
}

fn init_files() -> Vec<InitFile> {
    vec![
        InitFile {
            path: PathBuf::from("mender.toml"),
            content: templates::MENDER_TOML,
            description: "Project configuration",
        },
        InitFile {
            path: PathBuf::from(".mender/.gitignore"),
            content: "*\n",
            description: "Keeps event logs out of version control",
        },
    ]
}

/// Writes every file that does not exist yet, or every file with `force`.
fn init_project<E, D, W>(
    files: &[InitFile],
    force: bool,
    exists: E,
    create_dir: D,
    mut write_file: W,
) -> Result<Vec<(PathBuf, WriteResult)>>
where
    E: Fn(&Path) -> bool,
    D: Fn(&Path) -> Result<()>,
    W: FnMut(&Path, &str) -> Result<()>,
{
    let dirs: Vec<_> = files
        .iter()
        .filter_map(|f| f.path.parent())
        .filter(|p| !p.as_os_str().is_empty())
        .collect();
    for dir in dirs {
        create_dir(dir)?;
    }

    let mut results = Vec::new();
    for file in files {
        // Checked before writing; afterwards the file always exists.
        let existed = exists(&file.path);
        let result = if existed && !force {
            WriteResult::Skipped
        } else {
            write_file(&file.path, file.content)?;
            if existed {
                WriteResult::Overwritten
            } else {
                WriteResult::Created
            }
        };
        results.push((file.path.clone(), result));
    }

    Ok(results)
}

fn format_results(results: &[(PathBuf, WriteResult)], files: &[InitFile]) -> String {
    let mut out = String::new();

    let _ = writeln!(
        &mut out,
        "\n{} Mender initialized successfully!\n",
        "✓".green().bold()
    );
    let _ = writeln!(&mut out, "Files:");

    for (path, result) in results {
        let desc = files
            .iter()
            .find(|f| &f.path == path)
            .map_or("", |f| f.description);

        let _ = match result {
            WriteResult::Created => writeln!(
                &mut out,
                "  {} - {}",
                path.display().to_string().cyan(),
                desc
            ),
            WriteResult::Overwritten => {
                writeln!(&mut out, "  {} {} (overwritten)", "↻".blue(), path.display())
            }
            WriteResult::Skipped => writeln!(
                &mut out,
                "  {} {} (already exists, use --force to overwrite)",
                "⊘".yellow(),
                path.display()
            ),
        };
    }

    let _ = writeln!(&mut out, "\n{}", "Next steps:".yellow().bold());
    let _ = writeln!(
        &mut out,
        "  1. Edit {} to choose a repair oracle",
        "mender.toml".cyan()
    );
    let _ = writeln!(
        &mut out,
        "  2. Run {} on your generated files",
        "mender run manifest.json".green()
    );

    out
}
