//! Per-language execution strategies.
//!
//! Each [`Language`] variant indexes into a static table; the sandbox never
//! branches on language names at runtime.

use std::path::Path;

use crate::model::Language;

/// Placeholder replaced by the in-sandbox file path.
const FILE: &str = "{file}";

/// How to install dependencies for and run one language.
#[derive(Debug)]
pub struct RuntimeStrategy {
    /// Language this entry serves. Must match its table index.
    pub language: Language,
    /// Image used when the runtime spec does not override it.
    pub default_image: &'static str,
    /// Extension given to files whose path has none.
    pub extension: &'static str,
    /// Shell command prefix that installs packages, if the runtime has a package manager.
    install: Option<&'static str>,
    /// Argv for running the unit as a program.
    run: &'static [&'static str],
    /// Argv for loading a non-entrypoint unit.
    check: &'static [&'static str],
}

static STRATEGIES: [RuntimeStrategy; 4] = [
    RuntimeStrategy {
        language: Language::Python,
        default_image: "python:3.12-slim",
        extension: "py",
        install: Some("pip install --no-cache-dir --quiet --disable-pip-version-check"),
        run: &["python", FILE],
        // Executes module-level code but skips `if __name__ == "__main__"` blocks
        check: &[
            "python",
            "-c",
            "import runpy, sys; runpy.run_path(sys.argv[1], run_name='__mender_check__')",
            FILE,
        ],
    },
    RuntimeStrategy {
        language: Language::JavaScript,
        default_image: "node:22-slim",
        extension: "js",
        install: Some("npm install --no-audit --no-fund --silent"),
        run: &["node", FILE],
        check: &["node", "--check", FILE],
    },
    RuntimeStrategy {
        language: Language::TypeScript,
        default_image: "node:22-slim",
        extension: "ts",
        install: Some("npm install --no-audit --no-fund --silent"),
        run: &["node", "--experimental-strip-types", FILE],
        check: &["node", "--experimental-strip-types", FILE],
    },
    RuntimeStrategy {
        language: Language::Shell,
        default_image: "debian:bookworm-slim",
        extension: "sh",
        install: Some("apt-get update -qq && apt-get install -y -qq --no-install-recommends"),
        run: &["bash", FILE],
        check: &["bash", "-n", FILE],
    },
];

impl Language {
    /// Execution strategy for this language.
    pub fn strategy(self) -> &'static RuntimeStrategy {
        &STRATEGIES[self as usize]
    }
}

impl RuntimeStrategy {
    /// File name used inside the sandbox for a unit path.
    ///
    /// Keeps the original base name so tracebacks point at a recognizable file.
    pub fn file_name(&self, unit_path: &str) -> String {
        let base = Path::new(unit_path)
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.starts_with('.'))
            .map(|n| {
                n.chars()
                    .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
                    .collect::<String>()
            })
            .filter(|n| !n.is_empty());

        match base {
            Some(name) if Path::new(&name).extension().is_some() => name,
            Some(name) => format!("{name}.{}", self.extension),
            None => format!("main.{}", self.extension),
        }
    }

    /// Argv that executes `file`.
    pub fn command(&self, file: &str, entrypoint: bool) -> Vec<String> {
        let template = if entrypoint { self.run } else { self.check };
        template
            .iter()
            .map(|part| if *part == FILE { file.to_string() } else { (*part).to_string() })
            .collect()
    }

    /// Shell command installing `dependencies`, or `None` when there is nothing to do.
    pub fn install_command(&self, dependencies: &[String]) -> Option<String> {
        let prefix = self.install?;
        let packages: Vec<&str> = dependencies
            .iter()
            .map(|d| d.trim())
            .filter(|d| !d.is_empty())
            .collect();
        if packages.is_empty() {
            return None;
        }
        Some(format!("{prefix} {}", shell_words::join(packages)))
    }
}
