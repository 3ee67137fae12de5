//! Loading generated files handed over by the upstream generator.
//!
//! ```json
//! {
//!   "dependencies": { "python": ["requests"], "javascript": ["lodash"] },
//!   "entrypoint": "main.py",
//!   "files": { "main.py": "import requests\n", "util.py": "..." }
//! }
//! ```
//!
//! `files` may also be a list of `{ "path", "content", "language"?, "entrypoint"? }`.
//! `dependencies` may be a plain list; it then belongs to the entrypoint's
//! language, or to the only language present. Files that are not source code
//! (`README.md`, `requirements.txt`) are skipped.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::warn;

use crate::model::{Language, SourceUnit};

/// One file entry in list form.
#[derive(Debug, Clone, Deserialize)]
pub struct FileEntry {
    /// Relative path, unique within the manifest.
    pub path: String,
    /// Generated source text.
    pub content: String,
    /// Language name, when the extension is not enough.
    #[serde(default)]
    pub language: Option<String>,
    /// Whether this file is the program entrypoint.
    #[serde(default)]
    pub entrypoint: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Files {
    Map(BTreeMap<String, String>),
    List(Vec<FileEntry>),
}

/// Declared packages, either for one language or keyed by language name.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Dependencies {
    /// Packages for the entrypoint's language.
    List(Vec<String>),
    /// Packages per language, e.g. `{ "python": ["requests"] }`.
    ByLanguage(BTreeMap<String, Vec<String>>),
}

impl Default for Dependencies {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

/// A parsed manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    /// Packages to install before every execution.
    #[serde(default)]
    pub dependencies: Dependencies,
    /// Path of the program entrypoint.
    #[serde(default)]
    pub entrypoint: Option<String>,
    files: Files,
}

impl Manifest {
    /// Reads and parses a manifest file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse manifest: {}", path.display()))
    }

    /// Parses manifest JSON.
    pub fn parse(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Invalid manifest JSON")
    }

    /// Converts the manifest into source units and per-language dependencies.
    ///
    /// Languages are inferred from extensions; files with no recognizable
    /// language are skipped. With no entrypoint declared, a single-file
    /// manifest treats its file as the entrypoint.
    pub fn into_parts(self) -> Result<(Vec<SourceUnit>, BTreeMap<Language, Vec<String>>)> {
        let entries: Vec<FileEntry> = match self.files {
            Files::Map(map) => map
                .into_iter()
                .map(|(path, content)| FileEntry {
                    path,
                    content,
                    language: None,
                    entrypoint: false,
                })
                .collect(),
            Files::List(list) => list,
        };

        if let Some(entry) = &self.entrypoint {
            if !entries.iter().any(|e| &e.path == entry) {
                anyhow::bail!("Entrypoint '{entry}' is not one of the manifest files");
            }
        }

        let mut resolved = Vec::with_capacity(entries.len());
        for entry in entries {
            let language = match &entry.language {
                Some(name) => name
                    .parse::<Language>()
                    .with_context(|| format!("Invalid language for {}", entry.path))?,
                None => match Language::from_path(&entry.path) {
                    Some(language) => language,
                    None => {
                        warn!("Skipping {}: not a supported source file", entry.path);
                        continue;
                    }
                },
            };
            resolved.push((entry, language));
        }

        if let Some(entry) = &self.entrypoint {
            if !resolved.iter().any(|(e, _)| &e.path == entry) {
                anyhow::bail!("Entrypoint '{entry}' is not a supported source file");
            }
        }

        let single = resolved.len() == 1;
        let any_flagged = self.entrypoint.is_some() || resolved.iter().any(|(e, _)| e.entrypoint);

        let units: Vec<SourceUnit> = resolved
            .into_iter()
            .map(|(entry, language)| {
                let is_entrypoint = entry.entrypoint
                    || self.entrypoint.as_deref() == Some(entry.path.as_str())
                    || (single && !any_flagged);
                let unit = SourceUnit::new(entry.path, entry.content, language);
                if is_entrypoint {
                    unit.as_entrypoint()
                } else {
                    unit
                }
            })
            .collect();

        let dependencies = resolve_dependencies(self.dependencies, &units)?;
        Ok((units, dependencies))
    }
}

fn resolve_dependencies(
    dependencies: Dependencies,
    units: &[SourceUnit],
) -> Result<BTreeMap<Language, Vec<String>>> {
    match dependencies {
        Dependencies::ByLanguage(map) => map
            .into_iter()
            .map(|(name, packages)| {
                let language = name
                    .parse::<Language>()
                    .with_context(|| format!("Invalid key in \"dependencies\": '{name}'"))?;
                Ok((language, packages))
            })
            .collect(),
        Dependencies::List(packages) if packages.is_empty() => Ok(BTreeMap::new()),
        Dependencies::List(packages) => {
            let owner = units.iter().find(|u| u.entrypoint).map(|u| u.language);
            let owner = match owner {
                Some(language) => language,
                None => {
                    let mut languages = units.iter().map(|u| u.language);
                    let first = languages
                        .next()
                        .context("\"dependencies\" declared but the manifest has no source files")?;
                    if languages.any(|l| l != first) {
                        anyhow::bail!(
                            "\"dependencies\" is a plain list but the manifest mixes languages \
                             without an entrypoint; key it by language instead"
                        );
                    }
                    first
                }
            };
            Ok(BTreeMap::from([(owner, packages)]))
        }
    }
}
