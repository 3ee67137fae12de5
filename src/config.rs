//! Configuration loaded from `mender.toml`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::model::{Language, RuntimeSpec};
use crate::oracle::Provider;

/// Project config file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "mender.toml";

/// Environment variable overriding `[oracle].provider`.
pub const ORACLE_ENV: &str = "MENDER_ORACLE";

/// Contents of `mender.toml`. Every section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// `[sandbox]`
    #[serde(default)]
    pub sandbox: SandboxConfig,
    /// `[repair]`
    #[serde(default)]
    pub repair: RepairConfig,
    /// `[oracle]`
    #[serde(default)]
    pub oracle: OracleConfig,
    /// `[events]`
    #[serde(default)]
    pub events: EventsConfig,
    /// `[logging]`
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Execution limits applied to every sandbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Wall-clock budget per execution
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Memory limit (e.g., "512m", "2g")
    #[serde(default = "default_memory")]
    pub memory: String,

    /// CPU limit (e.g., "1", "0.5")
    #[serde(default = "default_cpus")]
    pub cpus: String,

    /// Allow executed code to reach the network
    #[serde(default)]
    pub network_enabled: bool,

    /// Maximum processes inside the container
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,

    /// Budget for dependency installation
    #[serde(default = "default_install_timeout_seconds")]
    pub install_timeout_seconds: u64,

    /// Image for every language, overriding `images`
    #[serde(default)]
    pub image: Option<String>,

    /// Per-language images, keyed by language name
    #[serde(default)]
    pub images: BTreeMap<String, String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout_seconds(),
            memory: default_memory(),
            cpus: default_cpus(),
            network_enabled: false,
            pids_limit: default_pids_limit(),
            install_timeout_seconds: default_install_timeout_seconds(),
            image: None,
            images: BTreeMap::new(),
        }
    }
}

/// Retry budget and fan-out
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairConfig {
    /// Executions per unit before giving up
    #[serde(default = "default_max_fix_attempts")]
    pub max_fix_attempts: u32,

    /// Sessions in flight; derived from host parallelism when unset
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            max_fix_attempts: default_max_fix_attempts(),
            max_concurrency: None,
        }
    }
}

/// Oracle configuration - selects and configures the repair backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    /// Which backend to use: "http" or "command"
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Budget for one oracle call
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,

    /// Pause before the single retry of a transient failure
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Settings for the `http` backend
    #[serde(default)]
    pub http: HttpOracleConfig,

    /// Settings for the `command` backend
    #[serde(default)]
    pub command: CommandOracleConfig,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            request_timeout_seconds: default_request_timeout_seconds(),
            retry_delay_ms: default_retry_delay_ms(),
            http: HttpOracleConfig::default(),
            command: CommandOracleConfig::default(),
        }
    }
}

impl OracleConfig {
    /// Parse the provider string into a Provider enum
    pub fn get_provider(&self) -> Result<Provider> {
        self.provider.parse()
    }
}

/// OpenAI-compatible chat completions endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpOracleConfig {
    /// Chat completions URL
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Model name sent with every request
    #[serde(default = "default_model")]
    pub model: String,

    /// Environment variable holding the API key; empty disables auth
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

impl Default for HttpOracleConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            temperature: default_temperature(),
        }
    }
}

/// Agent CLI invoked with the prompt on stdin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOracleConfig {
    /// Full command line, split with shell quoting rules
    /// - Default: "claude -p --output-format text"
    #[serde(default = "default_command")]
    pub command: String,
}

impl Default for CommandOracleConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
        }
    }
}

/// Audit log location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// JSON-lines audit log
    #[serde(default = "default_events_log")]
    pub log: String,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            log: default_events_log(),
        }
    }
}

/// Diagnostic logging
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Optional JSON log file in addition to stderr
    #[serde(default)]
    pub file: Option<String>,
}

// Default value functions
fn default_timeout_seconds() -> u64 {
    30
}

fn default_memory() -> String {
    "512m".to_string()
}

fn default_cpus() -> String {
    "1".to_string()
}

fn default_pids_limit() -> i64 {
    256
}

fn default_install_timeout_seconds() -> u64 {
    120
}

fn default_max_fix_attempts() -> u32 {
    crate::repair::DEFAULT_MAX_FIX_ATTEMPTS
}

fn default_provider() -> String {
    "http".to_string()
}

fn default_request_timeout_seconds() -> u64 {
    120
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_temperature() -> f64 {
    0.2
}

fn default_command() -> String {
    "claude -p --output-format text".to_string()
}

fn default_events_log() -> String {
    ".mender/events.jsonl".to_string()
}

impl Config {
    /// Load `mender.toml` from a directory, using defaults if not found
    pub fn load(project_dir: &Path) -> Result<Self> {
        let config_path = project_dir.join(CONFIG_FILE);

        if !config_path.exists() {
            debug!("No {} in {}, using defaults", CONFIG_FILE, project_dir.display());
            return Ok(Self::default());
        }

        Self::load_file(&config_path)
    }

    /// Load an explicitly named config file; a missing file is an error
    pub fn load_file(config_path: &Path) -> Result<Self> {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        Ok(config)
    }

    /// Builds the execution configuration for a run.
    pub fn runtime_spec(
        &self,
        dependencies: BTreeMap<Language, Vec<String>>,
    ) -> Result<RuntimeSpec> {
        let sandbox = &self.sandbox;
        if sandbox.timeout_seconds == 0 {
            anyhow::bail!("[sandbox].timeout_seconds must be greater than 0");
        }

        let mut images = BTreeMap::new();
        for (name, image) in &sandbox.images {
            let language: Language = name
                .parse()
                .with_context(|| format!("Invalid key in [sandbox.images]: '{name}'"))?;
            images.insert(language, image.clone());
        }

        Ok(RuntimeSpec {
            image: sandbox.image.clone(),
            images,
            timeout_seconds: sandbox.timeout_seconds,
            memory_limit: parse_memory_limit(&sandbox.memory)?,
            network_enabled: sandbox.network_enabled,
            cpus: parse_cpus(&sandbox.cpus)?,
            pids_limit: sandbox.pids_limit,
            install_timeout_seconds: sandbox.install_timeout_seconds,
            dependencies,
        })
    }

    /// Resolved path of the event log.
    pub fn events_path(&self) -> Result<PathBuf> {
        expand_path(&self.events.log)
    }

    /// Resolved path of the JSON log file, if configured.
    pub fn log_file(&self) -> Result<Option<PathBuf>> {
        self.logging.file.as_deref().map(expand_path).transpose()
    }

    /// Resolves the oracle backend.
    /// Priority: CLI flag > MENDER_ORACLE env var > config file.
    pub fn resolve_provider(&self, provider_override: Option<&str>) -> Result<Provider> {
        let env_provider = std::env::var(ORACLE_ENV).ok();
        self.resolve_provider_with_env(provider_override, env_provider.as_deref())
    }

    /// Provider resolution with an explicit env var value, for testing.
    fn resolve_provider_with_env(
        &self,
        provider_override: Option<&str>,
        env_provider: Option<&str>,
    ) -> Result<Provider> {
        if let Some(p) = provider_override {
            debug!("Using CLI oracle override: {}", p);
            return p.parse();
        }

        if let Some(env_val) = env_provider.filter(|v| !v.is_empty()) {
            debug!("Using {} env var: {}", ORACLE_ENV, env_val);
            return env_val.parse();
        }

        self.oracle.get_provider()
    }
}

/// Parse memory limit string (e.g., "2g", "512m", "64k") to bytes
pub fn parse_memory_limit(limit: &str) -> Result<u64> {
    let limit = limit.trim().to_lowercase();
    let limit = limit.strip_suffix('b').unwrap_or(&limit);

    let (num, multiplier) = if let Some(num) = limit.strip_suffix('g') {
        (num, 1024 * 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('m') {
        (num, 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('k') {
        (num, 1024)
    } else {
        (limit, 1)
    };

    let value: u64 = num
        .trim()
        .parse()
        .with_context(|| format!("Invalid memory limit: '{limit}'"))?;
    if value == 0 {
        anyhow::bail!("Memory limit must be greater than 0");
    }
    value
        .checked_mul(multiplier)
        .with_context(|| format!("Memory limit too large: '{limit}'"))
}

/// Parse CPU limit string (e.g., "2", "0.5")
pub fn parse_cpus(cpus: &str) -> Result<f64> {
    let value: f64 = cpus
        .trim()
        .parse()
        .with_context(|| format!("Invalid CPU limit: '{cpus}'"))?;
    if !value.is_finite() || value <= 0.0 {
        anyhow::bail!("CPU limit must be a positive number, got '{cpus}'");
    }
    Ok(value)
}

/// Expand a leading `~/` to the home directory
pub fn expand_path(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir().context("Could not determine home directory")?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}
