//! Agent CLI repair oracle
//!
//! Runs the configured command line, e.g.
//! ```bash
//! claude -p --output-format text
//! ```
//!
//! The prompt is piped via stdin and the revision is read from stdout.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::error::looks_rate_limited;
use super::prompt::{build_prompt, extract_code, SYSTEM_PROMPT};
use super::{FixRequest, OracleError, RepairOracle};
use crate::config::CommandOracleConfig;

/// Repair oracle backed by an agent CLI.
pub struct CommandOracle {
    config: CommandOracleConfig,
}

impl CommandOracle {
    /// Creates an oracle that runs `config.command` for every request.
    pub fn new(config: CommandOracleConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RepairOracle for CommandOracle {
    fn name(&self) -> &'static str {
        "Command"
    }

    async fn propose_fix(&self, request: &FixRequest<'_>) -> Result<Option<String>, OracleError> {
        let argv = shell_words::split(&self.config.command)
            .map_err(|e| OracleError::misconfigured(format!("invalid oracle command: {e}")))?;
        let Some((program, args)) = argv.split_first() else {
            return Err(OracleError::misconfigured(
                "[oracle.command].command is empty",
            ));
        };

        info!("Running repair command for {}: {}", request.unit.path, program);
        debug!("Command args: {:?}", args);

        // Dropped futures (timeouts, cancellation) must not leave the agent running
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    OracleError::misconfigured(format!(
                        "repair command '{program}' not found.\n\
                         Configure it in mender.toml:\n\
                         [oracle.command]\n\
                         command = \"/full/path/to/agent -p\""
                    ))
                } else {
                    OracleError::transient(format!("failed to spawn '{program}': {e}"))
                }
            })?;

        let prompt = format!("{SYSTEM_PROMPT}\n\n{}", build_prompt(request));
        if let Some(mut stdin) = child.stdin.take() {
            // The agent may exit without reading; its exit status decides the outcome
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                debug!("Failed to write prompt to repair command: {}", e);
            }
            let _ = stdin.flush().await;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| OracleError::transient(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("Repair command stderr: {}", stderr.trim());
            let message = format!(
                "repair command failed with exit code {:?}: {}",
                output.status.code(),
                stderr.trim()
            );
            return if looks_rate_limited(&stderr) {
                Err(OracleError::transient(message))
            } else {
                Err(OracleError::rejected(message))
            };
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        debug!("Repair command output length: {} bytes", stdout.len());
        Ok(extract_code(&stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ErrorCategory, ExecutionResult, Language, SourceUnit};
    use std::time::Duration;

    fn oracle(command: &str) -> CommandOracle {
        CommandOracle::new(CommandOracleConfig {
            command: command.to_string(),
        })
    }

    async fn ask(command: &str) -> Result<Option<String>, OracleError> {
        let unit = SourceUnit::new("main.py", "print(x)\n", Language::Python);
        let result =
            ExecutionResult::from_output(1, "", "NameError: name 'x' is not defined\n", Duration::ZERO);
        let request = FixRequest {
            unit: &unit,
            category: ErrorCategory::TypeOrNameError,
            result: &result,
        };
        oracle(command).propose_fix(&request).await
    }

    #[test]
    fn test_command_oracle_name() {
        assert_eq!(oracle("claude -p").name(), "Command");
    }

    #[tokio::test]
    async fn test_reads_revision_from_stdout() {
        let fix = ask(r#"sh -c "cat >/dev/null; printf 'x = 1\nprint(x)\n'""#)
            .await
            .unwrap();
        assert_eq!(fix.as_deref(), Some("x = 1\nprint(x)\n"));
    }

    #[tokio::test]
    async fn test_prompt_is_piped_to_stdin() {
        let fix = ask(r#"sh -c "grep -c 'Path: main.py'""#).await.unwrap();
        assert_eq!(fix.as_deref(), Some("1\n"));
    }

    #[tokio::test]
    async fn test_empty_output_declines() {
        let fix = ask(r#"sh -c "cat >/dev/null""#).await.unwrap();
        assert_eq!(fix, None);
    }

    #[tokio::test]
    async fn test_rate_limit_is_transient() {
        let err = ask(r#"sh -c "echo 'rate limit exceeded' >&2; exit 1""#)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_failure_is_definitive() {
        let err = ask(r#"sh -c "echo boom >&2; exit 2""#).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_misconfigured() {
        let err = ask("mender-no-such-agent-binary -p").await.unwrap_err();
        assert!(matches!(err, OracleError::Misconfigured { .. }));
    }

    #[tokio::test]
    async fn test_empty_command_is_misconfigured() {
        let err = ask("   ").await.unwrap_err();
        assert!(matches!(err, OracleError::Misconfigured { .. }));
    }
}
