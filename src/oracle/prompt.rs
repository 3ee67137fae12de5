//! Repair prompt construction and response parsing.

use std::fmt::Write;

use super::FixRequest;

/// System message for chat-style oracles.
pub const SYSTEM_PROMPT: &str = "You repair source files that fail to run. \
Reply with the complete corrected file in a single fenced code block and nothing else.";

/// Lines of stderr carried into the prompt.
const STDERR_TAIL_LINES: usize = 40;

/// Builds the repair prompt for a failed unit.
pub fn build_prompt(request: &FixRequest<'_>) -> String {
    let unit = request.unit;
    let result = request.result;
    let mut prompt = String::new();

    let _ = writeln!(prompt, "## FILE THAT FAILED TO RUN");
    let _ = writeln!(prompt, "Path: {}", unit.path);
    let _ = writeln!(prompt, "Language: {}", unit.language);
    let _ = writeln!(prompt, "Exit code: {}", result.exit_code);
    let _ = writeln!(prompt, "Error category: {}", request.category);
    let _ = writeln!(prompt, "\n{}", request.category.repair_hint());

    if !result.errors.is_empty() {
        let _ = writeln!(prompt, "\n## ERRORS");
        for error in &result.errors {
            let _ = writeln!(prompt, "- {error}");
        }
    }

    let tail = result.stderr_tail(STDERR_TAIL_LINES);
    if !tail.is_empty() {
        let _ = writeln!(prompt, "\n## STDERR (tail)\n```\n{tail}\n```");
    }

    let _ = writeln!(
        prompt,
        "\n## CURRENT SOURCE\n```{}\n{}\n```",
        unit.language,
        unit.content.trim_end()
    );
    let _ = writeln!(
        prompt,
        "\nReturn the full corrected contents of {} in one fenced code block. \
         Keep the file's purpose and public names unchanged.",
        unit.path
    );

    prompt
}

/// Extracts the revised source from an oracle response.
///
/// Takes the first fenced code block; an unfenced response is used whole.
/// Returns `None` for an empty response.
pub fn extract_code(response: &str) -> Option<String> {
    let code = match fenced_block(response) {
        Some(block) => block,
        None => response.trim().to_string(),
    };

    if code.trim().is_empty() {
        return None;
    }

    let mut code = code;
    if !code.ends_with('\n') {
        code.push('\n');
    }
    Some(code)
}

fn fenced_block(response: &str) -> Option<String> {
    let mut lines = response.lines();
    lines.by_ref().find(|l| l.trim_start().starts_with("```"))?;

    let mut block = String::new();
    for line in lines {
        if line.trim_start().starts_with("```") {
            return Some(block);
        }
        block.push_str(line);
        block.push('\n');
    }
    // Unterminated fence: keep what followed it
    Some(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ErrorCategory, ExecutionResult, Language, SourceUnit};
    use std::time::Duration;

    #[test]
    fn test_prompt_contains_failure_context() {
        let unit = SourceUnit::new("app/main.py", "import requests\n", Language::Python);
        let result = ExecutionResult::from_output(
            1,
            "",
            "ModuleNotFoundError: No module named 'requests'\n",
            Duration::ZERO,
        );
        let request = FixRequest {
            unit: &unit,
            category: ErrorCategory::MissingDependency,
            result: &result,
        };

        let prompt = build_prompt(&request);
        assert!(prompt.contains("Path: app/main.py"));
        assert!(prompt.contains("Language: python"));
        assert!(prompt.contains("Error category: missing_dependency"));
        assert!(prompt.contains("- ModuleNotFoundError: No module named 'requests'"));
        assert!(prompt.contains("```python\nimport requests\n```"));
    }

    #[test]
    fn test_extract_first_fenced_block() {
        let response = "Here is the fix:\n```python\nprint('fixed')\n```\nAnd another:\n```\nx\n```";
        assert_eq!(extract_code(response), Some("print('fixed')\n".to_string()));
    }

    #[test]
    fn test_extract_unfenced_response() {
        assert_eq!(
            extract_code("  console.log(1);  \n"),
            Some("console.log(1);\n".to_string())
        );
    }

    #[test]
    fn test_extract_unterminated_fence() {
        assert_eq!(
            extract_code("```js\nconst a = 1;\n"),
            Some("const a = 1;\n".to_string())
        );
    }

    #[test]
    fn test_extract_empty_response() {
        assert_eq!(extract_code(""), None);
        assert_eq!(extract_code("```\n```"), None);
    }
}
