//! Maps failed executions to an [`ErrorCategory`].
//!
//! Classification is a pure function of the `ExecutionResult`: pattern
//! tables are matched, in precedence order, against the extracted error
//! lines and the raw stderr.

use crate::model::{ErrorCategory, ExecutionResult};

/// Module, package or command resolution failures.
const MISSING_DEPENDENCY: &[&str] = &[
    "dependency installation failed",
    "modulenotfounderror",
    "no module named",
    "cannot find module",
    "cannot find package",
    "err_module_not_found",
    "no matching distribution found",
    "could not find a version that satisfies",
    "npm err! 404",
    "npm error 404",
    "unable to locate package",
    "command not found",
];

/// Parser and compiler failures.
const SYNTAX: &[&str] = &[
    "syntaxerror",
    "indentationerror",
    "taberror",
    "syntax error",
    "unexpected token",
    "unexpected end of input",
    "unexpected eof",
    "unterminated string",
    "err_invalid_typescript_syntax",
];

/// Recognizable name, attribute and type misuse.
const TYPE_OR_NAME: &[&str] = &[
    "nameerror",
    "typeerror",
    "attributeerror",
    "referenceerror",
    "unboundlocalerror",
    "importerror",
    "is not defined",
    "is not a function",
    "is not a constructor",
    "cannot read properties of undefined",
    "cannot read properties of null",
];

/// Classifies a failed execution.
///
/// A timeout sentinel maps straight to [`ErrorCategory::Timeout`] without
/// looking at the output. Successful results are never classified by the
/// repair loop; passing one here yields `UnknownRuntimeError`.
pub fn classify(result: &ExecutionResult) -> ErrorCategory {
    if result.is_timeout() {
        return ErrorCategory::Timeout;
    }

    let haystack = format!("{}\n{}", result.errors.join("\n"), result.stderr).to_lowercase();
    let matches = |patterns: &[&str]| patterns.iter().any(|p| haystack.contains(p));

    if matches(MISSING_DEPENDENCY) {
        ErrorCategory::MissingDependency
    } else if matches(SYNTAX) {
        ErrorCategory::Syntax
    } else if matches(TYPE_OR_NAME) {
        ErrorCategory::TypeOrNameError
    } else {
        ErrorCategory::UnknownRuntimeError
    }
}

impl ErrorCategory {
    /// One-line guidance included in repair prompts.
    pub fn repair_hint(self) -> &'static str {
        match self {
            Self::Syntax => {
                "The file does not parse. Fix the syntax error without changing behavior."
            }
            Self::MissingDependency => {
                "A module or package could not be resolved. Fix the import, use the standard library, or replace the unavailable dependency."
            }
            Self::TypeOrNameError => {
                "A name, attribute or type is used incorrectly. Define or correct the offending identifier."
            }
            Self::Timeout => {
                "Execution exceeded its time limit. Remove infinite loops, blocking reads and long sleeps; the program must terminate on its own."
            }
            Self::UnknownRuntimeError => {
                "The program failed at runtime. Fix the root cause shown in the error output."
            }
        }
    }
}
