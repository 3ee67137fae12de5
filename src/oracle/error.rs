//! Errors returned by repair oracles.

/// Errors that can occur while asking an oracle for a fix.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OracleError {
    /// Transport-level failure worth one retry (network, 5xx, rate limit).
    #[error("Repair oracle temporarily unavailable: {message}")]
    Transient {
        /// What went wrong.
        message: String,
    },

    /// The oracle refused or failed in a way a retry will not change.
    #[error("Repair oracle rejected the request: {message}")]
    Rejected {
        /// Reason given by the backend.
        message: String,
    },

    /// The oracle is not configured correctly.
    #[error("Repair oracle misconfigured: {message}")]
    Misconfigured {
        /// Which setting is wrong.
        message: String,
    },
}

impl OracleError {
    /// Creates a `Transient` error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Creates a `Rejected` error.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    /// Creates a `Misconfigured` error.
    pub fn misconfigured(message: impl Into<String>) -> Self {
        Self::Misconfigured {
            message: message.into(),
        }
    }

    /// Returns true if a retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Heuristic used by text-based backends to spot throttling.
pub(crate) fn looks_rate_limited(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("rate limit")
        || lower.contains("resource_exhausted")
        || lower.contains("429")
        || lower.contains("quota")
        || lower.contains("overloaded")
        || lower.contains("timed out")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(OracleError::transient("502").is_transient());
        assert!(!OracleError::rejected("400").is_transient());
        assert!(!OracleError::misconfigured("no key").is_transient());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            OracleError::rejected("bad request").to_string(),
            "Repair oracle rejected the request: bad request"
        );
    }

    #[test]
    fn test_looks_rate_limited() {
        assert!(looks_rate_limited("Rate limit exceeded"));
        assert!(looks_rate_limited("error: resource_exhausted"));
        assert!(looks_rate_limited("HTTP 429 Too Many Requests"));
        assert!(!looks_rate_limited("invalid api key"));
    }
}
