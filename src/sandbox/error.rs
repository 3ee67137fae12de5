//! Domain-specific error types for sandbox operations.
//!
//! A `SandboxError` always means the isolation backend failed, never the code
//! under test. Code failures come back as a normal `ExecutionResult`.

/// Errors that can occur while provisioning or driving a sandbox.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SandboxError {
    /// The isolation backend is not running or not reachable.
    #[error("Sandbox backend is not available: {message}")]
    Unavailable {
        /// Why the backend could not be reached.
        message: String,
    },

    /// The runtime image was not found and could not be pulled.
    #[error("Sandbox image not found: {image}")]
    ImageNotFound {
        /// Image reference that failed to resolve.
        image: String,
    },

    /// Network access could not be revoked after dependency installation.
    #[error("Network setup failed: {message}")]
    NetworkSetupFailed {
        /// Daemon error text.
        message: String,
    },

    /// A container operation failed (create, start, upload, exec).
    #[error("Container operation failed: {message}")]
    ContainerFailed {
        /// Operation and daemon error text.
        message: String,
    },

    /// The execution was cancelled before it finished.
    #[error("Sandbox execution cancelled")]
    Cancelled,
}

impl SandboxError {
    /// Creates an `Unavailable` error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Creates an `ImageNotFound` error.
    pub fn image_not_found(image: impl Into<String>) -> Self {
        Self::ImageNotFound {
            image: image.into(),
        }
    }

    /// Creates a `NetworkSetupFailed` error.
    pub fn network_setup_failed(message: impl Into<String>) -> Self {
        Self::NetworkSetupFailed {
            message: message.into(),
        }
    }

    /// Creates a `ContainerFailed` error.
    pub fn container_failed(message: impl Into<String>) -> Self {
        Self::ContainerFailed {
            message: message.into(),
        }
    }

    /// Returns true if the backend could not be reached at all.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    /// Returns true if this is a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
