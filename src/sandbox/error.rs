//! Domain-specific error types for sandbox operations.
//!
//! Typed errors enable callers to match on specific failure modes
//! rather than parsing error message strings.

use std::time::Duration;

/// Errors that can occur during sandbox operations.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Container could not be created or started (image pull failure,
    /// resource exhaustion, engine unreachable).
    #[error("failed to provision container: {message}")]
    Provision { message: String },

    /// A command exceeded its per-command wall-clock bound.
    #[error("command timed out after {timeout_secs} seconds")]
    ExecutionTimeout { timeout_secs: u64 },

    /// A file transfer failed: path missing, unreadable, or escaping the
    /// workspace root.
    #[error("transfer failed: {message}")]
    Transfer { message: String },

    /// A request referenced an unknown container or workspace id.
    #[error("unknown {kind}: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A container engine operation failed outside of provisioning
    /// (exec, logs, removal).
    #[error("container operation failed: {message}")]
    Container { message: String },
}

impl SandboxError {
    /// Creates a `Provision` error.
    pub fn provision(message: impl Into<String>) -> Self {
        Self::Provision {
            message: message.into(),
        }
    }

    /// Creates an `ExecutionTimeout` error from a `Duration`.
    pub fn timeout(duration: Duration) -> Self {
        Self::ExecutionTimeout {
            timeout_secs: duration.as_secs(),
        }
    }

    /// Creates a `Transfer` error.
    pub fn transfer(message: impl Into<String>) -> Self {
        Self::Transfer {
            message: message.into(),
        }
    }

    /// Creates a `NotFound` error for an unknown container id.
    pub fn container_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "container",
            id: id.into(),
        }
    }

    /// Creates a `NotFound` error for an unknown workspace id.
    pub fn workspace_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "workspace",
            id: id.into(),
        }
    }

    /// Creates a `Container` error.
    pub fn container(message: impl Into<String>) -> Self {
        Self::Container {
            message: message.into(),
        }
    }

    /// Short machine-readable kind, used by the tool-call response envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Provision { .. } => "provision",
            Self::ExecutionTimeout { .. } => "timeout",
            Self::Transfer { .. } => "transfer",
            Self::NotFound { .. } => "not_found",
            Self::Container { .. } => "container",
        }
    }

    /// Returns true if this is a timeout error.
    #[allow(dead_code)] // Public API for callers
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ExecutionTimeout { .. })
    }

    /// Returns true if this is a provisioning error.
    #[allow(dead_code)] // Public API for callers
    pub fn is_provision(&self) -> bool {
        matches!(self, Self::Provision { .. })
    }

    /// Returns true if this is a not-found error.
    #[allow(dead_code)] // Public API for callers
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Maps an engine error on a container-scoped operation, turning the
/// engine's 404 into a typed `NotFound` for the given container id.
pub(crate) fn engine_error(err: &bollard::errors::Error, container_id: &str) -> SandboxError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => SandboxError::container_not_found(container_id),
        other => SandboxError::container(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provision_error() {
        let err = SandboxError::provision("image pull failed");
        assert!(err.is_provision());
        assert!(!err.is_timeout());
        assert_eq!(err.kind(), "provision");
        assert_eq!(
            err.to_string(),
            "failed to provision container: image pull failed"
        );
    }

    #[test]
    fn test_timeout_error() {
        let err = SandboxError::timeout(Duration::from_secs(300));
        assert!(err.is_timeout());
        assert_eq!(err.kind(), "timeout");
        assert_eq!(err.to_string(), "command timed out after 300 seconds");
    }

    #[test]
    fn test_transfer_error() {
        let err = SandboxError::transfer("path escapes workspace root");
        assert_eq!(err.kind(), "transfer");
        assert_eq!(
            err.to_string(),
            "transfer failed: path escapes workspace root"
        );
    }

    #[test]
    fn test_not_found_errors() {
        let container = SandboxError::container_not_found("abc123");
        assert!(container.is_not_found());
        assert_eq!(container.to_string(), "unknown container: abc123");

        let workspace = SandboxError::workspace_not_found("ws-1");
        assert!(workspace.is_not_found());
        assert_eq!(workspace.to_string(), "unknown workspace: ws-1");
    }

    #[test]
    fn test_container_error() {
        let err = SandboxError::container("exec failed");
        assert_eq!(err.kind(), "container");
        assert_eq!(err.to_string(), "container operation failed: exec failed");
    }

    #[test]
    fn test_error_variants_are_distinct() {
        let timeout = SandboxError::timeout(Duration::from_secs(60));
        let provision = SandboxError::provision("test");
        let not_found = SandboxError::container_not_found("test");

        assert!(timeout.is_timeout());
        assert!(!timeout.is_provision());
        assert!(!timeout.is_not_found());

        assert!(!provision.is_timeout());
        assert!(provision.is_provision());

        assert!(!not_found.is_timeout());
        assert!(not_found.is_not_found());
    }
}
