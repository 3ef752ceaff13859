//! Error types for the endpoint health checker

use thiserror::Error;

/// Main error type for health checker operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The probed pod no longer exists in the cluster
    ///
    /// Raised when a status write finds the pod gone. The watcher will remove
    /// the stale target shortly; callers log and discard.
    #[error("pod {namespace}/{name} not found")]
    PodNotFound {
        /// Namespace of the missing pod
        namespace: String,
        /// Name of the missing pod
        name: String,
    },

    /// Probe transport could not be set up (e.g. raw ICMP socket denied)
    #[error("probe setup error: {0}")]
    ProbeSetup(#[source] std::io::Error),

    /// Invalid runtime configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// The pod watch stream terminated before delivering the initial list
    #[error("pod watch failed to sync initial state")]
    WatchSync,
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error is a pod-not-found
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::PodNotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_message() {
        let err = Error::config("health check interval must be positive");
        assert!(err.to_string().contains("configuration error"));
        assert!(err.to_string().contains("must be positive"));
    }

    #[test]
    fn test_not_found_carries_identity() {
        let err = Error::PodNotFound {
            namespace: "default".into(),
            name: "web-0".into(),
        };
        assert!(err.is_not_found());
        assert!(err.to_string().contains("default/web-0"));
    }

    #[test]
    fn test_other_errors_are_not_not_found() {
        assert!(!Error::config("x").is_not_found());
        assert!(!Error::WatchSync.is_not_found());
    }
}
