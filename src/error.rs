//! Error types for meshprobe
//!
//! Errors here are the fatal kind: provisioning, policy CRUD, configuration.
//! A probe that fails during a convergence window is not an error (see
//! [`crate::probe::TransportError`]), and a convergence window that times out
//! is reported as a [`crate::scenario::VerificationFailure`], not through this
//! type.

use thiserror::Error;

/// Main error type for meshprobe operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Workload or namespace provisioning failed
    #[error("provisioning error for {workload}: {message}")]
    Provisioning {
        /// `namespace/name` of the workload (or the namespace alone)
        workload: String,
        /// Description of what failed
        message: String,
    },

    /// Creating or deleting a policy object failed
    #[error("policy error for {policy}: {message}")]
    Policy {
        /// `namespace/name` of the policy object
        policy: String,
        /// Description of what failed
        message: String,
    },

    /// Invalid harness or convergence parameters
    #[error("validation error: {0}")]
    Validation(String),

    /// Configuration could not be loaded
    #[error("config error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "poll_until", "create_client")
        context: String,
    },
}

impl Error {
    /// Create a provisioning error for a workload or namespace
    pub fn provisioning(workload: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provisioning {
            workload: workload.into(),
            message: msg.into(),
        }
    }

    /// Create a policy error for a policy object
    pub fn policy(policy: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Policy {
            policy: policy.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a config error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
