//! Single-shot traffic probes
//!
//! A probe issues exactly one request from inside a source workload and
//! returns what happened as data. Failures are values ([`TransportError`]),
//! never panics or `Err`s, because during a convergence window a failed
//! request is expected noise. Probes never retry; that is the job of
//! [`crate::convergence`].
//!
//! Requests are executed by a [`Transport`] collaborator that runs a command in
//! a container. [`kubectl::KubectlTransport`] is the Kubernetes implementation.

pub mod http;
pub mod kubectl;
pub mod tcp;

use std::fmt;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::workload::Workload;

pub use http::{HttpRequest, HttpResult};
pub use tcp::{TcpRequest, TcpResult};

/// Error text the exec API produces when curl exits with code 7
/// (connection refused). Kept for parsing messages from older tooling.
pub const CONNECTION_REFUSED_SIGNATURE: &str = "command terminated with exit code 7 ";

const EXIT_CODE_PREFIX: &str = "command terminated with exit code ";

// =============================================================================
// Transport errors
// =============================================================================

/// Semantic category of a transport failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportErrorKind {
    /// The destination (or the proxy in front of it) refused the connection
    ConnectionRefused,
    /// The request did not complete in time
    Timeout,
    /// Anything else: DNS, exec failures, garbage output, ...
    Other,
}

/// Structured failure of a single request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    /// What kind of failure this is
    pub kind: TransportErrorKind,
    /// Human-readable detail, kept for diagnostics
    pub message: String,
}

impl TransportError {
    /// Create an error of the given kind
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Create an `Other` error
    pub fn other(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Other, message)
    }

    /// Create a `Timeout` error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    /// Error for a remote command that exited non-zero.
    ///
    /// The message uses the exec API's wording so logs stay comparable with
    /// other tooling; the kind comes from the tool's exit-code contract.
    pub fn from_exit(tool: Tool, exit_code: i32, stderr: &str) -> Self {
        Self {
            kind: tool.classify_exit(exit_code),
            message: format!("{}{} {}", EXIT_CODE_PREFIX, exit_code, stderr.trim()),
        }
    }

    /// Recover a kind from an unstructured curl exec error message
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = parse_exit_code(&message)
            .map(|code| Tool::Curl.classify_exit(code))
            .unwrap_or(TransportErrorKind::Other);
        Self { kind, message }
    }

    /// Whether the destination refused the connection
    pub fn is_connection_refused(&self) -> bool {
        self.kind == TransportErrorKind::ConnectionRefused
    }
}

fn parse_exit_code(message: &str) -> Option<i32> {
    let start = message.find(EXIT_CODE_PREFIX)? + EXIT_CODE_PREFIX.len();
    let rest = &message[start..];
    // The code must be followed by a separator; "exit code 70" is not 7
    let end = rest.find(' ')?;
    rest[..end].parse().ok()
}

/// Command-line tool a probe runs, used to interpret its exit codes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tool {
    /// curl(1)
    Curl,
    /// nc(1)
    Netcat,
}

impl Tool {
    /// Map an exit code to a semantic error kind
    pub fn classify_exit(&self, exit_code: i32) -> TransportErrorKind {
        match (self, exit_code) {
            (Tool::Curl, 7) => TransportErrorKind::ConnectionRefused,
            (Tool::Curl, 28) => TransportErrorKind::Timeout,
            _ => TransportErrorKind::Other,
        }
    }
}

// =============================================================================
// Transport collaborator
// =============================================================================

/// Output of a command that ran to completion
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
    /// Exit status of the remote command
    pub exit_code: i32,
}

impl ExecOutput {
    /// Whether the command exited with status 0
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs commands inside workload containers
///
/// `Err` means the command could not be run at all (or timed out); a command
/// that ran and failed is `Ok` with a non-zero exit code.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Execute `command` in `source`'s container
    async fn exec(
        &self,
        source: &Workload,
        command: &[String],
    ) -> std::result::Result<ExecOutput, TransportError>;
}

// =============================================================================
// Protocol-agnostic requests and results
// =============================================================================

/// One request of either protocol
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeRequest {
    /// HTTP GET via curl
    Http(HttpRequest),
    /// TCP echo via nc
    Tcp(TcpRequest),
}

impl ProbeRequest {
    /// Workload the request is issued from
    pub fn source(&self) -> &Workload {
        match self {
            ProbeRequest::Http(r) => &r.source,
            ProbeRequest::Tcp(r) => &r.source,
        }
    }

    /// Destination descriptor (`authority` or `host:port`)
    pub fn destination(&self) -> String {
        match self {
            ProbeRequest::Http(r) => r.destination.clone(),
            ProbeRequest::Tcp(r) => r.destination(),
        }
    }

    /// `source -> destination`, used to label every log line
    pub fn pair(&self) -> String {
        format!("{} -> {}", self.source(), self.destination())
    }

    /// Issue the request once
    pub async fn send<T: Transport + ?Sized>(&self, transport: &T) -> ProbeResult {
        match self {
            ProbeRequest::Http(r) => ProbeResult::Http(http::send(transport, r).await),
            ProbeRequest::Tcp(r) => ProbeResult::Tcp(tcp::send(transport, r).await),
        }
    }
}

/// Result of one request of either protocol
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum ProbeResult {
    /// HTTP outcome
    Http(HttpResult),
    /// TCP outcome
    Tcp(TcpResult),
}

impl fmt::Display for ProbeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeResult::Http(r) => match (&r.error, r.status_code) {
                (Some(e), _) => write!(f, "HTTP error ({:?}): {}", e.kind, e.message),
                (None, Some(code)) => write!(f, "HTTP {}", code),
                (None, None) => write!(f, "HTTP no status"),
            },
            ProbeResult::Tcp(r) => match &r.error {
                Some(e) => write!(f, "TCP error ({:?}): {}", e.kind, e.message),
                None => write!(f, "TCP response: {:?}", r.response),
            },
        }
    }
}
