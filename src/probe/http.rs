//! HTTP probe: one curl request from a source container

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{Tool, Transport, TransportError};
use crate::workload::Workload;

/// HTTP request from a workload to a destination authority
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpRequest {
    /// Workload the request is issued from
    pub source: Workload,
    /// Destination authority, e.g. `server.server` or `server.server:8080`
    pub destination: String,
}

impl HttpRequest {
    /// Create a new request
    pub fn new(source: Workload, destination: impl Into<String>) -> Self {
        Self {
            source,
            destination: destination.into(),
        }
    }

    /// Command that prints only the status code
    pub fn command(&self) -> Vec<String> {
        [
            "curl",
            "-s",
            "-o",
            "/dev/null",
            "-w",
            "%{http_code}",
            self.destination.as_str(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

/// Outcome of one HTTP request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResult {
    /// Destination authority the request went to
    pub destination: String,
    /// Status code; only present when `error` is `None`
    pub status_code: Option<u16>,
    /// Transport-level failure
    pub error: Option<TransportError>,
}

impl HttpResult {
    fn failed(destination: &str, error: TransportError) -> Self {
        Self {
            destination: destination.to_string(),
            status_code: None,
            error: Some(error),
        }
    }
}

/// Issue `request` once. Never retries.
pub async fn send<T: Transport + ?Sized>(transport: &T, request: &HttpRequest) -> HttpResult {
    let output = match transport.exec(&request.source, &request.command()).await {
        Ok(output) => output,
        Err(e) => return HttpResult::failed(&request.destination, e),
    };

    trace!(
        destination = %request.destination,
        exit_code = output.exit_code,
        stdout = %output.stdout,
        "curl finished"
    );

    if !output.success() {
        return HttpResult::failed(
            &request.destination,
            TransportError::from_exit(Tool::Curl, output.exit_code, &output.stderr),
        );
    }

    match output.stdout.trim().parse::<u16>() {
        Ok(code) => HttpResult {
            destination: request.destination.clone(),
            status_code: Some(code),
            error: None,
        },
        Err(_) => HttpResult::failed(
            &request.destination,
            TransportError::other(format!(
                "unexpected curl output {:?}",
                output.stdout.trim()
            )),
        ),
    }
}
