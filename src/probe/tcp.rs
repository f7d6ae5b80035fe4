//! TCP probe: send a payload through nc and capture the echo

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{Tool, Transport, TransportError};
use crate::workload::Workload;

/// TCP request that writes `message` to `host:port` and reads the reply
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TcpRequest {
    /// Workload the request is issued from
    pub source: Workload,
    /// Destination host
    pub host: String,
    /// Destination port
    pub port: u16,
    /// Payload to send
    pub message: String,
}

impl TcpRequest {
    /// Create a new request
    pub fn new(
        source: Workload,
        host: impl Into<String>,
        port: u16,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source,
            host: host.into(),
            port,
            message: message.into(),
        }
    }

    /// `host:port`
    pub fn destination(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Shell pipeline that echoes the payload into nc
    pub fn command(&self) -> Vec<String> {
        vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!(
                "echo '{}' | nc {} {}",
                shell_quote(&self.message),
                self.host,
                self.port
            ),
        ]
    }
}

// Single-quote escaping: ' becomes '\''
fn shell_quote(s: &str) -> String {
    s.replace('\'', r"'\''")
}

/// Outcome of one TCP request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpResult {
    /// `host:port` the request went to
    pub destination: String,
    /// Payload that was sent
    pub sent: String,
    /// Bytes echoed back (possibly empty)
    pub response: String,
    /// Transport-level failure
    pub error: Option<TransportError>,
}

impl TcpResult {
    /// No error, and the echo contains the full payload
    pub fn echoed(&self) -> bool {
        self.error.is_none() && self.response.contains(&self.sent)
    }
}

/// Issue `request` once. Never retries.
pub async fn send<T: Transport + ?Sized>(transport: &T, request: &TcpRequest) -> TcpResult {
    let destination = request.destination();
    let mut result = TcpResult {
        destination,
        sent: request.message.clone(),
        response: String::new(),
        error: None,
    };

    match transport.exec(&request.source, &request.command()).await {
        Ok(output) => {
            trace!(
                destination = %result.destination,
                exit_code = output.exit_code,
                "nc finished"
            );
            result.response = output.stdout.trim_end().to_string();
            if !output.success() {
                result.error = Some(TransportError::from_exit(
                    Tool::Netcat,
                    output.exit_code,
                    &output.stderr,
                ));
            }
        }
        Err(e) => result.error = Some(e),
    }

    result
}
