//! Maps raw probe results to verdicts
//!
//! Both "access denied" and "environment broken" look like network errors
//! from the outside. The classifier only calls a result a denial when it
//! carries the denial signature; everything it cannot vouch for is
//! [`Verdict::Indeterminate`], so a crashed destination never passes as a
//! successful revoke.
//!
//! TCP has no status code, so any TCP transport error is accepted as a
//! denial. That is a weaker guarantee than HTTP's refusal-kind match.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::probe::{HttpResult, ProbeResult, TcpResult};

/// Classified meaning of one probe result
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    /// Traffic went through and the destination answered correctly
    Allowed,
    /// Traffic was refused with the signature the mesh uses for denials
    DeniedExpected,
    /// A denial signature observed while access was expected to be granted
    DeniedUnexpected,
    /// Neither: a broken environment, an application error, or garbage
    Indeterminate,
}

impl Verdict {
    /// Re-read a verdict relative to what the policy says should happen.
    ///
    /// Only a denial seen while the grant is in force changes meaning.
    pub fn under(self, expected: Verdict) -> Verdict {
        match (self, expected) {
            (Verdict::DeniedExpected, Verdict::Allowed) => Verdict::DeniedUnexpected,
            (v, _) => v,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Allowed => "Allowed",
            Verdict::DeniedExpected => "DeniedExpected",
            Verdict::DeniedUnexpected => "DeniedUnexpected",
            Verdict::Indeterminate => "Indeterminate",
        };
        f.write_str(s)
    }
}

/// Classify a result of either protocol
pub fn classify(result: &ProbeResult) -> Verdict {
    match result {
        ProbeResult::Http(r) => classify_http(r),
        ProbeResult::Tcp(r) => classify_tcp(r),
    }
}

/// HTTP: 200 is allowed, a refused connection is denied, anything else is
/// indeterminate
pub fn classify_http(result: &HttpResult) -> Verdict {
    match (&result.error, result.status_code) {
        (None, Some(200)) => Verdict::Allowed,
        (Some(e), _) if e.is_connection_refused() => Verdict::DeniedExpected,
        (Some(e), _) => {
            warn!(
                destination = %result.destination,
                kind = ?e.kind,
                error = %e.message,
                "HTTP transport error is not a denial signature"
            );
            Verdict::Indeterminate
        }
        (None, code) => {
            warn!(
                destination = %result.destination,
                status = ?code,
                "HTTP response is neither success nor denial"
            );
            Verdict::Indeterminate
        }
    }
}

/// TCP: full echo is allowed, any transport error is denied, a wrong echo is
/// indeterminate
pub fn classify_tcp(result: &TcpResult) -> Verdict {
    if result.error.is_some() {
        return Verdict::DeniedExpected;
    }
    if result.echoed() {
        return Verdict::Allowed;
    }
    warn!(
        destination = %result.destination,
        response = %result.response,
        expected = %result.sent,
        "TCP echo does not contain the payload"
    );
    Verdict::Indeterminate
}
