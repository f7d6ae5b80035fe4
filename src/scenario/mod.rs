//! Scenario orchestration
//!
//! A scenario walks one policy through its lifecycle and checks that traffic
//! follows it:
//!
//! ```text
//! Provisioning -> Granted -> VerifiedAllowed -> Revoked -> VerifiedDenied
//!       \            \             \               \
//!        +------------+-------------+---------------+--> Failed
//! ```
//!
//! Policy changes and probing never overlap: every mutation is followed by a
//! convergence window before the next one. Setup errors abort immediately;
//! verification failures carry the recent probe trail. Teardown runs either
//! way and never changes the outcome.

pub mod source;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::classifier::{classify, Verdict};
use crate::context::ScenarioContext;
use crate::convergence::{wait_for_repeated_success, ConvergencePolicy, ConvergenceProbe};
use crate::policy::{AuthorizationPolicy, ServiceAccountIdentity, TrafficShape};
use crate::probe::{HttpRequest, ProbeRequest, ProbeResult, TcpRequest, Transport};
use crate::workload::{AppProtocol, NetworkIdentity, Workload, WorkloadDef};
use crate::{Error, Result};

/// Name of the source workload and its service account
pub const SOURCE_NAME: &str = "client";
/// Name of the destination workload and its service account
pub const DESTINATION_NAME: &str = "server";
/// Name of the access grant
pub const GRANT_NAME: &str = "test-target";
/// Name of the route the grant refers to
pub const ROUTE_NAME: &str = "routes";
/// Port the destination listens on
pub const DESTINATION_PORT: u16 = 80;
/// Payload sent by TCP probes
pub const TCP_MESSAGE: &str = "test request";

// =============================================================================
// Scenario definition
// =============================================================================

/// Traffic protocol a scenario exercises
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// HTTP through curl against httpbin
    Http,
    /// Raw TCP through nc against an echo server
    Tcp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => f.write_str("HTTP"),
            Protocol::Tcp => f.write_str("TCP"),
        }
    }
}

/// Parameters of one scenario run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioSpec {
    /// Human-readable scenario name
    pub name: String,
    /// Protocol under test
    pub protocol: Protocol,
    /// Whether the source gets a network identity of its own
    pub with_source_service: bool,
}

impl ScenarioSpec {
    /// HTTP scenario
    pub fn http(name: impl Into<String>, with_source_service: bool) -> Self {
        Self {
            name: name.into(),
            protocol: Protocol::Http,
            with_source_service,
        }
    }

    /// TCP scenario
    pub fn tcp(name: impl Into<String>, with_source_service: bool) -> Self {
        Self {
            name: name.into(),
            protocol: Protocol::Tcp,
            with_source_service,
        }
    }
}

// =============================================================================
// Phases and checks
// =============================================================================

/// Lifecycle phase of a scenario
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScenarioPhase {
    /// Namespaces and workloads are being created
    Provisioning,
    /// The allow policy has been submitted
    Granted,
    /// Traffic was observed flowing under the grant
    VerifiedAllowed,
    /// The allow policy has been withdrawn
    Revoked,
    /// Traffic was observed being refused after the revoke
    VerifiedDenied,
    /// The scenario stopped on an error or a failed check
    Failed,
}

impl ScenarioPhase {
    /// Whether `next` may follow `self`
    pub fn can_transition_to(self, next: ScenarioPhase) -> bool {
        use ScenarioPhase::*;
        matches!(
            (self, next),
            (Provisioning, Granted)
                | (Granted, VerifiedAllowed)
                | (VerifiedAllowed, Revoked)
                | (Revoked, VerifiedDenied)
                | (Provisioning | Granted | VerifiedAllowed | Revoked, Failed)
        )
    }
}

impl fmt::Display for ScenarioPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Which verification window a probe belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Check {
    /// Traffic must flow while the grant is in place
    Positive,
    /// Traffic must be refused after the grant is withdrawn
    Negative,
}

impl Check {
    /// Verdict a probe must produce to count towards the streak
    pub fn expected(self) -> Verdict {
        match self {
            Check::Positive => Verdict::Allowed,
            Check::Negative => Verdict::DeniedExpected,
        }
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Check::Positive => f.write_str("positive"),
            Check::Negative => f.write_str("negative"),
        }
    }
}

// =============================================================================
// Reports
// =============================================================================

/// One probe made during a verification window
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeAttempt {
    /// Window the probe belongs to
    pub check: Check,
    /// 1-based attempt number within the window
    pub attempt: u32,
    /// Verdict relative to the policy in force
    pub verdict: Verdict,
    /// Raw result
    pub result: ProbeResult,
}

/// A verification window that timed out
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationFailure {
    /// Which check failed
    pub check: Check,
    /// `source -> destination`
    pub pair: String,
    /// Verdict that was required
    pub expected: Verdict,
    /// Verdict of the final attempt, if any attempt was made
    pub last_verdict: Option<Verdict>,
    /// Attempts made in the window
    pub attempts: u32,
    /// Most recent results, oldest first
    pub recent: Vec<ProbeAttempt>,
}

impl fmt::Display for VerificationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} check failed for ({}): expected {} after {} attempts, last verdict ",
            self.check, self.pair, self.expected, self.attempts
        )?;
        match self.last_verdict {
            Some(v) => write!(f, "{}", v)?,
            None => f.write_str("none")?,
        }
        for a in &self.recent {
            write!(f, "\n  #{} {}: {}", a.attempt, a.verdict, a.result)?;
        }
        Ok(())
    }
}

/// Why a scenario failed
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum ScenarioFailure {
    /// Environment or policy CRUD failed; the cause is kept verbatim
    Setup {
        /// Phase being attempted when the error occurred
        phase: ScenarioPhase,
        /// Underlying error
        message: String,
    },
    /// A convergence window timed out
    Verification(VerificationFailure),
    /// The scenario panicked
    Panicked {
        /// Panic payload
        message: String,
    },
}

impl fmt::Display for ScenarioFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScenarioFailure::Setup { phase, message } => {
                write!(f, "setup failed during {}: {}", phase, message)
            }
            ScenarioFailure::Verification(v) => v.fmt(f),
            ScenarioFailure::Panicked { message } => write!(f, "PANIC: {}", message),
        }
    }
}

/// Outcome of one scenario run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioReport {
    /// Scenario name
    pub name: String,
    /// Whether every phase completed
    pub passed: bool,
    /// Last phase reached
    pub phase: ScenarioPhase,
    /// Cause of failure, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<ScenarioFailure>,
    /// Every probe made, in order
    pub attempts: Vec<ProbeAttempt>,
    /// Teardown problems; informational only
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub teardown_errors: Vec<String>,
    /// Time spent, measured on the scenario clock
    pub elapsed_secs: f64,
}

// =============================================================================
// Verification probe
// =============================================================================

/// Probe for one verification window: sends the request, classifies the
/// result and appends it to the trail.
struct VerificationProbe<'a> {
    transport: &'a dyn Transport,
    request: &'a ProbeRequest,
    protocol: Protocol,
    check: Check,
    pair: String,
    attempt: u32,
    trail: &'a mut Vec<ProbeAttempt>,
}

impl VerificationProbe<'_> {
    fn log(&self, verdict: Verdict, matched: bool, result: &ProbeResult) {
        let proto = self.protocol;
        let pair = self.pair.as_str();
        match (self.check, matched) {
            (Check::Positive, true) => {
                info!(pair, attempt = self.attempt, %verdict, "> ({}) {} Req succeeded: {}", pair, proto, result)
            }
            (Check::Positive, false) => {
                info!(pair, attempt = self.attempt, %verdict, "> ({}) {} Req failed: {}", pair, proto, result)
            }
            (Check::Negative, true) => {
                info!(pair, attempt = self.attempt, %verdict, "> ({}) {} Req failed correctly: {}", pair, proto, result)
            }
            (Check::Negative, false) => {
                info!(pair, attempt = self.attempt, %verdict, "> ({}) {} Req did not fail as expected: {}", pair, proto, result)
            }
        }
    }
}

#[async_trait]
impl ConvergenceProbe for VerificationProbe<'_> {
    async fn attempt(&mut self) -> bool {
        self.attempt += 1;
        let result = self.request.send(self.transport).await;
        let verdict = classify(&result);
        let matched = verdict == self.check.expected();
        self.log(verdict, matched, &result);

        // Once granted, a denial is a regression, not the expected outcome
        let recorded = match self.check {
            Check::Positive => verdict.under(Verdict::Allowed),
            Check::Negative => verdict,
        };
        self.trail.push(ProbeAttempt {
            check: self.check,
            attempt: self.attempt,
            verdict: recorded,
            result,
        });
        matched
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

struct ScenarioRun<'a> {
    ctx: &'a ScenarioContext,
    spec: &'a ScenarioSpec,
    phase: ScenarioPhase,
    attempts: Vec<ProbeAttempt>,
}

impl<'a> ScenarioRun<'a> {
    fn new(ctx: &'a ScenarioContext, spec: &'a ScenarioSpec) -> Self {
        Self {
            ctx,
            spec,
            phase: ScenarioPhase::Provisioning,
            attempts: Vec::new(),
        }
    }

    fn enter(&mut self, next: ScenarioPhase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(Error::internal_with_context(
                "scenario",
                format!("invalid phase transition {} -> {}", self.phase, next),
            ));
        }
        info!(scenario = %self.spec.name, from = %self.phase, to = %next, "phase transition");
        self.phase = next;
        Ok(())
    }

    fn setup_failure(&self, attempting: ScenarioPhase, error: Error) -> ScenarioFailure {
        ScenarioFailure::Setup {
            phase: attempting,
            message: error.to_string(),
        }
    }

    fn destination_def(&self) -> WorkloadDef {
        let config = &self.ctx.config;
        match self.spec.protocol {
            Protocol::Http => WorkloadDef::new(
                DESTINATION_NAME,
                &config.server_namespace,
                &config.images.http_server,
            )
            .with_ports([DESTINATION_PORT]),
            Protocol::Tcp => WorkloadDef::new(
                DESTINATION_NAME,
                &config.server_namespace,
                config.images.tcp_echo_server_image(),
            )
            .with_command(["/tcp-echo-server"])
            .with_args(["--port".to_string(), DESTINATION_PORT.to_string()])
            .with_ports([DESTINATION_PORT])
            .with_app_protocol(AppProtocol::Tcp),
        }
    }

    fn destination_ready_timeout(&self) -> Duration {
        let t = &self.ctx.config.timeouts;
        match self.spec.protocol {
            Protocol::Http => Duration::from_secs(t.http_server_ready_secs),
            Protocol::Tcp => Duration::from_secs(t.tcp_server_ready_secs),
        }
    }

    fn policy(&self) -> AuthorizationPolicy {
        let config = &self.ctx.config;
        let shape = match self.spec.protocol {
            Protocol::Http => TrafficShape::Http,
            Protocol::Tcp => TrafficShape::Tcp {
                port: DESTINATION_PORT,
            },
        };
        AuthorizationPolicy::allow(
            GRANT_NAME,
            ROUTE_NAME,
            ServiceAccountIdentity::new(&config.client_namespace, SOURCE_NAME),
            ServiceAccountIdentity::new(&config.server_namespace, DESTINATION_NAME),
            shape,
        )
    }

    fn request(&self, source: Workload, destination: &NetworkIdentity) -> ProbeRequest {
        match self.spec.protocol {
            Protocol::Http => ProbeRequest::Http(HttpRequest::new(source, destination.authority())),
            Protocol::Tcp => ProbeRequest::Tcp(TcpRequest::new(
                source,
                destination.authority(),
                DESTINATION_PORT,
                TCP_MESSAGE,
            )),
        }
    }

    /// Namespaces, destination, then source
    async fn provision(&self) -> Result<(Workload, NetworkIdentity)> {
        let ctx = self.ctx;
        let env = ctx.environment.as_ref();
        let config = &ctx.config;

        for ns in [&config.client_namespace, &config.server_namespace] {
            env.create_namespace(ns).await?;
            env.add_namespace_to_mesh(ns, true).await?;
        }

        let dest = self.destination_def();
        env.create_service_account(&dest).await?;
        env.create_workload(&dest).await?;
        let identity = env.create_network_identity(&dest).await?;
        env.wait_for_workloads_ready(&dest.namespace, self.destination_ready_timeout(), 1)
            .await?;
        info!(scenario = %self.spec.name, destination = %identity.authority(), "destination ready");

        let source =
            source::setup_source(env, config, self.spec.with_source_service).await?;
        Ok((source, identity))
    }

    async fn verify(
        &mut self,
        check: Check,
        request: &ProbeRequest,
        policy: &ConvergencePolicy,
    ) -> std::result::Result<(), VerificationFailure> {
        let ctx = self.ctx;
        let pair = request.pair();
        let mut trail = Vec::new();
        let probe = VerificationProbe {
            transport: ctx.transport.as_ref(),
            request,
            protocol: self.spec.protocol,
            check,
            pair: pair.clone(),
            attempt: 0,
            trail: &mut trail,
        };

        let label = format!("{} {} {}", self.spec.name, check, pair);
        let outcome = wait_for_repeated_success(ctx.clock.as_ref(), policy, &label, probe).await;

        let window = ctx.config.diagnostic_window;
        let recent = trail[trail.len().saturating_sub(window)..].to_vec();
        let last_verdict = trail.last().map(|a| a.verdict);
        self.attempts.append(&mut trail);

        if outcome.converged {
            return Ok(());
        }
        Err(VerificationFailure {
            check,
            pair,
            expected: check.expected(),
            last_verdict,
            attempts: outcome.attempts,
            recent,
        })
    }

    async fn execute(&mut self) -> std::result::Result<(), ScenarioFailure> {
        use ScenarioPhase::*;

        let ctx = self.ctx;
        let config = &ctx.config;
        let grant_policy = config
            .grant_policy()
            .map_err(|e| self.setup_failure(Provisioning, e))?;
        let revoke_policy = config
            .revoke_policy()
            .map_err(|e| self.setup_failure(Provisioning, e))?;

        // Provisioning
        let (source, destination) = match self.provision().await {
            Ok(v) => v,
            Err(e) => return Err(self.setup_failure(Provisioning, e)),
        };
        let request = self.request(source, &destination);

        // Grant
        let policy = self.policy();
        let route = policy.route();
        let target = policy.traffic_target();
        let env = ctx.environment.as_ref();
        if let Err(e) = env.create_route(&route).await {
            return Err(self.setup_failure(Granted, e));
        }
        if let Err(e) = env.create_access_grant(&target).await {
            return Err(self.setup_failure(Granted, e));
        }
        self.enter(Granted)
            .map_err(|e| self.setup_failure(Granted, e))?;

        // Positive verification
        self.verify(Check::Positive, &request, &grant_policy)
            .await
            .map_err(ScenarioFailure::Verification)?;
        self.enter(VerifiedAllowed)
            .map_err(|e| self.setup_failure(VerifiedAllowed, e))?;

        // Revoke: grant first, then the route it refers to
        if let Err(e) = env.delete_access_grant(&policy.namespace, &policy.name).await {
            return Err(self.setup_failure(Revoked, e));
        }
        if let Err(e) = env.delete_route(&route).await {
            return Err(self.setup_failure(Revoked, e));
        }
        self.enter(Revoked)
            .map_err(|e| self.setup_failure(Revoked, e))?;

        // Negative verification
        self.verify(Check::Negative, &request, &revoke_policy)
            .await
            .map_err(ScenarioFailure::Verification)?;
        self.enter(VerifiedDenied)
            .map_err(|e| self.setup_failure(VerifiedDenied, e))?;

        Ok(())
    }

    async fn teardown(&self) -> Vec<String> {
        teardown_namespaces(self.ctx, &self.spec.name).await
    }
}

/// Best-effort deletion of the scenario namespaces.
///
/// Does nothing when `cleanup_namespaces` is off. Errors are logged and
/// returned, never raised.
pub async fn teardown_namespaces(ctx: &ScenarioContext, scenario: &str) -> Vec<String> {
    let config = &ctx.config;
    if !config.cleanup_namespaces {
        debug!(scenario = %scenario, "namespace cleanup disabled");
        return Vec::new();
    }

    let mut errors = Vec::new();
    for ns in [&config.client_namespace, &config.server_namespace] {
        if let Err(e) = ctx.environment.delete_namespace(ns).await {
            warn!(scenario = %scenario, namespace = %ns, error = %e, "teardown failed");
            errors.push(format!("{}: {}", ns, e));
        }
    }
    errors
}

/// Run one scenario to completion and report what happened.
///
/// Never returns an error: setup problems and failed checks end up in the
/// report.
pub async fn run_scenario(ctx: &ScenarioContext, spec: &ScenarioSpec) -> ScenarioReport {
    let start = ctx.clock.now();
    info!(scenario = %spec.name, protocol = %spec.protocol, with_source_service = spec.with_source_service, "scenario starting");

    let mut run = ScenarioRun::new(ctx, spec);
    let result = run.execute().await;

    let failure = match result {
        Ok(()) => None,
        Err(failure) => {
            error!(scenario = %spec.name, phase = %run.phase, "{}", failure);
            run.phase = ScenarioPhase::Failed;
            Some(failure)
        }
    };

    let teardown_errors = run.teardown().await;
    let elapsed = ctx.clock.now().duration_since(start);
    let passed = failure.is_none();
    info!(scenario = %spec.name, passed, phase = %run.phase, elapsed_secs = elapsed.as_secs_f64(), "scenario finished");

    ScenarioReport {
        name: spec.name.clone(),
        passed,
        phase: run.phase,
        failure,
        attempts: run.attempts,
        teardown_errors,
        elapsed_secs: elapsed.as_secs_f64(),
    }
}
