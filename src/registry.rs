//! Scenario catalogue and run-all-and-report runner
//!
//! Scenarios run one after another; a failing (or panicking) scenario is
//! recorded and the runner moves on. [`SuiteReport::finish`] turns the
//! collected results into a single pass/fail.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::context::ScenarioContext;
use crate::scenario::{
    run_scenario, teardown_namespaces, ScenarioFailure, ScenarioPhase, ScenarioReport, ScenarioSpec,
};
use crate::{Error, Result};

/// Suite the built-in scenarios belong to
pub const POD_CLIENT_SERVER_SUITE: &str = "Test HTTP traffic from 1 pod client -> 1 pod server";

/// A named, schedulable scenario
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioDescriptor {
    /// Short unique name, used for selection
    pub name: String,
    /// What the scenario checks
    pub description: String,
    /// Suite the scenario belongs to
    pub suite: String,
    /// Scheduling tier (1 runs on every change)
    pub tier: u8,
    /// Bucket for sharding runs across CI jobs
    pub bucket: u8,
    /// Parameters handed to the orchestrator
    pub spec: ScenarioSpec,
}

/// Which scenarios to run. Empty filters select everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selection {
    /// Scenario names
    pub names: Vec<String>,
    /// Only this tier
    pub tier: Option<u8>,
    /// Only this bucket
    pub bucket: Option<u8>,
}

impl Selection {
    fn matches(&self, d: &ScenarioDescriptor) -> bool {
        (self.names.is_empty() || self.names.iter().any(|n| *n == d.name))
            && self.tier.map_or(true, |t| t == d.tier)
            && self.bucket.map_or(true, |b| b == d.bucket)
    }
}

/// Set of known scenarios
#[derive(Clone, Debug, Default)]
pub struct Registry {
    scenarios: Vec<ScenarioDescriptor>,
}

impl Registry {
    /// Registry holding the pod client/server suite: HTTP with and without a
    /// source service, and TCP without one
    pub fn builtin() -> Self {
        let entries = [
            (
                ScenarioSpec::http("http-with-source-service", true),
                "SimpleClientServer with a Kubernetes Service for the Source: HTTP",
            ),
            (
                ScenarioSpec::http("http-without-source-service", false),
                "SimpleClientServer without a Kubernetes Service for the Source: HTTP",
            ),
            (
                ScenarioSpec::tcp("tcp-without-source-service", false),
                "SimpleClientServer without a Kubernetes Service for the Source: TCP",
            ),
        ];

        Self {
            scenarios: entries
                .into_iter()
                .map(|(spec, description)| ScenarioDescriptor {
                    name: spec.name.clone(),
                    description: description.to_string(),
                    suite: POD_CLIENT_SERVER_SUITE.to_string(),
                    tier: 1,
                    bucket: 1,
                    spec,
                })
                .collect(),
        }
    }

    /// All scenarios in registration order
    pub fn scenarios(&self) -> &[ScenarioDescriptor] {
        &self.scenarios
    }

    /// Look up a scenario by name
    pub fn get(&self, name: &str) -> Option<&ScenarioDescriptor> {
        self.scenarios.iter().find(|d| d.name == name)
    }

    /// Scenarios matching `selection`. Unknown names are an error.
    pub fn select(&self, selection: &Selection) -> Result<Vec<&ScenarioDescriptor>> {
        if let Some(unknown) = selection.names.iter().find(|n| self.get(n).is_none()) {
            return Err(Error::validation(format!("unknown scenario {}", unknown)));
        }
        Ok(self
            .scenarios
            .iter()
            .filter(|d| selection.matches(d))
            .collect())
    }
}

// =============================================================================
// Runner
// =============================================================================

/// Results of a suite run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteReport {
    /// Suite name used in the summary banner
    pub suite: String,
    /// One report per scenario, in run order
    pub results: Vec<ScenarioReport>,
}

impl SuiteReport {
    /// Number of scenarios that passed
    pub fn passed(&self) -> usize {
        self.results.iter().filter(|r| r.passed).count()
    }

    /// Number of scenarios that failed
    pub fn failed(&self) -> usize {
        self.results.len() - self.passed()
    }

    /// Log the PASS/FAIL table
    pub fn log_summary(&self) {
        let total: f64 = self.results.iter().map(|r| r.elapsed_secs).sum();

        info!("========================================");
        info!("  {}", self.suite.to_uppercase());
        info!("========================================");
        for r in &self.results {
            let tag = if r.passed { "PASS" } else { "FAIL" };
            info!("  {tag}  {:40} {:.1}s", r.name, r.elapsed_secs);
            if let Some(failure) = &r.failure {
                let line = failure.to_string();
                // First line only; the probe trail is in the JSON report
                let first = line.lines().next().unwrap_or_default();
                let truncated: String = first.chars().take(200).collect();
                info!("        -> {truncated}");
            }
        }
        info!("----------------------------------------");
        info!(
            "  {} passed, {} failed ({:.1}s total)",
            self.passed(),
            self.failed(),
            total
        );
        info!("========================================");
    }

    /// Log the summary and fail if any scenario failed
    pub fn finish(&self) -> std::result::Result<(), String> {
        self.log_summary();

        if self.failed() == 0 {
            return Ok(());
        }
        let failures: Vec<_> = self
            .results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| r.name.as_str())
            .collect();
        Err(format!(
            "{} scenario(s) failed in {}: {}",
            failures.len(),
            self.suite,
            failures.join(", ")
        ))
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run `scenarios` sequentially against `ctx`
pub async fn run_all(
    ctx: &ScenarioContext,
    suite: &str,
    scenarios: &[&ScenarioDescriptor],
) -> SuiteReport {
    let mut results = Vec::with_capacity(scenarios.len());

    for (i, d) in scenarios.iter().enumerate() {
        info!(
            scenario = %d.name,
            index = i + 1,
            total = scenarios.len(),
            tier = d.tier,
            bucket = d.bucket,
            "{}",
            d.description
        );

        let start = ctx.clock.now();
        let report = match AssertUnwindSafe(run_scenario(ctx, &d.spec))
            .catch_unwind()
            .await
        {
            Ok(report) => report,
            Err(panic) => {
                let message = panic_message(panic);
                error!(scenario = %d.name, "PANIC: {}", message);
                // The scenario never reached its own teardown
                let teardown_errors = teardown_namespaces(ctx, &d.name).await;
                ScenarioReport {
                    name: d.name.clone(),
                    passed: false,
                    phase: ScenarioPhase::Failed,
                    failure: Some(ScenarioFailure::Panicked { message }),
                    attempts: Vec::new(),
                    teardown_errors,
                    elapsed_secs: ctx.clock.now().duration_since(start).as_secs_f64(),
                }
            }
        };
        results.push(report);
    }

    SuiteReport {
        suite: suite.to_string(),
        results,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::HarnessConfig;
    use crate::environment::MockEnvironment;
    use crate::probe::{ExecOutput, MockTransport, Transport, TransportError};
    use crate::workload::Workload;
    use std::sync::Arc;

    fn context(env: MockEnvironment) -> ScenarioContext {
        ScenarioContext::new(
            Arc::new(env),
            Arc::new(MockTransport::new()),
            HarnessConfig::default(),
        )
        .with_clock(Arc::new(ManualClock::new()))
    }

    // ==========================================================================
    // Story: Catalogue and selection
    // ==========================================================================

    #[test]
    fn builtin_suite_has_the_three_pod_client_server_scenarios() {
        let registry = Registry::builtin();
        let names: Vec<_> = registry.scenarios().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "http-with-source-service",
                "http-without-source-service",
                "tcp-without-source-service"
            ]
        );
        assert!(registry
            .scenarios()
            .iter()
            .all(|d| d.tier == 1 && d.bucket == 1 && d.suite == POD_CLIENT_SERVER_SUITE));
        assert!(registry.get("http-with-source-service").unwrap().spec.with_source_service);
    }

    #[test]
    fn selection_filters_by_name_tier_and_bucket() {
        let registry = Registry::builtin();

        let all = registry.select(&Selection::default()).unwrap();
        assert_eq!(all.len(), 3);

        let one = registry
            .select(&Selection {
                names: vec!["tcp-without-source-service".to_string()],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(one.len(), 1);

        let none = registry
            .select(&Selection {
                tier: Some(2),
                ..Default::default()
            })
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn unknown_names_are_rejected() {
        let registry = Registry::builtin();
        let err = registry
            .select(&Selection {
                names: vec!["http-with-source-service".to_string(), "grpc".to_string()],
                ..Default::default()
            })
            .unwrap_err();
        assert!(err.to_string().contains("unknown scenario grpc"));
    }

    // ==========================================================================
    // Story: Run-all-and-report
    // ==========================================================================

    #[tokio::test]
    async fn one_failure_never_aborts_the_rest() {
        let mut env = MockEnvironment::new();
        env.expect_create_namespace()
            .times(3)
            .returning(|ns| Err(Error::provisioning(ns, "api server unavailable")));
        env.expect_delete_namespace().times(6).returning(|_| Ok(()));

        let registry = Registry::builtin();
        let selected = registry.select(&Selection::default()).unwrap();
        let report = run_all(&context(env), POD_CLIENT_SERVER_SUITE, &selected).await;

        assert_eq!(report.results.len(), 3);
        assert_eq!(report.failed(), 3);
        assert!(report.results.iter().all(|r| r.phase == ScenarioPhase::Failed));
        let err = report.finish().unwrap_err();
        assert!(err.starts_with("3 scenario(s) failed"));
        assert!(err.contains("tcp-without-source-service"));
    }

    /// Transport that panics on first use
    struct PanickingTransport;

    #[async_trait::async_trait]
    impl Transport for PanickingTransport {
        async fn exec(
            &self,
            _source: &Workload,
            _command: &[String],
        ) -> std::result::Result<ExecOutput, TransportError> {
            panic!("exec stream closed unexpectedly")
        }
    }

    #[tokio::test]
    async fn panicking_scenario_is_recorded_and_still_torn_down() {
        let mut env = MockEnvironment::new();
        env.expect_create_namespace().returning(|_| Ok(()));
        env.expect_add_namespace_to_mesh().returning(|_, _| Ok(()));
        env.expect_create_service_account().returning(|_| Ok(()));
        env.expect_create_workload().returning(|def| Ok(def.workload()));
        env.expect_create_network_identity()
            .returning(|def| Ok(def.network_identity()));
        env.expect_wait_for_workloads_ready()
            .returning(|_, _, _| Ok(()));
        env.expect_create_route().returning(|_| Ok(()));
        env.expect_create_access_grant().returning(|_| Ok(()));
        env.expect_delete_namespace()
            .withf(|ns| ns == "client" || ns == "server")
            .times(2)
            .returning(|_| Ok(()));

        let ctx = ScenarioContext::new(
            Arc::new(env),
            Arc::new(PanickingTransport),
            HarnessConfig::default(),
        )
        .with_clock(Arc::new(ManualClock::new()));

        let registry = Registry::builtin();
        let selected = registry
            .select(&Selection {
                names: vec!["http-with-source-service".to_string()],
                ..Default::default()
            })
            .unwrap();
        let report = run_all(&ctx, POD_CLIENT_SERVER_SUITE, &selected).await;

        let result = &report.results[0];
        assert!(!result.passed);
        assert_eq!(result.phase, ScenarioPhase::Failed);
        assert_eq!(
            result.failure,
            Some(ScenarioFailure::Panicked {
                message: "exec stream closed unexpectedly".to_string()
            })
        );
        assert!(result.teardown_errors.is_empty());
    }

    #[test]
    fn panic_payloads_become_messages() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new("boom".to_string())), "boom");
        assert_eq!(panic_message(Box::new(42)), "unknown panic");
    }

    #[test]
    fn empty_suite_finishes_cleanly() {
        let report = SuiteReport {
            suite: "empty".to_string(),
            results: Vec::new(),
        };
        assert!(report.finish().is_ok());
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["suite"], "empty");
    }
}
