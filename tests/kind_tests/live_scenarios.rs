//! Built-in suite against a live mesh
//!
//! Each story provisions the client and server namespaces, grants and
//! revokes access, and expects both changes to reach the data plane within
//! the default windows.

use std::path::PathBuf;
use std::sync::Arc;

use meshprobe::config::{ConfigOverrides, HarnessConfig};
use meshprobe::context::ScenarioContext;
use meshprobe::environment::kube::KubeEnvironment;
use meshprobe::probe::kubectl::KubectlTransport;
use meshprobe::registry::{run_all, Registry, Selection, POD_CLIENT_SERVER_SUITE};
use meshprobe::scenario::ScenarioPhase;

// =============================================================================
// Test Fixtures
// =============================================================================

/// Context wired to the cluster named by `MESHPROBE_KUBECONFIG`
async fn live_context() -> ScenarioContext {
    let kubeconfig = std::env::var_os("MESHPROBE_KUBECONFIG").map(PathBuf::from);

    let mut config = HarnessConfig::default();
    config.apply_overrides(ConfigOverrides {
        mesh_name: std::env::var("MESHPROBE_MESH_NAME").ok(),
        registry: std::env::var("MESHPROBE_REGISTRY").ok(),
        image_tag: std::env::var("MESHPROBE_IMAGE_TAG").ok(),
    });
    config.validate().expect("invalid harness config");

    let environment = KubeEnvironment::connect(kubeconfig.as_deref(), &config.mesh_name)
        .await
        .expect("failed to connect to the cluster");
    let transport = KubectlTransport::new(kubeconfig).with_timeout(config.exec_timeout());

    ScenarioContext::new(Arc::new(environment), Arc::new(transport), config)
}

async fn run_named(name: &str) {
    let ctx = live_context().await;
    let registry = Registry::builtin();
    let selected = registry
        .select(&Selection {
            names: vec![name.to_string()],
            ..Default::default()
        })
        .expect("scenario should be registered");

    let report = run_all(&ctx, POD_CLIENT_SERVER_SUITE, &selected).await;

    assert_eq!(report.results[0].phase, ScenarioPhase::VerifiedDenied);
    report.finish().expect("scenario failed");
}

// =============================================================================
// Story: HTTP access follows the grant
// =============================================================================

#[tokio::test]
#[ignore = "requires a cluster with the mesh installed - run with: cargo test --test kind -- --ignored"]
async fn story_http_grant_and_revoke_with_source_service() {
    run_named("http-with-source-service").await;
}

#[tokio::test]
#[ignore = "requires a cluster with the mesh installed - run with: cargo test --test kind -- --ignored"]
async fn story_http_grant_and_revoke_without_source_service() {
    run_named("http-without-source-service").await;
}

// =============================================================================
// Story: TCP access follows the grant
// =============================================================================

#[tokio::test]
#[ignore = "requires a cluster with the mesh installed - run with: cargo test --test kind -- --ignored"]
async fn story_tcp_grant_and_revoke_without_source_service() {
    run_named("tcp-without-source-service").await;
}
