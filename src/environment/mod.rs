//! Cluster environment collaborator
//!
//! Everything the scenario orchestrator needs from the cluster sits behind
//! [`Environment`]: namespaces, workloads, network identities, readiness and
//! the SMI policy objects. [`kube::KubeEnvironment`] talks to a real API
//! server; tests use the generated mock or an in-memory mesh.

pub mod kube;

use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::policy::{TrafficRoute, TrafficTarget};
use crate::workload::{NetworkIdentity, Workload, WorkloadDef};
use crate::Result;

/// Label that enrolls a namespace in a mesh
pub const MONITORED_BY_LABEL: &str = "openservicemesh.io/monitored-by";

/// Annotation that turns proxy sidecar injection on or off for a namespace
pub const SIDECAR_INJECTION_ANNOTATION: &str = "openservicemesh.io/sidecar-injection";

/// Operations the harness performs against the cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Environment: Send + Sync {
    /// Create a namespace (idempotent)
    async fn create_namespace(&self, name: &str) -> Result<()>;

    /// Delete a namespace and wait until it is gone
    async fn delete_namespace(&self, name: &str) -> Result<()>;

    /// Put a namespace under the mesh's enforcement
    async fn add_namespace_to_mesh(&self, name: &str, sidecar_injection: bool) -> Result<()>;

    /// Create the service account a workload runs as
    async fn create_service_account(&self, def: &WorkloadDef) -> Result<()>;

    /// Create the workload itself
    async fn create_workload(&self, def: &WorkloadDef) -> Result<Workload>;

    /// Create the stable address fronting a workload
    async fn create_network_identity(&self, def: &WorkloadDef) -> Result<NetworkIdentity>;

    /// Remove a workload's network identity; succeeds if there is none
    async fn delete_network_identity(&self, def: &WorkloadDef) -> Result<()>;

    /// Wait until at least `min_ready` workloads in `namespace` are ready
    async fn wait_for_workloads_ready(
        &self,
        namespace: &str,
        timeout: Duration,
        min_ready: usize,
    ) -> Result<()>;

    /// Submit a route definition
    async fn create_route(&self, route: &TrafficRoute) -> Result<()>;

    /// Submit an access grant
    async fn create_access_grant(&self, target: &TrafficTarget) -> Result<()>;

    /// Withdraw an access grant
    async fn delete_access_grant(&self, namespace: &str, name: &str) -> Result<()>;

    /// Delete a route definition
    async fn delete_route(&self, route: &TrafficRoute) -> Result<()>;
}
