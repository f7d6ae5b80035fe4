//! Kubernetes-backed environment using kube-rs
//!
//! Namespaces, service accounts, pods and services are applied with
//! server-side apply so re-running a scenario against leftovers from an
//! aborted run converges instead of failing on "already exists". SMI objects
//! have no typed bindings and go through `DynamicObject`.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Pod, Service, ServiceAccount};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};
use serde_json::json;
use tracing::{debug, info, trace};

use super::{Environment, MONITORED_BY_LABEL, SIDECAR_INJECTION_ANNOTATION};
use crate::policy::{TrafficRoute, TrafficTarget, SMI_ACCESS_API_VERSION};
use crate::workload::{NetworkIdentity, Workload, WorkloadDef, MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use crate::{Error, Result};

/// Field manager for server-side apply
pub const FIELD_MANAGER: &str = "meshprobe";

/// Separate field manager for mesh enrollment so it does not strip the
/// labels owned by [`FIELD_MANAGER`]
const MESH_FIELD_MANAGER: &str = "meshprobe-mesh";

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// How long namespace deletion may take before teardown gives up
pub const NAMESPACE_DELETE_TIMEOUT: Duration = Duration::from_secs(240);

const POLL_INTERVAL: Duration = Duration::from_secs(2);

// =============================================================================
// Client and polling helpers
// =============================================================================

/// Create a kube client from an optional kubeconfig path with custom timeouts
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig {}: {}", path.display(), e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Poll `check_fn` until it returns `Ok(true)` or `timeout` elapses.
///
/// Check errors are logged and polling continues; API hiccups while waiting
/// for readiness are expected.
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    timeout_msg: impl Into<String>,
    mut check_fn: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = tokio::time::Instant::now();
    let timeout_msg = timeout_msg.into();

    loop {
        if start.elapsed() > timeout {
            return Err(Error::internal_with_context("poll_until", timeout_msg));
        }

        match check_fn().await {
            Ok(true) => return Ok(()),
            Ok(false) => trace!("polling condition not yet met"),
            Err(e) => trace!(error = %e, "polling check failed, retrying"),
        }

        tokio::time::sleep(poll_interval).await;
    }
}

fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 404)
}

/// Running with every container ready
pub fn pod_is_ready(pod: &Pod) -> bool {
    let Some(status) = &pod.status else {
        return false;
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    match &status.container_statuses {
        Some(statuses) if !statuses.is_empty() => statuses.iter().all(|c| c.ready),
        _ => false,
    }
}

/// ApiResource for an SMI kind. SMI plurals are the lowercased kind plus `s`.
pub fn smi_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    };
    ApiResource {
        group,
        version,
        api_version: api_version.to_string(),
        kind: kind.to_string(),
        plural: format!("{}s", kind.to_lowercase()),
    }
}

/// Server-side apply body for a namespace
pub fn namespace_manifest(
    name: &str,
    labels: &BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
) -> serde_json::Value {
    let mut metadata = json!({ "name": name });
    if !labels.is_empty() {
        metadata["labels"] = json!(labels);
    }
    if !annotations.is_empty() {
        metadata["annotations"] = json!(annotations);
    }
    json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": metadata,
    })
}

// =============================================================================
// KubeEnvironment
// =============================================================================

/// [`Environment`] backed by a Kubernetes API server
#[derive(Clone)]
pub struct KubeEnvironment {
    client: Client,
    mesh_name: String,
}

impl KubeEnvironment {
    /// Wrap an existing client
    pub fn new(client: Client, mesh_name: impl Into<String>) -> Self {
        Self {
            client,
            mesh_name: mesh_name.into(),
        }
    }

    /// Connect using an optional kubeconfig path
    pub async fn connect(kubeconfig: Option<&Path>, mesh_name: impl Into<String>) -> Result<Self> {
        let client =
            create_client_with_timeout(kubeconfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT)
                .await?;
        Ok(Self::new(client, mesh_name))
    }

    fn apply_params() -> PatchParams {
        PatchParams::apply(FIELD_MANAGER).force()
    }

    fn dynamic(&self, namespace: &str, api_version: &str, kind: &str) -> Api<DynamicObject> {
        let ar = smi_api_resource(api_version, kind);
        Api::namespaced_with(self.client.clone(), namespace, &ar)
    }

    async fn apply_namespace(
        &self,
        name: &str,
        labels: BTreeMap<String, String>,
        annotations: BTreeMap<String, String>,
        field_manager: &str,
    ) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let body = namespace_manifest(name, &labels, &annotations);
        api.patch(
            name,
            &PatchParams::apply(field_manager).force(),
            &Patch::Apply(&body),
        )
        .await
        .map_err(|e| Error::provisioning(name, format!("failed to apply namespace: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl Environment for KubeEnvironment {
    async fn create_namespace(&self, name: &str) -> Result<()> {
        let labels = BTreeMap::from([(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string())]);
        self.apply_namespace(name, labels, BTreeMap::new(), FIELD_MANAGER)
            .await?;
        info!(namespace = %name, "namespace created");
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        poll_until(
            NAMESPACE_DELETE_TIMEOUT,
            POLL_INTERVAL,
            format!("timeout waiting for namespace {} to be deleted", name),
            || {
                let api = api.clone();
                async move { Ok::<_, Error>(api.get_opt(name).await?.is_none()) }
            },
        )
        .await?;
        info!(namespace = %name, "namespace deleted");
        Ok(())
    }

    async fn add_namespace_to_mesh(&self, name: &str, sidecar_injection: bool) -> Result<()> {
        let labels = BTreeMap::from([(MONITORED_BY_LABEL.to_string(), self.mesh_name.clone())]);
        let injection = if sidecar_injection { "enabled" } else { "disabled" };
        let annotations = BTreeMap::from([(
            SIDECAR_INJECTION_ANNOTATION.to_string(),
            injection.to_string(),
        )]);
        self.apply_namespace(name, labels, annotations, MESH_FIELD_MANAGER)
            .await?;
        info!(namespace = %name, mesh = %self.mesh_name, sidecar_injection, "namespace added to mesh");
        Ok(())
    }

    async fn create_service_account(&self, def: &WorkloadDef) -> Result<()> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), &def.namespace);
        api.patch(
            &def.name,
            &Self::apply_params(),
            &Patch::Apply(&def.service_account()),
        )
        .await
        .map_err(|e| {
            Error::provisioning(
                def.qualified_name(),
                format!("failed to create service account: {}", e),
            )
        })?;
        debug!(workload = %def.qualified_name(), "service account created");
        Ok(())
    }

    async fn create_workload(&self, def: &WorkloadDef) -> Result<Workload> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &def.namespace);
        api.patch(&def.name, &Self::apply_params(), &Patch::Apply(&def.pod()))
            .await
            .map_err(|e| {
                Error::provisioning(def.qualified_name(), format!("failed to create pod: {}", e))
            })?;
        debug!(workload = %def.qualified_name(), image = %def.image, "pod created");
        Ok(def.workload())
    }

    async fn create_network_identity(&self, def: &WorkloadDef) -> Result<NetworkIdentity> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), &def.namespace);
        api.patch(
            &def.name,
            &Self::apply_params(),
            &Patch::Apply(&def.service()),
        )
        .await
        .map_err(|e| {
            Error::provisioning(
                def.qualified_name(),
                format!("failed to create service: {}", e),
            )
        })?;
        debug!(workload = %def.qualified_name(), ports = ?def.ports, "service created");
        Ok(def.network_identity())
    }

    async fn delete_network_identity(&self, def: &WorkloadDef) -> Result<()> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), &def.namespace);
        match api.delete(&def.name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(workload = %def.qualified_name(), "leftover service deleted");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(Error::provisioning(
                def.qualified_name(),
                format!("failed to delete service: {}", e),
            )),
        }
    }

    async fn wait_for_workloads_ready(
        &self,
        namespace: &str,
        timeout: Duration,
        min_ready: usize,
    ) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let selector = format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY_VALUE);

        poll_until(
            timeout,
            POLL_INTERVAL,
            format!("fewer than {} pods ready in {}", min_ready, namespace),
            || {
                let api = api.clone();
                let params = ListParams::default().labels(&selector);
                async move {
                    let pods = api.list(&params).await?;
                    let ready = pods.items.iter().filter(|p| pod_is_ready(p)).count();
                    trace!(namespace = %namespace, ready, min_ready, "checking pod readiness");
                    Ok::<_, Error>(ready >= min_ready)
                }
            },
        )
        .await
        .map_err(|e| Error::provisioning(namespace, e.to_string()))?;

        info!(namespace = %namespace, min_ready, "workloads ready");
        Ok(())
    }

    async fn create_route(&self, route: &TrafficRoute) -> Result<()> {
        let meta = route.metadata();
        let qualified = format!("{}/{}", meta.namespace, meta.name);
        let body = route.to_value()?;
        self.dynamic(&meta.namespace, route.api_version(), route.kind())
            .patch(&meta.name, &Self::apply_params(), &Patch::Apply(&body))
            .await
            .map_err(|e| Error::policy(&qualified, format!("failed to create {}: {}", route.kind(), e)))?;
        info!(route = %qualified, kind = route.kind(), "route created");
        Ok(())
    }

    async fn create_access_grant(&self, target: &TrafficTarget) -> Result<()> {
        let meta = &target.metadata;
        let qualified = format!("{}/{}", meta.namespace, meta.name);
        let body = serde_json::to_value(target)?;
        self.dynamic(&meta.namespace, &target.api_version, TrafficTarget::KIND)
            .patch(&meta.name, &Self::apply_params(), &Patch::Apply(&body))
            .await
            .map_err(|e| Error::policy(&qualified, format!("failed to create TrafficTarget: {}", e)))?;
        info!(grant = %qualified, "access grant created");
        Ok(())
    }

    async fn delete_access_grant(&self, namespace: &str, name: &str) -> Result<()> {
        let api = self.dynamic(namespace, SMI_ACCESS_API_VERSION, TrafficTarget::KIND);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => {
                debug!(grant = %format!("{}/{}", namespace, name), "access grant already gone");
            }
            Err(e) => {
                return Err(Error::policy(
                    format!("{}/{}", namespace, name),
                    format!("failed to delete TrafficTarget: {}", e),
                ))
            }
        }
        info!(grant = %format!("{}/{}", namespace, name), "access grant deleted");
        Ok(())
    }

    async fn delete_route(&self, route: &TrafficRoute) -> Result<()> {
        let meta = route.metadata();
        let qualified = format!("{}/{}", meta.namespace, meta.name);
        match self
            .dynamic(&meta.namespace, route.api_version(), route.kind())
            .delete(&meta.name, &DeleteParams::default())
            .await
        {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => {}
            Err(e) => {
                return Err(Error::policy(
                    &qualified,
                    format!("failed to delete {}: {}", route.kind(), e),
                ))
            }
        }
        info!(route = %qualified, kind = route.kind(), "route deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerStatus, PodStatus};

    fn pod(phase: &str, ready: &[bool]) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                container_statuses: Some(
                    ready
                        .iter()
                        .map(|r| ContainerStatus {
                            ready: *r,
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn pod_is_ready_only_when_running_with_all_containers_ready() {
        assert!(pod_is_ready(&pod("Running", &[true, true])));
        assert!(!pod_is_ready(&pod("Running", &[true, false])));
        assert!(!pod_is_ready(&pod("Pending", &[true])));
        assert!(!pod_is_ready(&pod("Running", &[])));
        assert!(!pod_is_ready(&Pod::default()));
    }

    #[test]
    fn smi_resources_use_lowercase_plurals() {
        let ar = smi_api_resource("specs.smi-spec.io/v1alpha4", "HTTPRouteGroup");
        assert_eq!(ar.group, "specs.smi-spec.io");
        assert_eq!(ar.version, "v1alpha4");
        assert_eq!(ar.plural, "httproutegroups");

        let ar = smi_api_resource(SMI_ACCESS_API_VERSION, TrafficTarget::KIND);
        assert_eq!(ar.plural, "traffictargets");
        assert_eq!(ar.api_version, "access.smi-spec.io/v1alpha3");
    }

    #[test]
    fn mesh_enrollment_manifest_carries_label_and_annotation() {
        let labels = BTreeMap::from([(MONITORED_BY_LABEL.to_string(), "osm".to_string())]);
        let annotations = BTreeMap::from([(
            SIDECAR_INJECTION_ANNOTATION.to_string(),
            "enabled".to_string(),
        )]);
        let body = namespace_manifest("client", &labels, &annotations);

        assert_eq!(body["kind"], "Namespace");
        assert_eq!(body["metadata"]["name"], "client");
        assert_eq!(body["metadata"]["labels"][MONITORED_BY_LABEL], "osm");
        assert_eq!(
            body["metadata"]["annotations"][SIDECAR_INJECTION_ANNOTATION],
            "enabled"
        );
    }

    #[test]
    fn plain_namespace_manifest_omits_empty_maps() {
        let body = namespace_manifest("server", &BTreeMap::new(), &BTreeMap::new());
        assert!(body["metadata"].get("labels").is_none());
        assert!(body["metadata"].get("annotations").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn poll_until_times_out_with_the_given_message() {
        let err = poll_until(
            Duration::from_secs(10),
            Duration::from_secs(1),
            "never ready",
            || async { Ok(false) },
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("never ready"));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_until_keeps_polling_through_check_errors() {
        let mut calls = 0;
        poll_until(Duration::from_secs(10), Duration::from_secs(1), "x", || {
            calls += 1;
            let n = calls;
            async move {
                if n < 3 {
                    Err(Error::internal_with_context("list_pods", "api hiccup"))
                } else {
                    Ok(true)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(calls, 3);
    }
}
