//! Workload types for mesh scenarios
//!
//! A scenario runs two single-container pods, each with its own
//! ServiceAccount (the identity the mesh authorizes) and, optionally, a
//! Service in front of it. [`WorkloadDef`] describes one of them and builds
//! the Kubernetes objects; [`Workload`] and [`NetworkIdentity`] are what the
//! environment hands back once they exist.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, Pod, PodSpec, Service, ServiceAccount, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::{Deserialize, Serialize};

/// Label used to select a workload's pods
pub const APP_LABEL: &str = "app";

/// Label marking objects created by meshprobe
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`]
pub const MANAGED_BY_VALUE: &str = "meshprobe";

/// Application protocol hint placed on the Service ports
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppProtocol {
    /// HTTP traffic (the mesh can apply L7 routes)
    #[default]
    Http,
    /// Opaque TCP traffic
    Tcp,
}

impl AppProtocol {
    /// Protocol name as used in `appProtocol`
    pub fn as_str(&self) -> &'static str {
        match self {
            AppProtocol::Http => "http",
            AppProtocol::Tcp => "tcp",
        }
    }
}

/// Definition of a single-container test workload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadDef {
    /// Name shared by the pod, its container, service account and service
    pub name: String,
    /// Namespace the workload lives in
    pub namespace: String,
    /// Container image
    pub image: String,
    /// Container entrypoint override
    pub command: Vec<String>,
    /// Container arguments
    pub args: Vec<String>,
    /// Ports exposed by the container (and the service, if any)
    pub ports: Vec<u16>,
    /// Protocol hint for the service ports
    pub app_protocol: AppProtocol,
}

impl WorkloadDef {
    /// Create a definition with no command, args or ports
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        image: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            image: image.into(),
            command: Vec::new(),
            args: Vec::new(),
            ports: Vec::new(),
            app_protocol: AppProtocol::Http,
        }
    }

    /// Set the container command
    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Set the container args
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the exposed ports
    pub fn with_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.ports = ports.into_iter().collect();
        self
    }

    /// Set the application protocol hint
    pub fn with_app_protocol(mut self, protocol: AppProtocol) -> Self {
        self.app_protocol = protocol;
        self
    }

    /// `namespace/name`
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (APP_LABEL.to_string(), self.name.clone()),
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        ])
    }

    fn metadata(&self) -> ObjectMeta {
        ObjectMeta {
            name: Some(self.name.clone()),
            namespace: Some(self.namespace.clone()),
            labels: Some(self.labels()),
            ..Default::default()
        }
    }

    /// ServiceAccount carrying the workload's mesh identity
    pub fn service_account(&self) -> ServiceAccount {
        ServiceAccount {
            metadata: self.metadata(),
            ..Default::default()
        }
    }

    /// Single-container pod running as the workload's service account
    pub fn pod(&self) -> Pod {
        let ports = self
            .ports
            .iter()
            .map(|p| ContainerPort {
                container_port: i32::from(*p),
                ..Default::default()
            })
            .collect::<Vec<_>>();

        Pod {
            metadata: self.metadata(),
            spec: Some(PodSpec {
                service_account_name: Some(self.name.clone()),
                termination_grace_period_seconds: Some(0),
                containers: vec![Container {
                    name: self.name.clone(),
                    image: Some(self.image.clone()),
                    image_pull_policy: Some("IfNotPresent".to_string()),
                    command: (!self.command.is_empty()).then(|| self.command.clone()),
                    args: (!self.args.is_empty()).then(|| self.args.clone()),
                    ports: (!ports.is_empty()).then_some(ports),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// ClusterIP Service fronting every declared port
    pub fn service(&self) -> Service {
        let ports = self
            .ports
            .iter()
            .map(|p| ServicePort {
                name: Some(format!("{}-{}", self.app_protocol.as_str(), p)),
                port: i32::from(*p),
                target_port: Some(IntOrString::Int(i32::from(*p))),
                protocol: Some("TCP".to_string()),
                app_protocol: Some(self.app_protocol.as_str().to_string()),
                ..Default::default()
            })
            .collect();

        Service {
            metadata: self.metadata(),
            spec: Some(ServiceSpec {
                selector: Some(BTreeMap::from([(APP_LABEL.to_string(), self.name.clone())])),
                ports: Some(ports),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Reference to the running workload this definition produces
    pub fn workload(&self) -> Workload {
        Workload {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            container: self.name.clone(),
        }
    }

    /// Network identity the definition's service produces
    pub fn network_identity(&self) -> NetworkIdentity {
        NetworkIdentity {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            ports: self.ports.clone(),
        }
    }
}

/// A running workload: the pod and container traffic is issued from
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Workload {
    /// Namespace of the pod
    pub namespace: String,
    /// Pod name
    pub name: String,
    /// Container to execute probe commands in
    pub container: String,
}

impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Stable resolvable address fronting a workload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkIdentity {
    /// Namespace of the service
    pub namespace: String,
    /// Service name
    pub name: String,
    /// Service ports
    pub ports: Vec<u16>,
}

impl NetworkIdentity {
    /// `name.namespace`, resolvable from any namespace in the cluster
    pub fn authority(&self) -> String {
        format!("{}.{}", self.name, self.namespace)
    }
}
