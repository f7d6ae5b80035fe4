//! Authorization policy types
//!
//! An [`AuthorizationPolicy`] is the harness's view of an allow rule: source
//! identity, destination identity and traffic shape. The mesh under test
//! consumes it as two SMI (Service Mesh Interface) objects:
//!
//! - a route describing the traffic (`HTTPRouteGroup` or `TCPRoute`)
//! - a `TrafficTarget` granting the source service account access to the
//!   destination service account over that route
//!
//! Policies are never mutated in place. Replacing one means deleting both
//! objects and creating new ones.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::workload::{MANAGED_BY_LABEL, MANAGED_BY_VALUE};

/// API version for SMI route specs
pub const SMI_SPECS_API_VERSION: &str = "specs.smi-spec.io/v1alpha4";

/// API version for SMI access control
pub const SMI_ACCESS_API_VERSION: &str = "access.smi-spec.io/v1alpha3";

/// Name of the catch-all HTTP match
pub const MATCH_ALL: &str = "all";

/// Kind used for service account subjects
pub const SERVICE_ACCOUNT_KIND: &str = "ServiceAccount";

// =============================================================================
// Harness-level policy
// =============================================================================

/// Service account a workload runs as
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAccountIdentity {
    /// Namespace of the service account
    pub namespace: String,
    /// Service account name
    pub name: String,
}

impl ServiceAccountIdentity {
    /// Create a new identity
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    fn subject(&self) -> IdentityBindingSubject {
        IdentityBindingSubject {
            kind: SERVICE_ACCOUNT_KIND.to_string(),
            name: self.name.clone(),
            namespace: self.namespace.clone(),
        }
    }
}

impl fmt::Display for ServiceAccountIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Traffic a policy allows
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "protocol")]
pub enum TrafficShape {
    /// Every HTTP path and method
    Http,
    /// Raw TCP to one port
    Tcp {
        /// Destination port
        port: u16,
    },
}

/// Declarative allow rule from one identity to another
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthorizationPolicy {
    /// Name of the access grant (TrafficTarget)
    pub name: String,
    /// Name of the route object the grant refers to
    pub route_name: String,
    /// Namespace both objects are created in
    pub namespace: String,
    /// Caller identity
    pub source: ServiceAccountIdentity,
    /// Callee identity
    pub destination: ServiceAccountIdentity,
    /// Allowed traffic
    pub shape: TrafficShape,
}

impl AuthorizationPolicy {
    /// Allow all `shape` traffic from `source` to `destination`.
    ///
    /// Objects are placed in the source namespace, which is monitored by the
    /// mesh.
    pub fn allow(
        name: impl Into<String>,
        route_name: impl Into<String>,
        source: ServiceAccountIdentity,
        destination: ServiceAccountIdentity,
        shape: TrafficShape,
    ) -> Self {
        Self {
            name: name.into(),
            route_name: route_name.into(),
            namespace: source.namespace.clone(),
            source,
            destination,
            shape,
        }
    }

    /// `namespace/name` of the access grant
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Route object describing the allowed traffic
    pub fn route(&self) -> TrafficRoute {
        let metadata = PolicyMetadata::new(&self.route_name, &self.namespace);
        match self.shape {
            TrafficShape::Http => TrafficRoute::Http(HttpRouteGroup {
                api_version: SMI_SPECS_API_VERSION.to_string(),
                kind: HttpRouteGroup::KIND.to_string(),
                metadata,
                spec: HttpRouteGroupSpec {
                    matches: vec![HttpMatch {
                        name: MATCH_ALL.to_string(),
                        path_regex: ".*".to_string(),
                        methods: vec!["*".to_string()],
                    }],
                },
            }),
            TrafficShape::Tcp { port } => TrafficRoute::Tcp(TcpRoute {
                api_version: SMI_SPECS_API_VERSION.to_string(),
                kind: TcpRoute::KIND.to_string(),
                metadata,
                spec: TcpRouteSpec {
                    matches: TcpMatch { ports: vec![port] },
                },
            }),
        }
    }

    /// Access grant binding source to destination over [`Self::route`]
    pub fn traffic_target(&self) -> TrafficTarget {
        let rule = match self.shape {
            TrafficShape::Http => TrafficTargetRule {
                kind: HttpRouteGroup::KIND.to_string(),
                name: self.route_name.clone(),
                matches: vec![MATCH_ALL.to_string()],
            },
            TrafficShape::Tcp { .. } => TrafficTargetRule {
                kind: TcpRoute::KIND.to_string(),
                name: self.route_name.clone(),
                matches: Vec::new(),
            },
        };

        TrafficTarget {
            api_version: SMI_ACCESS_API_VERSION.to_string(),
            kind: TrafficTarget::KIND.to_string(),
            metadata: PolicyMetadata::new(&self.name, &self.namespace),
            spec: TrafficTargetSpec {
                destination: self.destination.subject(),
                sources: vec![self.source.subject()],
                rules: vec![rule],
            },
        }
    }
}

// =============================================================================
// SMI resources
// =============================================================================

/// Metadata for policy resources
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyMetadata {
    /// Resource name
    pub name: String,
    /// Resource namespace
    pub namespace: String,
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl PolicyMetadata {
    /// Create new metadata with the managed-by label
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
        Self {
            name: name.into(),
            namespace: namespace.into(),
            labels,
        }
    }
}

/// SMI HTTPRouteGroup
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HttpRouteGroup {
    /// API version
    pub api_version: String,
    /// Kind
    pub kind: String,
    /// Metadata
    pub metadata: PolicyMetadata,
    /// Spec
    pub spec: HttpRouteGroupSpec,
}

impl HttpRouteGroup {
    /// Resource kind
    pub const KIND: &'static str = "HTTPRouteGroup";
}

/// HTTPRouteGroup spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpRouteGroupSpec {
    /// Named matches referenced from TrafficTarget rules
    pub matches: Vec<HttpMatch>,
}

/// One HTTP match
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HttpMatch {
    /// Match name
    pub name: String,
    /// Path regex
    pub path_regex: String,
    /// Allowed methods (`*` for all)
    pub methods: Vec<String>,
}

/// SMI TCPRoute
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TcpRoute {
    /// API version
    pub api_version: String,
    /// Kind
    pub kind: String,
    /// Metadata
    pub metadata: PolicyMetadata,
    /// Spec
    pub spec: TcpRouteSpec,
}

impl TcpRoute {
    /// Resource kind
    pub const KIND: &'static str = "TCPRoute";
}

/// TCPRoute spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TcpRouteSpec {
    /// Port match
    pub matches: TcpMatch,
}

/// TCP port match
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TcpMatch {
    /// Allowed destination ports
    pub ports: Vec<u16>,
}

/// SMI TrafficTarget
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TrafficTarget {
    /// API version
    pub api_version: String,
    /// Kind
    pub kind: String,
    /// Metadata
    pub metadata: PolicyMetadata,
    /// Spec
    pub spec: TrafficTargetSpec,
}

impl TrafficTarget {
    /// Resource kind
    pub const KIND: &'static str = "TrafficTarget";
}

/// TrafficTarget spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrafficTargetSpec {
    /// Identity receiving traffic
    pub destination: IdentityBindingSubject,
    /// Identities allowed to send traffic
    pub sources: Vec<IdentityBindingSubject>,
    /// Routes the grant applies to
    pub rules: Vec<TrafficTargetRule>,
}

/// Subject of a TrafficTarget
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityBindingSubject {
    /// Subject kind (always ServiceAccount)
    pub kind: String,
    /// Service account name
    pub name: String,
    /// Service account namespace
    pub namespace: String,
}

/// Route reference inside a TrafficTarget
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrafficTargetRule {
    /// Route kind
    pub kind: String,
    /// Route name
    pub name: String,
    /// Named matches inside the route (empty for TCP)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matches: Vec<String>,
}

/// Either route kind
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrafficRoute {
    /// HTTP route group
    Http(HttpRouteGroup),
    /// TCP route
    Tcp(TcpRoute),
}

impl TrafficRoute {
    /// Metadata of the underlying resource
    pub fn metadata(&self) -> &PolicyMetadata {
        match self {
            TrafficRoute::Http(r) => &r.metadata,
            TrafficRoute::Tcp(r) => &r.metadata,
        }
    }

    /// API version of the underlying resource
    pub fn api_version(&self) -> &str {
        match self {
            TrafficRoute::Http(r) => &r.api_version,
            TrafficRoute::Tcp(r) => &r.api_version,
        }
    }

    /// Kind of the underlying resource
    pub fn kind(&self) -> &'static str {
        match self {
            TrafficRoute::Http(_) => HttpRouteGroup::KIND,
            TrafficRoute::Tcp(_) => TcpRoute::KIND,
        }
    }

    /// Serialize to a JSON value suitable for a dynamic API create
    pub fn to_value(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            TrafficRoute::Http(r) => serde_json::to_value(r),
            TrafficRoute::Tcp(r) => serde_json::to_value(r),
        }
    }
}
