//! Harness configuration
//!
//! Defaults match the timings known to work against a local kind
//! cluster. A YAML (or JSON) file can override any subset of fields; the CLI
//! layers its flags on top with [`HarnessConfig::apply_overrides`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::convergence::ConvergencePolicy;
use crate::{Error, Result};

/// Top-level harness configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HarnessConfig {
    /// Mesh name written into the monitored-by namespace label
    pub mesh_name: String,
    /// Namespace for the source workload
    pub client_namespace: String,
    /// Namespace for the destination workload
    pub server_namespace: String,
    /// Delete scenario namespaces when a scenario finishes
    pub cleanup_namespaces: bool,
    /// Number of recent probe results kept in a failure report
    pub diagnostic_window: usize,
    /// Container images
    pub images: ImageConfig,
    /// Convergence criterion
    pub convergence: ConvergenceConfig,
    /// Phase timeouts
    pub timeouts: TimeoutConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            mesh_name: "osm".to_string(),
            client_namespace: "client".to_string(),
            server_namespace: "server".to_string(),
            cleanup_namespaces: true,
            diagnostic_window: 5,
            images: ImageConfig::default(),
            convergence: ConvergenceConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

/// Container images used by the scenarios
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageConfig {
    /// HTTP destination
    pub http_server: String,
    /// Source workload; must ship curl and nc
    pub client: String,
    /// Registry hosting the TCP echo server
    pub registry: String,
    /// Tag of the TCP echo server
    pub tag: String,
    /// Full TCP echo server image, overriding registry and tag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_echo_server: Option<String>,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            http_server: "kennethreitz/httpbin".to_string(),
            client: "curlimages/curl".to_string(),
            registry: "openservicemesh".to_string(),
            tag: "latest".to_string(),
            tcp_echo_server: None,
        }
    }
}

impl ImageConfig {
    /// `<registry>/tcp-echo-server:<tag>` unless overridden
    pub fn tcp_echo_server_image(&self) -> String {
        self.tcp_echo_server
            .clone()
            .unwrap_or_else(|| format!("{}/tcp-echo-server:{}", self.registry, self.tag))
    }
}

/// How many consecutive successes prove a verdict, and how often to probe
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConvergenceConfig {
    /// Consecutive matching results required
    pub required_successes: u32,
    /// Seconds between attempts
    pub probe_interval_secs: u64,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            required_successes: 5,
            probe_interval_secs: 1,
        }
    }
}

/// Phase timeouts, in seconds
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutConfig {
    /// Window for traffic to start flowing after a grant
    pub grant_secs: u64,
    /// Window for traffic to stop after a revoke
    pub revoke_secs: u64,
    /// Readiness of the HTTP destination
    pub http_server_ready_secs: u64,
    /// Readiness of the TCP destination
    pub tcp_server_ready_secs: u64,
    /// Readiness of the source
    pub client_ready_secs: u64,
    /// Deadline for a single probe command
    pub exec_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            grant_secs: 90,
            revoke_secs: 150,
            http_server_ready_secs: 90,
            tcp_server_ready_secs: 120,
            client_ready_secs: 90,
            exec_secs: 60,
        }
    }
}

/// Values given on the command line or in the environment
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    /// Mesh name
    pub mesh_name: Option<String>,
    /// Container registry
    pub registry: Option<String>,
    /// Image tag
    pub image_tag: Option<String>,
}

impl HarnessConfig {
    /// Load from a YAML or JSON file (JSON is valid YAML)
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_yaml(&raw)
            .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))?;
        debug!(path = %path.display(), "loaded harness config");
        Ok(config)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Layer CLI/environment values on top
    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(mesh) = overrides.mesh_name {
            self.mesh_name = mesh;
        }
        if let Some(registry) = overrides.registry {
            self.images.registry = registry;
        }
        if let Some(tag) = overrides.image_tag {
            self.images.tag = tag;
        }
    }

    /// Reject values that would make every scenario meaningless
    pub fn validate(&self) -> Result<()> {
        if self.convergence.required_successes == 0 {
            return Err(Error::validation("requiredSuccesses must be at least 1"));
        }
        let t = &self.timeouts;
        for (name, secs) in [
            ("grantSecs", t.grant_secs),
            ("revokeSecs", t.revoke_secs),
            ("httpServerReadySecs", t.http_server_ready_secs),
            ("tcpServerReadySecs", t.tcp_server_ready_secs),
            ("clientReadySecs", t.client_ready_secs),
            ("execSecs", t.exec_secs),
        ] {
            if secs == 0 {
                return Err(Error::validation(format!("{} must be greater than 0", name)));
            }
        }
        if self.client_namespace == self.server_namespace {
            return Err(Error::validation(
                "client and server namespaces must differ",
            ));
        }
        Ok(())
    }

    fn policy(&self, timeout_secs: u64) -> Result<ConvergencePolicy> {
        ConvergencePolicy::with_interval(
            self.convergence.required_successes,
            Duration::from_secs(timeout_secs),
            Duration::from_secs(self.convergence.probe_interval_secs),
        )
    }

    /// Criterion for traffic to start flowing after a grant
    pub fn grant_policy(&self) -> Result<ConvergencePolicy> {
        self.policy(self.timeouts.grant_secs)
    }

    /// Criterion for traffic to stop after a revoke
    pub fn revoke_policy(&self) -> Result<ConvergencePolicy> {
        self.policy(self.timeouts.revoke_secs)
    }

    /// Per-exec deadline for the transport
    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.exec_secs)
    }
}
