//! In-memory mesh for integration tests
//!
//! [`SimulatedMesh`] plays both collaborators. The control plane applies
//! policy instantly; the data plane sees each change only after a
//! propagation delay, measured on the shared [`ManualClock`].

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use meshprobe::clock::ManualClock;
use meshprobe::config::HarnessConfig;
use meshprobe::context::ScenarioContext;
use meshprobe::environment::Environment;
use meshprobe::policy::{TrafficRoute, TrafficTarget};
use meshprobe::probe::{ExecOutput, Transport, TransportError};
use meshprobe::workload::{NetworkIdentity, Workload, WorkloadDef};
use meshprobe::{Error, Result};

#[derive(Default)]
struct State {
    /// namespace -> enrolled in the mesh
    namespaces: BTreeMap<String, bool>,
    /// `ns/name`
    pods: BTreeSet<String>,
    /// `name.ns`
    services: BTreeSet<String>,
    /// `ns/name`
    routes: BTreeSet<String>,
    /// `ns/name`
    grants: BTreeSet<String>,
    /// (virtual time, access allowed by the control plane)
    history: Vec<(Duration, bool)>,
    requests: u64,
    source_services: u32,
}

impl State {
    fn authorized(&self) -> bool {
        !self.grants.is_empty() && !self.routes.is_empty()
    }
}

/// Mesh with a fixed propagation delay and optional periodic flakes
pub struct SimulatedMesh {
    clock: Arc<ManualClock>,
    delay: Duration,
    revoke_delay: Duration,
    flake_every: Option<u64>,
    state: Mutex<State>,
}

impl SimulatedMesh {
    pub fn new(clock: Arc<ManualClock>, delay: Duration) -> Self {
        Self {
            clock,
            delay,
            revoke_delay: delay,
            flake_every: None,
            state: Mutex::new(State::default()),
        }
    }

    /// Withdrawals take `delay` to reach the data plane instead
    pub fn with_revoke_delay(mut self, delay: Duration) -> Self {
        self.revoke_delay = delay;
        self
    }

    /// Every `n`th request fails with a transport error unrelated to policy
    pub fn with_flakes(mut self, n: u64) -> Self {
        self.flake_every = Some(n);
        self
    }

    fn record_policy_change(state: &mut State, now: Duration) {
        let authorized = state.authorized();
        state.history.push((now, authorized));
    }

    /// Whether the data plane currently lets traffic through
    fn data_plane_allows(&self, state: &State) -> bool {
        let now = self.clock.elapsed();
        state
            .history
            .iter()
            .rev()
            .find(|(t, allowed)| {
                let delay = if *allowed { self.delay } else { self.revoke_delay };
                *t + delay <= now
            })
            .map(|(_, allowed)| *allowed)
            .unwrap_or(false)
    }

    pub fn requests(&self) -> u64 {
        self.state.lock().unwrap().requests
    }

    pub fn source_services_created(&self) -> u32 {
        self.state.lock().unwrap().source_services
    }

    /// Whether a service currently answers at `authority` (`name.ns`)
    pub fn has_service(&self, authority: &str) -> bool {
        self.state.lock().unwrap().services.contains(authority)
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.state.lock().unwrap().namespaces.keys().cloned().collect()
    }

    pub fn enrolled(&self, ns: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .namespaces
            .get(ns)
            .copied()
            .unwrap_or(false)
    }
}

fn curl(exit_code: i32, stdout: &str) -> ExecOutput {
    ExecOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code,
    }
}

/// Split `echo '<msg>' | nc <host> <port>`
fn parse_nc(script: &str) -> Option<(String, String)> {
    let rest = script.strip_prefix("echo '")?;
    let (msg, rest) = rest.split_once("' | nc ")?;
    let host = rest.split_whitespace().next()?;
    Some((msg.to_string(), host.to_string()))
}

#[async_trait]
impl Environment for SimulatedMesh {
    async fn create_namespace(&self, name: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .namespaces
            .entry(name.to_string())
            .or_insert(false);
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.namespaces.remove(name);
        let prefix = format!("{}/", name);
        let suffix = format!(".{}", name);
        st.pods.retain(|p| !p.starts_with(&prefix));
        st.services.retain(|s| !s.ends_with(&suffix));
        st.routes.retain(|r| !r.starts_with(&prefix));
        st.grants.retain(|g| !g.starts_with(&prefix));
        let now = self.clock.elapsed();
        Self::record_policy_change(&mut st, now);
        Ok(())
    }

    async fn add_namespace_to_mesh(&self, name: &str, _sidecar_injection: bool) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        match st.namespaces.get_mut(name) {
            Some(enrolled) => {
                *enrolled = true;
                Ok(())
            }
            None => Err(Error::provisioning(name, "namespace not found")),
        }
    }

    async fn create_service_account(&self, def: &WorkloadDef) -> Result<()> {
        if !self.state.lock().unwrap().namespaces.contains_key(&def.namespace) {
            return Err(Error::provisioning(def.qualified_name(), "namespace not found"));
        }
        Ok(())
    }

    async fn create_workload(&self, def: &WorkloadDef) -> Result<Workload> {
        self.state.lock().unwrap().pods.insert(def.qualified_name());
        Ok(def.workload())
    }

    async fn create_network_identity(&self, def: &WorkloadDef) -> Result<NetworkIdentity> {
        let identity = def.network_identity();
        let mut st = self.state.lock().unwrap();
        st.services.insert(identity.authority());
        if def.name == "client" {
            st.source_services += 1;
        }
        Ok(identity)
    }

    async fn delete_network_identity(&self, def: &WorkloadDef) -> Result<()> {
        let authority = def.network_identity().authority();
        self.state.lock().unwrap().services.remove(&authority);
        Ok(())
    }

    async fn wait_for_workloads_ready(
        &self,
        namespace: &str,
        _timeout: Duration,
        min_ready: usize,
    ) -> Result<()> {
        let prefix = format!("{}/", namespace);
        let ready = self
            .state
            .lock()
            .unwrap()
            .pods
            .iter()
            .filter(|p| p.starts_with(&prefix))
            .count();
        if ready < min_ready {
            return Err(Error::provisioning(namespace, "no pods ready"));
        }
        Ok(())
    }

    async fn create_route(&self, route: &TrafficRoute) -> Result<()> {
        let meta = route.metadata();
        let mut st = self.state.lock().unwrap();
        st.routes.insert(format!("{}/{}", meta.namespace, meta.name));
        let now = self.clock.elapsed();
        Self::record_policy_change(&mut st, now);
        Ok(())
    }

    async fn create_access_grant(&self, target: &TrafficTarget) -> Result<()> {
        let meta = &target.metadata;
        let mut st = self.state.lock().unwrap();
        st.grants.insert(format!("{}/{}", meta.namespace, meta.name));
        let now = self.clock.elapsed();
        Self::record_policy_change(&mut st, now);
        Ok(())
    }

    async fn delete_access_grant(&self, namespace: &str, name: &str) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if !st.grants.remove(&format!("{}/{}", namespace, name)) {
            return Err(Error::policy(format!("{}/{}", namespace, name), "not found"));
        }
        let now = self.clock.elapsed();
        Self::record_policy_change(&mut st, now);
        Ok(())
    }

    async fn delete_route(&self, route: &TrafficRoute) -> Result<()> {
        let meta = route.metadata();
        let mut st = self.state.lock().unwrap();
        st.routes.remove(&format!("{}/{}", meta.namespace, meta.name));
        let now = self.clock.elapsed();
        Self::record_policy_change(&mut st, now);
        Ok(())
    }
}

#[async_trait]
impl Transport for SimulatedMesh {
    async fn exec(
        &self,
        source: &Workload,
        command: &[String],
    ) -> std::result::Result<ExecOutput, TransportError> {
        let mut st = self.state.lock().unwrap();
        st.requests += 1;
        let n = st.requests;

        if !st.pods.contains(&format!("{}/{}", source.namespace, source.name)) {
            return Err(TransportError::other(format!(
                "pods \"{}\" not found",
                source.name
            )));
        }

        let flake = self.flake_every.map_or(false, |k| n % k == 0);
        let allowed = self.data_plane_allows(&st);

        match command.first().map(String::as_str) {
            Some("curl") => {
                let dest = command.last().cloned().unwrap_or_default();
                if !st.services.contains(&dest) {
                    return Ok(curl(6, "000"));
                }
                if flake {
                    // Connection reset mid-response
                    return Ok(curl(56, "000"));
                }
                Ok(if allowed { curl(0, "200") } else { curl(7, "000") })
            }
            Some("/bin/sh") => {
                let Some((msg, host)) = command.get(2).and_then(|s| parse_nc(s)) else {
                    return Err(TransportError::other("malformed nc command"));
                };
                if !st.services.contains(&host) {
                    return Ok(ExecOutput {
                        stderr: "nc: bad address".to_string(),
                        exit_code: 1,
                        ..Default::default()
                    });
                }
                if flake {
                    return Ok(ExecOutput::default());
                }
                if allowed {
                    Ok(ExecOutput {
                        stdout: format!("echo: {}\n", msg),
                        ..Default::default()
                    })
                } else {
                    Ok(ExecOutput {
                        exit_code: 1,
                        ..Default::default()
                    })
                }
            }
            _ => Err(TransportError::other("unsupported command")),
        }
    }
}

/// Context with the mesh as both collaborators, on virtual time
pub fn context(mesh: Arc<SimulatedMesh>, clock: Arc<ManualClock>) -> ScenarioContext {
    context_with(mesh, clock, HarnessConfig::default())
}

/// Same as [`context`] with a caller-supplied config
pub fn context_with(
    mesh: Arc<SimulatedMesh>,
    clock: Arc<ManualClock>,
    config: HarnessConfig,
) -> ScenarioContext {
    ScenarioContext::new(mesh.clone(), mesh, config).with_clock(clock)
}
