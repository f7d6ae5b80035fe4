//! Source workload setup
//!
//! The source is a curl image kept alive with `sleep`. Whether it gets a
//! Service of its own is the one parameter that separates the HTTP variants:
//! the mesh must authorize by service account even when the caller has no
//! network identity.

use std::time::Duration;

use tracing::info;

use super::SOURCE_NAME;
use crate::config::HarnessConfig;
use crate::environment::Environment;
use crate::workload::{Workload, WorkloadDef};
use crate::Result;

/// Port declared on the source pod (and its service, when created)
pub const SOURCE_PORT: u16 = 80;

/// Definition of the source workload
pub fn source_def(config: &HarnessConfig) -> WorkloadDef {
    WorkloadDef::new(SOURCE_NAME, &config.client_namespace, &config.images.client)
        .with_command(["sleep", "365d"])
        .with_ports([SOURCE_PORT])
}

/// Create the source service account and workload, and its network identity
/// when `with_service` is set, then wait until it is ready. Without
/// `with_service` any existing source identity is removed first.
pub async fn setup_source(
    env: &dyn Environment,
    config: &HarnessConfig,
    with_service: bool,
) -> Result<Workload> {
    let def = source_def(config);

    env.create_service_account(&def).await?;
    let workload = env.create_workload(&def).await?;

    if with_service {
        env.create_network_identity(&def).await?;
    } else {
        // A retained namespace may still hold the service from an earlier run
        env.delete_network_identity(&def).await?;
    }

    env.wait_for_workloads_ready(
        &def.namespace,
        Duration::from_secs(config.timeouts.client_ready_secs),
        1,
    )
    .await?;

    info!(source = %workload, with_service, "source workload ready");
    Ok(workload)
}
