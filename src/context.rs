//! Collaborators a scenario runs against

use std::sync::Arc;

use crate::clock::{Clock, TokioClock};
use crate::config::HarnessConfig;
use crate::environment::Environment;
use crate::probe::Transport;

/// Everything a scenario needs, passed explicitly instead of living in
/// process-wide state
#[derive(Clone)]
pub struct ScenarioContext {
    /// Cluster operations
    pub environment: Arc<dyn Environment>,
    /// Command execution inside workloads
    pub transport: Arc<dyn Transport>,
    /// Time source for convergence windows
    pub clock: Arc<dyn Clock>,
    /// Harness configuration
    pub config: HarnessConfig,
}

impl ScenarioContext {
    /// Create a context on the wall clock
    pub fn new(
        environment: Arc<dyn Environment>,
        transport: Arc<dyn Transport>,
        config: HarnessConfig,
    ) -> Self {
        Self {
            environment,
            transport,
            clock: Arc::new(TokioClock),
            config,
        }
    }

    /// Replace the clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}
