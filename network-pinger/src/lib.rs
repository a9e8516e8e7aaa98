pub mod error;
pub mod k8s;
pub mod probes;
pub mod runner;
pub mod server;
pub mod settings;
pub mod telemetry;
pub mod version;

#[cfg(test)]
pub(crate) mod testing;

use std::{future::Future, sync::Arc};

use log::info;

use crate::{
    error::BootstrapError,
    probes::{Collaborators, ProbeScheduler, catalog::discover_self},
    runner::RunLoop,
    settings::Settings,
};

/// A pinger that knows its own address families and is ready to probe.
pub struct PingerEngine {
    settings: Arc<Settings>,
    run_loop: RunLoop,
}

impl PingerEngine {
    /// Resolve this pod's addresses, then freeze the settings. Nothing is
    /// probed if this fails.
    pub async fn bootstrap(
        settings: Settings,
        collaborators: Collaborators,
    ) -> Result<Self, BootstrapError> {
        let local = discover_self(
            collaborators.control_plane.as_ref(),
            &settings.ds_namespace,
            &settings.identity.pod_name,
        )
        .await?;

        let settings = Arc::new(settings.with_pod_protocols(local.protocols));
        info!("pinger config is {:?}", settings);

        let scheduler = ProbeScheduler::new(settings.clone(), collaborators);
        let run_loop = RunLoop::new(scheduler, &settings);
        Ok(Self { settings, run_loop })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Run until done (job) or until `shutdown` resolves (server). Returns
    /// the process exit code.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> i32 {
        self.run_loop.run(shutdown).await
    }
}
