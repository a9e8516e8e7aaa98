use std::{future::Future, time::Duration};

use log::{error, info, warn};
use tokio::{
    signal::{
        self,
        unix::{SignalKind, signal as unix_signal},
    },
    time,
};

use crate::{
    probes::ProbeScheduler,
    settings::{Mode, Settings},
};

/// Drives cycles: one in job mode, one per interval in server mode until
/// `shutdown` resolves.
pub struct RunLoop {
    scheduler: ProbeScheduler,
    mode: Mode,
    interval: Duration,
    exit_code: i32,
}

impl RunLoop {
    pub fn new(scheduler: ProbeScheduler, settings: &Settings) -> Self {
        Self {
            scheduler,
            mode: settings.mode,
            interval: settings.interval,
            exit_code: settings.exit_code,
        }
    }

    /// Returns the process exit code.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> i32 {
        tokio::pin!(shutdown);
        let mut failure_seen = false;
        let mut cycles = 0u64;

        loop {
            let cycle = self.scheduler.run_cycle().await;
            cycles += 1;
            failure_seen |= cycle.failed();

            if self.mode == Mode::Job {
                break;
            }

            tokio::select! {
                _ = time::sleep(self.interval) => {}
                _ = &mut shutdown => {
                    info!("Shutdown signal received after {} cycles", cycles);
                    break;
                }
            }
        }

        let code = terminal_exit_code(failure_seen, self.exit_code);
        if code != 0 {
            warn!("check failed, exiting with code {}", code);
        }
        code
    }
}

/// Resolves on SIGINT or SIGTERM. SIGTERM is hooked before returning, so
/// from then on it no longer kills the process.
pub fn shutdown_signal() -> std::io::Result<impl Future<Output = ()>> {
    let mut terminate = unix_signal(SignalKind::terminate())?;
    Ok(async move {
        let interrupt = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to listen for SIGINT: {}", e);
                std::future::pending::<()>().await;
            }
        };
        tokio::select! {
            _ = interrupt => info!("Received SIGINT"),
            _ = terminate.recv() => info!("Received SIGTERM"),
        }
    })
}

/// Failures only change the exit code when a non-zero one is configured.
pub fn terminal_exit_code(failure_seen: bool, exit_code: i32) -> i32 {
    if failure_seen { exit_code } else { 0 }
}
