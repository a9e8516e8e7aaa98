use std::{process, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use network_pinger::{
    PingerEngine,
    error::FATAL_STARTUP_EXIT_CODE,
    k8s::{self, KubeControlPlane},
    probes::{Collaborators, IcmpPinger, SystemResolver},
    runner, server,
    settings::{Args, Settings},
    telemetry::{PingerMetrics, get_otlp_endpoint},
    version,
};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if args.verbose { "debug" } else { "info" }),
    )
    .init();

    info!("{}", version::banner());

    let settings = Settings::load(args).context("Failed to load settings")?;
    let client = k8s::connect(settings.kubeconfig.as_deref()).await?;
    let metrics = Arc::new(PingerMetrics::new(&settings.identity, get_otlp_endpoint())?);

    let collaborators = Collaborators {
        control_plane: Arc::new(KubeControlPlane::new(client)),
        pinger: Arc::new(IcmpPinger),
        resolver: Arc::new(SystemResolver),
        metrics: metrics.clone(),
    };

    let engine = match PingerEngine::bootstrap(settings, collaborators).await {
        Ok(engine) => engine,
        Err(e) => {
            error!("{}", e);
            process::exit(FATAL_STARTUP_EXIT_CODE);
        }
    };

    if engine.settings().serves_metrics() {
        let listener = server::bind(engine.settings().port).await?;
        server::spawn(listener, metrics.clone());
    }

    let shutdown = runner::shutdown_signal().context("Failed to install signal handlers")?;
    let code = engine.run(shutdown).await;

    metrics.shutdown();
    if code != 0 {
        process::exit(code);
    }
    Ok(())
}
