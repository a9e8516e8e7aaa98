//! `GET /metrics` in the Prometheus text format.

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use log::{error, info};
use tokio::{net::TcpListener, task::JoinHandle};

use crate::telemetry::PingerMetrics;

/// Bind the metrics port on all interfaces.
pub async fn bind(port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to listen on {}", addr))
}

pub fn router(metrics: Arc<PingerMetrics>) -> Router<()> {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

pub fn spawn(listener: TcpListener, metrics: Arc<PingerMetrics>) -> JoinHandle<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("metrics server listening on {}", addr);
    }
    let router = router(metrics);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!("metrics server stopped: {}", e);
        }
    })
}

async fn metrics_handler(State(metrics): State<Arc<PingerMetrics>>) -> Response {
    match metrics.render() {
        Ok(body) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            error!("failed to render metrics: {:#}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)).into_response()
        }
    }
}
