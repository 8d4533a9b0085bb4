//! Prometheus metrics endpoint.
//!
//! Exposes the negotiated offload HAL version and the accounting map
//! occupancy in Prometheus exposition format via a lightweight HTTP
//! server.

use anyhow::{Context, Result};
use axum::{extract::State, response::IntoResponse, routing::get, Router};
use tracing::info;

use crate::bpf::BpfHandler;
use crate::config::MetricsConfig;
use crate::hal::HalVersion;

// ---------------------------------------------------------------------------
// Metrics State
// ---------------------------------------------------------------------------

/// Shared state for the metrics endpoint.
#[derive(Clone, Copy)]
pub struct MetricsState {
    /// Accounting handler to read map occupancy from.
    pub handler: Option<&'static BpfHandler>,
    /// HAL version negotiated at startup.
    pub hal_version: HalVersion,
}

// ---------------------------------------------------------------------------
// HTTP Server
// ---------------------------------------------------------------------------

/// Start the Prometheus metrics HTTP server.
pub async fn serve_metrics(config: &MetricsConfig, state: MetricsState) -> Result<()> {
    let app = Router::new()
        .route(&config.path, get(metrics_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("binding metrics server to {}", config.bind))?;

    info!(bind = %config.bind, path = %config.path, "metrics server started");

    axum::serve(listener, app)
        .await
        .context("metrics server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Metrics Handler
// ---------------------------------------------------------------------------

async fn metrics_handler(State(state): State<MetricsState>) -> impl IntoResponse {
    let mut output = String::with_capacity(1024);

    output.push_str("# HELP tether_offload_hal_version Negotiated offload HAL version (0=none, 1=HIDL 1.0, 2=HIDL 1.1, 3=AIDL)\n");
    output.push_str("# TYPE tether_offload_hal_version gauge\n");
    output.push_str(&format!(
        "tether_offload_hal_version {}\n",
        state.hal_version as i32
    ));

    if let Some(handler) = state.handler {
        output.push_str("# HELP tether_offload_cookie_tag_entries Live socket tag entries\n");
        output.push_str("# TYPE tether_offload_cookie_tag_entries gauge\n");
        match handler.cookie_tag_entries() {
            Ok(count) => {
                output.push_str(&format!("tether_offload_cookie_tag_entries {}\n", count));
            }
            Err(e) => {
                output.push_str(&format!("# ERROR reading cookie tag map: {}\n", e));
            }
        }

        output.push_str("# HELP tether_offload_stats_entries Entries per stats map\n");
        output.push_str("# TYPE tether_offload_stats_entries gauge\n");
        match handler.stats_entries() {
            Ok((map_a, map_b)) => {
                output.push_str(&format!(
                    "tether_offload_stats_entries{{map=\"A\"}} {}\n",
                    map_a
                ));
                output.push_str(&format!(
                    "tether_offload_stats_entries{{map=\"B\"}} {}\n",
                    map_b
                ));
            }
            Err(e) => {
                output.push_str(&format!("# ERROR reading stats maps: {}\n", e));
            }
        }
    }

    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        output,
    )
}
