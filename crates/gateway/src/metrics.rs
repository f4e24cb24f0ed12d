//! Prometheus recorder and `/metrics` endpoint.

use std::sync::Arc;

use {
    axum::{
        extract::State,
        http::{StatusCode, header::CONTENT_TYPE},
        response::{IntoResponse, Response},
    },
    metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle},
    tracing::info,
};

use crate::state::GatewayState;

/// Install the global recorder. Call once, before any session is created.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

pub async fn metrics_handler(State(state): State<Arc<GatewayState>>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
