use std::{sync::Arc, time::Instant};

use wagate_sessions::{SessionManager, SqliteTenantDirectory};

use crate::auth::ResolvedAuth;

/// Shared gateway runtime state, wrapped in Arc for use across handlers.
pub struct GatewayState {
    pub manager: SessionManager,
    /// Instance records; the same directory the manager resolves tenants from.
    pub instances: Arc<SqliteTenantDirectory>,
    pub auth: ResolvedAuth,
    pub version: String,
    pub started_at: Instant,
    #[cfg(feature = "prometheus")]
    pub metrics: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

impl GatewayState {
    pub fn new(
        manager: SessionManager,
        instances: Arc<SqliteTenantDirectory>,
        auth: ResolvedAuth,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            instances,
            auth,
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: Instant::now(),
            #[cfg(feature = "prometheus")]
            metrics: None,
        })
    }

    /// Attach the Prometheus handle rendered on `/metrics`.
    #[cfg(feature = "prometheus")]
    pub fn with_metrics(
        manager: SessionManager,
        instances: Arc<SqliteTenantDirectory>,
        auth: ResolvedAuth,
        handle: metrics_exporter_prometheus::PrometheusHandle,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            instances,
            auth,
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: Instant::now(),
            metrics: Some(handle),
        })
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
