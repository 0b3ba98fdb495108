//! Optional prometheus exporter, enabled by the `prometheus` feature.

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to install prometheus recorder: {0}")]
    Install(#[from] BuildError),
}

/// Install the prometheus recorder and start its HTTP exporter, binding
/// `addr`. Call once at process start, before any `counter!`/`histogram!`
/// call — the first successful [`metrics::set_global_recorder`] wins.
pub fn install(addr: SocketAddr) -> Result<(), MetricsError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    crate::describe();
    Ok(())
}
