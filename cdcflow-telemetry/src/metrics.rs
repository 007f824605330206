use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Port of the Prometheus scrape endpoint.
const METRICS_PORT: u16 = 9000;

/// Installs the global metrics recorder and serves it on `[::]:9000/metrics`.
///
/// Must be called from within a tokio runtime since the exporter spawns its HTTP listener
/// on it. Every series gets a `project` label when `project_ref` is set.
pub fn init_metrics(project_ref: Option<&str>) -> Result<(), BuildError> {
    let mut builder = PrometheusBuilder::new().with_http_listener(SocketAddr::new(
        IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        METRICS_PORT,
    ));

    if let Some(project_ref) = project_ref {
        builder = builder.add_global_label("project", project_ref);
    }

    builder.install()?;

    Ok(())
}
