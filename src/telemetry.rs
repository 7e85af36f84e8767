//! Prometheus metrics setup and descriptions.
//!
//! Metrics are recorded throughout the codebase with the `metrics` crate's
//! macros. This module installs the Prometheus exporter and registers
//! human-readable descriptions for each metric.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusHandle;

/// Install the Prometheus recorder and register metric descriptions.
///
/// Returns `None` if a recorder is already installed (e.g. in tests where
/// several builds share a process); recording still works through whichever
/// recorder won.
pub fn install() -> Option<PrometheusHandle> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .ok()?;
    describe();
    Some(handle)
}

fn describe() {
    describe_counter!("gpuplane_deploys_total", "Successful model deployments");
    describe_counter!("gpuplane_deploy_failures_total", "Failed model deployments");
    describe_histogram!(
        "gpuplane_deploy_duration_seconds",
        "Wall-clock duration of deployment attempts (validation through readiness)"
    );
    describe_counter!("gpuplane_spindowns_total", "Containers stopped via spindown");
    describe_counter!(
        "gpuplane_optimize_restarts_total",
        "Models restarted with a right-sized GPU memory budget"
    );
    describe_gauge!(
        "gpuplane_models_running",
        "Deployed containers observed running at the last health tick"
    );
}
