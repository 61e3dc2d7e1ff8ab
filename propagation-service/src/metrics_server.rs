use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

use crate::pipeline::PropagationError;

static PROM_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the global Prometheus recorder. Later calls return the first handle.
pub fn install() -> Result<PrometheusHandle, PropagationError> {
    PROM_HANDLE
        .get_or_try_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .map_err(|e| PropagationError::Configuration(format!("failed to install Prometheus recorder: {e}")))
        })
        .cloned()
}

/// Render the current metrics, or an empty page if no recorder is installed.
pub fn render() -> String {
    PROM_HANDLE.get().map(PrometheusHandle::render).unwrap_or_default()
}
