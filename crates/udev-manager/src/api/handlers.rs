use std::fmt::Write;
use std::sync::Arc;

use poem::handler;
use poem::http::StatusCode;
use poem::web::Data;
use poem::Response;
use tracing::warn;

use super::types::HealthProbe;

/// Probe every device plugin and report the ones that did not answer.
#[handler]
pub async fn healthz(probe: Data<&Arc<dyn HealthProbe>>) -> Response {
    let mut failures = String::new();
    for outcome in probe.probe_all().await {
        if !outcome.healthy {
            warn!(resource = %outcome.name, "device plugin probe failed");
            let _ = writeln!(failures, "probe failed for device plugin {:?}", outcome.name);
        }
    }

    if failures.is_empty() {
        Response::builder().status(StatusCode::OK).body("ok")
    } else {
        Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(failures)
    }
}
