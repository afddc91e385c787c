// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Prometheus metrics for the deployment pipeline.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use regex::Regex;

/// Install the Prometheus recorder and return its render handle.
///
/// Returns `None` when a recorder is already installed (tests, embedding).
pub fn install() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!("Failed to install Prometheus recorder: {}", e);
            None
        }
    }
}

/// Reduce a document version to `3.x.y`, or empty when it is not one.
pub fn sanitize_version(version: &str) -> String {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^3\.\d+\.\d+$").ok());
    match re {
        Some(re) if re.is_match(version) => version.to_string(),
        _ => String::new(),
    }
}

/// Record one processed OpenAPI document.
pub fn openapi_processed(outcome: &str, version: &str, elapsed: Duration) {
    let version = sanitize_version(version);
    counter!(
        "openapi_processed_count",
        "outcome" => outcome.to_string(),
        "version" => version.clone()
    )
    .increment(1);
    histogram!(
        "openapi_processed_duration_seconds",
        "outcome" => outcome.to_string(),
        "version" => version
    )
    .record(elapsed.as_secs_f64());
}

/// Record a skipped OpenAPI operation.
pub fn openapi_operation_skipped(reason: &str) {
    counter!("openapi_operations_skipped", "reason" => reason.to_string()).increment(1);
}

/// Record a 3.0 to 3.1 upgrade attempt.
pub fn openapi_upgraded(outcome: &str, from_version: &str, elapsed: Duration) {
    let version = sanitize_version(from_version);
    counter!(
        "openapi_upgrade_count",
        "outcome" => outcome.to_string(),
        "version" => version.clone()
    )
    .increment(1);
    histogram!(
        "openapi_upgrade_duration_seconds",
        "outcome" => outcome.to_string(),
        "version" => version
    )
    .record(elapsed.as_secs_f64());
}

/// Record a processed functions bundle.
pub fn functions_processed(outcome: &str, elapsed: Duration, tools: usize) {
    histogram!("functions_processed_duration_seconds", "outcome" => outcome.to_string())
        .record(elapsed.as_secs_f64());
    histogram!("functions_tools_count").record(tools as f64);
}

/// Record a manifest tool or resource that failed validation.
pub fn functions_tool_skipped(reason: &str) {
    counter!("functions_tools_skipped", "reason" => reason.to_string()).increment(1);
}

/// Record a deployment reaching a terminal status.
pub fn deployment_finished(status: &str) {
    counter!("gram_deployments_total", "status" => status.to_string()).increment(1);
}

/// Record a runner deployment outcome.
pub fn runner_deployed(outcome: &str) {
    counter!("gram_runner_deployments_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record a reaper pass.
pub fn runners_reaped(reaped: usize, errors: usize) {
    counter!("gram_runners_reaped_total").increment(reaped as u64);
    counter!("gram_runner_reap_errors_total").increment(errors as u64);
}
