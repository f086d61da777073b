//! Prometheus metrics for a fan-out run
//!
//! The job is a batch process, so nothing is served over HTTP: the recorder
//! is rendered to a textfile once the job ends (node-exporter textfile
//! collector format). Besides the dispatcher's own counters:
//!
//! - `fanout_prompts_total` (counter): label `outcome` (`ok` / error kind)
//! - `fanout_prompt_duration_seconds` (histogram): label `outcome`

use std::path::Path;

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_BUCKETS: &[f64] = &[
    0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("fanout_prompt_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record one finished prompt.
pub fn record_prompt(outcome: &'static str, duration_secs: f64) {
    metrics::counter!("fanout_prompts_total", "outcome" => outcome).increment(1);
    metrics::histogram!("fanout_prompt_duration_seconds", "outcome" => outcome)
        .record(duration_secs);
}

/// Render every recorded metric into `path`.
pub async fn write_snapshot(handle: &PrometheusHandle, path: &Path) -> std::io::Result<()> {
    tokio::fs::write(path, handle.render()).await
}
