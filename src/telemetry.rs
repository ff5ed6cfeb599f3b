//! Logging setup, metric names and the Prometheus recorder.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::config::LogFormat;

pub const SUBMISSIONS_COMPLETED: &str = "changeflow_submissions_completed_total";
pub const SUBMISSIONS_REQUEUED: &str = "changeflow_submissions_requeued_total";
pub const DEAD_LETTERS: &str = "changeflow_dead_letters_total";
pub const WORK_ITEMS_PUBLISHED: &str = "changeflow_work_items_published_total";
pub const CANDIDATES_PUBLISHED: &str = "changeflow_candidates_published_total";
pub const SOLVER_FAILURES: &str = "changeflow_solver_failures_total";
pub const EVALUATIONS_APPLIED: &str = "changeflow_evaluations_applied_total";
pub const EVALUATIONS_FAILED: &str = "changeflow_evaluations_failed_total";
pub const RESULTS_DELIVERED: &str = "changeflow_results_delivered_total";

const DEFAULT_DIRECTIVE: &str = "changeflow=info";

/// Install the global subscriber. `RUST_LOG` wins over the default directive.
pub fn init_logging(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    let installed = match format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if let Err(e) = installed {
        eprintln!("logging already initialised: {e}");
    }
}

/// Install the global metrics recorder. The handle renders the scrape body;
/// `None` means counters stay unrecorded.
pub fn init_metrics() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "metrics recorder not installed");
            None
        }
    }
}
