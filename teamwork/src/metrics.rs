//! Prometheus metrics instrumentation for teamwork.
//!
//! All metrics are conditionally compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `teamwork_job_steps_total` - Job steps executed, by team and status
//! - `teamwork_jobs_parked_total` - Jobs suspended on a managed object
//! - `teamwork_jobs_reactivated_total` - Parked jobs resubmitted to their team
//! - `teamwork_jobs_escalated_total` - Failures routed to escalation handling
//! - `teamwork_state_transitions_total` - Managed object lifecycle transitions
//! - `teamwork_assignments_rejected_total` - Jobs refused by a team
//! - `teamwork_process_contention_total` - Threads that waited to enter a process
//!
//! ## Histograms
//! - `teamwork_job_step_duration_seconds` - Duration of one job step
#![cfg(feature = "metrics")]

use prometheus::{CounterVec, HistogramVec, IntCounter, Opts, Registry, exponential_buckets};
use std::sync::LazyLock;

/// Global Prometheus registry for teamwork metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static JOB_STEPS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("teamwork_job_steps_total", "Total number of job steps executed");
    CounterVec::new(opts, &["team", "status"])
        .expect("teamwork_job_steps_total metric creation failed")
});

pub static JOBS_PARKED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "teamwork_jobs_parked_total",
        "Total number of jobs suspended on a managed object",
    );
    CounterVec::new(opts, &["managed_object"])
        .expect("teamwork_jobs_parked_total metric creation failed")
});

pub static JOBS_REACTIVATED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "teamwork_jobs_reactivated_total",
        "Total number of parked jobs resubmitted to their team",
    );
    CounterVec::new(opts, &["managed_object"])
        .expect("teamwork_jobs_reactivated_total metric creation failed")
});

/// Labels:
/// - `kind`: panicked, task_failed, timed_out, managed_object, defect, overloaded
pub static JOBS_ESCALATED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "teamwork_jobs_escalated_total",
        "Total number of job failures routed to escalation",
    );
    CounterVec::new(opts, &["kind"]).expect("teamwork_jobs_escalated_total metric creation failed")
});

pub static STATE_TRANSITIONS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "teamwork_state_transitions_total",
        "Total number of managed object lifecycle transitions",
    );
    CounterVec::new(opts, &["managed_object", "to"])
        .expect("teamwork_state_transitions_total metric creation failed")
});

pub static ASSIGNMENTS_REJECTED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "teamwork_assignments_rejected_total",
        "Total number of jobs refused by a team",
    );
    CounterVec::new(opts, &["team", "reason"])
        .expect("teamwork_assignments_rejected_total metric creation failed")
});

pub static PROCESS_CONTENTION_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "teamwork_process_contention_total",
        "Total number of threads that waited to enter a process",
    )
    .expect("teamwork_process_contention_total metric creation failed")
});

pub static JOB_STEP_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.0001, 2.0, 16).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "teamwork_job_step_duration_seconds",
        "Duration of one job step in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["team", "status"])
        .expect("teamwork_job_step_duration_seconds metric creation failed")
});

/// Register all metrics with the global registry.
///
/// Idempotent; duplicate registrations are ignored.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOB_STEPS_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(JOBS_PARKED_TOTAL.clone()),
        Box::new(JOBS_REACTIVATED_TOTAL.clone()),
        Box::new(JOBS_ESCALATED_TOTAL.clone()),
        Box::new(STATE_TRANSITIONS_TOTAL.clone()),
        Box::new(ASSIGNMENTS_REJECTED_TOTAL.clone()),
        Box::new(PROCESS_CONTENTION_TOTAL.clone()),
        Box::new(JOB_STEP_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn observe_job_step(team: &str, status: &str, duration_secs: f64) {
    JOB_STEPS_TOTAL.with_label_values(&[team, status]).inc();
    JOB_STEP_DURATION_SECONDS
        .with_label_values(&[team, status])
        .observe(duration_secs);
}

pub fn record_job_parked(managed_object: &str) {
    JOBS_PARKED_TOTAL.with_label_values(&[managed_object]).inc();
}

pub fn record_jobs_reactivated(managed_object: &str, jobs: u64) {
    JOBS_REACTIVATED_TOTAL
        .with_label_values(&[managed_object])
        .inc_by(jobs as f64);
}

pub fn record_job_escalated(kind: &str) {
    JOBS_ESCALATED_TOTAL.with_label_values(&[kind]).inc();
}

pub fn record_state_change(managed_object: &str, to: &str) {
    STATE_TRANSITIONS_TOTAL
        .with_label_values(&[managed_object, to])
        .inc();
}

pub fn record_assignment_rejected(team: &str, reason: &str) {
    ASSIGNMENTS_REJECTED_TOTAL
        .with_label_values(&[team, reason])
        .inc();
}

pub fn record_process_contention() {
    PROCESS_CONTENTION_TOTAL.inc();
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        init_metrics().expect("metrics initialization should succeed");
        init_metrics().expect("second initialization should be a no-op");
    }

    #[test]
    fn test_recorded_metrics_are_gathered() {
        init_metrics().unwrap();
        observe_job_step("metrics-test", "complete", 0.002);
        record_job_parked("metrics-db");
        record_jobs_reactivated("metrics-db", 2);
        record_job_escalated("timed_out");
        record_state_change("metrics-db", "ready");
        record_assignment_rejected("metrics-test", "overloaded");
        record_process_contention();

        let output = gather_metrics().unwrap();
        assert!(output.contains("teamwork_job_steps_total"));
        assert!(output.contains("teamwork_jobs_reactivated_total"));
        assert!(output.contains("teamwork_process_contention_total"));
    }
}
