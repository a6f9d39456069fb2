//! Tracing and telemetry instrumentation for teamwork.
//!
//! Helper functions for creating tracing spans and recording metrics at the
//! points where jobs run, park, reactivate and escalate. All functions work
//! both with and without the `metrics` feature flag.

use tracing::{Span, info_span};

use crate::managed_object::LifecycleState;

/// Create a tracing span for one job step on a team.
#[must_use]
pub fn job_execute_span(job_id: impl AsRef<str>, team: impl AsRef<str>) -> Span {
    info_span!(
        "teamwork.execute",
        job_id = %job_id.as_ref(),
        team = %team.as_ref(),
    )
}

/// Create the span handed to a managed object as its logger.
#[must_use]
pub fn managed_object_span(managed_object: impl AsRef<str>, process: impl AsRef<str>) -> Span {
    info_span!(
        "teamwork.managed_object",
        managed_object = %managed_object.as_ref(),
        process = %process.as_ref(),
    )
}

/// Create a tracing span for the office manager handling one activation.
#[must_use]
pub fn activation_span(managed_object: impl AsRef<str>, jobs: usize) -> Span {
    info_span!(
        "teamwork.activation",
        managed_object = %managed_object.as_ref(),
        jobs = jobs,
    )
}

/// Record the start of a job step for duration tracking.
///
/// Returns an opaque handle that should be passed to `record_job_end`.
pub fn record_job_start(job_id: impl AsRef<str>) -> JobTimingHandle {
    JobTimingHandle {
        job_id: job_id.as_ref().to_string(),
        start: std::time::Instant::now(),
    }
}

/// Record the end of a job step.
///
/// `status` is one of `complete`, `incomplete` or `panicked`.
pub fn record_job_end(handle: JobTimingHandle, team: impl AsRef<str>, status: impl AsRef<str>) {
    let duration_secs = handle.start.elapsed().as_secs_f64();
    tracing::trace!(
        job_id = %handle.job_id,
        team = %team.as_ref(),
        status = %status.as_ref(),
        duration_secs = duration_secs,
        "job step finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_job_step(team.as_ref(), status.as_ref(), duration_secs);
}

/// Record a thread waiting to enter a busy process.
pub fn record_process_contention(process: impl AsRef<str>) {
    tracing::trace!(process = %process.as_ref(), "waiting for process");

    #[cfg(feature = "metrics")]
    crate::metrics::record_process_contention();
}

/// Record a job suspending on a managed object.
pub fn record_job_parked(
    job_id: impl AsRef<str>,
    managed_object: impl AsRef<str>,
    state: LifecycleState,
) {
    tracing::debug!(
        job_id = %job_id.as_ref(),
        managed_object = %managed_object.as_ref(),
        state = %state,
        "job parked"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_parked(managed_object.as_ref());
}

/// Record parked jobs being resubmitted to their teams.
pub fn record_jobs_reactivated(managed_object: impl AsRef<str>, jobs: usize) {
    tracing::debug!(
        managed_object = %managed_object.as_ref(),
        jobs = jobs,
        "jobs reactivated"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_jobs_reactivated(managed_object.as_ref(), jobs as u64);
}

/// Record a failure being routed to a job's escalation handling.
pub fn record_job_escalated(job_id: impl AsRef<str>, kind: impl AsRef<str>) {
    tracing::warn!(
        job_id = %job_id.as_ref(),
        kind = %kind.as_ref(),
        "job escalated"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_escalated(kind.as_ref());
}

/// Record a managed object lifecycle transition.
pub fn record_state_change(managed_object: impl AsRef<str>, from: LifecycleState, to: LifecycleState) {
    tracing::debug!(
        managed_object = %managed_object.as_ref(),
        from = %from,
        to = %to,
        "managed object state changed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_state_change(managed_object.as_ref(), to.as_str());
}

/// Record a team refusing a job.
pub fn record_assignment_rejected(team: impl AsRef<str>, reason: impl AsRef<str>) {
    tracing::debug!(
        team = %team.as_ref(),
        reason = %reason.as_ref(),
        "job assignment rejected"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_assignment_rejected(team.as_ref(), reason.as_ref());
}

/// Handle for tracking job step duration.
///
/// Returned by `record_job_start` and consumed by `record_job_end`.
#[derive(Debug)]
pub struct JobTimingHandle {
    job_id: String,
    start: std::time::Instant,
}

impl JobTimingHandle {
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_execute_span() {
        let span = job_execute_span("job-123", "io");
        if let Some(metadata) = span.metadata() {
            assert_eq!(metadata.name(), "teamwork.execute");
        }
    }

    #[test]
    fn test_managed_object_span() {
        let span = managed_object_span("db", "process-1");
        if let Some(metadata) = span.metadata() {
            assert_eq!(metadata.name(), "teamwork.managed_object");
        }
    }

    #[test]
    fn test_record_job_timing() {
        let handle = record_job_start("job-123");
        assert_eq!(handle.job_id(), "job-123");
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(handle.elapsed() >= std::time::Duration::from_millis(5));
        record_job_end(handle, "io", "complete");
    }

    #[test]
    fn test_recorders_do_not_panic() {
        record_process_contention("process-1");
        record_job_parked("job-1", "db", LifecycleState::Sourcing);
        record_jobs_reactivated("db", 3);
        record_job_escalated("job-1", "timed_out");
        record_state_change("db", LifecycleState::Ready, LifecycleState::AsyncPending);
        record_assignment_rejected("io", "overloaded");
    }
}
