//! Test doubles for the teamwork execution core.
//!
//! - [`CountingJob`]: a job that completes after a fixed number of steps.
//! - [`RecordingTeam`]: a team that records assignments and can hold or
//!   refuse them.
//! - [`ScriptedResource`], [`DeferredSource`] and [`LinkedResource`]: managed
//!   objects whose lifecycle the test drives by hand.

mod job;
mod mock;
mod resource;

pub use job::{CountingJob, JobProbe};
pub use mock::{RecordingTeam, TeamMode};
pub use resource::{DeferredSource, LinkedResource, ScriptedResource, immediate_source};

use std::time::Duration;

/// Poll `condition` until it holds or `timeout` elapses.
///
/// Returns whether the condition was met.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Install a test subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
