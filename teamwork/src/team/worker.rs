use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

use crate::error::TeamError;
use crate::job::Job;

use super::{RejectedJob, Team, run_job};

/// A dedicated thread draining a bounded job queue.
///
/// Jobs that ask to continue on the same team are kept in a local
/// continuation list, so a busy queue can never reject a team's own work.
/// New arrivals are interleaved with continuations.
pub(super) struct QueueWorker {
    sender: mpsc::Sender<Box<dyn Job>>,
    handle: JoinHandle<()>,
}

impl QueueWorker {
    pub(super) fn spawn(
        team: Arc<dyn Team>,
        thread_name: String,
        capacity: usize,
    ) -> Result<Self, TeamError> {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let team_name = team.name().to_string();
        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || worker_loop(team, receiver))
            .map_err(|source| TeamError::Spawn {
                team: team_name,
                source,
            })?;
        Ok(Self { sender, handle })
    }

    pub(super) fn try_assign(&self, job: Box<dyn Job>, team: &str) -> Result<(), RejectedJob> {
        match self.sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => Err(RejectedJob::overloaded(job, team)),
            Err(TrySendError::Closed(job)) => Err(RejectedJob::not_working(job, team)),
        }
    }

    pub(super) fn thread_id(&self) -> ThreadId {
        self.handle.thread().id()
    }

    /// Close the queue and wait for the worker to drain it.
    ///
    /// Joining is skipped when called from the worker itself.
    pub(super) fn stop(self) {
        let QueueWorker { sender, handle } = self;
        drop(sender);
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            tracing::error!("team worker thread panicked outside of job execution");
        }
    }
}

fn worker_loop(team: Arc<dyn Team>, mut receiver: mpsc::Receiver<Box<dyn Job>>) {
    tracing::debug!(team = team.name(), "team worker started");
    let mut continuations: VecDeque<Box<dyn Job>> = VecDeque::new();

    loop {
        let job = if continuations.is_empty() {
            match receiver.blocking_recv() {
                Some(job) => job,
                None => break,
            }
        } else {
            match receiver.try_recv() {
                Ok(job) => job,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                    match continuations.pop_front() {
                        Some(job) => job,
                        None => continue,
                    }
                }
            }
        };

        if let Some(job) = run_job(&team, job) {
            continuations.push_back(job);
        }
    }

    tracing::debug!(team = team.name(), "team worker stopped");
}
