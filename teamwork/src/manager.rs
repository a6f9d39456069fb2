//! The office manager: reactivates parked jobs and enforces timeouts.
//!
//! Managed object containers never touch teams directly. When an object
//! becomes ready, fails, or times out, the container hands the affected jobs
//! to the [`Activator`]; the manager's activation loop resubmits or
//! escalates them off the calling thread. A second loop periodically scans
//! monitored containers for sourcing or asynchronous operations that ran
//! past their timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

use crate::config::OfficeManagerConfig;
use crate::error::Escalation;
use crate::events::{EngineEventPayload, InProcEventBus};
use crate::job::{Job, JobContext, JobId};
use crate::managed_object::{ManagedObjectContainer, ParkedJob};
use crate::process::ProcessId;
use crate::team::Team;
use crate::telemetry;

/// Token for signaling graceful shutdown to the manager loops.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Work handed from containers to the manager.
pub(crate) enum Activation {
    /// Every job parked on `managed_object` when it became ready.
    Resubmit {
        process: ProcessId,
        managed_object: String,
        jobs: Vec<ParkedJob>,
    },
    /// A parked job whose managed object failed.
    Escalate {
        process: ProcessId,
        job: ParkedJob,
        escalation: Escalation,
    },
}

#[derive(Clone, Copy, Debug)]
struct ResubmitPolicy {
    backoff: Duration,
    attempts: u32,
}

impl From<&OfficeManagerConfig> for ResubmitPolicy {
    fn from(config: &OfficeManagerConfig) -> Self {
        Self {
            backoff: Duration::from_millis(config.resubmit_backoff_ms),
            attempts: config.resubmit_attempts.max(1),
        }
    }
}

/// Sending side of the manager, held by containers.
///
/// Once the manager has shut down, activations are delivered on the calling
/// thread instead.
#[derive(Clone)]
pub struct Activator {
    sender: mpsc::UnboundedSender<Activation>,
    events: Arc<InProcEventBus>,
    policy: ResubmitPolicy,
}

impl std::fmt::Debug for Activator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Activator")
            .field("closed", &self.sender.is_closed())
            .field("policy", &self.policy)
            .finish()
    }
}

impl Activator {
    pub(crate) fn resubmit(&self, process: ProcessId, managed_object: &str, jobs: Vec<ParkedJob>) {
        if jobs.is_empty() {
            return;
        }
        self.send(Activation::Resubmit {
            process,
            managed_object: managed_object.to_string(),
            jobs,
        });
    }

    pub(crate) fn escalate(&self, process: ProcessId, job: ParkedJob, escalation: Escalation) {
        self.send(Activation::Escalate {
            process,
            job,
            escalation,
        });
    }

    fn send(&self, activation: Activation) {
        if let Err(mpsc::error::SendError(activation)) = self.sender.send(activation) {
            tracing::debug!("office manager stopped, delivering activation inline");
            deliver(activation, &self.events, self.policy);
        }
    }
}

/// Background loops of an office.
pub struct OfficeManager {
    config: OfficeManagerConfig,
    activator: Activator,
    monitored: Arc<Mutex<Vec<Weak<ManagedObjectContainer>>>>,
    shutdown_token: ShutdownToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for OfficeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfficeManager")
            .field("config", &self.config)
            .field("monitored", &self.monitored.lock().len())
            .field("cancelled", &self.shutdown_token.is_cancelled())
            .field("loops", &self.handles.lock().len())
            .finish()
    }
}

impl OfficeManager {
    /// Spawn the activation and monitor loops on `runtime`.
    pub fn start(
        config: OfficeManagerConfig,
        runtime: &Handle,
        events: Arc<InProcEventBus>,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let policy = ResubmitPolicy::from(&config);
        let activator = Activator {
            sender,
            events: Arc::clone(&events),
            policy,
        };
        let shutdown_token = ShutdownToken::new();
        let monitored = Arc::new(Mutex::new(Vec::new()));

        let activation = runtime.spawn(activation_loop(
            receiver,
            shutdown_token.clone(),
            events,
            policy,
        ));
        let monitor = runtime.spawn(monitor_loop(
            Arc::clone(&monitored),
            Duration::from_millis(config.monitor_interval_ms.max(1)),
            shutdown_token.clone(),
        ));

        Self {
            config,
            activator,
            monitored,
            shutdown_token,
            handles: Mutex::new(vec![activation, monitor]),
        }
    }

    pub fn activator(&self) -> Activator {
        self.activator.clone()
    }

    pub fn config(&self) -> &OfficeManagerConfig {
        &self.config
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown_token.clone()
    }

    /// Watch `container` for timeouts until it is dropped.
    pub fn monitor(&self, container: &Arc<ManagedObjectContainer>) {
        if container.metadata().timeout().is_some() {
            self.monitored.lock().push(Arc::downgrade(container));
        }
    }

    /// Run one timeout scan now. Returns the number of containers that timed out.
    pub fn check_timeouts(&self) -> usize {
        scan_timeouts(&self.monitored, Instant::now())
    }

    /// Stop both loops, delivering any activations already queued.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        tracing::info!("Initiating office manager shutdown");
        self.shutdown_token.cancel();

        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            match tokio::time::timeout(Duration::from_secs(30), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Office manager task failed: {:?}", e),
                Err(_) => tracing::warn!("Office manager task timed out during shutdown"),
            }
        }

        tracing::info!("Office manager shutdown complete");
        Ok(())
    }
}

async fn activation_loop(
    mut receiver: mpsc::UnboundedReceiver<Activation>,
    shutdown: ShutdownToken,
    events: Arc<InProcEventBus>,
    policy: ResubmitPolicy,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("Activation loop shutting down");
                break;
            }
            activation = receiver.recv() => match activation {
                Some(activation) => dispatch(activation, &events, policy),
                None => break,
            }
        }
    }

    receiver.close();
    while let Ok(activation) = receiver.try_recv() {
        dispatch(activation, &events, policy);
    }
}

async fn monitor_loop(
    monitored: Arc<Mutex<Vec<Weak<ManagedObjectContainer>>>>,
    interval: Duration,
    shutdown: ShutdownToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("Timeout monitor shutting down");
                break;
            }
            _ = tokio::time::sleep(interval) => {
                let timed_out = scan_timeouts(&monitored, Instant::now());
                if timed_out > 0 {
                    tracing::warn!(timed_out, "managed objects timed out");
                }
            }
        }
    }
}

fn scan_timeouts(monitored: &Mutex<Vec<Weak<ManagedObjectContainer>>>, now: Instant) -> usize {
    let live: Vec<Arc<ManagedObjectContainer>> = {
        let mut guard = monitored.lock();
        guard.retain(|weak| weak.strong_count() > 0);
        guard.iter().filter_map(Weak::upgrade).collect()
    };
    live.iter()
        .filter(|container| container.check_timeout(now))
        .count()
}

/// Deliver off the async runtime; team assignment may run a job inline.
fn dispatch(activation: Activation, events: &Arc<InProcEventBus>, policy: ResubmitPolicy) {
    let events = Arc::clone(events);
    tokio::task::spawn_blocking(move || deliver(activation, &events, policy));
}

fn deliver(activation: Activation, events: &InProcEventBus, policy: ResubmitPolicy) {
    match activation {
        Activation::Resubmit {
            process,
            managed_object,
            jobs,
        } => {
            let span = telemetry::activation_span(&managed_object, jobs.len());
            let _enter = span.enter();
            telemetry::record_jobs_reactivated(&managed_object, jobs.len());
            for ParkedJob { job, team } in jobs {
                events.emit(
                    process,
                    EngineEventPayload::JobReactivated {
                        job_id: job.id(),
                        managed_object: managed_object.clone(),
                        team: team.name().to_string(),
                    },
                );
                assign_with_retry(job, team.as_ref(), policy);
            }
        }
        Activation::Escalate {
            process,
            job: ParkedJob { job, team },
            escalation,
        } => {
            tracing::debug!(
                process = %process,
                job_id = %job.id(),
                kind = escalation.kind(),
                "delivering escalation"
            );
            let escalated = EscalationJob {
                job,
                pending: Some(escalation),
            };
            assign_with_retry(Box::new(escalated), team.as_ref(), policy);
        }
    }
}

/// Assign `job`, retrying while the team reports overload.
fn assign_with_retry(mut job: Box<dyn Job>, team: &dyn Team, policy: ResubmitPolicy) {
    let mut attempt = 1;
    loop {
        match team.assign_job(job) {
            Ok(()) => return,
            Err(rejected) => {
                telemetry::record_assignment_rejected(team.name(), rejected.reason.to_string());
                if rejected.reason.is_overload() && attempt < policy.attempts {
                    attempt += 1;
                    job = rejected.job;
                    std::thread::sleep(policy.backoff);
                    continue;
                }
                rejected.escalate();
                return;
            }
        }
    }
}

/// Delivers a pending escalation to a job on the job's own team.
struct EscalationJob {
    job: Box<dyn Job>,
    pending: Option<Escalation>,
}

impl Job for EscalationJob {
    fn id(&self) -> JobId {
        self.job.id()
    }

    fn execute(&mut self, _context: &mut JobContext) -> bool {
        if let Some(escalation) = self.pending.take() {
            self.job.escalate(escalation);
        }
        true
    }

    /// A rejected escalation still delivers the original failure.
    fn escalate(&mut self, escalation: Escalation) {
        let escalation = self.pending.take().unwrap_or(escalation);
        self.job.escalate(escalation);
    }

    fn affinity(&self) -> Option<u64> {
        self.job.affinity()
    }
}
