//! Integration tests for the execution core.
//!
//! Covers parking and reactivation of jobs on managed objects, asynchronous
//! start/complete from foreign threads, coordinating dependency loading,
//! timeouts, overload handling and process recycling.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use teamwork::{
    CoordinatingManagedObject, Defect, EngineEventPayload, Escalation, LifecycleState,
    ManagedObject, ManagedObjectConfig, ManagedObjectError, ManagedObjectUser, Object,
    ObjectRegistry, Office, OfficeConfig, OfficeManagerConfig, Process, ProcessId, SubmitError,
    TaskOutcome, TaskSpec, Team, TeamConfig,
};
use teamwork_testkit::{
    DeferredSource, LinkedResource, RecordingTeam, ScriptedResource, eventually, immediate_source,
    init_tracing,
};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

fn fast_manager() -> OfficeManagerConfig {
    OfficeManagerConfig::default()
        .with_monitor_interval(5)
        .with_resubmit_backoff(1)
}

fn office_config(objects: Vec<ManagedObjectConfig>) -> OfficeConfig {
    objects.into_iter().fold(
        OfficeConfig::new("office").with_manager(fast_manager()),
        OfficeConfig::with_managed_object,
    )
}

/// Escalation kinds received by a process, with the matching errors.
#[derive(Clone, Default)]
struct Escalations {
    received: Arc<Mutex<Vec<Escalation>>>,
}

impl Escalations {
    fn install(&self, process: &Process) {
        let received = Arc::clone(&self.received);
        process.set_escalation_handler(move |_process: ProcessId, escalation: Escalation| {
            received.lock().push(escalation);
        });
    }

    fn kinds(&self) -> Vec<&'static str> {
        self.received.lock().iter().map(Escalation::kind).collect()
    }

    fn len(&self) -> usize {
        self.received.lock().len()
    }
}

fn counting_task(name: &str, object: &str, runs: &Arc<AtomicUsize>) -> TaskSpec {
    let runs = Arc::clone(runs);
    let required = object.to_string();
    TaskSpec::new(name, move |task| {
        task.object(&required)?;
        runs.fetch_add(1, Ordering::SeqCst);
        Ok(TaskOutcome::Complete)
    })
    .using(object)
}

async fn wait_idle(process: &Process) {
    timeout(WAIT, process.wait_idle())
        .await
        .expect("process did not become idle");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn job_parked_on_sourcing_object_resumes_on_its_team() {
    init_tracing();
    let team = RecordingTeam::inline("t");
    let source = DeferredSource::new();
    let office = Office::builder(office_config(vec![ManagedObjectConfig::new("m").with_team("t")]))
        .with_team(team.clone())
        .with_source("m", source.clone())
        .build()
        .unwrap();

    let process = office.create_process();
    let seen = Arc::new(Mutex::new(None));
    let observed = Arc::clone(&seen);
    let job_id = process
        .submit(
            TaskSpec::new("read", move |task| {
                let value = task.get::<String>("m")?;
                *observed.lock() = Some(value.as_str().to_string());
                Ok(TaskOutcome::Complete)
            })
            .using("m"),
        )
        .unwrap();

    // First execution found the object still sourcing and parked.
    assert_eq!(source.requests(), 1);
    assert_eq!(process.managed_object_state("m"), Some(LifecycleState::Sourcing));
    assert_eq!(process.container("m").unwrap().parked_jobs(), 1);
    assert!(seen.lock().is_none());

    let resource = ScriptedResource::new(String::from("connected"));
    assert!(source.resolve(resource.clone()).unwrap());

    wait_idle(&process).await;
    assert_eq!(seen.lock().as_deref(), Some("connected"));
    assert_eq!(team.assigned(), vec![job_id, job_id]);
    assert_eq!(source.requests(), 1);
    assert_eq!(resource.recycle_count(), 1);
    assert_eq!(process.escalations(), 0);

    office.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn completion_from_foreign_thread_reactivates_parked_job() {
    let team = RecordingTeam::inline("t");
    let resource = ScriptedResource::new(AtomicUsize::new(0));
    let office = Office::builder(office_config(vec![ManagedObjectConfig::new("m").with_team("t")]))
        .with_team(team.clone())
        .with_source("m", immediate_source(resource.clone()))
        .build()
        .unwrap();
    let mut events = office.subscribe();

    let process = office.create_process();
    let driver = Arc::clone(&resource);
    let observed = Arc::new(Mutex::new(Vec::new()));
    let states = Arc::clone(&observed);
    let job_id = process
        .submit(
            TaskSpec::new("transfer", move |task| {
                let counter = task.get::<AtomicUsize>("m")?;
                states.lock().push((task.state("m")?, counter.load(Ordering::SeqCst)));
                if task.step() == 1 {
                    let context = driver.asynchronous_context().expect("granted");
                    context
                        .start(|| {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Ok::<(), std::io::Error>(())
                        })
                        .map_err(|err| anyhow::anyhow!("{err}"))?;
                    return Ok(TaskOutcome::Continue);
                }
                Ok(TaskOutcome::Complete)
            })
            .using("m"),
        )
        .unwrap();

    assert_eq!(resource.state(), Some(LifecycleState::AsyncPending));
    assert_eq!(process.container("m").unwrap().parked_jobs(), 1);
    assert!(matches!(
        process.container("m").unwrap().object(),
        Err(ManagedObjectError::NotAvailable { state: LifecycleState::AsyncPending, .. })
    ));

    let completer = Arc::clone(&resource);
    std::thread::spawn(move || {
        let context = completer.asynchronous_context().expect("granted");
        let counter = completer.object().unwrap().downcast::<AtomicUsize>().unwrap();
        context
            .complete(|| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), std::io::Error>(())
            })
            .unwrap();
    })
    .join()
    .unwrap();

    wait_idle(&process).await;
    assert_eq!(
        observed.lock().as_slice(),
        [(LifecycleState::Ready, 0), (LifecycleState::Ready, 2)]
    );
    assert_eq!(team.assigned(), vec![job_id, job_id]);

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.meta.correlation_id == process.id().0 {
            kinds.push(match event.payload {
                EngineEventPayload::JobAssigned { .. } => "assigned",
                EngineEventPayload::JobParked { .. } => "parked",
                EngineEventPayload::JobReactivated { .. } => "reactivated",
                EngineEventPayload::JobCompleted { .. } => "completed",
                EngineEventPayload::JobEscalated { .. } => "escalated",
                EngineEventPayload::StateChanged { .. } => continue,
                _ => continue,
            });
        }
    }
    assert_eq!(kinds, ["assigned", "parked", "reactivated", "completed"]);

    office.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_start_is_reported_immediately() {
    let team = RecordingTeam::inline("t");
    let resource = ScriptedResource::new(());
    let office = Office::builder(office_config(vec![ManagedObjectConfig::new("m").with_team("t")]))
        .with_team(team.clone())
        .with_source("m", immediate_source(resource.clone()))
        .build()
        .unwrap();

    let process = office.create_process();
    let escalations = Escalations::default();
    escalations.install(&process);

    let driver = Arc::clone(&resource);
    let second = Arc::new(Mutex::new(None));
    let reported = Arc::clone(&second);
    let job_id = process
        .submit(
            TaskSpec::new("double-start", move |_task| {
                driver.begin()?;
                *reported.lock() = Some(driver.begin());
                Ok(TaskOutcome::Continue)
            })
            .using("m"),
        )
        .unwrap();

    assert_eq!(
        second.lock().clone(),
        Some(Err(Defect::AsynchronousOperationAlreadyStarted {
            managed_object: "m".into()
        }))
    );
    wait_idle(&process).await;
    assert_eq!(escalations.kinds(), ["managed_object"]);
    // The step itself, then the escalation delivered on the same team.
    assert_eq!(team.assigned(), vec![job_id, job_id]);

    office.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reading_object_that_went_pending_mid_step_suspends_the_job() {
    let team = RecordingTeam::inline("t");
    let resource = ScriptedResource::new(String::from("socket"));
    let office = Office::builder(office_config(vec![ManagedObjectConfig::new("m").with_team("t")]))
        .with_team(team.clone())
        .with_source("m", immediate_source(resource.clone()))
        .build()
        .unwrap();

    let process = office.create_process();
    let escalations = Escalations::default();
    escalations.install(&process);

    let driver = Arc::clone(&resource);
    let steps = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&steps);
    let job_id = process
        .submit(
            TaskSpec::new("send", move |task| {
                if task.step() == 1 {
                    driver.begin()?;
                }
                let socket = task.get::<String>("m")?;
                recorded.lock().push((task.step(), socket.as_str().to_string()));
                Ok(TaskOutcome::Complete)
            })
            .using("m"),
        )
        .unwrap();

    // The read after `begin` suspended the job instead of failing it.
    assert_eq!(escalations.len(), 0);
    assert_eq!(process.active_jobs(), 1);
    assert_eq!(process.managed_object_state("m"), Some(LifecycleState::AsyncPending));
    assert_eq!(process.container("m").unwrap().parked_jobs(), 1);
    assert!(steps.lock().is_empty());

    let completer = Arc::clone(&resource);
    std::thread::spawn(move || completer.finish()).join().unwrap();

    wait_idle(&process).await;
    assert_eq!(steps.lock().as_slice(), [(2, String::from("socket"))]);
    assert_eq!(team.assigned(), vec![job_id, job_id]);
    assert_eq!(escalations.len(), 0);

    office.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_parked_job_is_reactivated_exactly_once() {
    let team = RecordingTeam::inline("t");
    let source = DeferredSource::new();
    let office = Office::builder(office_config(vec![ManagedObjectConfig::new("m").with_team("t")]))
        .with_team(team.clone())
        .with_source("m", source.clone())
        .build()
        .unwrap();

    let process = office.create_process();
    let runs = Arc::new(AtomicUsize::new(0));
    for index in 0..5 {
        process
            .submit(counting_task(&format!("reader-{index}"), "m", &runs))
            .unwrap();
    }
    assert_eq!(process.container("m").unwrap().parked_jobs(), 5);
    assert_eq!(source.requests(), 1);

    let resource = ScriptedResource::new(7_u32);
    source.resolve(resource.clone()).unwrap();
    wait_idle(&process).await;

    assert_eq!(runs.load(Ordering::SeqCst), 5);
    team.assert_assigned_eq(10);
    let mut assigned = team.assigned();
    assigned.sort_by_key(|id| id.as_uuid());
    assigned.dedup();
    assert_eq!(assigned.len(), 5);

    office.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn complete_while_ready_has_no_effect() {
    let held = RecordingTeam::holding("held");
    let inline = RecordingTeam::inline("inline");
    let resource = ScriptedResource::new(());
    let office = Office::builder(office_config(vec![ManagedObjectConfig::new("m").with_team("inline")]))
        .with_team(held.clone())
        .with_team(inline.clone())
        .with_source("m", immediate_source(resource.clone()))
        .build()
        .unwrap();

    let process = office.create_process();
    let runs = Arc::new(AtomicUsize::new(0));
    // Keeps the process alive until released.
    process
        .submit(counting_task("late", "m", &runs).with_team("held"))
        .unwrap();
    process.submit(counting_task("warm", "m", &runs)).unwrap();
    assert_eq!(resource.state(), Some(LifecycleState::Ready));

    let ran = AtomicUsize::new(0);
    resource
        .asynchronous_context()
        .unwrap()
        .complete(|| {
            ran.fetch_add(1, Ordering::SeqCst);
            Ok::<(), String>(())
        })
        .unwrap();

    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(resource.state(), Some(LifecycleState::Ready));
    assert_eq!(process.container("m").unwrap().parked_jobs(), 0);
    inline.assert_assigned_eq(1);

    let releaser = held.clone();
    tokio::task::spawn_blocking(move || releaser.release())
        .await
        .unwrap();
    wait_idle(&process).await;
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    office.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_then_complete_unobserved_runs_dependent_once() {
    let held = RecordingTeam::holding("held");
    let inline = RecordingTeam::inline("inline");
    let resource = ScriptedResource::new(String::from("payload"));
    let office = Office::builder(office_config(vec![ManagedObjectConfig::new("m").with_team("inline")]))
        .with_team(held.clone())
        .with_team(inline.clone())
        .with_source("m", immediate_source(resource.clone()))
        .build()
        .unwrap();

    let process = office.create_process();
    let dependent_runs = Arc::new(AtomicUsize::new(0));
    let warm_runs = Arc::new(AtomicUsize::new(0));
    process
        .submit(counting_task("dependent", "m", &dependent_runs).with_team("held"))
        .unwrap();
    process.submit(counting_task("warm", "m", &warm_runs)).unwrap();

    let driver = Arc::clone(&resource);
    std::thread::spawn(move || {
        driver.begin().unwrap();
        driver.finish();
    })
    .join()
    .unwrap();

    let releaser = held.clone();
    tokio::task::spawn_blocking(move || releaser.release())
        .await
        .unwrap();
    wait_idle(&process).await;

    assert_eq!(dependent_runs.load(Ordering::SeqCst), 1);
    held.assert_assigned_eq(1);
    assert_eq!(process.escalations(), 0);

    office.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn coordinating_object_loads_dependencies_once_ready() {
    let team = RecordingTeam::inline("t");
    let socket_source = DeferredSource::new();
    let cache = ScriptedResource::new(64_u32);
    let session = LinkedResource::new();
    let session_object = Arc::clone(&session);
    let config = office_config(vec![
        ManagedObjectConfig::new("socket").with_team("t"),
        ManagedObjectConfig::new("cache").with_team("t"),
        ManagedObjectConfig::new("session")
            .with_team("t")
            .with_dependency("socket", "socket")
            .with_dependency("cache", "cache"),
    ]);
    let office = Office::builder(config)
        .with_team(team.clone())
        .with_source("socket", socket_source.clone())
        .with_source("cache", immediate_source(cache.clone()))
        .with_source("session", move |user: ManagedObjectUser| {
            let shared: Arc<dyn ManagedObject> = Arc::clone(&session_object) as Arc<dyn ManagedObject>;
            user.set_shared_managed_object(shared).unwrap();
        })
        .build()
        .unwrap();

    let process = office.create_process();
    let keys = Arc::new(Mutex::new(Vec::new()));
    let loaded = Arc::clone(&keys);
    process
        .submit(
            TaskSpec::new("session", move |task| {
                *loaded.lock() = task.get::<Vec<String>>("session")?.as_ref().clone();
                Ok(TaskOutcome::Complete)
            })
            .using("session"),
        )
        .unwrap();

    // The socket is still sourcing, so the session has not been loaded.
    assert_eq!(session.load_count(), 0);
    assert_eq!(socket_source.pending(), 1);

    let socket = ScriptedResource::new(String::from("10.0.0.1:5432"));
    socket_source.resolve(socket.clone()).unwrap();
    wait_idle(&process).await;

    assert_eq!(keys.lock().as_slice(), ["socket", "cache"]);
    assert_eq!(session.load_count(), 1);
    assert_eq!(session.unload_count(), 1);
    assert!(session.dependency::<String>("socket").is_none());
    assert_eq!(socket.recycle_count(), 1);
    assert_eq!(cache.recycle_count(), 1);

    office.shutdown().await.unwrap();
}

struct Greedy;

impl ManagedObject for Greedy {
    fn object(&self) -> anyhow::Result<Object> {
        Ok(Arc::new(()))
    }

    fn as_coordinating(&self) -> Option<&dyn CoordinatingManagedObject> {
        Some(self)
    }
}

impl CoordinatingManagedObject for Greedy {
    fn load_objects(&self, registry: &ObjectRegistry) -> anyhow::Result<()> {
        registry.get_named("a")?;
        registry.get_named("b")?;
        registry.get_named("c")?;
        Ok(())
    }

    fn unload_objects(&self) {}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn undeclared_dependency_is_a_defect() {
    let team = RecordingTeam::inline("t");
    let config = office_config(vec![
        ManagedObjectConfig::new("a").with_team("t"),
        ManagedObjectConfig::new("b").with_team("t"),
        ManagedObjectConfig::new("greedy")
            .with_team("t")
            .with_dependency("a", "a")
            .with_dependency("b", "b"),
    ]);
    let office = Office::builder(config)
        .with_team(team.clone())
        .with_source("a", immediate_source(ScriptedResource::new(1_u8)))
        .with_source("b", immediate_source(ScriptedResource::new(2_u8)))
        .with_source("greedy", |user: ManagedObjectUser| {
            user.set_managed_object(Greedy).unwrap();
        })
        .build()
        .unwrap();

    let process = office.create_process();
    let escalations = Escalations::default();
    escalations.install(&process);
    let runs = Arc::new(AtomicUsize::new(0));
    process.submit(counting_task("greedy", "greedy", &runs)).unwrap();
    wait_idle(&process).await;

    assert_eq!(runs.load(Ordering::SeqCst), 0);
    let received = escalations.received.lock();
    let [Escalation::ManagedObject {
        source: ManagedObjectError::ObjectFailed { managed_object, source },
        ..
    }] = received.as_slice()
    else {
        panic!("unexpected escalations {received:?}");
    };
    assert_eq!(managed_object, "greedy");
    assert_eq!(
        source.downcast_ref::<Defect>(),
        Some(&Defect::UndeclaredDependency {
            managed_object: "greedy".into(),
            key: "c".into()
        })
    );
    drop(received);

    office.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stuck_object_times_out_and_late_object_is_recycled() {
    let team = RecordingTeam::inline("t");
    let source = DeferredSource::new();
    let office = Office::builder(office_config(vec![
        ManagedObjectConfig::new("slow")
            .with_team("t")
            .with_timeout_ms(20),
    ]))
    .with_team(team.clone())
    .with_source("slow", source.clone())
    .build()
    .unwrap();

    let process = office.create_process();
    let escalations = Escalations::default();
    escalations.install(&process);
    let runs = Arc::new(AtomicUsize::new(0));
    process.submit(counting_task("read-slow", "slow", &runs)).unwrap();

    wait_idle(&process).await;
    assert_eq!(escalations.kinds(), ["timed_out"]);
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    let late = ScriptedResource::new(());
    assert!(source.resolve(late.clone()).unwrap());
    assert_eq!(late.recycle_count(), 1);

    office.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn check_timeouts_fails_pending_operation() {
    let team = RecordingTeam::inline("t");
    let resource = ScriptedResource::starting(());
    let config = OfficeConfig::new("office")
        .with_manager(OfficeManagerConfig::default().with_monitor_interval(3_600_000))
        .with_managed_object(ManagedObjectConfig::new("m").with_team("t").with_timeout_ms(1));
    let office = Office::builder(config)
        .with_team(team.clone())
        .with_source("m", immediate_source(resource.clone()))
        .build()
        .unwrap();

    let process = office.create_process();
    let escalations = Escalations::default();
    escalations.install(&process);
    let runs = Arc::new(AtomicUsize::new(0));
    process.submit(counting_task("op", "m", &runs)).unwrap();
    assert_eq!(resource.state(), Some(LifecycleState::AsyncPending));

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(office.manager().check_timeouts(), 1);
    wait_idle(&process).await;
    assert_eq!(escalations.kinds(), ["timed_out"]);

    // A completion arriving after the timeout changes nothing.
    resource.finish();
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    office.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn source_failure_escalates_parked_jobs() {
    let team = RecordingTeam::inline("t");
    let source = DeferredSource::new();
    let office = Office::builder(office_config(vec![ManagedObjectConfig::new("m").with_team("t")]))
        .with_team(team.clone())
        .with_source("m", source.clone())
        .build()
        .unwrap();

    let process = office.create_process();
    let escalations = Escalations::default();
    escalations.install(&process);
    let runs = Arc::new(AtomicUsize::new(0));
    process.submit(counting_task("a", "m", &runs)).unwrap();
    process.submit(counting_task("b", "m", &runs)).unwrap();

    assert!(source.fail("host unreachable"));
    wait_idle(&process).await;

    assert_eq!(escalations.kinds(), ["managed_object", "managed_object"]);
    let received = escalations.received.lock();
    assert!(received[0].to_string().contains("host unreachable"));
    drop(received);

    office.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overloaded_resubmission_is_retried() {
    let team = RecordingTeam::inline("t");
    let source = DeferredSource::new();
    let office = Office::builder(office_config(vec![ManagedObjectConfig::new("m").with_team("t")]))
        .with_team(team.clone())
        .with_source("m", source.clone())
        .build()
        .unwrap();

    let process = office.create_process();
    let runs = Arc::new(AtomicUsize::new(0));
    process.submit(counting_task("read", "m", &runs)).unwrap();

    team.refuse_next(3);
    source.resolve(ScriptedResource::new(())).unwrap();
    wait_idle(&process).await;

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(team.rejected_count(), 3);
    team.assert_assigned_eq(2);

    office.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn persistent_overload_escalates() {
    let team = RecordingTeam::inline("t");
    let source = DeferredSource::new();
    let config = OfficeConfig::new("office")
        .with_manager(
            OfficeManagerConfig::default()
                .with_resubmit_backoff(1)
                .with_resubmit_attempts(3),
        )
        .with_managed_object(ManagedObjectConfig::new("m").with_team("t"));
    let office = Office::builder(config)
        .with_team(team.clone())
        .with_source("m", source.clone())
        .build()
        .unwrap();

    let process = office.create_process();
    let escalations = Escalations::default();
    escalations.install(&process);
    let runs = Arc::new(AtomicUsize::new(0));
    process.submit(counting_task("read", "m", &runs)).unwrap();

    team.refuse_next(usize::MAX);
    source.resolve(ScriptedResource::new(())).unwrap();
    wait_idle(&process).await;

    assert_eq!(escalations.kinds(), ["overloaded"]);
    assert_eq!(team.rejected_count(), 3);
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    office.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_submission_returns_the_job() {
    let team = RecordingTeam::inline("t");
    let office = Office::builder(office_config(vec![ManagedObjectConfig::new("m").with_team("t")]))
        .with_team(team.clone())
        .with_source("m", immediate_source(ScriptedResource::new(())))
        .build()
        .unwrap();

    let process = office.create_process();
    let runs = Arc::new(AtomicUsize::new(0));
    team.refuse_next(1);

    let err = process.submit(counting_task("read", "m", &runs)).unwrap_err();
    let rejected = match err {
        SubmitError::Rejected(rejected) => rejected,
        other => panic!("expected rejection, got {other}"),
    };
    assert!(rejected.reason.is_overload());
    assert_eq!(process.active_jobs(), 1);
    drop(rejected);
    assert_eq!(process.active_jobs(), 0);

    process.submit(counting_task("read", "m", &runs)).unwrap();
    wait_idle(&process).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    office.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn task_failures_and_panics_are_escalated() {
    let office = Office::builder(
        OfficeConfig::new("office")
            .with_team(TeamConfig::one_person("worker"))
            .with_manager(fast_manager()),
    )
    .build()
    .unwrap();

    let process = office.create_process();
    let escalations = Escalations::default();
    escalations.install(&process);
    process
        .submit(TaskSpec::new("fails", |_task| anyhow::bail!("disk full")).with_team("worker"))
        .unwrap();
    process
        .submit(TaskSpec::new("panics", |_task| panic!("invariant broken")).with_team("worker"))
        .unwrap();
    wait_idle(&process).await;

    let mut kinds = escalations.kinds();
    kinds.sort_unstable();
    assert_eq!(kinds, ["panicked", "task_failed"]);
    assert_eq!(process.escalations(), 2);

    office.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn continuing_task_runs_until_complete() {
    let office = Office::builder(
        OfficeConfig::new("office")
            .with_team(TeamConfig::worker_per_job("workers", 4))
            .with_manager(fast_manager()),
    )
    .build()
    .unwrap();

    let process = office.create_process();
    let steps = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&steps);
    process
        .submit(
            TaskSpec::new("chunked", move |task| {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(if task.step() < 4 {
                    TaskOutcome::Continue
                } else {
                    TaskOutcome::Complete
                })
            })
            .with_team("workers"),
        )
        .unwrap();
    wait_idle(&process).await;

    assert_eq!(steps.load(Ordering::SeqCst), 4);
    office.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn processes_do_not_share_managed_objects() {
    let team = RecordingTeam::holding("t");
    let created = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&created);
    let office = Office::builder(office_config(vec![ManagedObjectConfig::new("m").with_team("t")]))
        .with_team(team.clone())
        .with_source("m", move |user: ManagedObjectUser| {
            let index = counter.fetch_add(1, Ordering::SeqCst);
            user.set_managed_object(ScriptedResourceValue(index)).unwrap();
        })
        .build()
        .unwrap();

    let first = office.create_process();
    let second = office.create_process();
    let seen = Arc::new(Mutex::new(Vec::new()));
    for process in [&first, &second] {
        for _ in 0..2 {
            let seen = Arc::clone(&seen);
            process
                .submit(
                    TaskSpec::new("read", move |task| {
                        seen.lock().push(*task.get::<usize>("m")?);
                        Ok(TaskOutcome::Complete)
                    })
                    .using("m"),
                )
                .unwrap();
        }
    }
    let releaser = team.clone();
    let released = tokio::task::spawn_blocking(move || releaser.release())
        .await
        .unwrap();
    assert_eq!(released, 4);
    wait_idle(&first).await;
    wait_idle(&second).await;

    assert_eq!(created.load(Ordering::SeqCst), 2);
    let mut values = seen.lock().clone();
    values.sort_unstable();
    assert_eq!(values, [0, 0, 1, 1]);
    assert_ne!(first.id(), second.id());

    office.shutdown().await.unwrap();
}

struct ScriptedResourceValue(usize);

impl ManagedObject for ScriptedResourceValue {
    fn object(&self) -> anyhow::Result<Object> {
        Ok(Arc::new(self.0))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn process_safe_run_is_serialized_with_job_steps() {
    let team = RecordingTeam::inline("t");
    let resource = ScriptedResource::new(());
    let office = Office::builder(office_config(vec![ManagedObjectConfig::new("m").with_team("t")]))
        .with_team(team.clone())
        .with_source("m", immediate_source(resource.clone()))
        .build()
        .unwrap();

    let process = office.create_process();
    let shared = Arc::new(Mutex::new(Vec::new()));
    let written = Arc::clone(&shared);
    let driver = Arc::clone(&resource);
    process
        .submit(
            TaskSpec::new("writer", move |task| {
                if task.step() == 1 {
                    written.lock().push("job");
                    driver.begin()?;
                    return Ok(TaskOutcome::Continue);
                }
                Ok(TaskOutcome::Complete)
            })
            .using("m"),
        )
        .unwrap();

    let context = resource.managed_object_context().expect("context granted");
    assert_eq!(context.bound_name(), "m");
    assert_eq!(context.process_id(), process.id());
    let callback = Arc::clone(&shared);
    let result = std::thread::spawn(move || {
        context.run(|| {
            callback.lock().push("callback");
            Err::<(), _>("rejected by peer")
        })
    })
    .join()
    .unwrap();
    assert_eq!(result, Err("rejected by peer"));

    resource.finish();
    wait_idle(&process).await;
    assert_eq!(shared.lock().as_slice(), ["job", "callback"]);
    assert!(
        eventually(WAIT, || resource.recycle_count() == 1).await,
        "resource was not recycled"
    );

    office.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stopped_team_escalates_reactivated_jobs() {
    let team = RecordingTeam::inline("t");
    let source = DeferredSource::new();
    let office = Office::builder(office_config(vec![ManagedObjectConfig::new("m").with_team("t")]))
        .with_team(team.clone())
        .with_source("m", source.clone())
        .build()
        .unwrap();

    let process = office.create_process();
    let escalations = Escalations::default();
    escalations.install(&process);
    let runs = Arc::new(AtomicUsize::new(0));
    process.submit(counting_task("read", "m", &runs)).unwrap();

    office.shutdown().await.unwrap();
    assert_eq!(team.name(), "t");
    source.resolve(ScriptedResource::new(())).unwrap();

    wait_idle(&process).await;
    assert_eq!(escalations.len(), 1);
    assert_eq!(escalations.kinds(), ["overloaded"]);
    assert_eq!(runs.load(Ordering::SeqCst), 0);
}
