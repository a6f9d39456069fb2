//! Stress tests for the execution core.
//!
//! Many processes, each with an asynchronous managed object completed from a
//! foreign thread, running on shared teams.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use teamwork::{
    ManagedObject, ManagedObjectConfig, ManagedObjectUser, Office, OfficeConfig,
    OfficeManagerConfig, TaskOutcome, TaskSpec, TeamConfig,
};
use teamwork_testkit::ScriptedResource;
use tokio::time::timeout;

/// Source whose objects start an operation on grant and complete it from a
/// separate thread shortly after.
fn completing_source(user: ManagedObjectUser) {
    let resource = ScriptedResource::starting(user.process_id());
    let shared: Arc<dyn ManagedObject> = Arc::clone(&resource) as Arc<dyn ManagedObject>;
    if user.set_shared_managed_object(shared).is_err() {
        return;
    }
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_micros(200));
        resource.finish();
    });
}

fn build_office(team: TeamConfig) -> Office {
    let config = OfficeConfig::new("stress")
        .with_team(team.clone())
        .with_manager(OfficeManagerConfig::default().with_resubmit_backoff(1))
        .with_managed_object(ManagedObjectConfig::new("conn").with_team(team.name.as_str()));
    Office::builder(config)
        .with_source("conn", completing_source)
        .build()
        .unwrap()
}

async fn run_processes(office: &Office, processes: usize, tasks_per_process: usize) {
    let completed = Arc::new(AtomicUsize::new(0));
    let owners = Arc::new(Mutex::new(HashSet::new()));
    let mut handles = Vec::with_capacity(processes);

    for _ in 0..processes {
        let process = office.create_process();
        for index in 0..tasks_per_process {
            let completed = Arc::clone(&completed);
            let owners = Arc::clone(&owners);
            process
                .submit(
                    TaskSpec::new(format!("task-{index}"), move |task| {
                        let owner = task.get::<teamwork::ProcessId>("conn")?;
                        assert_eq!(*owner, task.process_id());
                        owners.lock().insert(*owner);
                        completed.fetch_add(1, Ordering::SeqCst);
                        Ok(TaskOutcome::Complete)
                    })
                    .using("conn"),
                )
                .unwrap();
        }
        handles.push(process);
    }

    let wait = timeout(
        Duration::from_secs(60),
        join_all(handles.iter().map(|process| process.wait_idle())),
    );
    assert!(wait.await.is_ok(), "processes did not finish in time");

    assert_eq!(completed.load(Ordering::SeqCst), processes * tasks_per_process);
    assert_eq!(owners.lock().len(), processes);
    for process in &handles {
        assert_eq!(process.escalations(), 0);
        assert_eq!(process.active_jobs(), 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stress_200_processes_on_one_person_team() {
    let office = build_office(TeamConfig::one_person("io").with_queue_capacity(4096));
    run_processes(&office, 200, 3).await;
    office.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stress_200_processes_on_affinity_team() {
    let office = build_office(TeamConfig::affinity("pinned", 4).with_queue_capacity(4096));
    run_processes(&office, 200, 3).await;
    office.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stress_100_processes_on_executor_team() {
    let office = build_office(TeamConfig::executor("pool", 256));
    run_processes(&office, 100, 2).await;
    office.shutdown().await.unwrap();
}
