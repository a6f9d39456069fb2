//! An office with an asynchronous managed object.
//!
//! A "socket" managed object connects in the background: its source hands
//! the object over immediately, the socket starts a connect operation as soon
//! as it receives its asynchronous context, and a separate thread completes
//! it later. Tasks using the socket park until the connection is up and then
//! resume on their team. A coordinating "session" object picks up the socket
//! once it is ready.
//!
//! Run with `RUST_LOG=teamwork=debug cargo run --example async_resource`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use teamwork::*;

/// A fake network connection.
#[derive(Debug, Default)]
struct Connection {
    bytes_sent: AtomicU64,
}

impl Connection {
    fn send(&self, payload: &str) -> u64 {
        self.bytes_sent
            .fetch_add(payload.len() as u64, Ordering::SeqCst)
            + payload.len() as u64
    }
}

/// Managed object owning a [`Connection`] that needs a connect round trip.
struct Socket {
    connection: Arc<Connection>,
    latency: Duration,
}

impl Socket {
    fn connect_in_background(&self, context: AsynchronousContext) -> anyhow::Result<()> {
        context
            .start(|| {
                println!("[socket] connecting");
                Ok::<(), std::io::Error>(())
            })
            .map_err(|err| anyhow::anyhow!("{err}"))?;
        let latency = self.latency;
        std::thread::spawn(move || {
            std::thread::sleep(latency);
            let result = context.complete(|| {
                println!("[socket] connected after {latency:?}");
                Ok::<(), std::io::Error>(())
            });
            if let Err(err) = result {
                eprintln!("[socket] completion failed: {err}");
            }
        });
        Ok(())
    }
}

impl ManagedObject for Socket {
    fn object(&self) -> anyhow::Result<Object> {
        Ok(Arc::clone(&self.connection) as Object)
    }

    fn as_asynchronous(&self) -> Option<&dyn AsynchronousManagedObject> {
        Some(self)
    }

    fn recycle(&self) {
        println!(
            "[socket] closing after {} bytes",
            self.connection.bytes_sent.load(Ordering::SeqCst)
        );
    }
}

impl AsynchronousManagedObject for Socket {
    fn set_asynchronous_context(&self, context: AsynchronousContext) {
        if let Err(err) = self.connect_in_background(context) {
            eprintln!("[socket] connect failed: {err}");
        }
    }
}

dependency_keys! {
    enum SessionKey {
        Socket => "socket",
    }
}

/// Coordinating object holding the socket's connection while loaded.
#[derive(Default)]
struct Session {
    connection: Mutex<Option<Arc<Connection>>>,
}

impl ManagedObject for Session {
    fn object(&self) -> anyhow::Result<Object> {
        let connection = self
            .connection
            .lock()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("session not loaded"))?;
        Ok(connection as Object)
    }

    fn as_coordinating(&self) -> Option<&dyn CoordinatingManagedObject> {
        Some(self)
    }
}

impl CoordinatingManagedObject for Session {
    fn load_objects(&self, registry: &ObjectRegistry) -> anyhow::Result<()> {
        let connection = registry.get::<Connection, _>(&SessionKey::Socket)?;
        *self.connection.lock() = Some(connection);
        println!("[session] loaded socket");
        Ok(())
    }

    fn unload_objects(&self) {
        self.connection.lock().take();
        println!("[session] released socket");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = OfficeConfig::new("demo")
        .with_team(TeamConfig::one_person("io"))
        .with_team(TeamConfig::worker_per_job("workers", 8))
        .with_managed_object(ManagedObjectConfig::new("socket").with_team("io").with_timeout_ms(5_000))
        .with_managed_object(
            ManagedObjectConfig::new("session")
                .with_team("workers")
                .with_dependency("socket", "socket"),
        );

    let office = Office::builder(config)
        .with_source("socket", |user: ManagedObjectUser| {
            let socket = Socket {
                connection: Arc::new(Connection::default()),
                latency: Duration::from_millis(200),
            };
            if let Err(defect) = user.set_managed_object(socket) {
                eprintln!("[source] {defect}");
            }
        })
        .with_source("session", |user: ManagedObjectUser| {
            if let Err(defect) = user.set_managed_object(Session::default()) {
                eprintln!("[source] {defect}");
            }
        })
        .with_escalation_handler(|process: ProcessId, escalation: Escalation| {
            eprintln!("[office] process {process}: {escalation}");
        })
        .build()?;

    let mut events = office.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let Ok(json) = serde_json::to_string(&event.payload) {
                println!("[event] {json}");
            }
        }
    });

    let process = office.create_process();
    process.submit(
        TaskSpec::new("connect", |task| {
            task.object("socket")?;
            println!("[connect] socket ready on step {}", task.step());
            Ok(TaskOutcome::Complete)
        })
        .using("socket"),
    )
    .map_err(|err| anyhow::anyhow!("{err}"))?;

    for index in 0..3 {
        process.submit(
            TaskSpec::new(format!("send-{index}"), move |task| {
                let connection = task.get::<Connection>("session")?;
                let total = connection.send(&format!("hello #{index}"));
                println!("[send-{index}] sent, {total} bytes so far");
                Ok(TaskOutcome::Complete)
            })
            .using("session"),
        )
        .map_err(|err| anyhow::anyhow!("{err}"))?;
    }

    tokio::time::timeout(Duration::from_secs(10), process.wait_idle()).await?;
    println!("[demo] process idle, {} escalations", process.escalations());

    office.shutdown().await?;
    Ok(())
}
