//! Teamwork - an inversion-of-control execution engine.
//!
//! Work is expressed as tasks that depend on managed resources. The engine
//! schedules tasks as jobs on pluggable worker pools, governs each resource
//! through a lifecycle, suspends jobs while a resource is busy with an
//! asynchronous operation, and resumes them once it completes.
//!
//! # Core Concepts
//!
//! - **Job**: a schedulable unit of work implementing [`Job`], executed one step
//!   at a time until it reports completion.
//!
//! - **Team**: a worker pool implementing [`Team`]. Jobs are assigned to a team;
//!   the team decides which thread runs them.
//!
//! - **Managed object**: an engine-governed resource implementing
//!   [`ManagedObject`], optionally context-aware, asynchronous or coordinating.
//!
//! - **Process**: a group of tasks sharing managed objects. Operations on
//!   process state are serialized through [`ProcessState::run`], no matter which
//!   thread calls it.
//!
//! - **Office manager**: the [`OfficeManager`] resubmits parked jobs when their
//!   managed object becomes ready and escalates those whose object failed or
//!   timed out.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use teamwork::*;
//!
//! let config = OfficeConfig::new("office")
//!     .with_team(TeamConfig::one_person("io"))
//!     .with_managed_object(ManagedObjectConfig::new("db").with_team("io"));
//!
//! let office = Office::builder(config)
//!     .with_source("db", |user: ManagedObjectUser| {
//!         let _ = user.set_managed_object(Database::connect());
//!     })
//!     .build()?;
//!
//! let process = office.create_process();
//! process.submit(TaskSpec::new("query", |task| {
//!     let db = task.get::<Connection>("db")?;
//!     db.query("select 1")?;
//!     Ok(TaskOutcome::Complete)
//! }).using("db"))?;
//! process.wait_idle().await;
//! ```

/// Configuration of teams, managed objects and the office manager.
///
/// Configuration is plain serde data and can be loaded from JSON with
/// [`OfficeConfig::from_json`].
pub mod config;

/// Error types: [`Defect`], [`TeamError`], [`ManagedObjectError`],
/// [`AsynchronousError`], [`ConfigError`] and [`Escalation`].
pub mod error;

/// Engine lifecycle events and the [`InProcEventBus`].
pub mod events;

/// The [`Job`] contract, [`JobId`] and job handover.
pub mod job;

/// Managed object capabilities, sourcing and the per-process container.
pub mod managed_object;

/// The [`OfficeManager`]: reactivation of parked jobs and timeout monitoring.
pub mod manager;

#[cfg(feature = "metrics")]
/// Prometheus metrics, available with the `metrics` feature.
pub mod metrics;

/// Engine assembly: [`Office`], [`Process`] and tasks.
pub mod office;

/// Process-safe execution: [`ProcessState`] and [`ProcessAwareContext`].
pub mod process;

/// Dependency lookup for coordinating managed objects.
pub mod registry;

/// Team implementations and the [`Team`] contract.
pub mod team;

/// Tracing spans and recording helpers.
pub mod telemetry;

pub use config::*;
pub use error::*;
pub use events::*;
pub use job::*;
pub use managed_object::*;
pub use manager::{Activator, OfficeManager, ShutdownToken};
pub use office::*;
pub use process::*;
pub use registry::*;
pub use team::*;
