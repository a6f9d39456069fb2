use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::job::JobId;
use crate::managed_object::LifecycleState;
use crate::process::ProcessId;

/// Metadata envelope attached to every engine event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    /// The process the event belongs to.
    pub correlation_id: Uuid,
    pub idempotency_key: String,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(process: ProcessId, idempotency_key: impl Into<String>) -> Self {
        Self {
            version: 1,
            correlation_id: process.0,
            idempotency_key: idempotency_key.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Engine event with metadata and payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineEvent {
    pub meta: EventMeta,
    pub payload: EngineEventPayload,
}

impl EngineEvent {
    pub fn new(process: ProcessId, payload: EngineEventPayload) -> Self {
        let key = payload.idempotency_key();
        Self {
            meta: EventMeta::new(process, key),
            payload,
        }
    }
}

/// Event payload emitted for job and managed object transitions.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum EngineEventPayload {
    /// Job was handed to a team.
    JobAssigned { job_id: JobId, team: String },
    /// Job suspended until a managed object becomes ready.
    JobParked {
        job_id: JobId,
        managed_object: String,
        state: LifecycleState,
    },
    /// Parked job was resubmitted to its team.
    JobReactivated {
        job_id: JobId,
        managed_object: String,
        team: String,
    },
    /// Job finished its work.
    JobCompleted { job_id: JobId },
    /// Job failure was routed to escalation handling.
    JobEscalated { job_id: JobId, kind: String },
    /// Managed object moved between lifecycle states.
    StateChanged {
        managed_object: String,
        from: LifecycleState,
        to: LifecycleState,
    },
}

impl EngineEventPayload {
    fn idempotency_key(&self) -> String {
        match self {
            EngineEventPayload::JobAssigned { job_id, team } => format!("assigned-{job_id}-{team}"),
            EngineEventPayload::JobParked {
                job_id,
                managed_object,
                ..
            } => format!("parked-{job_id}-{managed_object}"),
            EngineEventPayload::JobReactivated {
                job_id,
                managed_object,
                ..
            } => format!("reactivated-{job_id}-{managed_object}"),
            EngineEventPayload::JobCompleted { job_id } => format!("completed-{job_id}"),
            EngineEventPayload::JobEscalated { job_id, .. } => format!("escalated-{job_id}"),
            EngineEventPayload::StateChanged {
                managed_object,
                from,
                to,
            } => format!("state-{managed_object}-{from}-{to}"),
        }
    }
}

/// In-process event bus using tokio broadcast channels.
///
/// Publishing never blocks; subscribers that fall behind receive
/// `RecvError::Lagged` and events are dropped when nobody listens.
pub struct InProcEventBus {
    sender: broadcast::Sender<EngineEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for InProcEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    /// Build and publish an event for `process`.
    pub fn emit(&self, process: ProcessId, payload: EngineEventPayload) {
        if self.sender.receiver_count() == 0 {
            return;
        }
        self.publish(EngineEvent::new(process, payload));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}
