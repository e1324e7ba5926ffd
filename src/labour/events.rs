//! Labour events: broadcast notifications and the persisted audit trail.
//!
//! `LabourEvent`s fan out to subscribers (notification and UI layers) over a
//! broadcast channel after the owning write commits. `LogEntry`s are the
//! accountability records appended to the store for every operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use super::model::{CoordinatorId, FarmerId, RequestId, RequestStatus, SlotStatus, WorkerId};

/// Events emitted by the core. Consumers never get called synchronously.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LabourEvent {
    #[serde(rename = "request.created")]
    RequestCreated {
        request_id: RequestId,
        farmer_id: FarmerId,
        workers_needed: u32,
    },
    #[serde(rename = "request.status_changed")]
    StatusChanged {
        request_id: RequestId,
        from: RequestStatus,
        to: RequestStatus,
    },
    /// A slot was added or changed status.
    #[serde(rename = "request.assigned_changed")]
    AssignedChanged {
        request_id: RequestId,
        worker_id: WorkerId,
        slot_status: SlotStatus,
        active_count: u32,
        workers_needed: u32,
    },
    #[serde(rename = "slot.replaced")]
    SlotReplaced {
        request_id: RequestId,
        previous_worker_id: WorkerId,
        worker_id: WorkerId,
    },
    #[serde(rename = "staffing.shortfall")]
    StaffingShortfall {
        request_id: RequestId,
        active_count: u32,
        workers_needed: u32,
        deadline: DateTime<Utc>,
    },
    #[serde(rename = "request.failed")]
    RequestFailed { request_id: RequestId, reason: String },
    /// `reassigned_to` is empty when nobody was left to take the request.
    #[serde(rename = "request.coordinator_declined")]
    CoordinatorDeclined {
        request_id: RequestId,
        coordinator_id: CoordinatorId,
        reassigned_to: Option<CoordinatorId>,
    },
}

impl LabourEvent {
    pub fn request_id(&self) -> RequestId {
        match self {
            Self::RequestCreated { request_id, .. }
            | Self::StatusChanged { request_id, .. }
            | Self::AssignedChanged { request_id, .. }
            | Self::SlotReplaced { request_id, .. }
            | Self::StaffingShortfall { request_id, .. }
            | Self::RequestFailed { request_id, .. }
            | Self::CoordinatorDeclined { request_id, .. } => *request_id,
        }
    }

    /// Event name (matches the serde tag).
    pub fn name(&self) -> &'static str {
        match self {
            Self::RequestCreated { .. } => "request.created",
            Self::StatusChanged { .. } => "request.status_changed",
            Self::AssignedChanged { .. } => "request.assigned_changed",
            Self::SlotReplaced { .. } => "slot.replaced",
            Self::StaffingShortfall { .. } => "staffing.shortfall",
            Self::RequestFailed { .. } => "request.failed",
            Self::CoordinatorDeclined { .. } => "request.coordinator_declined",
        }
    }
}

/// Broadcast fan-out for labour events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LabourEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LabourEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; fine if nobody is listening.
    pub fn publish(&self, event: LabourEvent) {
        trace!(event = event.name(), request_id = %event.request_id(), "Publishing labour event");
        let _ = self.tx.send(event);
    }
}

/// Who performed an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    System,
    Farmer,
    Coordinator,
    Worker,
}

/// Audited event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEventType {
    RequestCreated,
    CoordinatorAccepted,
    CoordinatorDeclined,
    CoordinatorAssigned,
    WorkerAssigned,
    WorkerConfirmed,
    WorkerCancelled,
    WorkerNoShow,
    WorkerCompleted,
    StandbyAdded,
    ReplacementMade,
    ReplacementSuggested,
    WorkStarted,
    WorkCompleted,
    FarmerConfirmed,
    RequestCancelled,
    RequestFailed,
    FeedbackSubmitted,
}

/// One accountability record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub request_id: RequestId,
    pub actor: Actor,
    pub event: LogEventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinator_id: Option<CoordinatorId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_worker_id: Option<WorkerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_count: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(
        request_id: RequestId,
        actor: Actor,
        event: LogEventType,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            request_id,
            actor,
            event,
            coordinator_id: None,
            worker_id: None,
            previous_worker_id: None,
            reason: None,
            rating: None,
            worker_count: None,
            timestamp,
        }
    }

    pub fn with_coordinator(mut self, coordinator: Option<CoordinatorId>) -> Self {
        self.coordinator_id = coordinator;
        self
    }

    pub fn with_worker(mut self, worker: WorkerId) -> Self {
        self.worker_id = Some(worker);
        self
    }

    pub fn with_previous_worker(mut self, worker: WorkerId) -> Self {
        self.previous_worker_id = Some(worker);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_rating(mut self, rating: Option<u8>) -> Self {
        self.rating = rating;
        self
    }

    pub fn with_worker_count(mut self, count: u32) -> Self {
        self.worker_count = Some(count);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_tags_use_dotted_names() {
        let event = LabourEvent::SlotReplaced {
            request_id: RequestId::new(),
            previous_worker_id: "a".into(),
            worker_id: "d".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"slot.replaced\""));
        assert_eq!(event.name(), "slot.replaced");

        let parsed: LabourEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn decline_event_carries_optional_successor() {
        let event = LabourEvent::CoordinatorDeclined {
            request_id: RequestId::new(),
            coordinator_id: "c1".into(),
            reassigned_to: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "request.coordinator_declined");
        assert!(json["reassigned_to"].is_null());
        assert_eq!(
            serde_json::to_value(LogEventType::CoordinatorDeclined).unwrap(),
            "coordinator_declined"
        );
    }

    #[test]
    fn status_change_serializes_snake_case_states() {
        let event = LabourEvent::StatusChanged {
            request_id: RequestId::new(),
            from: RequestStatus::Assigned,
            to: RequestStatus::InProgress,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"to\":\"in_progress\""));
    }

    #[tokio::test]
    async fn bus_delivers_to_subscribers() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let id = RequestId::new();
        bus.publish(LabourEvent::RequestFailed {
            request_id: id,
            reason: "shortfall".into(),
        });
        let received = rx.recv().await.unwrap();
        assert_eq!(received.request_id(), id);
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new(1);
        bus.publish(LabourEvent::RequestFailed {
            request_id: RequestId::new(),
            reason: "nobody listening".into(),
        });
    }

    #[test]
    fn log_entry_builder_omits_empty_fields() {
        let entry = LogEntry::new(
            RequestId::new(),
            Actor::Coordinator,
            LogEventType::WorkerAssigned,
            Utc::now(),
        )
        .with_worker("w1".into());
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"event\":\"worker_assigned\""));
        assert!(json.contains("\"worker_id\":\"w1\""));
        assert!(!json.contains("\"rating\""));
    }
}
