//! One write attempt against a single request.
//!
//! A `RequestTxn` holds the working copy loaded at a known version together
//! with everything the attempt produced: reservations it acquired, events to
//! broadcast and audit records to append. Nothing leaves the transaction
//! until the service commits it. Reservations of slots that ended are dropped
//! by the store as part of the versioned write.

use chrono::{DateTime, NaiveDate, Utc};

use super::events::{Actor, LabourEvent, LogEntry, LogEventType};
use super::model::{LabourRequest, RequestId, RequestStatus, SlotStatus, WorkerId};
use super::staffing;
use crate::error::LabourError;

/// Side effects of a committed transaction.
#[derive(Debug, Default)]
pub struct TxnEffects {
    pub events: Vec<LabourEvent>,
    pub logs: Vec<LogEntry>,
}

#[derive(Debug)]
pub struct RequestTxn {
    request: LabourRequest,
    now: DateTime<Utc>,
    today: NaiveDate,
    acquired: Vec<WorkerId>,
    effects: TxnEffects,
    dirty: bool,
}

impl RequestTxn {
    pub fn new(request: LabourRequest, now: DateTime<Utc>, today: NaiveDate) -> Self {
        Self {
            request,
            now,
            today,
            acquired: Vec::new(),
            effects: TxnEffects::default(),
            dirty: false,
        }
    }

    pub fn request(&self) -> &LabourRequest {
        &self.request
    }

    /// Mutable access marks the transaction as needing a write.
    pub fn request_mut(&mut self) -> &mut LabourRequest {
        self.dirty = true;
        &mut self.request
    }

    pub fn id(&self) -> RequestId {
        self.request.id
    }

    pub fn status(&self) -> RequestStatus {
        self.request.status
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn today(&self) -> NaiveDate {
        self.today
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Reservations newly taken by this attempt (released on rollback).
    pub fn acquired(&self) -> &[WorkerId] {
        &self.acquired
    }

    pub fn note_acquired(&mut self, worker_id: WorkerId) {
        self.acquired.push(worker_id);
    }

    pub fn emit(&mut self, event: LabourEvent) {
        self.effects.events.push(event);
    }

    pub fn log(&mut self, entry: LogEntry) {
        self.effects.logs.push(entry);
    }

    /// Start an audit record stamped with this attempt's time and the request's coordinator.
    pub fn log_entry(&self, actor: Actor, event: LogEventType) -> LogEntry {
        LogEntry::new(self.request.id, actor, event, self.now)
            .with_coordinator(self.request.coordinator_id.clone())
    }

    /// Move a live slot to a terminal status.
    pub fn end_slot(
        &mut self,
        idx: usize,
        status: SlotStatus,
        reason: Option<String>,
    ) -> Result<(), LabourError> {
        let now = self.now;
        let request_id = self.request.id;
        let slot = &self.request.assigned_workers[idx];
        if slot.status.is_terminal() {
            return Err(LabourError::InvalidSlotState {
                request_id,
                worker_id: slot.worker_id.clone(),
                status: slot.status,
                operation: status.as_str().to_string(),
            });
        }
        let worker_id = slot.worker_id.clone();

        let slot = &mut self.request_mut().assigned_workers[idx];
        slot.status = status;
        slot.ended_at = Some(now);
        if reason.is_some() {
            slot.cancellation_reason = reason;
        }
        self.emit_slot_changed(worker_id, status);
        Ok(())
    }

    /// Broadcast a slot change with the current staffing level.
    pub fn emit_slot_changed(&mut self, worker_id: WorkerId, slot_status: SlotStatus) {
        let event = LabourEvent::AssignedChanged {
            request_id: self.request.id,
            worker_id,
            slot_status,
            active_count: staffing::active_count(&self.request),
            workers_needed: self.request.workers_needed,
        };
        self.emit(event);
    }

    /// Bump `updated_at` before the write.
    pub fn touch(&mut self) {
        let now = self.now;
        self.request_mut().updated_at = now;
    }

    /// Give up the attempt, keeping only the working copy.
    pub fn into_request(self) -> LabourRequest {
        self.request
    }

    /// Split into the written request and its side effects.
    pub fn finish(self) -> (LabourRequest, TxnEffects) {
        (self.request, self.effects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labour::model::{AssignedWorker, NewLabourRequest, WorkType};

    fn txn() -> RequestTxn {
        let now = Utc::now();
        let mut req = LabourRequest::create(
            NewLabourRequest::new(
                "f",
                "l",
                WorkType::Weeding,
                2,
                NaiveDate::from_ymd_opt(2026, 11, 2).unwrap(),
            ),
            now,
        );
        req.assigned_workers.push(AssignedWorker::new("w1".into(), now));
        req.version = 4;
        RequestTxn::new(req, now, now.date_naive())
    }

    #[test]
    fn reading_does_not_dirty() {
        let t = txn();
        assert_eq!(t.request().assigned_workers.len(), 1);
        assert_eq!(t.request().version, 4);
        assert!(!t.is_dirty());
    }

    #[test]
    fn end_slot_stamps_slot_and_queues_event() {
        let mut t = txn();
        t.end_slot(0, SlotStatus::Cancelled, Some("sick".into())).unwrap();
        assert!(t.is_dirty());
        let (req, effects) = t.finish();
        assert_eq!(req.assigned_workers[0].status, SlotStatus::Cancelled);
        assert_eq!(req.assigned_workers[0].cancellation_reason.as_deref(), Some("sick"));
        assert!(req.assigned_workers[0].ended_at.is_some());
        assert_eq!(req.reserved_workers().count(), 0);
        assert!(matches!(
            effects.events[0],
            LabourEvent::AssignedChanged { active_count: 0, .. }
        ));
    }

    #[test]
    fn completed_slot_keeps_reservation() {
        let mut t = txn();
        t.end_slot(0, SlotStatus::Completed, None).unwrap();
        let req = t.into_request();
        assert_eq!(req.reserved_workers().collect::<Vec<_>>(), vec![&WorkerId::new("w1")]);
    }

    #[test]
    fn terminal_slot_is_immutable() {
        let mut t = txn();
        t.end_slot(0, SlotStatus::NoShow, None).unwrap();
        assert!(matches!(
            t.end_slot(0, SlotStatus::Cancelled, None),
            Err(LabourError::InvalidSlotState { status: SlotStatus::NoShow, .. })
        ));
    }
}
