//! Assignment engine: adds, ends and swaps worker slots on a request.
//!
//! All slot mutation goes through here so the terminal-slot and capacity
//! invariants hold. Cross-request double booking is enforced by reserving
//! `(worker, work_date)` in the store before the slot is appended.

use std::sync::Arc;

use tracing::info;

use super::directory::WorkerDirectory;
use super::events::{Actor, LabourEvent, LogEventType};
use super::lifecycle;
use super::model::{AssignedWorker, RequestStatus, SlotStatus, WorkerId};
use super::staffing;
use super::standby;
use super::txn::RequestTxn;
use crate::error::{DatabaseError, LabourError};
use crate::store::{LabourStore, Reservation};

/// A slot that just went terminal and may need backfilling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vacancy {
    pub slot_index: usize,
}

pub struct AssignmentEngine {
    store: Arc<dyn LabourStore>,
    directory: Arc<dyn WorkerDirectory>,
}

impl AssignmentEngine {
    pub fn new(store: Arc<dyn LabourStore>, directory: Arc<dyn WorkerDirectory>) -> Self {
        Self { store, directory }
    }

    pub fn directory(&self) -> &Arc<dyn WorkerDirectory> {
        &self.directory
    }

    /// Append an `assigned` slot for the worker.
    ///
    /// Fails with `CapacityExceeded` when the request is already full; the
    /// caller should queue the worker on standby instead.
    pub async fn assign(
        &self,
        txn: &mut RequestTxn,
        worker_id: &WorkerId,
        actor: Actor,
    ) -> Result<usize, LabourError> {
        ensure_staffing_open(txn, "assign worker")?;
        self.check_worker(worker_id).await?;
        ensure_not_on_request(txn, worker_id)?;

        let request = txn.request();
        if staffing::is_fully_staffed(request) {
            return Err(LabourError::CapacityExceeded {
                request_id: request.id,
                workers_needed: request.workers_needed,
            });
        }

        self.reserve(txn, worker_id).await?;
        let idx = push_slot(txn, worker_id);

        let entry = txn
            .log_entry(actor, LogEventType::WorkerAssigned)
            .with_worker(worker_id.clone());
        txn.log(entry);
        let staffing = lifecycle::reconcile_staffing(txn)?;
        info!(
            request_id = %txn.id(),
            worker_id = %worker_id,
            active = staffing.active,
            needed = staffing.needed,
            "Worker assigned"
        );
        Ok(idx)
    }

    /// Cancel a live slot. Returns the vacancy for the replacement coordinator.
    pub fn unassign(
        &self,
        txn: &mut RequestTxn,
        worker_id: &WorkerId,
        reason: &str,
    ) -> Result<Vacancy, LabourError> {
        ensure_staffing_open(txn, "cancel worker")?;
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(LabourError::validation("reason", "is required"));
        }
        let idx = live_slot(txn, worker_id, "cancel")?;
        txn.end_slot(idx, SlotStatus::Cancelled, Some(reason.to_string()))?;

        let entry = txn
            .log_entry(Actor::Coordinator, LogEventType::WorkerCancelled)
            .with_worker(worker_id.clone())
            .with_reason(reason);
        txn.log(entry);
        info!(request_id = %txn.id(), worker_id = %worker_id, reason, "Worker slot cancelled");
        Ok(Vacancy { slot_index: idx })
    }

    /// Worker acknowledgment. Confirming twice is a no-op.
    pub fn confirm(&self, txn: &mut RequestTxn, worker_id: &WorkerId) -> Result<(), LabourError> {
        ensure_not_terminal(txn, "confirm worker")?;
        let idx = txn
            .request()
            .slot_index(worker_id)
            .ok_or_else(|| LabourError::not_found("assigned worker", worker_id))?;

        let status = txn.request().assigned_workers[idx].status;
        match status {
            SlotStatus::Confirmed => Ok(()),
            SlotStatus::Assigned => {
                let now = txn.now();
                let slot = &mut txn.request_mut().assigned_workers[idx];
                slot.status = SlotStatus::Confirmed;
                slot.confirmed_at = Some(now);
                txn.emit_slot_changed(worker_id.clone(), SlotStatus::Confirmed);

                let entry = txn
                    .log_entry(Actor::Worker, LogEventType::WorkerConfirmed)
                    .with_worker(worker_id.clone());
                txn.log(entry);
                info!(request_id = %txn.id(), worker_id = %worker_id, "Worker confirmed");
                Ok(())
            }
            status => Err(LabourError::InvalidSlotState {
                request_id: txn.id(),
                worker_id: worker_id.clone(),
                status,
                operation: "confirm".into(),
            }),
        }
    }

    /// Record a no-show. Only on the work date itself.
    pub fn mark_no_show(
        &self,
        txn: &mut RequestTxn,
        worker_id: &WorkerId,
    ) -> Result<Vacancy, LabourError> {
        ensure_staffing_open(txn, "mark no-show")?;
        let work_date = txn.request().work_date;
        if txn.today() != work_date {
            return Err(LabourError::validation(
                "work_date",
                format!("no-show can only be recorded on {work_date}"),
            ));
        }
        let idx = live_slot(txn, worker_id, "mark no-show")?;
        txn.end_slot(idx, SlotStatus::NoShow, None)?;

        let entry = txn
            .log_entry(Actor::Coordinator, LogEventType::WorkerNoShow)
            .with_worker(worker_id.clone());
        txn.log(entry);
        info!(request_id = %txn.id(), worker_id = %worker_id, "Worker marked no-show");
        Ok(Vacancy { slot_index: idx })
    }

    /// A confirmed worker finished their part while the request is in progress.
    pub fn mark_completed(
        &self,
        txn: &mut RequestTxn,
        worker_id: &WorkerId,
    ) -> Result<(), LabourError> {
        if txn.status() != RequestStatus::InProgress {
            return Err(LabourError::StateTransition {
                request_id: txn.id(),
                current: txn.status(),
                attempted: "complete worker".into(),
            });
        }
        let idx = txn
            .request()
            .slot_index(worker_id)
            .ok_or_else(|| LabourError::not_found("assigned worker", worker_id))?;
        let status = txn.request().assigned_workers[idx].status;
        if status != SlotStatus::Confirmed {
            return Err(LabourError::InvalidSlotState {
                request_id: txn.id(),
                worker_id: worker_id.clone(),
                status,
                operation: "complete".into(),
            });
        }
        txn.end_slot(idx, SlotStatus::Completed, None)?;

        let entry = txn
            .log_entry(Actor::Coordinator, LogEventType::WorkerCompleted)
            .with_worker(worker_id.clone());
        txn.log(entry);
        info!(request_id = %txn.id(), worker_id = %worker_id, "Worker completed");
        Ok(())
    }

    /// Swap a live slot for a named worker in one step.
    ///
    /// The old slot becomes `replaced`; the new worker gets a fresh slot.
    pub async fn replace(
        &self,
        txn: &mut RequestTxn,
        old_worker: &WorkerId,
        new_worker: &WorkerId,
        reason: Option<&str>,
    ) -> Result<usize, LabourError> {
        ensure_staffing_open(txn, "replace worker")?;
        let old_idx = live_slot(txn, old_worker, "replace")?;
        self.check_worker(new_worker).await?;
        ensure_not_on_request(txn, new_worker)?;
        self.reserve(txn, new_worker).await?;

        let reason = reason.map(str::trim).filter(|r| !r.is_empty());
        txn.end_slot(old_idx, SlotStatus::Replaced, reason.map(str::to_string))?;
        let new_idx = push_slot(txn, new_worker);
        let now = txn.now();
        let old_slot = &mut txn.request_mut().assigned_workers[old_idx];
        old_slot.replaced_by = Some(new_worker.clone());
        old_slot.replaced_at = Some(now);

        txn.emit(LabourEvent::SlotReplaced {
            request_id: txn.id(),
            previous_worker_id: old_worker.clone(),
            worker_id: new_worker.clone(),
        });
        let mut entry = txn
            .log_entry(Actor::Coordinator, LogEventType::ReplacementMade)
            .with_worker(new_worker.clone())
            .with_previous_worker(old_worker.clone());
        if let Some(r) = reason {
            entry = entry.with_reason(r);
        }
        txn.log(entry);
        lifecycle::reconcile_staffing(txn)?;
        info!(
            request_id = %txn.id(),
            old_worker = %old_worker,
            new_worker = %new_worker,
            "Worker replaced"
        );
        Ok(new_idx)
    }

    /// Check the worker exists in the directory and is active.
    pub async fn check_worker(&self, worker_id: &WorkerId) -> Result<(), LabourError> {
        let status = self
            .directory
            .resolve_worker(worker_id)
            .await?
            .ok_or_else(|| LabourError::not_found("worker", worker_id))?;
        if !status.active {
            return Err(LabourError::validation(
                "worker_id",
                format!("worker {worker_id} is not active"),
            ));
        }
        Ok(())
    }

    /// Take the `(worker, work_date)` reservation for this request.
    async fn reserve(&self, txn: &mut RequestTxn, worker_id: &WorkerId) -> Result<(), LabourError> {
        let work_date = txn.request().work_date;
        match self.store.reserve_worker(worker_id, work_date, txn.id()).await {
            Ok(Reservation::Acquired) => {
                txn.note_acquired(worker_id.clone());
                Ok(())
            }
            Ok(Reservation::AlreadyHeld) => Ok(()),
            Err(DatabaseError::ReservationHeld { held_by, .. }) => Err(LabourError::DoubleBooking {
                worker_id: worker_id.clone(),
                work_date,
                held_by,
            }),
            Err(e) => Err(e.into()),
        }
    }
}

fn ensure_staffing_open(txn: &RequestTxn, attempted: &str) -> Result<(), LabourError> {
    if !txn.status().accepts_staffing() {
        return Err(LabourError::StateTransition {
            request_id: txn.id(),
            current: txn.status(),
            attempted: attempted.to_string(),
        });
    }
    Ok(())
}

fn ensure_not_terminal(txn: &RequestTxn, attempted: &str) -> Result<(), LabourError> {
    if txn.status().is_terminal() {
        return Err(LabourError::StateTransition {
            request_id: txn.id(),
            current: txn.status(),
            attempted: attempted.to_string(),
        });
    }
    Ok(())
}

fn ensure_not_on_request(txn: &RequestTxn, worker_id: &WorkerId) -> Result<(), LabourError> {
    if txn.request().holds_staffing_slot(worker_id) {
        return Err(LabourError::DuplicateWorker {
            request_id: txn.id(),
            worker_id: worker_id.clone(),
        });
    }
    Ok(())
}

/// Index of the worker's live slot, or the error explaining why there is none.
fn live_slot(txn: &RequestTxn, worker_id: &WorkerId, operation: &str) -> Result<usize, LabourError> {
    let idx = txn
        .request()
        .slot_index(worker_id)
        .ok_or_else(|| LabourError::not_found("assigned worker", worker_id))?;
    let status = txn.request().assigned_workers[idx].status;
    if !status.is_active() {
        return Err(LabourError::InvalidSlotState {
            request_id: txn.id(),
            worker_id: worker_id.clone(),
            status,
            operation: operation.to_string(),
        });
    }
    Ok(idx)
}

fn push_slot(txn: &mut RequestTxn, worker_id: &WorkerId) -> usize {
    let now = txn.now();
    let request = txn.request_mut();
    standby::remove(request, worker_id);
    request
        .assigned_workers
        .push(AssignedWorker::new(worker_id.clone(), now));
    let idx = request.assigned_workers.len() - 1;
    txn.emit_slot_changed(worker_id.clone(), SlotStatus::Assigned);
    idx
}
