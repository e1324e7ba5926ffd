//! Replacement coordinator: backfills vacated slots from the standby pool
//! and escalates unresolved shortfalls.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::assignment::{AssignmentEngine, Vacancy};
use super::events::{Actor, LabourEvent, LogEventType};
use super::lifecycle::{self, SHORTFALL_FAILURE_REASON};
use super::model::{LabourRequest, RequestStatus, SlotStatus, WorkerId};
use super::staffing::{self, Staffing};
use super::standby;
use super::txn::RequestTxn;
use crate::error::LabourError;

/// What happened after a slot went terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backfill {
    /// Staffing was still whole.
    NotNeeded,
    /// A standby worker took the vacated slot.
    Replaced { worker_id: WorkerId },
    /// No replacement; the shortfall is recorded until the deadline.
    Shortfall { deadline: DateTime<Utc> },
    /// No replacement and the deadline has passed; the request failed.
    Failed,
}

pub struct ReplacementCoordinator {
    engine: Arc<AssignmentEngine>,
    shortfall_window: chrono::Duration,
}

impl ReplacementCoordinator {
    pub fn new(engine: Arc<AssignmentEngine>, shortfall_window: chrono::Duration) -> Self {
        Self {
            engine,
            shortfall_window,
        }
    }

    /// Latest time a shortfall may persist before the request fails.
    pub fn shortfall_deadline(&self, request: &LabourRequest) -> DateTime<Utc> {
        shortfall_deadline(request, self.shortfall_window)
    }

    /// React to one terminal slot event. At most one replacement is made.
    pub async fn backfill(
        &self,
        txn: &mut RequestTxn,
        vacancy: Vacancy,
    ) -> Result<Backfill, LabourError> {
        if staffing::is_fully_staffed(txn.request()) {
            return Ok(Backfill::NotNeeded);
        }

        while let Ok(candidate) = standby::dequeue_next(txn.request_mut()) {
            match self.engine.assign(txn, &candidate, Actor::System).await {
                Ok(_) => {
                    self.record_replacement(txn, vacancy, candidate.clone());
                    return Ok(Backfill::Replaced {
                        worker_id: candidate,
                    });
                }
                Err(e) if is_unassignable(&e) => drop_candidate(txn, &candidate, &e),
                Err(e) => return Err(e),
            }
        }

        self.shortfall(txn)
    }

    /// Move standby workers into open capacity until the request is full or
    /// the pool runs dry. Each promotion backfills the most recent vacated
    /// slot that has no replacement yet, if there is one.
    ///
    /// Returns how many workers were promoted.
    pub async fn promote_standby(&self, txn: &mut RequestTxn) -> Result<u32, LabourError> {
        if !txn.status().accepts_staffing() {
            return Ok(0);
        }
        let mut promoted = 0;
        while !staffing::is_fully_staffed(txn.request()) && !txn.request().standby_workers.is_empty()
        {
            let Ok(candidate) = standby::dequeue_next(txn.request_mut()) else {
                break;
            };
            match self.place(txn, &candidate, Actor::System).await {
                Ok(()) => promoted += 1,
                Err(e) if is_unassignable(&e) => drop_candidate(txn, &candidate, &e),
                Err(e) => return Err(e),
            }
        }
        Ok(promoted)
    }

    /// Give a worker one of the open slots, crediting them as the
    /// replacement for the latest unfilled vacancy.
    pub async fn place(
        &self,
        txn: &mut RequestTxn,
        worker_id: &WorkerId,
        actor: Actor,
    ) -> Result<(), LabourError> {
        let vacancy = latest_vacancy(txn.request());
        self.engine.assign(txn, worker_id, actor).await?;
        if let Some(vacancy) = vacancy {
            self.record_replacement(txn, vacancy, worker_id.clone());
        }
        Ok(())
    }

    fn record_replacement(&self, txn: &mut RequestTxn, vacancy: Vacancy, worker_id: WorkerId) {
        let now = txn.now();
        let vacated = &mut txn.request_mut().assigned_workers[vacancy.slot_index];
        vacated.replaced_by = Some(worker_id.clone());
        vacated.replaced_at = Some(now);
        let previous = vacated.worker_id.clone();

        txn.emit(LabourEvent::SlotReplaced {
            request_id: txn.id(),
            previous_worker_id: previous.clone(),
            worker_id: worker_id.clone(),
        });
        let entry = txn
            .log_entry(Actor::System, LogEventType::ReplacementMade)
            .with_worker(worker_id.clone())
            .with_previous_worker(previous.clone());
        txn.log(entry);
        info!(
            request_id = %txn.id(),
            previous_worker = %previous,
            worker_id = %worker_id,
            "Standby worker promoted"
        );
    }

    /// Pool exhausted: fail if the deadline has passed, else record the shortfall.
    fn shortfall(&self, txn: &mut RequestTxn) -> Result<Backfill, LabourError> {
        let staffing = Staffing::evaluate(txn.request());
        let deadline = self.shortfall_deadline(txn.request());

        if txn.now() >= deadline && can_fail_for_shortfall(txn.status()) {
            warn!(
                request_id = %txn.id(),
                active = staffing.active,
                needed = staffing.needed,
                %deadline,
                "Shortfall past deadline, failing request"
            );
            lifecycle::fail(txn, SHORTFALL_FAILURE_REASON)?;
            return Ok(Backfill::Failed);
        }

        if txn.request().shortfall_since.is_none() {
            let now = txn.now();
            txn.request_mut().shortfall_since = Some(now);
        }
        txn.emit(LabourEvent::StaffingShortfall {
            request_id: txn.id(),
            active_count: staffing.active,
            workers_needed: staffing.needed,
            deadline,
        });
        warn!(
            request_id = %txn.id(),
            active = staffing.active,
            needed = staffing.needed,
            %deadline,
            "Staffing shortfall with empty standby pool"
        );
        Ok(Backfill::Shortfall { deadline })
    }
}

/// Shift start minus the window, clamped at the earliest representable time.
pub fn shortfall_deadline(request: &LabourRequest, window: chrono::Duration) -> DateTime<Utc> {
    request
        .shift_start()
        .checked_sub_signed(window)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Only requests still being staffed fail for a shortfall.
pub fn can_fail_for_shortfall(status: RequestStatus) -> bool {
    matches!(status, RequestStatus::Accepted | RequestStatus::Assigned)
}

/// Whether the sweep has anything to do for this request at `now`: standby
/// waiting beside open capacity, or an expired shortfall.
pub fn needs_sweep(request: &LabourRequest, window: chrono::Duration, now: DateTime<Utc>) -> bool {
    can_fail_for_shortfall(request.status)
        && !staffing::is_fully_staffed(request)
        && (!request.standby_workers.is_empty() || now >= shortfall_deadline(request, window))
}

/// Whether the request should fail for its shortfall at `now`.
pub fn shortfall_expired(
    request: &LabourRequest,
    window: chrono::Duration,
    now: DateTime<Utc>,
) -> bool {
    can_fail_for_shortfall(request.status)
        && !staffing::is_fully_staffed(request)
        && request.standby_workers.is_empty()
        && now >= shortfall_deadline(request, window)
}

/// Standby candidates failing with these are dropped; anything else aborts.
fn is_unassignable(e: &LabourError) -> bool {
    matches!(
        e,
        LabourError::DoubleBooking { .. }
            | LabourError::NotFound { .. }
            | LabourError::Validation { .. }
            | LabourError::DuplicateWorker { .. }
    )
}

fn drop_candidate(txn: &RequestTxn, worker_id: &WorkerId, e: &LabourError) {
    warn!(
        request_id = %txn.id(),
        worker_id = %worker_id,
        error = %e,
        "Standby worker could not be assigned, dropping from pool"
    );
}

fn latest_vacancy(request: &LabourRequest) -> Option<Vacancy> {
    request
        .assigned_workers
        .iter()
        .rposition(|s| {
            matches!(s.status, SlotStatus::Cancelled | SlotStatus::NoShow) && s.replaced_by.is_none()
        })
        .map(|slot_index| Vacancy { slot_index })
}
