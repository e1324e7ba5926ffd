//! Request lifecycle state machine.
//!
//! Every status change goes through [`transition`], which checks the edge
//! against [`RequestStatus::can_transition_to`], stamps the milestone and
//! queues a `request.status_changed` event on the transaction.

use tracing::info;

use super::directory::CoordinatorRecord;
use super::events::{Actor, LabourEvent, LogEventType};
use super::model::{CoordinatorId, RequestStatus, SlotStatus, WorkType};
use super::staffing::Staffing;
use super::standby;
use super::txn::RequestTxn;
use crate::error::LabourError;

/// Reason recorded when the shortfall deadline passes without a replacement.
pub const SHORTFALL_FAILURE_REASON: &str = "staffing shortfall unresolved";

/// Reason recorded when every coordinator offering the work has declined.
pub const NO_COORDINATOR_REASON: &str = "no coordinator available";

/// Move the request to `target`, or fail naming both states.
pub fn transition(txn: &mut RequestTxn, target: RequestStatus) -> Result<(), LabourError> {
    let from = txn.status();
    if !from.can_transition_to(target) {
        return Err(LabourError::StateTransition {
            request_id: txn.id(),
            current: from,
            attempted: target.as_str().to_string(),
        });
    }

    let now = txn.now();
    let request = txn.request_mut();
    request.status = target;
    match target {
        RequestStatus::Accepted => request.coordinator_accepted_at = Some(now),
        RequestStatus::InProgress => request.work_started_at = Some(now),
        RequestStatus::Completed => request.work_completed_at = Some(now),
        RequestStatus::Cancelled => request.cancelled_at = Some(now),
        RequestStatus::Failed => request.failed_at = Some(now),
        RequestStatus::Pending | RequestStatus::Assigned => {}
    }

    txn.emit(LabourEvent::StatusChanged {
        request_id: txn.id(),
        from,
        to: target,
    });
    info!(request_id = %txn.id(), %from, to = %target, "Request status changed");
    Ok(())
}

/// `pending → accepted` under a coordinator.
pub fn accept(txn: &mut RequestTxn, coordinator_id: CoordinatorId) -> Result<(), LabourError> {
    if coordinator_id.as_str().trim().is_empty() {
        return Err(LabourError::validation("coordinator_id", "is required"));
    }
    if txn.status() == RequestStatus::Pending {
        ensure_offered_to(txn, &coordinator_id)?;
    }
    transition(txn, RequestStatus::Accepted)?;
    txn.request_mut().coordinator_id = Some(coordinator_id);

    let entry = txn.log_entry(Actor::Coordinator, LogEventType::CoordinatorAccepted);
    txn.log(entry);
    Ok(())
}

/// A pending request may be offered to one coordinator; nobody else answers it.
fn ensure_offered_to(txn: &RequestTxn, coordinator_id: &CoordinatorId) -> Result<(), LabourError> {
    let request = txn.request();
    if let Some(offered) = request.coordinator_id.as_ref().filter(|c| *c != coordinator_id) {
        return Err(LabourError::validation(
            "coordinator_id",
            format!("request is offered to {offered}"),
        ));
    }
    if request.declined_by.contains(coordinator_id) {
        return Err(LabourError::validation(
            "coordinator_id",
            format!("{coordinator_id} already declined this request"),
        ));
    }
    Ok(())
}

/// Best remaining coordinator for the work: active, offering the work type,
/// not among `declined`. Most reliable first, ties by id.
pub fn next_coordinator(
    candidates: &[CoordinatorRecord],
    work_type: WorkType,
    declined: &[CoordinatorId],
) -> Option<CoordinatorId> {
    candidates
        .iter()
        .filter(|c| c.offers(work_type) && !declined.contains(&c.id))
        .min_by(|a, b| {
            b.reliability_score
                .cmp(&a.reliability_score)
                .then_with(|| a.id.cmp(&b.id))
        })
        .map(|c| c.id.clone())
}

/// A coordinator turns down a pending request. It is offered to `successor`
/// and stays pending, or fails when nobody is left.
pub fn decline(
    txn: &mut RequestTxn,
    coordinator_id: CoordinatorId,
    reason: Option<String>,
    successor: Option<CoordinatorId>,
) -> Result<(), LabourError> {
    if txn.status() != RequestStatus::Pending {
        return Err(LabourError::StateTransition {
            request_id: txn.id(),
            current: txn.status(),
            attempted: "decline".into(),
        });
    }
    if coordinator_id.as_str().trim().is_empty() {
        return Err(LabourError::validation("coordinator_id", "is required"));
    }
    ensure_offered_to(txn, &coordinator_id)?;
    if successor.as_ref() == Some(&coordinator_id) {
        return Err(LabourError::validation(
            "coordinator_id",
            "a request cannot be handed back to the coordinator declining it",
        ));
    }

    txn.request_mut().declined_by.push(coordinator_id.clone());
    let mut entry = txn
        .log_entry(Actor::Coordinator, LogEventType::CoordinatorDeclined)
        .with_coordinator(Some(coordinator_id.clone()));
    if let Some(reason) = reason.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
        entry = entry.with_reason(reason);
    }
    txn.log(entry);
    txn.emit(LabourEvent::CoordinatorDeclined {
        request_id: txn.id(),
        coordinator_id: coordinator_id.clone(),
        reassigned_to: successor.clone(),
    });

    match successor {
        Some(next) => {
            txn.request_mut().coordinator_id = Some(next.clone());
            let entry = txn.log_entry(Actor::System, LogEventType::CoordinatorAssigned);
            txn.log(entry);
            info!(request_id = %txn.id(), declined = %coordinator_id, offered = %next, "Request offered to next coordinator");
            Ok(())
        }
        None => {
            info!(request_id = %txn.id(), declined = %coordinator_id, "No coordinator left for request");
            fail(txn, NO_COORDINATOR_REASON)
        }
    }
}

/// Re-evaluate staffing after any slot change.
///
/// Fires `accepted → assigned` the first time the request is fully staffed
/// and clears a recorded shortfall once staffing is whole again.
pub fn reconcile_staffing(txn: &mut RequestTxn) -> Result<Staffing, LabourError> {
    let staffing = Staffing::evaluate(txn.request());
    if staffing.is_fully_staffed() {
        if txn.request().shortfall_since.is_some() {
            txn.request_mut().shortfall_since = None;
        }
        if txn.status() == RequestStatus::Accepted {
            transition(txn, RequestStatus::Assigned)?;
        }
    }
    Ok(staffing)
}

/// `assigned → in_progress`, on or after the work date.
pub fn start_work(txn: &mut RequestTxn) -> Result<(), LabourError> {
    let work_date = txn.request().work_date;
    if txn.status() == RequestStatus::Assigned && txn.today() < work_date {
        return Err(LabourError::validation(
            "work_date",
            format!("work cannot start before {work_date}"),
        ));
    }
    transition(txn, RequestStatus::InProgress)?;

    let entry = txn.log_entry(Actor::Coordinator, LogEventType::WorkStarted);
    txn.log(entry);
    Ok(())
}

fn validate_rating(rating: u8) -> Result<(), LabourError> {
    if !(1..=5).contains(&rating) {
        return Err(LabourError::validation(
            "rating",
            format!("{rating} is outside 1..=5"),
        ));
    }
    Ok(())
}

/// Farmer signs off on the work. Only while the work is in progress.
pub fn confirm_by_farmer(
    txn: &mut RequestTxn,
    rating: Option<u8>,
    feedback: Option<String>,
) -> Result<(), LabourError> {
    if txn.status() != RequestStatus::InProgress {
        return Err(LabourError::StateTransition {
            request_id: txn.id(),
            current: txn.status(),
            attempted: "farmer confirm".into(),
        });
    }
    if let Some(r) = rating {
        validate_rating(r)?;
    }

    let now = txn.now();
    let request = txn.request_mut();
    request.farmer_confirmed = true;
    request.farmer_confirmed_at = Some(now);
    if rating.is_some() {
        request.farmer_rating = rating;
    }
    if let Some(text) = feedback.filter(|f| !f.trim().is_empty()) {
        request.farmer_feedback = Some(text);
    }

    let entry = txn
        .log_entry(Actor::Farmer, LogEventType::FarmerConfirmed)
        .with_rating(rating);
    txn.log(entry);
    Ok(())
}

/// `in_progress → completed`. Every live slot completes with the request.
pub fn complete_work(txn: &mut RequestTxn) -> Result<(), LabourError> {
    if txn.status() == RequestStatus::InProgress && !txn.request().farmer_confirmed {
        return Err(LabourError::validation(
            "farmer_confirmed",
            "the farmer has not confirmed the work",
        ));
    }
    transition(txn, RequestStatus::Completed)?;

    end_live_slots(txn, SlotStatus::Completed, None)?;
    standby::clear(txn.request_mut());

    let completed = txn
        .request()
        .assigned_workers
        .iter()
        .filter(|s| s.status == SlotStatus::Completed)
        .count() as u32;
    let entry = txn
        .log_entry(Actor::Coordinator, LogEventType::WorkCompleted)
        .with_worker_count(completed);
    txn.log(entry);
    Ok(())
}

/// Any non-terminal state → `cancelled`, cascading to every live slot.
pub fn cancel(txn: &mut RequestTxn, reason: &str, actor: Actor) -> Result<(), LabourError> {
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(LabourError::validation("cancellation_reason", "is required"));
    }
    transition(txn, RequestStatus::Cancelled)?;
    txn.request_mut().cancellation_reason = Some(reason.to_string());

    end_live_slots(txn, SlotStatus::Cancelled, Some(reason))?;
    standby::clear(txn.request_mut());

    let entry = txn
        .log_entry(actor, LogEventType::RequestCancelled)
        .with_reason(reason);
    txn.log(entry);
    Ok(())
}

/// Any non-terminal state → `failed`, cancelling every live slot.
pub fn fail(txn: &mut RequestTxn, reason: &str) -> Result<(), LabourError> {
    transition(txn, RequestStatus::Failed)?;
    txn.request_mut().failure_reason = Some(reason.to_string());

    end_live_slots(txn, SlotStatus::Cancelled, Some(reason))?;
    standby::clear(txn.request_mut());

    txn.emit(LabourEvent::RequestFailed {
        request_id: txn.id(),
        reason: reason.to_string(),
    });
    let entry = txn
        .log_entry(Actor::System, LogEventType::RequestFailed)
        .with_reason(reason);
    txn.log(entry);
    Ok(())
}

/// Rating and feedback after completion; overwrites earlier values.
pub fn submit_feedback(
    txn: &mut RequestTxn,
    rating: u8,
    feedback: Option<String>,
) -> Result<(), LabourError> {
    if txn.status() != RequestStatus::Completed {
        return Err(LabourError::StateTransition {
            request_id: txn.id(),
            current: txn.status(),
            attempted: "submit feedback".into(),
        });
    }
    validate_rating(rating)?;

    let request = txn.request_mut();
    request.farmer_rating = Some(rating);
    request.farmer_feedback = feedback.filter(|f| !f.trim().is_empty());

    let entry = txn
        .log_entry(Actor::Farmer, LogEventType::FeedbackSubmitted)
        .with_rating(Some(rating));
    txn.log(entry);
    Ok(())
}

fn end_live_slots(
    txn: &mut RequestTxn,
    status: SlotStatus,
    reason: Option<&str>,
) -> Result<(), LabourError> {
    let live: Vec<usize> = txn
        .request()
        .assigned_workers
        .iter()
        .enumerate()
        .filter(|(_, s)| s.status.is_active())
        .map(|(idx, _)| idx)
        .collect();
    for idx in live {
        txn.end_slot(idx, status, reason.map(str::to_string))?;
    }
    Ok(())
}
