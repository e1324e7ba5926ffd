//! Standby pool: FIFO queue of backup workers held against a request.

use super::model::{LabourRequest, WorkerId};
use crate::error::LabourError;

/// Append a worker to the back of the queue.
///
/// Rejects a worker already queued or already holding a staffing slot.
pub fn enqueue(request: &mut LabourRequest, worker_id: WorkerId) -> Result<(), LabourError> {
    if request.in_standby(&worker_id) || request.holds_staffing_slot(&worker_id) {
        return Err(LabourError::DuplicateWorker {
            request_id: request.id,
            worker_id,
        });
    }
    request.standby_workers.push_back(worker_id);
    Ok(())
}

/// Pop the head of the queue.
pub fn dequeue_next(request: &mut LabourRequest) -> Result<WorkerId, LabourError> {
    request
        .standby_workers
        .pop_front()
        .ok_or(LabourError::StandbyEmpty {
            request_id: request.id,
        })
}

/// Remove a specific worker. Returns whether they were queued.
pub fn remove(request: &mut LabourRequest, worker_id: &WorkerId) -> bool {
    let before = request.standby_workers.len();
    request.standby_workers.retain(|w| w != worker_id);
    request.standby_workers.len() != before
}

/// Empty the queue, returning the released workers in order.
pub fn clear(request: &mut LabourRequest) -> Vec<WorkerId> {
    request.standby_workers.drain(..).collect()
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, Utc};

    use super::*;
    use crate::labour::model::{AssignedWorker, NewLabourRequest, SlotStatus, WorkType};

    fn request() -> LabourRequest {
        LabourRequest::create(
            NewLabourRequest::new(
                "f",
                "l",
                WorkType::Sowing,
                2,
                NaiveDate::from_ymd_opt(2026, 11, 2).unwrap(),
            ),
            Utc::now(),
        )
    }

    #[test]
    fn fifo_order() {
        let mut req = request();
        enqueue(&mut req, "a".into()).unwrap();
        enqueue(&mut req, "b".into()).unwrap();
        assert_eq!(dequeue_next(&mut req).unwrap(), WorkerId::new("a"));
        assert_eq!(dequeue_next(&mut req).unwrap(), WorkerId::new("b"));
        assert!(matches!(
            dequeue_next(&mut req),
            Err(LabourError::StandbyEmpty { .. })
        ));
    }

    #[test]
    fn rejects_duplicate_standby() {
        let mut req = request();
        enqueue(&mut req, "a".into()).unwrap();
        assert!(matches!(
            enqueue(&mut req, "a".into()),
            Err(LabourError::DuplicateWorker { .. })
        ));
    }

    #[test]
    fn rejects_worker_with_active_slot() {
        let mut req = request();
        req.assigned_workers
            .push(AssignedWorker::new("a".into(), Utc::now()));
        assert!(matches!(
            enqueue(&mut req, "a".into()),
            Err(LabourError::DuplicateWorker { .. })
        ));
    }

    #[test]
    fn cancelled_worker_may_stand_by() {
        let mut req = request();
        let mut slot = AssignedWorker::new("a".into(), Utc::now());
        slot.status = SlotStatus::Cancelled;
        req.assigned_workers.push(slot);
        assert!(enqueue(&mut req, "a".into()).is_ok());
    }

    #[test]
    fn remove_and_clear() {
        let mut req = request();
        enqueue(&mut req, "a".into()).unwrap();
        enqueue(&mut req, "b".into()).unwrap();
        enqueue(&mut req, "c".into()).unwrap();
        assert!(remove(&mut req, &"b".into()));
        assert!(!remove(&mut req, &"z".into()));
        let rest = clear(&mut req);
        assert_eq!(rest, vec![WorkerId::new("a"), WorkerId::new("c")]);
        assert!(req.standby_workers.is_empty());
    }
}
