//! In-memory `LabourStore`: used by tests and single-process deployments.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::error::DatabaseError;
use crate::labour::events::LogEntry;
use crate::labour::model::{LabourRequest, RequestId, WorkerId};
use crate::store::traits::{LabourStore, Reservation, RequestFilter};

#[derive(Default)]
pub struct MemoryStore {
    requests: RwLock<HashMap<RequestId, LabourRequest>>,
    reservations: Mutex<HashMap<(WorkerId, NaiveDate), RequestId>>,
    logs: RwLock<Vec<LogEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sort_requests(requests: &mut [LabourRequest]) {
    requests.sort_by(|a, b| {
        a.work_date
            .cmp(&b.work_date)
            .then(a.created_at.cmp(&b.created_at))
    });
}

#[async_trait]
impl LabourStore for MemoryStore {
    // ── Requests ────────────────────────────────────────────────────

    async fn insert_request(&self, request: &LabourRequest) -> Result<(), DatabaseError> {
        let mut requests = self.requests.write().await;
        if requests.contains_key(&request.id) {
            return Err(DatabaseError::Constraint(format!(
                "labour request {} already exists",
                request.id
            )));
        }
        requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn get_request(&self, id: RequestId) -> Result<Option<LabourRequest>, DatabaseError> {
        Ok(self.requests.read().await.get(&id).cloned())
    }

    async fn update_request(&self, request: &LabourRequest) -> Result<u64, DatabaseError> {
        let mut requests = self.requests.write().await;
        let mut reservations = self.reservations.lock().await;
        let stored = requests
            .get_mut(&request.id)
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "labour_request".into(),
                id: request.id.to_string(),
            })?;

        if stored.version != request.version {
            debug!(
                id = %request.id,
                expected = request.version,
                actual = stored.version,
                "Version conflict"
            );
            return Err(DatabaseError::VersionConflict {
                id: request.id.to_string(),
                expected: request.version,
            });
        }

        let keep: HashSet<&WorkerId> = request.reserved_workers().collect();
        for worker_id in &keep {
            let key = ((*worker_id).clone(), request.work_date);
            if let Some(holder) = reservations.get(&key).filter(|h| **h != request.id) {
                return Err(DatabaseError::ReservationHeld {
                    worker_id: worker_id.to_string(),
                    work_date: request.work_date,
                    held_by: holder.to_string(),
                });
            }
        }
        for worker_id in &keep {
            reservations
                .entry(((*worker_id).clone(), request.work_date))
                .or_insert(request.id);
        }
        reservations.retain(|(worker_id, _), holder| *holder != request.id || keep.contains(worker_id));

        let mut next = request.clone();
        next.version = request.version + 1;
        let version = next.version;
        *stored = next;
        Ok(version)
    }

    async fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<LabourRequest>, DatabaseError> {
        let requests = self.requests.read().await;
        let mut matched: Vec<LabourRequest> =
            requests.values().filter(|r| filter.matches(r)).cloned().collect();
        sort_requests(&mut matched);
        Ok(matched)
    }

    async fn list_requests_for_worker(
        &self,
        worker_id: &WorkerId,
    ) -> Result<Vec<LabourRequest>, DatabaseError> {
        let requests = self.requests.read().await;
        let mut matched: Vec<LabourRequest> = requests
            .values()
            .filter(|r| r.assigned_workers.iter().any(|s| &s.worker_id == worker_id))
            .cloned()
            .collect();
        sort_requests(&mut matched);
        Ok(matched)
    }

    async fn list_open_requests(&self) -> Result<Vec<LabourRequest>, DatabaseError> {
        let requests = self.requests.read().await;
        let mut open: Vec<LabourRequest> = requests
            .values()
            .filter(|r| r.status.accepts_staffing())
            .cloned()
            .collect();
        sort_requests(&mut open);
        Ok(open)
    }

    // ── Reservations ────────────────────────────────────────────────

    async fn reserve_worker(
        &self,
        worker_id: &WorkerId,
        work_date: NaiveDate,
        request_id: RequestId,
    ) -> Result<Reservation, DatabaseError> {
        let mut reservations = self.reservations.lock().await;
        let key = (worker_id.clone(), work_date);
        match reservations.get(&key) {
            Some(holder) if *holder == request_id => Ok(Reservation::AlreadyHeld),
            Some(holder) => Err(DatabaseError::ReservationHeld {
                worker_id: worker_id.to_string(),
                work_date,
                held_by: holder.to_string(),
            }),
            None => {
                reservations.insert(key, request_id);
                Ok(Reservation::Acquired)
            }
        }
    }

    async fn release_worker(
        &self,
        worker_id: &WorkerId,
        work_date: NaiveDate,
        request_id: RequestId,
    ) -> Result<bool, DatabaseError> {
        let mut reservations = self.reservations.lock().await;
        let key = (worker_id.clone(), work_date);
        if reservations.get(&key) == Some(&request_id) {
            reservations.remove(&key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn reservation_holder(
        &self,
        worker_id: &WorkerId,
        work_date: NaiveDate,
    ) -> Result<Option<RequestId>, DatabaseError> {
        let reservations = self.reservations.lock().await;
        Ok(reservations.get(&(worker_id.clone(), work_date)).copied())
    }

    // ── Audit log ───────────────────────────────────────────────────

    async fn append_log(&self, entry: &LogEntry) -> Result<(), DatabaseError> {
        self.logs.write().await.push(entry.clone());
        Ok(())
    }

    async fn list_logs(&self, request_id: RequestId) -> Result<Vec<LogEntry>, DatabaseError> {
        let logs = self.logs.read().await;
        Ok(logs
            .iter()
            .rev()
            .filter(|e| e.request_id == request_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::labour::events::{Actor, LogEventType};
    use crate::labour::model::{AssignedWorker, NewLabourRequest, RequestStatus, SlotStatus, WorkType};

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 11, 2).unwrap()
    }

    fn request() -> LabourRequest {
        LabourRequest::create(
            NewLabourRequest::new("f1", "l1", WorkType::Sowing, 2, date()),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_id() {
        let store = MemoryStore::new();
        let req = request();
        store.insert_request(&req).await.unwrap();
        assert!(matches!(
            store.insert_request(&req).await,
            Err(DatabaseError::Constraint(_))
        ));
    }

    #[tokio::test]
    async fn update_is_compare_and_swap() {
        let store = MemoryStore::new();
        let mut req = request();
        store.insert_request(&req).await.unwrap();

        let stale = req.clone();
        req.status = RequestStatus::Accepted;
        let v = store.update_request(&req).await.unwrap();
        assert_eq!(v, 1);

        let err = store.update_request(&stale).await.unwrap_err();
        assert!(matches!(err, DatabaseError::VersionConflict { expected: 0, .. }));

        let stored = store.get_request(req.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Accepted);
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn update_unknown_request_is_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.update_request(&request()).await,
            Err(DatabaseError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn reservations_are_exclusive_per_worker_and_date() {
        let store = MemoryStore::new();
        let (r1, r2) = (RequestId::new(), RequestId::new());
        let w = WorkerId::new("w1");

        assert_eq!(store.reserve_worker(&w, date(), r1).await.unwrap(), Reservation::Acquired);
        assert_eq!(store.reserve_worker(&w, date(), r1).await.unwrap(), Reservation::AlreadyHeld);
        assert!(matches!(
            store.reserve_worker(&w, date(), r2).await,
            Err(DatabaseError::ReservationHeld { .. })
        ));

        // A different date is independent.
        let next_day = date().succ_opt().unwrap();
        assert_eq!(store.reserve_worker(&w, next_day, r2).await.unwrap(), Reservation::Acquired);

        // Only the holder can release.
        assert!(!store.release_worker(&w, date(), r2).await.unwrap());
        assert!(store.release_worker(&w, date(), r1).await.unwrap());
        assert_eq!(store.reservation_holder(&w, date()).await.unwrap(), None);
        assert_eq!(store.reserve_worker(&w, date(), r2).await.unwrap(), Reservation::Acquired);
    }

    #[tokio::test]
    async fn versioned_write_reconciles_reservations() {
        let store = MemoryStore::new();
        let mut req = request();
        store.insert_request(&req).await.unwrap();
        let (w1, w2) = (WorkerId::new("w1"), WorkerId::new("w2"));

        // w1 was reserved and then lost its row to a concurrent rollback.
        store.reserve_worker(&w1, date(), req.id).await.unwrap();
        store.release_worker(&w1, date(), req.id).await.unwrap();
        req.assigned_workers.push(AssignedWorker::new(w1.clone(), Utc::now()));
        req.assigned_workers.push(AssignedWorker::new(w2.clone(), Utc::now()));
        req.version = store.update_request(&req).await.unwrap();
        assert_eq!(store.reservation_holder(&w1, date()).await.unwrap(), Some(req.id));
        assert_eq!(store.reservation_holder(&w2, date()).await.unwrap(), Some(req.id));

        req.assigned_workers[1].status = SlotStatus::Cancelled;
        req.version = store.update_request(&req).await.unwrap();
        assert_eq!(store.reservation_holder(&w2, date()).await.unwrap(), None);
        assert_eq!(store.reservation_holder(&w1, date()).await.unwrap(), Some(req.id));
    }

    #[tokio::test]
    async fn versioned_write_refuses_worker_held_elsewhere() {
        let store = MemoryStore::new();
        let mut req = request();
        store.insert_request(&req).await.unwrap();
        let other = RequestId::new();
        store.reserve_worker(&"w1".into(), date(), other).await.unwrap();

        req.assigned_workers.push(AssignedWorker::new("w1".into(), Utc::now()));
        assert!(matches!(
            store.update_request(&req).await,
            Err(DatabaseError::ReservationHeld { .. })
        ));
        let stored = store.get_request(req.id).await.unwrap().unwrap();
        assert_eq!(stored.version, 0);
        assert!(stored.assigned_workers.is_empty());
        assert_eq!(store.reservation_holder(&"w1".into(), date()).await.unwrap(), Some(other));
    }

    #[tokio::test]
    async fn list_for_worker_and_open() {
        let store = MemoryStore::new();
        let mut a = request();
        a.status = RequestStatus::Assigned;
        a.assigned_workers.push(AssignedWorker::new("w1".into(), Utc::now()));
        let b = request();
        store.insert_request(&a).await.unwrap();
        store.insert_request(&b).await.unwrap();

        let for_worker = store.list_requests_for_worker(&"w1".into()).await.unwrap();
        assert_eq!(for_worker.len(), 1);
        assert_eq!(for_worker[0].id, a.id);

        let open = store.list_open_requests().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(store.list_requests(&RequestFilter::farmer("f1")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn logs_newest_first() {
        let store = MemoryStore::new();
        let id = RequestId::new();
        let first = LogEntry::new(id, Actor::Farmer, LogEventType::RequestCreated, Utc::now());
        let second = LogEntry::new(id, Actor::Coordinator, LogEventType::CoordinatorAccepted, Utc::now());
        store.append_log(&first).await.unwrap();
        store
            .append_log(&LogEntry::new(RequestId::new(), Actor::System, LogEventType::RequestFailed, Utc::now()))
            .await
            .unwrap();
        store.append_log(&second).await.unwrap();

        let logs = store.list_logs(id).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].event, LogEventType::CoordinatorAccepted);
        assert_eq!(logs[1].event, LogEventType::RequestCreated);
    }
}
