//! `LabourStore` trait: single async interface for all persistence.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;

use crate::error::DatabaseError;
use crate::labour::events::LogEntry;
use crate::labour::model::{
    CoordinatorId, FarmerId, LabourRequest, RequestId, RequestStatus, WorkerId,
};

/// Outcome of a successful reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// A new `(worker, date)` row now belongs to the request.
    Acquired,
    /// The request already held this reservation.
    AlreadyHeld,
}

/// Lookup filter over the indexed request fields. Empty fields match anything.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestFilter {
    #[serde(default)]
    pub farmer_id: Option<FarmerId>,
    #[serde(default)]
    pub coordinator_id: Option<CoordinatorId>,
    #[serde(default)]
    pub work_date: Option<NaiveDate>,
    #[serde(default)]
    pub district: Option<String>,
    #[serde(default)]
    pub status: Option<RequestStatus>,
}

impl RequestFilter {
    pub fn farmer(farmer_id: impl Into<FarmerId>) -> Self {
        Self {
            farmer_id: Some(farmer_id.into()),
            ..Self::default()
        }
    }

    pub fn coordinator(coordinator_id: impl Into<CoordinatorId>) -> Self {
        Self {
            coordinator_id: Some(coordinator_id.into()),
            ..Self::default()
        }
    }

    pub fn work_date(date: NaiveDate) -> Self {
        Self {
            work_date: Some(date),
            ..Self::default()
        }
    }

    pub fn district(district: impl Into<String>) -> Self {
        Self {
            district: Some(district.into()),
            ..Self::default()
        }
    }

    /// Builder: narrow to one status.
    pub fn with_status(mut self, status: RequestStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, request: &LabourRequest) -> bool {
        self.farmer_id.as_ref().is_none_or(|f| f == &request.farmer_id)
            && self
                .coordinator_id
                .as_ref()
                .is_none_or(|c| request.coordinator_id.as_ref() == Some(c))
            && self.work_date.is_none_or(|d| d == request.work_date)
            && self
                .district
                .as_ref()
                .is_none_or(|d| d.eq_ignore_ascii_case(&request.location.district))
            && self.status.is_none_or(|s| s == request.status)
    }
}

/// Backend-agnostic persistence for requests, reservations and the audit log.
#[async_trait]
pub trait LabourStore: Send + Sync {
    // ── Requests ────────────────────────────────────────────────────

    /// Insert a new request. Fails with `Constraint` if the id exists.
    async fn insert_request(&self, request: &LabourRequest) -> Result<(), DatabaseError>;

    async fn get_request(&self, id: RequestId) -> Result<Option<LabourRequest>, DatabaseError>;

    /// Compare-and-swap write. `request.version` must equal the stored
    /// version; returns the new version. Fails with `VersionConflict`
    /// when another writer got there first.
    ///
    /// In the same atomic step the request's reservations are made to match
    /// [`LabourRequest::reserved_workers`]: missing rows are taken, rows of
    /// ended slots are dropped. Fails with `ReservationHeld`, writing
    /// nothing, when one of those workers is held by another request.
    async fn update_request(&self, request: &LabourRequest) -> Result<u64, DatabaseError>;

    /// Requests matching a filter, ordered by work date then creation time.
    async fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<LabourRequest>, DatabaseError>;

    /// Requests where the worker holds any slot.
    async fn list_requests_for_worker(
        &self,
        worker_id: &WorkerId,
    ) -> Result<Vec<LabourRequest>, DatabaseError>;

    /// Requests in accepted, assigned or in_progress.
    async fn list_open_requests(&self) -> Result<Vec<LabourRequest>, DatabaseError>;

    // ── Reservations ────────────────────────────────────────────────

    /// Atomically reserve a worker for a date. Fails with `ReservationHeld`
    /// when another request holds it.
    async fn reserve_worker(
        &self,
        worker_id: &WorkerId,
        work_date: NaiveDate,
        request_id: RequestId,
    ) -> Result<Reservation, DatabaseError>;

    /// Release a reservation held by this request. Returns whether a row was removed.
    async fn release_worker(
        &self,
        worker_id: &WorkerId,
        work_date: NaiveDate,
        request_id: RequestId,
    ) -> Result<bool, DatabaseError>;

    async fn reservation_holder(
        &self,
        worker_id: &WorkerId,
        work_date: NaiveDate,
    ) -> Result<Option<RequestId>, DatabaseError>;

    // ── Audit log ───────────────────────────────────────────────────

    async fn append_log(&self, entry: &LogEntry) -> Result<(), DatabaseError>;

    /// Log entries for a request, newest first.
    async fn list_logs(&self, request_id: RequestId) -> Result<Vec<LogEntry>, DatabaseError>;
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::labour::model::{Location, NewLabourRequest, WorkType};

    fn request() -> LabourRequest {
        LabourRequest::create(
            NewLabourRequest::new(
                "farmer-1",
                "land-1",
                WorkType::Harvesting,
                3,
                NaiveDate::from_ymd_opt(2026, 11, 2).unwrap(),
            )
            .with_location(Location {
                district: "Coimbatore".into(),
                area: "Pollachi".into(),
                coordinates: None,
            }),
            Utc::now(),
        )
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(RequestFilter::default().matches(&request()));
    }

    #[test]
    fn filter_fields_combine() {
        let req = request();
        assert!(RequestFilter::farmer("farmer-1").matches(&req));
        assert!(!RequestFilter::farmer("farmer-2").matches(&req));
        assert!(RequestFilter::district("coimbatore").matches(&req));
        assert!(
            RequestFilter::farmer("farmer-1")
                .with_status(RequestStatus::Pending)
                .matches(&req)
        );
        assert!(
            !RequestFilter::farmer("farmer-1")
                .with_status(RequestStatus::Accepted)
                .matches(&req)
        );
        // No coordinator yet.
        assert!(!RequestFilter::coordinator("c1").matches(&req));
    }
}
