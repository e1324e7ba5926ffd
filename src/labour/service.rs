//! Labour service: the operations exposed to transports.
//!
//! Every mutating operation runs as a [`RequestTxn`] against the latest
//! stored version of one request: load, apply, compare-and-swap write.
//! Writers inside this process are serialized per request; writers in other
//! processes sharing the store are caught by the version check and retried
//! up to `max_write_retries` times before `ConcurrentModification` is
//! returned. The store reconciles reservations with the written slots as
//! part of that write; audit records and events are only appended and
//! broadcast after it lands.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::assignment::AssignmentEngine;
use super::clock::Clock;
use super::directory::{WorkerDirectory, WorkerRecord};
use super::events::{Actor, EventBus, LabourEvent, LogEntry, LogEventType};
use super::lifecycle::{self, SHORTFALL_FAILURE_REASON};
use super::model::{
    CoordinatorId, LabourRequest, NewLabourRequest, RequestId, RequestStatus, WorkerId,
};
use super::replacement::{self, ReplacementCoordinator};
use super::staffing;
use super::standby;
use super::txn::RequestTxn;
use crate::config::LabourConfig;
use crate::error::{DatabaseError, LabourError};
use crate::store::{LabourStore, RequestFilter};

/// Directory workers suggested beyond the standby pool.
const MAX_SUGGESTIONS: usize = 5;

/// One logical mutation, re-applied from scratch on every attempt.
#[derive(Debug, Clone)]
enum Command {
    Accept { coordinator_id: CoordinatorId },
    Decline {
        coordinator_id: CoordinatorId,
        reason: Option<String>,
    },
    Assign { worker_id: WorkerId },
    AssignBatch { workers: Vec<WorkerId> },
    Enqueue { worker_id: WorkerId },
    Confirm { worker_id: WorkerId },
    CancelSlot { worker_id: WorkerId, reason: String },
    NoShow { worker_id: WorkerId },
    CompleteSlot { worker_id: WorkerId },
    Replace {
        old_worker: WorkerId,
        new_worker: WorkerId,
        reason: Option<String>,
    },
    Start,
    FarmerConfirm {
        rating: Option<u8>,
        feedback: Option<String>,
    },
    Complete,
    Cancel { reason: String, actor: Actor },
    Feedback {
        rating: u8,
        feedback: Option<String>,
    },
    ResolveShortfall,
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Self::Accept { .. } => "accept",
            Self::Decline { .. } => "decline",
            Self::Assign { .. } => "assign",
            Self::AssignBatch { .. } => "assign_batch",
            Self::Enqueue { .. } => "enqueue_standby",
            Self::Confirm { .. } => "confirm_worker",
            Self::CancelSlot { .. } => "cancel_worker_slot",
            Self::NoShow { .. } => "mark_no_show",
            Self::CompleteSlot { .. } => "complete_worker",
            Self::Replace { .. } => "replace_worker",
            Self::Start => "start_work",
            Self::FarmerConfirm { .. } => "farmer_confirm",
            Self::Complete => "complete_work",
            Self::Cancel { .. } => "cancel_request",
            Self::Feedback { .. } => "submit_feedback",
            Self::ResolveShortfall => "resolve_shortfall",
        }
    }
}

/// Replacement candidates for a request.
#[derive(Debug, Clone, Serialize)]
pub struct Suggestions {
    /// Usable standby workers, in queue order.
    pub standby: Vec<WorkerRecord>,
    /// Other roster workers with the right skill, most reliable first.
    pub available: Vec<WorkerRecord>,
}

pub struct LabourService {
    store: Arc<dyn LabourStore>,
    engine: Arc<AssignmentEngine>,
    replacement: ReplacementCoordinator,
    clock: Arc<dyn Clock>,
    config: LabourConfig,
    events: EventBus,
    locks: Mutex<HashMap<RequestId, Arc<Mutex<()>>>>,
}

impl LabourService {
    pub fn new(
        store: Arc<dyn LabourStore>,
        directory: Arc<dyn WorkerDirectory>,
        clock: Arc<dyn Clock>,
        config: LabourConfig,
    ) -> Self {
        let engine = Arc::new(AssignmentEngine::new(store.clone(), directory));
        let replacement =
            ReplacementCoordinator::new(engine.clone(), config.shortfall_window_delta());
        Self {
            store,
            engine,
            replacement,
            clock,
            events: EventBus::new(config.event_capacity),
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to events from writes that commit after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<LabourEvent> {
        self.events.subscribe()
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    pub async fn create_request(&self, input: NewLabourRequest) -> Result<LabourRequest, LabourError> {
        input.validate(&self.config)?;
        let request = LabourRequest::create(input, self.clock.now());
        self.store.insert_request(&request).await?;

        let entry = LogEntry::new(
            request.id,
            Actor::Farmer,
            LogEventType::RequestCreated,
            request.created_at,
        )
        .with_worker_count(request.workers_needed);
        self.append_log(&entry).await;
        self.events.publish(LabourEvent::RequestCreated {
            request_id: request.id,
            farmer_id: request.farmer_id.clone(),
            workers_needed: request.workers_needed,
        });
        info!(
            request_id = %request.id,
            farmer_id = %request.farmer_id,
            work_type = %request.work_type,
            workers_needed = request.workers_needed,
            work_date = %request.work_date,
            "Labour request created"
        );
        Ok(request)
    }

    pub async fn accept_request(
        &self,
        id: RequestId,
        coordinator_id: CoordinatorId,
    ) -> Result<LabourRequest, LabourError> {
        self.execute(id, Command::Accept { coordinator_id }).await
    }

    /// The coordinator turns the request down. It moves on to the most
    /// reliable coordinator still offering the work, or fails.
    pub async fn decline_request(
        &self,
        id: RequestId,
        coordinator_id: CoordinatorId,
        reason: Option<String>,
    ) -> Result<LabourRequest, LabourError> {
        self.execute(id, Command::Decline { coordinator_id, reason }).await
    }

    pub async fn start_work(&self, id: RequestId) -> Result<LabourRequest, LabourError> {
        self.execute(id, Command::Start).await
    }

    pub async fn confirm_by_farmer(
        &self,
        id: RequestId,
        rating: Option<u8>,
        feedback: Option<String>,
    ) -> Result<LabourRequest, LabourError> {
        self.execute(id, Command::FarmerConfirm { rating, feedback })
            .await
    }

    pub async fn complete_work(&self, id: RequestId) -> Result<LabourRequest, LabourError> {
        self.execute(id, Command::Complete).await
    }

    pub async fn cancel_request(
        &self,
        id: RequestId,
        reason: impl Into<String>,
        actor: Actor,
    ) -> Result<LabourRequest, LabourError> {
        self.execute(
            id,
            Command::Cancel {
                reason: reason.into(),
                actor,
            },
        )
        .await
    }

    pub async fn submit_feedback(
        &self,
        id: RequestId,
        rating: u8,
        feedback: Option<String>,
    ) -> Result<LabourRequest, LabourError> {
        self.execute(id, Command::Feedback { rating, feedback }).await
    }

    // ── Staffing ────────────────────────────────────────────────────

    pub async fn assign_worker(
        &self,
        id: RequestId,
        worker_id: WorkerId,
    ) -> Result<LabourRequest, LabourError> {
        self.execute(id, Command::Assign { worker_id }).await
    }

    /// Assign workers in order; once the request is full the rest go to standby.
    /// All or nothing.
    pub async fn assign_workers(
        &self,
        id: RequestId,
        workers: Vec<WorkerId>,
    ) -> Result<LabourRequest, LabourError> {
        self.execute(id, Command::AssignBatch { workers }).await
    }

    pub async fn enqueue_standby(
        &self,
        id: RequestId,
        worker_id: WorkerId,
    ) -> Result<LabourRequest, LabourError> {
        self.execute(id, Command::Enqueue { worker_id }).await
    }

    pub async fn confirm_worker(
        &self,
        id: RequestId,
        worker_id: WorkerId,
    ) -> Result<LabourRequest, LabourError> {
        self.execute(id, Command::Confirm { worker_id }).await
    }

    pub async fn cancel_worker_slot(
        &self,
        id: RequestId,
        worker_id: WorkerId,
        reason: impl Into<String>,
    ) -> Result<LabourRequest, LabourError> {
        self.execute(
            id,
            Command::CancelSlot {
                worker_id,
                reason: reason.into(),
            },
        )
        .await
    }

    pub async fn mark_no_show(
        &self,
        id: RequestId,
        worker_id: WorkerId,
    ) -> Result<LabourRequest, LabourError> {
        self.execute(id, Command::NoShow { worker_id }).await
    }

    pub async fn mark_slot_completed(
        &self,
        id: RequestId,
        worker_id: WorkerId,
    ) -> Result<LabourRequest, LabourError> {
        self.execute(id, Command::CompleteSlot { worker_id }).await
    }

    pub async fn replace_worker(
        &self,
        id: RequestId,
        old_worker: WorkerId,
        new_worker: WorkerId,
        reason: Option<String>,
    ) -> Result<LabourRequest, LabourError> {
        self.execute(
            id,
            Command::Replace {
                old_worker,
                new_worker,
                reason,
            },
        )
        .await
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub async fn get_request(&self, id: RequestId) -> Result<LabourRequest, LabourError> {
        self.store
            .get_request(id)
            .await?
            .ok_or_else(|| LabourError::not_found("labour_request", id))
    }

    pub async fn list_requests(
        &self,
        filter: &RequestFilter,
    ) -> Result<Vec<LabourRequest>, LabourError> {
        Ok(self.store.list_requests(filter).await?)
    }

    /// Audit trail, newest first.
    pub async fn request_logs(&self, id: RequestId) -> Result<Vec<LogEntry>, LabourError> {
        self.get_request(id).await?;
        Ok(self.store.list_logs(id).await?)
    }

    /// Assigned, in-progress and completed requests the worker has a slot on.
    pub async fn assignments_for_worker(
        &self,
        worker_id: &WorkerId,
    ) -> Result<Vec<LabourRequest>, LabourError> {
        let requests = self.store.list_requests_for_worker(worker_id).await?;
        Ok(requests
            .into_iter()
            .filter(|r| {
                matches!(
                    r.status,
                    RequestStatus::Assigned | RequestStatus::InProgress | RequestStatus::Completed
                )
            })
            .collect())
    }

    pub async fn suggest_replacements(&self, id: RequestId) -> Result<Suggestions, LabourError> {
        let request = self.get_request(id).await?;
        let directory = self.engine.directory();

        let mut standby = Vec::new();
        for worker_id in &request.standby_workers {
            if let Some(worker) = directory.get_worker(worker_id).await? {
                if worker.active && worker.availability.is_available_on(request.work_date) {
                    standby.push(worker);
                }
            }
        }

        let mut available = Vec::new();
        if let Some(coordinator_id) = &request.coordinator_id {
            for worker in directory.roster(coordinator_id).await? {
                let eligible = worker.active
                    && worker.has_skill(request.work_type)
                    && worker.availability.is_available_on(request.work_date)
                    && request.slot_index(&worker.id).is_none()
                    && !request.in_standby(&worker.id);
                if !eligible {
                    continue;
                }
                if self
                    .store
                    .reservation_holder(&worker.id, request.work_date)
                    .await?
                    .is_some()
                {
                    continue;
                }
                available.push(worker);
            }
        }
        available.sort_by(|a, b| b.reliability_score.cmp(&a.reliability_score));
        available.truncate(MAX_SUGGESTIONS);

        let entry = LogEntry::new(
            request.id,
            Actor::Coordinator,
            LogEventType::ReplacementSuggested,
            self.clock.now(),
        )
        .with_coordinator(request.coordinator_id.clone())
        .with_worker_count((standby.len() + available.len()) as u32);
        self.append_log(&entry).await;

        debug!(
            request_id = %id,
            standby = standby.len(),
            available = available.len(),
            "Replacement suggestions built"
        );
        Ok(Suggestions { standby, available })
    }

    // ── Shortfall sweep ─────────────────────────────────────────────

    /// Promote queued standby into open capacity on every understaffed
    /// request, then fail those whose shortfall outlived its deadline.
    /// Returns the ids that were failed.
    pub async fn sweep_shortfalls(&self) -> Result<Vec<RequestId>, LabourError> {
        let window = self.config.shortfall_window_delta();
        let now = self.clock.now();
        let candidates: Vec<RequestId> = self
            .store
            .list_open_requests()
            .await?
            .into_iter()
            .filter(|r| replacement::needs_sweep(r, window, now))
            .map(|r| r.id)
            .collect();

        if candidates.is_empty() {
            debug!("No staffing shortfalls to resolve");
            return Ok(Vec::new());
        }

        let mut failed = Vec::new();
        for id in candidates {
            match self.execute(id, Command::ResolveShortfall).await {
                Ok(request) if request.status == RequestStatus::Failed => failed.push(id),
                Ok(_) => {}
                Err(e) => {
                    warn!(request_id = %id, error = %e, "Failed to escalate staffing shortfall");
                }
            }
        }
        info!(count = failed.len(), "Shortfall sweep complete");
        Ok(failed)
    }

    // ── Transaction plumbing ────────────────────────────────────────

    async fn request_lock(&self, id: RequestId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(id).or_default().clone()
    }

    /// Drop the map entry once no other caller holds or waits on it.
    async fn release_lock(&self, id: RequestId, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        // One reference in the map, one here.
        let idle = Arc::strong_count(&lock) == 2
            && locks.get(&id).is_some_and(|held| Arc::ptr_eq(held, &lock));
        if idle {
            locks.remove(&id);
        }
    }

    async fn execute(&self, id: RequestId, command: Command) -> Result<LabourRequest, LabourError> {
        let lock = self.request_lock(id).await;
        let result = {
            let _guard = lock.lock().await;
            self.run(id, &command).await
        };
        self.release_lock(id, lock).await;
        result
    }

    async fn run(&self, id: RequestId, command: &Command) -> Result<LabourRequest, LabourError> {
        let attempts = self.config.max_write_retries.max(1);
        for attempt in 1..=attempts {
            let current = self
                .store
                .get_request(id)
                .await?
                .ok_or_else(|| LabourError::not_found("labour_request", id))?;
            let mut txn = RequestTxn::new(current, self.clock.now(), self.clock.today());

            if let Err(e) = self.apply(&mut txn, command).await {
                self.rollback(&txn).await;
                debug!(request_id = %id, op = command.name(), error = %e, "Operation rejected");
                return Err(e);
            }
            if !txn.is_dirty() {
                return Ok(txn.into_request());
            }

            txn.touch();
            match self.store.update_request(txn.request()).await {
                Ok(version) => return Ok(self.commit(txn, version).await),
                Err(DatabaseError::VersionConflict { expected, .. }) => {
                    debug!(
                        request_id = %id,
                        op = command.name(),
                        attempt,
                        expected,
                        "Version conflict, retrying"
                    );
                    self.rollback(&txn).await;
                }
                Err(DatabaseError::NotFound { entity, id }) => {
                    self.rollback(&txn).await;
                    return Err(LabourError::NotFound { entity, id });
                }
                Err(DatabaseError::ReservationHeld {
                    worker_id,
                    work_date,
                    held_by,
                }) => {
                    self.rollback(&txn).await;
                    return Err(LabourError::DoubleBooking {
                        worker_id: worker_id.into(),
                        work_date,
                        held_by,
                    });
                }
                Err(e) => {
                    self.rollback(&txn).await;
                    return Err(e.into());
                }
            }
        }

        warn!(request_id = %id, op = command.name(), attempts, "Giving up after repeated version conflicts");
        Err(LabourError::ConcurrentModification {
            request_id: id,
            attempts,
        })
    }

    async fn apply(&self, txn: &mut RequestTxn, command: &Command) -> Result<(), LabourError> {
        match command {
            Command::Accept { coordinator_id } => lifecycle::accept(txn, coordinator_id.clone()),
            Command::Decline { coordinator_id, reason } => {
                let candidates = self.engine.directory().coordinators().await?;
                let mut declined = txn.request().declined_by.clone();
                declined.push(coordinator_id.clone());
                let successor = lifecycle::next_coordinator(&candidates, txn.request().work_type, &declined);
                lifecycle::decline(txn, coordinator_id.clone(), reason.clone(), successor)
            }
            Command::Assign { worker_id } => self
                .engine
                .assign(txn, worker_id, Actor::Coordinator)
                .await
                .map(|_| ()),
            Command::AssignBatch { workers } => {
                if workers.is_empty() {
                    return Err(LabourError::validation("workers", "at least one worker is required"));
                }
                for worker_id in workers {
                    if staffing::is_fully_staffed(txn.request()) {
                        self.enqueue(txn, worker_id).await?;
                    } else {
                        self.engine.assign(txn, worker_id, Actor::Coordinator).await?;
                    }
                }
                Ok(())
            }
            Command::Enqueue { worker_id } => {
                if !txn.status().accepts_staffing() {
                    return Err(LabourError::StateTransition {
                        request_id: txn.id(),
                        current: txn.status(),
                        attempted: "enqueue standby".into(),
                    });
                }
                self.replacement.promote_standby(txn).await?;
                if staffing::is_fully_staffed(txn.request()) {
                    self.enqueue(txn, worker_id).await
                } else {
                    // Capacity is open and nobody is queued ahead.
                    self.replacement
                        .place(txn, worker_id, Actor::Coordinator)
                        .await
                }
            }
            Command::Confirm { worker_id } => self.engine.confirm(txn, worker_id),
            Command::CancelSlot { worker_id, reason } => {
                let vacancy = self.engine.unassign(txn, worker_id, reason)?;
                self.replacement.backfill(txn, vacancy).await.map(|_| ())
            }
            Command::NoShow { worker_id } => {
                let vacancy = self.engine.mark_no_show(txn, worker_id)?;
                self.replacement.backfill(txn, vacancy).await.map(|_| ())
            }
            Command::CompleteSlot { worker_id } => self.engine.mark_completed(txn, worker_id),
            Command::Replace {
                old_worker,
                new_worker,
                reason,
            } => self
                .engine
                .replace(txn, old_worker, new_worker, reason.as_deref())
                .await
                .map(|_| ()),
            Command::Start => lifecycle::start_work(txn),
            Command::FarmerConfirm { rating, feedback } => {
                lifecycle::confirm_by_farmer(txn, *rating, feedback.clone())
            }
            Command::Complete => lifecycle::complete_work(txn),
            Command::Cancel { reason, actor } => lifecycle::cancel(txn, reason, *actor),
            Command::Feedback { rating, feedback } => {
                lifecycle::submit_feedback(txn, *rating, feedback.clone())
            }
            Command::ResolveShortfall => {
                let promoted = self.replacement.promote_standby(txn).await?;
                if promoted > 0 {
                    info!(request_id = %txn.id(), promoted, "Standby promoted by sweep");
                }
                let window = self.config.shortfall_window_delta();
                if replacement::shortfall_expired(txn.request(), window, txn.now()) {
                    lifecycle::fail(txn, SHORTFALL_FAILURE_REASON)?;
                }
                Ok(())
            }
        }
    }

    /// Queue a known, active worker on standby.
    async fn enqueue(&self, txn: &mut RequestTxn, worker_id: &WorkerId) -> Result<(), LabourError> {
        if !txn.status().accepts_staffing() {
            return Err(LabourError::StateTransition {
                request_id: txn.id(),
                current: txn.status(),
                attempted: "enqueue standby".into(),
            });
        }
        self.engine.check_worker(worker_id).await?;
        standby::enqueue(txn.request_mut(), worker_id.clone())?;

        let entry = txn
            .log_entry(Actor::Coordinator, LogEventType::StandbyAdded)
            .with_worker(worker_id.clone());
        txn.log(entry);
        info!(
            request_id = %txn.id(),
            worker_id = %worker_id,
            queued = txn.request().standby_workers.len(),
            "Worker added to standby"
        );
        Ok(())
    }

    /// Undo reservations taken by an attempt that did not land.
    ///
    /// A reservation the committed request now relies on is left alone. A
    /// concurrent writer on the same request whose row is dropped here gets
    /// it back from its own versioned write.
    async fn rollback(&self, txn: &RequestTxn) {
        if txn.acquired().is_empty() {
            return;
        }
        let committed = match self.store.get_request(txn.id()).await {
            Ok(found) => found,
            Err(e) => {
                warn!(request_id = %txn.id(), error = %e, "Could not reload request for rollback");
                None
            }
        };
        let work_date = txn.request().work_date;
        for worker_id in txn.acquired() {
            let relied_on = committed
                .as_ref()
                .is_some_and(|r| r.active_workers().any(|w| w == worker_id));
            if relied_on {
                continue;
            }
            if let Err(e) = self.store.release_worker(worker_id, work_date, txn.id()).await {
                warn!(
                    request_id = %txn.id(),
                    worker_id = %worker_id,
                    error = %e,
                    "Failed to release reservation on rollback"
                );
            }
        }
    }

    /// Apply the side effects of a landed write.
    async fn commit(&self, txn: RequestTxn, version: u64) -> LabourRequest {
        let (mut request, effects) = txn.finish();
        request.version = version;

        for entry in &effects.logs {
            self.append_log(entry).await;
        }
        for event in effects.events {
            self.events.publish(event);
        }
        info!(
            request_id = %request.id,
            status = %request.status,
            active = staffing::active_count(&request),
            needed = request.workers_needed,
            standby = request.standby_workers.len(),
            version,
            "Labour request updated"
        );
        request
    }

    async fn append_log(&self, entry: &LogEntry) {
        if let Err(e) = self.store.append_log(entry).await {
            warn!(request_id = %entry.request_id, error = %e, "Failed to append labour log");
        }
    }
}

/// Spawn the periodic shortfall sweep. The first tick fires immediately.
pub fn spawn_shortfall_sweep(service: Arc<LabourService>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Shortfall sweep started (interval: {}s)", interval.as_secs());

        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            match service.sweep_shortfalls().await {
                Ok(failed) if !failed.is_empty() => {
                    warn!(count = failed.len(), "Requests failed for unresolved shortfall");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Shortfall sweep failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, NaiveDate, TimeZone, Utc};

    use super::*;
    use crate::labour::clock::ManualClock;
    use crate::labour::directory::{
        CoordinatorRecord, InMemoryWorkerDirectory, WeeklyAvailability, WorkerRecord,
    };
    use crate::labour::model::{SlotStatus, WorkType};
    use crate::store::{MemoryStore, Reservation};

    fn work_date() -> NaiveDate {
        // A Monday.
        NaiveDate::from_ymd_opt(2026, 11, 2).unwrap()
    }

    fn early() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 28, 9, 0, 0).unwrap()
    }

    fn directory() -> InMemoryWorkerDirectory {
        InMemoryWorkerDirectory::with_workers([
            WorkerRecord::new("a", "c1", "A").with_skills([WorkType::Harvesting]).with_reliability(70),
            WorkerRecord::new("b", "c1", "B").with_skills([WorkType::Harvesting]).with_reliability(90),
            WorkerRecord::new("c", "c1", "C").with_skills([WorkType::Harvesting]).with_reliability(40),
            WorkerRecord::new("d", "c1", "D").with_skills([WorkType::Sowing]),
            WorkerRecord::new("e", "c1", "E")
                .with_skills([WorkType::Harvesting])
                .with_availability(WeeklyAvailability {
                    monday: false,
                    ..WeeklyAvailability::default()
                }),
            WorkerRecord::new("f", "c2", "F").with_skills([WorkType::Harvesting]),
        ])
        .with_coordinators([
            CoordinatorRecord::new("c1", "One").with_skills([WorkType::Harvesting]).with_reliability(60),
            CoordinatorRecord::new("c2", "Two").with_skills([WorkType::Harvesting]).with_reliability(90),
            CoordinatorRecord::new("c3", "Three").with_skills([WorkType::Sowing]).with_reliability(99),
        ])
    }

    fn service_with(store: Arc<dyn LabourStore>, clock: Arc<ManualClock>) -> LabourService {
        LabourService::new(store, Arc::new(directory()), clock, LabourConfig::default())
    }

    fn service() -> (LabourService, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(early()));
        (service_with(Arc::new(MemoryStore::new()), clock.clone()), clock)
    }

    async fn accepted(service: &LabourService, needed: u32) -> RequestId {
        let req = service
            .create_request(NewLabourRequest::new("farmer-1", "land-1", WorkType::Harvesting, needed, work_date()))
            .await
            .unwrap();
        service.accept_request(req.id, "c1".into()).await.unwrap();
        req.id
    }

    async fn pending(service: &LabourService) -> RequestId {
        service
            .create_request(NewLabourRequest::new("farmer-1", "land-1", WorkType::Harvesting, 2, work_date()))
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn declined_request_moves_down_the_coordinator_list() {
        let (service, _) = service();
        let id = pending(&service).await;
        let mut rx = service.subscribe();

        let req = service
            .decline_request(id, "c2".into(), Some("fully booked".into()))
            .await
            .unwrap();
        assert_eq!(req.status, RequestStatus::Pending);
        assert_eq!(req.coordinator_id, Some("c1".into()));

        // c2 no longer has a say; c1 does.
        let err = service.accept_request(id, "c2".into()).await.unwrap_err();
        assert_eq!(err.kind(), "validation_error");
        let event = rx.try_recv().unwrap();
        assert!(matches!(
            event,
            LabourEvent::CoordinatorDeclined { reassigned_to: Some(ref next), .. } if next.as_str() == "c1"
        ));

        let logs = service.request_logs(id).await.unwrap();
        assert_eq!(logs[0].event, LogEventType::CoordinatorAssigned);
        assert_eq!(logs[0].coordinator_id, Some("c1".into()));
        assert_eq!(logs[1].event, LogEventType::CoordinatorDeclined);
        assert_eq!(logs[1].reason.as_deref(), Some("fully booked"));

        let req = service.accept_request(id, "c1".into()).await.unwrap();
        assert_eq!(req.status, RequestStatus::Accepted);
    }

    #[tokio::test]
    async fn last_decline_fails_the_request() {
        let (service, _) = service();
        let id = pending(&service).await;
        service.decline_request(id, "c2".into(), None).await.unwrap();
        let req = service.decline_request(id, "c1".into(), None).await.unwrap();

        assert_eq!(req.status, RequestStatus::Failed);
        assert_eq!(req.failure_reason.as_deref(), Some(lifecycle::NO_COORDINATOR_REASON));
        let logs = service.request_logs(id).await.unwrap();
        assert_eq!(logs[0].event, LogEventType::RequestFailed);
        assert_eq!(logs[0].reason.as_deref(), Some(lifecycle::NO_COORDINATOR_REASON));
        assert_eq!(logs[1].event, LogEventType::CoordinatorDeclined);

        let err = service.decline_request(id, "c1".into(), None).await.unwrap_err();
        assert_eq!(err.kind(), "state_transition_error");
    }

    #[tokio::test]
    async fn decline_after_acceptance_is_rejected() {
        let (service, _) = service();
        let id = accepted(&service, 1).await;
        let err = service.decline_request(id, "c1".into(), None).await.unwrap_err();
        assert_eq!(err.kind(), "state_transition_error");
        assert_eq!(service.get_request(id).await.unwrap().status, RequestStatus::Accepted);
        assert!(service.locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn create_rejects_invalid_input() {
        let (service, _) = service();
        let err = service
            .create_request(NewLabourRequest::new("f", "l", WorkType::General, 51, work_date()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[tokio::test]
    async fn operations_bump_version_and_write_audit_trail() {
        let (service, _) = service();
        let id = accepted(&service, 1).await;
        let req = service.assign_worker(id, "a".into()).await.unwrap();
        assert_eq!(req.version, 2);
        assert_eq!(req.status, RequestStatus::Assigned);

        let logs = service.request_logs(id).await.unwrap();
        let kinds: Vec<LogEventType> = logs.iter().map(|l| l.event).collect();
        assert_eq!(
            kinds,
            vec![
                LogEventType::WorkerAssigned,
                LogEventType::CoordinatorAccepted,
                LogEventType::RequestCreated
            ]
        );
        assert_eq!(logs[0].coordinator_id, Some("c1".into()));
    }

    #[tokio::test]
    async fn idempotent_confirm_skips_the_write() {
        let (service, _) = service();
        let id = accepted(&service, 1).await;
        service.assign_worker(id, "a".into()).await.unwrap();
        let first = service.confirm_worker(id, "a".into()).await.unwrap();
        let second = service.confirm_worker(id, "a".into()).await.unwrap();
        assert_eq!(first.version, second.version);
        assert_eq!(second.assigned_workers[0].status, SlotStatus::Confirmed);
    }

    #[tokio::test]
    async fn batch_assign_spills_into_standby() {
        let (service, _) = service();
        let id = accepted(&service, 2).await;
        let req = service
            .assign_workers(id, vec!["a".into(), "b".into(), "c".into()])
            .await
            .unwrap();
        assert_eq!(staffing::active_count(&req), 2);
        assert_eq!(req.standby_workers, vec![WorkerId::new("c")]);
        assert_eq!(req.status, RequestStatus::Assigned);
    }

    #[tokio::test]
    async fn failed_batch_releases_its_reservations() {
        let (service, _) = service();
        let id = accepted(&service, 3).await;
        let err = service
            .assign_workers(id, vec!["a".into(), "ghost".into()])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");

        let req = service.get_request(id).await.unwrap();
        assert!(req.assigned_workers.is_empty());
        // "a" is free for another request on the same day.
        let other = accepted(&service, 1).await;
        service.assign_worker(other, "a".into()).await.unwrap();
    }

    #[tokio::test]
    async fn standby_arriving_after_shortfall_backfills() {
        let (service, _) = service();
        let id = accepted(&service, 2).await;
        service.assign_workers(id, vec!["a".into(), "b".into()]).await.unwrap();
        let req = service.cancel_worker_slot(id, "a".into(), "sick").await.unwrap();
        assert!(req.shortfall_since.is_some());

        let req = service.enqueue_standby(id, "c".into()).await.unwrap();
        assert_eq!(staffing::active_count(&req), 2);
        assert!(req.shortfall_since.is_none());
        assert_eq!(req.assigned_workers[0].replaced_by, Some("c".into()));
    }

    #[tokio::test]
    async fn standby_offered_with_open_capacity_takes_a_slot() {
        let (service, _) = service();
        let id = accepted(&service, 2).await;
        service.assign_worker(id, "a".into()).await.unwrap();

        let req = service.enqueue_standby(id, "b".into()).await.unwrap();
        assert_eq!(req.status, RequestStatus::Assigned);
        assert_eq!(staffing::active_count(&req), 2);
        assert!(req.standby_workers.is_empty());

        // Once full, later offers queue as usual.
        let req = service.enqueue_standby(id, "c".into()).await.unwrap();
        assert_eq!(req.standby_workers, vec![WorkerId::new("c")]);
    }

    #[tokio::test]
    async fn standby_offered_with_open_capacity_reports_double_booking() {
        let (service, _) = service();
        let busy = accepted(&service, 1).await;
        service.assign_worker(busy, "b".into()).await.unwrap();
        let id = accepted(&service, 2).await;

        let err = service.enqueue_standby(id, "b".into()).await.unwrap_err();
        assert_eq!(err.kind(), "double_booking");
        let req = service.get_request(id).await.unwrap();
        assert!(req.standby_workers.is_empty());
        assert!(req.assigned_workers.is_empty());
    }

    #[tokio::test]
    async fn sweep_promotes_standby_left_beside_open_capacity() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(early()));
        let service = service_with(store.clone(), clock.clone());
        let id = accepted(&service, 2).await;
        service.assign_worker(id, "a".into()).await.unwrap();

        // A pool written before promotion on enqueue existed.
        let mut stored = store.get_request(id).await.unwrap().unwrap();
        stored.standby_workers.push_back("b".into());
        store.update_request(&stored).await.unwrap();

        clock.set(Utc.with_ymd_and_hms(2026, 11, 2, 6, 0, 0).unwrap());
        assert!(service.sweep_shortfalls().await.unwrap().is_empty());
        let req = service.get_request(id).await.unwrap();
        assert_eq!(req.status, RequestStatus::Assigned);
        assert_eq!(staffing::active_count(&req), 2);
        assert!(req.standby_workers.is_empty());
        assert_eq!(store.reservation_holder(&"b".into(), work_date()).await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn sweep_fails_when_queued_standby_cannot_be_placed() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(early()));
        let service = service_with(store.clone(), clock.clone());
        let id = accepted(&service, 2).await;
        service.assign_worker(id, "a".into()).await.unwrap();

        let mut stored = store.get_request(id).await.unwrap().unwrap();
        stored.standby_workers.push_back("ghost".into());
        store.update_request(&stored).await.unwrap();

        clock.set(Utc.with_ymd_and_hms(2026, 11, 2, 6, 0, 0).unwrap());
        assert_eq!(service.sweep_shortfalls().await.unwrap(), vec![id]);
        assert_eq!(service.get_request(id).await.unwrap().status, RequestStatus::Failed);
    }

    #[tokio::test]
    async fn request_locks_are_pruned_after_each_operation() {
        let (service, _) = service();
        for _ in 0..100 {
            let err = service.confirm_worker(RequestId::new(), "a".into()).await.unwrap_err();
            assert_eq!(err.kind(), "not_found");
        }
        assert!(service.locks.lock().await.is_empty());

        let id = accepted(&service, 1).await;
        service.assign_worker(id, "a".into()).await.unwrap();
        service.confirm_worker(id, "a".into()).await.unwrap();
        let err = service.assign_worker(id, "b".into()).await.unwrap_err();
        assert_eq!(err.kind(), "capacity_exceeded");
        assert!(service.locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn request_locks_survive_while_callers_queue() {
        let (service, _) = service();
        let service = Arc::new(service);
        let id = accepted(&service, 5).await;

        let mut handles = Vec::new();
        for w in ["a", "b", "c"] {
            let service = service.clone();
            handles.push(tokio::spawn(async move { service.assign_worker(id, w.into()).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(staffing::active_count(&service.get_request(id).await.unwrap()), 3);
        assert!(service.locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn cancelled_slot_frees_worker_for_other_requests() {
        let (service, _) = service();
        let first = accepted(&service, 2).await;
        let second = accepted(&service, 1).await;
        service.assign_worker(first, "a".into()).await.unwrap();
        let err = service.assign_worker(second, "a".into()).await.unwrap_err();
        assert_eq!(err.kind(), "double_booking");

        service.cancel_worker_slot(first, "a".into(), "moved").await.unwrap();
        service.assign_worker(second, "a".into()).await.unwrap();
    }

    #[tokio::test]
    async fn suggestions_rank_by_reliability() {
        let (service, _) = service();
        let id = accepted(&service, 1).await;
        service.assign_worker(id, "a".into()).await.unwrap();
        service.enqueue_standby(id, "d".into()).await.unwrap();

        let suggestions = service.suggest_replacements(id).await.unwrap();
        assert_eq!(suggestions.standby.len(), 1);
        let available: Vec<&str> = suggestions.available.iter().map(|w| w.id.as_str()).collect();
        // a holds a slot, d is queued, e is off on Mondays, f belongs to c2.
        assert_eq!(available, vec!["b", "c"]);

        let logs = service.request_logs(id).await.unwrap();
        assert_eq!(logs[0].event, LogEventType::ReplacementSuggested);
    }

    #[tokio::test]
    async fn worker_assignments_view() {
        let (service, _) = service();
        let staffed = accepted(&service, 1).await;
        service.assign_worker(staffed, "a".into()).await.unwrap();
        let partial = accepted(&service, 2).await;
        service.assign_worker(partial, "b".into()).await.unwrap();

        let mine = service.assignments_for_worker(&"a".into()).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, staffed);
        // Still accepted: not listed yet.
        assert!(service.assignments_for_worker(&"b".into()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_fails_expired_shortfalls_only() {
        let (service, clock) = service();
        let short = accepted(&service, 2).await;
        service.assign_worker(short, "a".into()).await.unwrap();
        let covered = accepted(&service, 1).await;
        service.assign_worker(covered, "b".into()).await.unwrap();

        assert!(service.sweep_shortfalls().await.unwrap().is_empty());

        clock.set(Utc.with_ymd_and_hms(2026, 11, 1, 12, 0, 0).unwrap());
        let failed = service.sweep_shortfalls().await.unwrap();
        assert_eq!(failed, vec![short]);
        let req = service.get_request(short).await.unwrap();
        assert_eq!(req.status, RequestStatus::Failed);
        assert_eq!(req.failure_reason.as_deref(), Some(SHORTFALL_FAILURE_REASON));
        assert_eq!(service.get_request(covered).await.unwrap().status, RequestStatus::Assigned);
    }

    #[tokio::test]
    async fn events_follow_commits() {
        let (service, _) = service();
        let mut rx = service.subscribe();
        let id = accepted(&service, 1).await;
        service.assign_worker(id, "a".into()).await.unwrap();

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.request_id(), id);
            names.push(event.name());
        }
        assert_eq!(
            names,
            vec![
                "request.created",
                "request.status_changed",
                "request.assigned_changed",
                "request.status_changed"
            ]
        );
    }

    /// Store whose CAS write loses a fixed number of times, and which can
    /// play another writer's reservation moves just before the next write.
    #[derive(Default)]
    struct ContendedStore {
        inner: MemoryStore,
        conflicts: AtomicU32,
        drop_before_write: std::sync::Mutex<Option<WorkerId>>,
        steal_before_write: std::sync::Mutex<Option<(WorkerId, RequestId)>>,
    }

    #[async_trait]
    impl LabourStore for ContendedStore {
        async fn insert_request(&self, request: &LabourRequest) -> Result<(), DatabaseError> {
            self.inner.insert_request(request).await
        }
        async fn get_request(&self, id: RequestId) -> Result<Option<LabourRequest>, DatabaseError> {
            self.inner.get_request(id).await
        }
        async fn update_request(&self, request: &LabourRequest) -> Result<u64, DatabaseError> {
            let dropped = self.drop_before_write.lock().unwrap().take();
            if let Some(worker_id) = dropped {
                self.inner.release_worker(&worker_id, request.work_date, request.id).await?;
            }
            let stolen = self.steal_before_write.lock().unwrap().take();
            if let Some((worker_id, thief)) = stolen {
                self.inner.reserve_worker(&worker_id, request.work_date, thief).await?;
            }
            if self.conflicts.load(Ordering::SeqCst) > 0 {
                self.conflicts.fetch_sub(1, Ordering::SeqCst);
                return Err(DatabaseError::VersionConflict {
                    id: request.id.to_string(),
                    expected: request.version,
                });
            }
            self.inner.update_request(request).await
        }
        async fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<LabourRequest>, DatabaseError> {
            self.inner.list_requests(filter).await
        }
        async fn list_requests_for_worker(
            &self,
            worker_id: &WorkerId,
        ) -> Result<Vec<LabourRequest>, DatabaseError> {
            self.inner.list_requests_for_worker(worker_id).await
        }
        async fn list_open_requests(&self) -> Result<Vec<LabourRequest>, DatabaseError> {
            self.inner.list_open_requests().await
        }
        async fn reserve_worker(
            &self,
            worker_id: &WorkerId,
            work_date: NaiveDate,
            request_id: RequestId,
        ) -> Result<Reservation, DatabaseError> {
            self.inner.reserve_worker(worker_id, work_date, request_id).await
        }
        async fn release_worker(
            &self,
            worker_id: &WorkerId,
            work_date: NaiveDate,
            request_id: RequestId,
        ) -> Result<bool, DatabaseError> {
            self.inner.release_worker(worker_id, work_date, request_id).await
        }
        async fn reservation_holder(
            &self,
            worker_id: &WorkerId,
            work_date: NaiveDate,
        ) -> Result<Option<RequestId>, DatabaseError> {
            self.inner.reservation_holder(worker_id, work_date).await
        }
        async fn append_log(&self, entry: &LogEntry) -> Result<(), DatabaseError> {
            self.inner.append_log(entry).await
        }
        async fn list_logs(&self, request_id: RequestId) -> Result<Vec<LogEntry>, DatabaseError> {
            self.inner.list_logs(request_id).await
        }
    }

    #[tokio::test]
    async fn version_conflicts_retry_then_surface() {
        let store = Arc::new(ContendedStore::default());
        let clock = Arc::new(ManualClock::new(early()));
        let service = service_with(store.clone(), clock);
        let id = accepted(&service, 1).await;

        // A couple of lost races are absorbed.
        store.conflicts.store(2, Ordering::SeqCst);
        let req = service.assign_worker(id, "a".into()).await.unwrap();
        assert_eq!(req.assigned_workers.len(), 1);

        // Persistent contention surfaces as a retryable error, with no leaked reservation.
        store.conflicts.store(100, Ordering::SeqCst);
        let err = service.cancel_worker_slot(id, "a".into(), "sick").await.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(
            err,
            LabourError::ConcurrentModification { attempts: 8, .. }
        ));
        let req = service.get_request(id).await.unwrap();
        assert_eq!(req.assigned_workers[0].status, SlotStatus::Assigned);
        assert_eq!(
            store.reservation_holder(&"a".into(), work_date()).await.unwrap(),
            Some(id)
        );
    }

    #[tokio::test]
    async fn write_restores_reservation_dropped_by_a_sibling_rollback() {
        let store = Arc::new(ContendedStore::default());
        let service = service_with(store.clone(), Arc::new(ManualClock::new(early())));
        let id = accepted(&service, 2).await;

        // Another writer on this request reserved "a" first, so this attempt
        // sees the row as already held; that writer then rolls back.
        store.reserve_worker(&"a".into(), work_date(), id).await.unwrap();
        *store.drop_before_write.lock().unwrap() = Some("a".into());

        let req = service.assign_worker(id, "a".into()).await.unwrap();
        assert!(req.holds_staffing_slot(&"a".into()));
        assert_eq!(store.reservation_holder(&"a".into(), work_date()).await.unwrap(), Some(id));

        let other = accepted(&service, 1).await;
        let err = service.assign_worker(other, "a".into()).await.unwrap_err();
        assert_eq!(err.kind(), "double_booking");
    }

    #[tokio::test]
    async fn write_loses_to_a_booking_taken_after_its_reservation_vanished() {
        let store = Arc::new(ContendedStore::default());
        let service = service_with(store.clone(), Arc::new(ManualClock::new(early())));
        let id = accepted(&service, 2).await;
        let thief = RequestId::new();

        store.reserve_worker(&"a".into(), work_date(), id).await.unwrap();
        *store.drop_before_write.lock().unwrap() = Some("a".into());
        *store.steal_before_write.lock().unwrap() = Some(("a".into(), thief));

        let err = service.assign_worker(id, "a".into()).await.unwrap_err();
        assert!(matches!(err, LabourError::DoubleBooking { ref held_by, .. } if *held_by == thief.to_string()));
        let req = service.get_request(id).await.unwrap();
        assert!(req.assigned_workers.is_empty());
        assert_eq!(store.reservation_holder(&"a".into(), work_date()).await.unwrap(), Some(thief));
    }
}
