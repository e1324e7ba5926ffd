//! Worker directory: read-only source of worker identity, skills and availability,
//! plus the coordinators a declined request can be handed to.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use super::model::{CoordinatorId, WorkType, WorkerId};
use crate::error::{ConfigError, LabourError};

/// Minimal identity view used to validate a worker before assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub id: WorkerId,
    pub active: bool,
}

/// Weekly availability flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyAvailability {
    pub monday: bool,
    pub tuesday: bool,
    pub wednesday: bool,
    pub thursday: bool,
    pub friday: bool,
    pub saturday: bool,
    pub sunday: bool,
}

impl Default for WeeklyAvailability {
    fn default() -> Self {
        Self {
            monday: true,
            tuesday: true,
            wednesday: true,
            thursday: true,
            friday: true,
            saturday: true,
            sunday: false,
        }
    }
}

impl WeeklyAvailability {
    pub fn is_available_on(&self, date: NaiveDate) -> bool {
        match date.weekday() {
            Weekday::Mon => self.monday,
            Weekday::Tue => self.tuesday,
            Weekday::Wed => self.wednesday,
            Weekday::Thu => self.thursday,
            Weekday::Fri => self.friday,
            Weekday::Sat => self.saturday,
            Weekday::Sun => self.sunday,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_reliability() -> u8 {
    50
}

/// Full directory record for a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub coordinator_id: CoordinatorId,
    pub name: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub skills: Vec<WorkType>,
    #[serde(default)]
    pub availability: WeeklyAvailability,
    #[serde(default = "default_true")]
    pub active: bool,
    /// 0..=100, higher is more reliable.
    #[serde(default = "default_reliability")]
    pub reliability_score: u8,
}

impl WorkerRecord {
    pub fn new(
        id: impl Into<WorkerId>,
        coordinator_id: impl Into<CoordinatorId>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            coordinator_id: coordinator_id.into(),
            name: name.into(),
            phone: String::new(),
            skills: vec![WorkType::General],
            availability: WeeklyAvailability::default(),
            active: true,
            reliability_score: default_reliability(),
        }
    }

    /// Builder: set skills.
    pub fn with_skills(mut self, skills: impl IntoIterator<Item = WorkType>) -> Self {
        self.skills = skills.into_iter().collect();
        self
    }

    /// Builder: set availability.
    pub fn with_availability(mut self, availability: WeeklyAvailability) -> Self {
        self.availability = availability;
        self
    }

    /// Builder: set reliability score (clamped to 100).
    pub fn with_reliability(mut self, score: u8) -> Self {
        self.reliability_score = score.min(100);
        self
    }

    /// Builder: set active flag.
    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    pub fn has_skill(&self, work_type: WorkType) -> bool {
        self.skills.contains(&work_type)
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            id: self.id.clone(),
            active: self.active,
        }
    }
}

/// A coordinator that can take requests for the work types it offers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorRecord {
    pub id: CoordinatorId,
    pub name: String,
    #[serde(default)]
    pub skills_offered: Vec<WorkType>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default = "default_reliability")]
    pub reliability_score: u8,
}

impl CoordinatorRecord {
    pub fn new(id: impl Into<CoordinatorId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            skills_offered: vec![WorkType::General],
            active: true,
            reliability_score: default_reliability(),
        }
    }

    pub fn with_skills(mut self, skills: impl IntoIterator<Item = WorkType>) -> Self {
        self.skills_offered = skills.into_iter().collect();
        self
    }

    pub fn with_reliability(mut self, score: u8) -> Self {
        self.reliability_score = score.min(100);
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    pub fn offers(&self, work_type: WorkType) -> bool {
        self.active && self.skills_offered.contains(&work_type)
    }
}

/// External worker directory. The core only reads from it.
#[async_trait]
pub trait WorkerDirectory: Send + Sync {
    /// Look up a worker's full record.
    async fn get_worker(&self, worker_id: &WorkerId) -> Result<Option<WorkerRecord>, LabourError>;

    /// All workers managed by a coordinator.
    async fn roster(&self, coordinator_id: &CoordinatorId) -> Result<Vec<WorkerRecord>, LabourError>;

    /// Every known coordinator, active or not.
    async fn coordinators(&self) -> Result<Vec<CoordinatorRecord>, LabourError>;

    /// Resolve a worker reference to `{id, active}`.
    async fn resolve_worker(&self, worker_id: &WorkerId) -> Result<Option<WorkerStatus>, LabourError> {
        Ok(self.get_worker(worker_id).await?.map(|w| w.status()))
    }
}

/// In-process directory backed by a map.
#[derive(Default)]
pub struct InMemoryWorkerDirectory {
    workers: RwLock<HashMap<WorkerId, WorkerRecord>>,
    coordinators: RwLock<HashMap<CoordinatorId, CoordinatorRecord>>,
}

impl InMemoryWorkerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workers(workers: impl IntoIterator<Item = WorkerRecord>) -> Self {
        Self {
            workers: RwLock::new(workers.into_iter().map(|w| (w.id.clone(), w)).collect()),
            coordinators: RwLock::default(),
        }
    }

    pub fn with_coordinators(self, coordinators: impl IntoIterator<Item = CoordinatorRecord>) -> Self {
        Self {
            coordinators: RwLock::new(coordinators.into_iter().map(|c| (c.id.clone(), c)).collect()),
            ..self
        }
    }

    /// Load a JSON array of worker records.
    pub async fn load_json(path: &Path) -> Result<Self, ConfigError> {
        let raw = tokio::fs::read_to_string(path).await?;
        let workers: Vec<WorkerRecord> = serde_json::from_str(&raw)
            .map_err(|e| ConfigError::ParseError(format!("{}: {e}", path.display())))?;
        info!(path = %path.display(), count = workers.len(), "Worker roster loaded");
        Ok(Self::with_workers(workers))
    }

    /// Add the coordinators listed in a JSON array.
    pub async fn load_coordinators_json(&self, path: &Path) -> Result<usize, ConfigError> {
        let raw = tokio::fs::read_to_string(path).await?;
        let coordinators: Vec<CoordinatorRecord> = serde_json::from_str(&raw)
            .map_err(|e| ConfigError::ParseError(format!("{}: {e}", path.display())))?;
        let count = coordinators.len();
        let mut known = self.coordinators.write().await;
        for coordinator in coordinators {
            known.insert(coordinator.id.clone(), coordinator);
        }
        info!(path = %path.display(), count, "Coordinator list loaded");
        Ok(count)
    }

    pub async fn upsert(&self, worker: WorkerRecord) {
        self.workers.write().await.insert(worker.id.clone(), worker);
    }

    pub async fn upsert_coordinator(&self, coordinator: CoordinatorRecord) {
        self.coordinators
            .write()
            .await
            .insert(coordinator.id.clone(), coordinator);
    }

    /// Flip a worker's active flag. Returns false if unknown.
    pub async fn set_active(&self, worker_id: &WorkerId, active: bool) -> bool {
        match self.workers.write().await.get_mut(worker_id) {
            Some(w) => {
                w.active = active;
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.workers.read().await.is_empty()
    }
}

#[async_trait]
impl WorkerDirectory for InMemoryWorkerDirectory {
    async fn get_worker(&self, worker_id: &WorkerId) -> Result<Option<WorkerRecord>, LabourError> {
        Ok(self.workers.read().await.get(worker_id).cloned())
    }

    async fn roster(&self, coordinator_id: &CoordinatorId) -> Result<Vec<WorkerRecord>, LabourError> {
        let workers = self.workers.read().await;
        let mut roster: Vec<WorkerRecord> = workers
            .values()
            .filter(|w| &w.coordinator_id == coordinator_id)
            .cloned()
            .collect();
        roster.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(roster)
    }

    async fn coordinators(&self) -> Result<Vec<CoordinatorRecord>, LabourError> {
        Ok(self.coordinators.read().await.values().cloned().collect())
    }
}
