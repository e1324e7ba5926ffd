//! Labour request data model: ids, enums, request and slot records.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::LabourConfig;
use crate::error::LabourError;

/// Globally unique labour request identifier (UUID v4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for RequestId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

macro_rules! reference_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

reference_id!(
    /// Reference to a farmer account.
    FarmerId
);
reference_id!(
    /// Reference to a land record.
    LandId
);
reference_id!(
    /// Reference to a labour coordinator.
    CoordinatorId
);
reference_id!(
    /// Reference to a worker in the worker directory.
    WorkerId
);

/// The kind of farm work a request is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkType {
    LandPreparation,
    Sowing,
    Transplanting,
    Weeding,
    Fertilizing,
    PestControl,
    Irrigation,
    Harvesting,
    PostHarvest,
    General,
}

impl WorkType {
    pub const ALL: [WorkType; 10] = [
        Self::LandPreparation,
        Self::Sowing,
        Self::Transplanting,
        Self::Weeding,
        Self::Fertilizing,
        Self::PestControl,
        Self::Irrigation,
        Self::Harvesting,
        Self::PostHarvest,
        Self::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LandPreparation => "land_preparation",
            Self::Sowing => "sowing",
            Self::Transplanting => "transplanting",
            Self::Weeding => "weeding",
            Self::Fertilizing => "fertilizing",
            Self::PestControl => "pest_control",
            Self::Irrigation => "irrigation",
            Self::Harvesting => "harvesting",
            Self::PostHarvest => "post_harvest",
            Self::General => "general",
        }
    }

    /// Human-readable label ("Land Preparation").
    pub fn label(&self) -> &'static str {
        match self {
            Self::LandPreparation => "Land Preparation",
            Self::Sowing => "Sowing",
            Self::Transplanting => "Transplanting",
            Self::Weeding => "Weeding",
            Self::Fertilizing => "Fertilizing",
            Self::PestControl => "Pest Control",
            Self::Irrigation => "Irrigation",
            Self::Harvesting => "Harvesting",
            Self::PostHarvest => "Post Harvest",
            Self::General => "General",
        }
    }
}

impl fmt::Display for WorkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkType {
    type Err = LabourError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|w| w.as_str() == s)
            .ok_or_else(|| LabourError::validation("work_type", format!("unknown work type '{s}'")))
    }
}

/// Aggregate lifecycle status of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Created by the farmer, waiting for a coordinator.
    Pending,
    /// A coordinator took the request; staffing in progress.
    Accepted,
    /// Fully staffed at least once.
    Assigned,
    /// Work has started on the work date.
    InProgress,
    Completed,
    Cancelled,
    /// Staffing could not be resolved in time.
    Failed,
}

impl RequestStatus {
    pub const ALL: [RequestStatus; 7] = [
        Self::Pending,
        Self::Accepted,
        Self::Assigned,
        Self::InProgress,
        Self::Completed,
        Self::Cancelled,
        Self::Failed,
    ];

    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: RequestStatus) -> bool {
        use RequestStatus::*;

        match target {
            Cancelled | Failed => !self.is_terminal(),
            _ => matches!(
                (self, target),
                (Pending, Accepted)
                    | (Accepted, Assigned)
                    | (Assigned, InProgress)
                    | (InProgress, Completed)
            ),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Whether workers may currently be assigned, queued or swapped.
    pub fn accepts_staffing(&self) -> bool {
        matches!(self, Self::Accepted | Self::Assigned | Self::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Assigned => "assigned",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = LabourError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| LabourError::validation("status", format!("unknown status '{s}'")))
    }
}

/// Status of one worker's slot on a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Assigned,
    Confirmed,
    Cancelled,
    Replaced,
    Completed,
    NoShow,
}

impl SlotStatus {
    /// Terminal slots are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Replaced | Self::Completed | Self::NoShow
        )
    }

    /// Holding the worker for the work date (assigned or confirmed).
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Assigned | Self::Confirmed)
    }

    /// Counted by the staffing evaluator.
    pub fn counts_toward_staffing(&self) -> bool {
        matches!(self, Self::Assigned | Self::Confirmed | Self::Completed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assigned => "assigned",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
            Self::Replaced => "replaced",
            Self::Completed => "completed",
            Self::NoShow => "no_show",
        }
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One worker's relationship to a request. Owned by the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignedWorker {
    pub worker_id: WorkerId,
    pub status: SlotStatus,
    pub assigned_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed_at: Option<DateTime<Utc>>,
    /// When the slot reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaced_by: Option<WorkerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaced_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancellation_reason: Option<String>,
}

impl AssignedWorker {
    pub fn new(worker_id: WorkerId, now: DateTime<Utc>) -> Self {
        Self {
            worker_id,
            status: SlotStatus::Assigned,
            assigned_at: now,
            confirmed_at: None,
            ended_at: None,
            replaced_by: None,
            replaced_at: None,
            cancellation_reason: None,
        }
    }
}

/// Map coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

/// Location snapshot copied from the land record at creation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    #[serde(default)]
    pub district: String,
    #[serde(default)]
    pub area: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
}

fn default_start_time() -> NaiveTime {
    NaiveTime::from_hms_opt(7, 0, 0).unwrap_or(NaiveTime::MIN)
}

const DEFAULT_DURATION_HOURS: u32 = 8;

/// Input for creating a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLabourRequest {
    pub farmer_id: FarmerId,
    pub land_id: LandId,
    pub work_type: WorkType,
    pub workers_needed: u32,
    pub work_date: NaiveDate,
    #[serde(default)]
    pub start_time: Option<NaiveTime>,
    #[serde(default)]
    pub duration_hours: Option<u32>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Location,
}

impl NewLabourRequest {
    pub fn new(
        farmer_id: impl Into<FarmerId>,
        land_id: impl Into<LandId>,
        work_type: WorkType,
        workers_needed: u32,
        work_date: NaiveDate,
    ) -> Self {
        Self {
            farmer_id: farmer_id.into(),
            land_id: land_id.into(),
            work_type,
            workers_needed,
            work_date,
            start_time: None,
            duration_hours: None,
            description: None,
            location: Location::default(),
        }
    }

    /// Builder: set start time.
    pub fn with_start_time(mut self, start: NaiveTime) -> Self {
        self.start_time = Some(start);
        self
    }

    /// Builder: set duration.
    pub fn with_duration_hours(mut self, hours: u32) -> Self {
        self.duration_hours = Some(hours);
        self
    }

    /// Builder: set description.
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    /// Builder: set location snapshot.
    pub fn with_location(mut self, location: Location) -> Self {
        self.location = location;
        self
    }

    pub fn validate(&self, config: &LabourConfig) -> Result<(), LabourError> {
        if self.farmer_id.as_str().trim().is_empty() {
            return Err(LabourError::validation("farmer_id", "is required"));
        }
        if self.land_id.as_str().trim().is_empty() {
            return Err(LabourError::validation("land_id", "is required"));
        }
        if self.workers_needed < config.min_workers || self.workers_needed > config.max_workers {
            return Err(LabourError::validation(
                "workers_needed",
                format!(
                    "{} is outside {}..={}",
                    self.workers_needed, config.min_workers, config.max_workers
                ),
            ));
        }
        if let Some(hours) = self.duration_hours {
            if !(1..=24).contains(&hours) {
                return Err(LabourError::validation(
                    "duration_hours",
                    format!("{hours} is outside 1..=24"),
                ));
            }
        }
        if let Some(c) = self.location.coordinates {
            if !(-90.0..=90.0).contains(&c.lat) || !(-180.0..=180.0).contains(&c.lng) {
                return Err(LabourError::validation(
                    "location.coordinates",
                    format!("({}, {}) is not a valid position", c.lat, c.lng),
                ));
            }
        }
        Ok(())
    }
}

/// One labour job posting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabourRequest {
    pub id: RequestId,
    pub farmer_id: FarmerId,
    pub land_id: LandId,
    pub work_type: WorkType,
    /// Fixed at creation.
    pub workers_needed: u32,
    pub work_date: NaiveDate,
    pub start_time: NaiveTime,
    pub duration_hours: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub location: Location,
    pub status: RequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinator_id: Option<CoordinatorId>,
    /// Coordinators who turned the request down, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub declined_by: Vec<CoordinatorId>,
    /// Slot arena; entries are never removed.
    #[serde(default)]
    pub assigned_workers: Vec<AssignedWorker>,
    /// FIFO standby queue.
    #[serde(default)]
    pub standby_workers: VecDeque<WorkerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinator_accepted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancellation_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Set while active staffing is below `workers_needed` with no replacement found.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shortfall_since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub farmer_confirmed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub farmer_confirmed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub farmer_rating: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub farmer_feedback: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency version, bumped by every committed write.
    #[serde(default)]
    pub version: u64,
}

impl LabourRequest {
    /// Build a pending request from validated input.
    pub fn create(input: NewLabourRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: RequestId::new(),
            farmer_id: input.farmer_id,
            land_id: input.land_id,
            work_type: input.work_type,
            workers_needed: input.workers_needed,
            work_date: input.work_date,
            start_time: input.start_time.unwrap_or_else(default_start_time),
            duration_hours: input.duration_hours.unwrap_or(DEFAULT_DURATION_HOURS),
            description: input.description.filter(|d| !d.trim().is_empty()),
            location: input.location,
            status: RequestStatus::Pending,
            coordinator_id: None,
            declined_by: Vec::new(),
            assigned_workers: Vec::new(),
            standby_workers: VecDeque::new(),
            coordinator_accepted_at: None,
            work_started_at: None,
            work_completed_at: None,
            cancelled_at: None,
            cancellation_reason: None,
            failed_at: None,
            failure_reason: None,
            shortfall_since: None,
            farmer_confirmed: false,
            farmer_confirmed_at: None,
            farmer_rating: None,
            farmer_feedback: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Shift start on the work date, in UTC.
    pub fn shift_start(&self) -> DateTime<Utc> {
        self.work_date.and_time(self.start_time).and_utc()
    }

    /// Index of the worker's most relevant slot: the live one if any, else the latest.
    pub fn slot_index(&self, worker_id: &WorkerId) -> Option<usize> {
        let mut latest = None;
        for (idx, slot) in self.assigned_workers.iter().enumerate() {
            if &slot.worker_id != worker_id {
                continue;
            }
            if !slot.status.is_terminal() {
                return Some(idx);
            }
            latest = Some(idx);
        }
        latest
    }

    pub fn slot(&self, worker_id: &WorkerId) -> Option<&AssignedWorker> {
        self.slot_index(worker_id).map(|idx| &self.assigned_workers[idx])
    }

    /// Whether the worker holds a slot that counts toward staffing.
    pub fn holds_staffing_slot(&self, worker_id: &WorkerId) -> bool {
        self.assigned_workers
            .iter()
            .any(|s| &s.worker_id == worker_id && s.status.counts_toward_staffing())
    }

    pub fn in_standby(&self, worker_id: &WorkerId) -> bool {
        self.standby_workers.iter().any(|w| w == worker_id)
    }

    /// Workers currently holding assigned or confirmed slots.
    pub fn active_workers(&self) -> impl Iterator<Item = &WorkerId> {
        self.assigned_workers
            .iter()
            .filter(|s| s.status.is_active())
            .map(|s| &s.worker_id)
    }

    /// Workers whose `(worker, work_date)` reservation this request must hold:
    /// live slots plus completed ones.
    pub fn reserved_workers(&self) -> impl Iterator<Item = &WorkerId> {
        self.assigned_workers
            .iter()
            .filter(|s| s.status.is_active() || s.status == SlotStatus::Completed)
            .map(|s| &s.worker_id)
    }
}
