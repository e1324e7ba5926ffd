//! Error types for farmhand.

use chrono::NaiveDate;

use crate::labour::model::{RequestId, RequestStatus, SlotStatus, WorkerId};

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Labour error: {0}")]
    Labour(#[from] LabourError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Compare-and-swap write lost against a newer version.
    #[error("Version conflict on {id}: expected version {expected}")]
    VersionConflict { id: String, expected: u64 },

    /// The `(worker, date)` reservation already belongs to another request.
    #[error("Worker {worker_id} already reserved on {work_date} by request {held_by}")]
    ReservationHeld {
        worker_id: String,
        work_date: NaiveDate,
        held_by: String,
    },
}

/// Labour-request errors returned by every core operation.
#[derive(Debug, thiserror::Error)]
pub enum LabourError {
    #[error("Invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("Cannot {attempted} request {request_id} in state {current}")]
    StateTransition {
        request_id: RequestId,
        current: RequestStatus,
        attempted: String,
    },

    #[error("Request {request_id} already has {workers_needed} active workers")]
    CapacityExceeded {
        request_id: RequestId,
        workers_needed: u32,
    },

    #[error("Worker {worker_id} is already booked on {work_date} by request {held_by}")]
    DoubleBooking {
        worker_id: WorkerId,
        work_date: NaiveDate,
        held_by: String,
    },

    #[error("Worker {worker_id} is already on request {request_id}")]
    DuplicateWorker {
        request_id: RequestId,
        worker_id: WorkerId,
    },

    #[error("Cannot {operation} worker {worker_id} on request {request_id}: slot is {status}")]
    InvalidSlotState {
        request_id: RequestId,
        worker_id: WorkerId,
        status: SlotStatus,
        operation: String,
    },

    #[error("Request {request_id} was modified concurrently ({attempts} attempts)")]
    ConcurrentModification { request_id: RequestId, attempts: u32 },

    #[error("{entity} {id} not found")]
    NotFound { entity: String, id: String },

    #[error("Standby pool for request {request_id} is empty")]
    StandbyEmpty { request_id: RequestId },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl LabourError {
    /// Shorthand for a field validation failure.
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a missing entity.
    pub fn not_found(entity: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Only concurrent-modification failures are safe to retry blindly.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. })
    }

    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::StateTransition { .. } => "state_transition_error",
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::DoubleBooking { .. } => "double_booking",
            Self::DuplicateWorker { .. } => "duplicate_worker",
            Self::InvalidSlotState { .. } => "invalid_slot_state",
            Self::ConcurrentModification { .. } => "concurrent_modification",
            Self::NotFound { .. } => "not_found",
            Self::StandbyEmpty { .. } => "standby_empty",
            Self::Database(_) => "database_error",
        }
    }
}

/// Result type alias for farmhand.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_concurrent_modification_is_retryable() {
        let id = RequestId::new();
        assert!(
            LabourError::ConcurrentModification {
                request_id: id,
                attempts: 3
            }
            .is_retryable()
        );
        assert!(
            !LabourError::CapacityExceeded {
                request_id: id,
                workers_needed: 2
            }
            .is_retryable()
        );
        assert!(!LabourError::validation("workers_needed", "too many").is_retryable());
    }

    #[test]
    fn state_transition_names_both_states() {
        let err = LabourError::StateTransition {
            request_id: RequestId::new(),
            current: RequestStatus::Completed,
            attempted: "cancelled".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("cancelled"));
        assert!(msg.contains("completed"));
        assert_eq!(err.kind(), "state_transition_error");
    }

    #[test]
    fn database_errors_convert() {
        let err: LabourError = DatabaseError::Query("boom".into()).into();
        assert_eq!(err.kind(), "database_error");
        let top: Error = err.into();
        assert!(top.to_string().contains("boom"));
    }
}
