//! Staffing evaluation: pure computations over a request's slot list.

use serde::Serialize;

use super::model::LabourRequest;

/// Number of slots that count toward staffing (assigned, confirmed, completed).
pub fn active_count(request: &LabourRequest) -> u32 {
    request
        .assigned_workers
        .iter()
        .filter(|s| s.status.counts_toward_staffing())
        .count() as u32
}

pub fn is_fully_staffed(request: &LabourRequest) -> bool {
    active_count(request) >= request.workers_needed
}

/// Snapshot of a request's staffing level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Staffing {
    pub active: u32,
    pub needed: u32,
}

impl Staffing {
    pub fn evaluate(request: &LabourRequest) -> Self {
        Self {
            active: active_count(request),
            needed: request.workers_needed,
        }
    }

    pub fn is_fully_staffed(&self) -> bool {
        self.active >= self.needed
    }

    /// Workers still missing.
    pub fn shortfall(&self) -> u32 {
        self.needed.saturating_sub(self.active)
    }
}
