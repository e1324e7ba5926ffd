//! Labour request fulfillment: lifecycle, staffing, standby and replacement.

pub mod assignment;
pub mod clock;
pub mod directory;
pub mod events;
pub mod lifecycle;
pub mod model;
pub mod replacement;
pub mod routes;
pub mod service;
pub mod staffing;
pub mod standby;
pub mod txn;

pub use clock::{Clock, ManualClock, SystemClock};
pub use directory::{CoordinatorRecord, InMemoryWorkerDirectory, WorkerDirectory, WorkerRecord};
pub use events::{Actor, LabourEvent, LogEntry, LogEventType};
pub use model::{
    AssignedWorker, CoordinatorId, FarmerId, LabourRequest, NewLabourRequest, RequestId,
    RequestStatus, SlotStatus, WorkType, WorkerId,
};
pub use routes::labour_routes;
pub use service::{LabourService, Suggestions, spawn_shortfall_sweep};
