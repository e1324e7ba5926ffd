//! Persistence layer: labour requests, worker reservations and the audit log.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use memory::MemoryStore;
pub use traits::{LabourStore, RequestFilter, Reservation};
