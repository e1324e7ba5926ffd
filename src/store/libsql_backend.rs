//! libSQL backend: async `LabourStore` implementation.
//!
//! Requests are stored as a JSON body plus denormalized index columns.
//! Writes are compare-and-swap on the `version` column; worker reservations
//! are rows keyed by `(worker_id, work_date)` so the primary key enforces
//! one request per worker per day across every process sharing the file.
//! A versioned write and the reservation rows it implies commit together
//! in one `BEGIN IMMEDIATE` transaction.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, TransactionBehavior, params};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::labour::events::LogEntry;
use crate::labour::model::{LabourRequest, RequestId, WorkerId};
use crate::store::migrations;
use crate::store::traits::{LabourStore, Reservation, RequestFilter};

/// Attempts at reserving before giving up on a row that keeps vanishing.
const RESERVE_ATTEMPTS: usize = 3;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
/// Reservation and request writes take `write_gate` so no statement from
/// another task lands inside an open transaction on the shared connection.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_gate: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            write_gate: Mutex::new(()),
        };
        migrations::upgrade(backend.conn()).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            write_gate: Mutex::new(()),
        };
        migrations::upgrade(backend.conn()).await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_requests(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<LabourRequest>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut requests = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => requests.push(row_to_request(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
            }
        }
        Ok(requests)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width RFC 3339 so text ordering matches time ordering.
fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Serialize a unit enum to its serde string form.
fn enum_str<T: Serialize>(value: &T) -> Result<String, DatabaseError> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => Ok(s),
        Ok(other) => Err(DatabaseError::Serialization(format!(
            "expected string enum, got {other}"
        ))),
        Err(e) => Err(DatabaseError::Serialization(e.to_string())),
    }
}

/// Map a `SELECT body` row to a request.
fn row_to_request(row: &libsql::Row) -> Result<LabourRequest, DatabaseError> {
    let body: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("request row: {e}")))?;
    serde_json::from_str(&body)
        .map_err(|e| DatabaseError::Serialization(format!("request body: {e}")))
}

fn row_to_log(row: &libsql::Row) -> Result<LogEntry, DatabaseError> {
    let body: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("log row: {e}")))?;
    serde_json::from_str(&body).map_err(|e| DatabaseError::Serialization(format!("log body: {e}")))
}

/// Current holder of a `(worker, date)` reservation.
async fn holder_of(
    conn: &Connection,
    worker_id: &WorkerId,
    work_date: NaiveDate,
) -> Result<Option<RequestId>, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT request_id FROM worker_reservations WHERE worker_id = ?1 AND work_date = ?2",
            params![worker_id.as_str(), work_date.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("reservation_holder: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => {
            let holder: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("reservation_holder row: {e}")))?;
            let id = holder.parse::<RequestId>().map_err(|e| {
                DatabaseError::Serialization(format!("reservation request id '{holder}': {e}"))
            })?;
            Ok(Some(id))
        }
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("reservation_holder: {e}"))),
    }
}

/// Body of a versioned write; runs inside the caller's transaction.
async fn write_versioned(
    conn: &Connection,
    request: &LabourRequest,
    next: &LabourRequest,
    body: String,
) -> Result<(), DatabaseError> {
    let affected = conn
        .execute(
            "UPDATE labour_requests SET coordinator_id = ?1, status = ?2, version = ?3, body = ?4, updated_at = ?5 WHERE id = ?6 AND version = ?7",
            params![
                opt_text(next.coordinator_id.as_ref().map(|c| c.as_str())),
                next.status.as_str(),
                next.version as i64,
                body,
                timestamp(next.updated_at),
                next.id.to_string(),
                request.version as i64,
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("update_request: {e}")))?;

    if affected == 0 {
        let mut rows = conn
            .query(
                "SELECT version FROM labour_requests WHERE id = ?1",
                params![request.id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_request: {e}")))?;
        return match rows.next().await {
            Ok(Some(_)) => {
                debug!(id = %request.id, expected = request.version, "Version conflict");
                Err(DatabaseError::VersionConflict {
                    id: request.id.to_string(),
                    expected: request.version,
                })
            }
            Ok(None) => Err(DatabaseError::NotFound {
                entity: "labour_request".into(),
                id: request.id.to_string(),
            }),
            Err(e) => Err(DatabaseError::Query(format!("update_request: {e}"))),
        };
    }

    let date = request.work_date.to_string();
    let keep: HashSet<&str> = request.reserved_workers().map(|w| w.as_str()).collect();
    for worker_id in &keep {
        let inserted = conn
            .execute(
                "INSERT INTO worker_reservations (worker_id, work_date, request_id, reserved_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(worker_id, work_date) DO NOTHING",
                params![*worker_id, date.as_str(), request.id.to_string(), timestamp(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_request reserve: {e}")))?;
        if inserted == 1 {
            debug!(request_id = %request.id, worker_id = %worker_id, "Reservation restored by versioned write");
            continue;
        }
        let worker = WorkerId::new(*worker_id);
        if let Some(holder) = holder_of(conn, &worker, request.work_date).await? {
            if holder != request.id {
                return Err(DatabaseError::ReservationHeld {
                    worker_id: worker.to_string(),
                    work_date: request.work_date,
                    held_by: holder.to_string(),
                });
            }
        }
    }

    let mut rows = conn
        .query(
            "SELECT worker_id FROM worker_reservations WHERE request_id = ?1",
            params![request.id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("update_request held: {e}")))?;
    let mut stale = Vec::new();
    loop {
        match rows.next().await {
            Ok(Some(row)) => {
                let worker_id: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("update_request held row: {e}")))?;
                if !keep.contains(worker_id.as_str()) {
                    stale.push(worker_id);
                }
            }
            Ok(None) => break,
            Err(e) => return Err(DatabaseError::Query(format!("update_request held: {e}"))),
        }
    }
    for worker_id in stale {
        conn.execute(
            "DELETE FROM worker_reservations WHERE worker_id = ?1 AND request_id = ?2",
            params![worker_id.as_str(), request.id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("update_request release: {e}")))?;
        debug!(request_id = %request.id, worker_id = %worker_id, "Worker released");
    }
    Ok(())
}

// ── Trait implementation ────────────────────────────────────────────

const OPEN_STATUSES: &str = "('accepted', 'assigned', 'in_progress')";

#[async_trait]
impl LabourStore for LibSqlBackend {
    // ── Requests ────────────────────────────────────────────────────

    async fn insert_request(&self, request: &LabourRequest) -> Result<(), DatabaseError> {
        let body = serde_json::to_string(request)
            .map_err(|e| DatabaseError::Serialization(format!("insert_request: {e}")))?;

        self.conn()
            .execute(
                "INSERT INTO labour_requests (id, farmer_id, land_id, coordinator_id, work_type, status, work_date, district, version, body, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    request.id.to_string(),
                    request.farmer_id.as_str(),
                    request.land_id.as_str(),
                    opt_text(request.coordinator_id.as_ref().map(|c| c.as_str())),
                    request.work_type.as_str(),
                    request.status.as_str(),
                    request.work_date.to_string(),
                    request.location.district.as_str(),
                    request.version as i64,
                    body,
                    timestamp(request.created_at),
                    timestamp(request.updated_at),
                ],
            )
            .await
            .map_err(|e| match e.to_string() {
                msg if msg.contains("UNIQUE") => {
                    DatabaseError::Constraint(format!("labour request {} already exists", request.id))
                }
                msg => DatabaseError::Query(format!("insert_request: {msg}")),
            })?;

        debug!(request_id = %request.id, "Labour request inserted");
        Ok(())
    }

    async fn get_request(&self, id: RequestId) -> Result<Option<LabourRequest>, DatabaseError> {
        let mut found = self
            .query_requests(
                "get_request",
                "SELECT body FROM labour_requests WHERE id = ?1",
                params![id.to_string()],
            )
            .await?;
        Ok(found.pop())
    }

    async fn update_request(&self, request: &LabourRequest) -> Result<u64, DatabaseError> {
        let mut next = request.clone();
        next.version = request.version + 1;
        let body = serde_json::to_string(&next)
            .map_err(|e| DatabaseError::Serialization(format!("update_request: {e}")))?;

        let _gate = self.write_gate.lock().await;
        let tx = self
            .conn()
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(|e| DatabaseError::Query(format!("update_request begin: {e}")))?;

        match write_versioned(&tx, request, &next, body).await {
            Ok(()) => {
                tx.commit()
                    .await
                    .map_err(|e| DatabaseError::Query(format!("update_request commit: {e}")))?;
                Ok(next.version)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(request_id = %request.id, error = %rollback, "Rollback of versioned write failed");
                }
                Err(e)
            }
        }
    }

    async fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<LabourRequest>, DatabaseError> {
        self.query_requests(
            "list_requests",
            "SELECT body FROM labour_requests
             WHERE (?1 IS NULL OR farmer_id = ?1)
               AND (?2 IS NULL OR coordinator_id = ?2)
               AND (?3 IS NULL OR work_date = ?3)
               AND (?4 IS NULL OR district = ?4 COLLATE NOCASE)
               AND (?5 IS NULL OR status = ?5)
             ORDER BY work_date ASC, created_at ASC",
            params![
                opt_text(filter.farmer_id.as_ref().map(|f| f.as_str())),
                opt_text(filter.coordinator_id.as_ref().map(|c| c.as_str())),
                opt_text(filter.work_date.map(|d| d.to_string()).as_deref()),
                opt_text(filter.district.as_deref()),
                opt_text(filter.status.map(|s| s.as_str())),
            ],
        )
        .await
    }

    async fn list_requests_for_worker(
        &self,
        worker_id: &WorkerId,
    ) -> Result<Vec<LabourRequest>, DatabaseError> {
        self.query_requests(
            "list_requests_for_worker",
            "SELECT body FROM labour_requests
             WHERE EXISTS (
                 SELECT 1 FROM json_each(labour_requests.body, '$.assigned_workers') AS slot
                 WHERE json_extract(slot.value, '$.worker_id') = ?1
             )
             ORDER BY work_date ASC, created_at ASC",
            params![worker_id.as_str()],
        )
        .await
    }

    async fn list_open_requests(&self) -> Result<Vec<LabourRequest>, DatabaseError> {
        self.query_requests(
            "list_open_requests",
            &format!(
                "SELECT body FROM labour_requests WHERE status IN {OPEN_STATUSES} ORDER BY work_date ASC, created_at ASC"
            ),
            (),
        )
        .await
    }

    // ── Reservations ────────────────────────────────────────────────

    async fn reserve_worker(
        &self,
        worker_id: &WorkerId,
        work_date: NaiveDate,
        request_id: RequestId,
    ) -> Result<Reservation, DatabaseError> {
        let _gate = self.write_gate.lock().await;
        for _ in 0..RESERVE_ATTEMPTS {
            let inserted = self
                .conn()
                .execute(
                    "INSERT INTO worker_reservations (worker_id, work_date, request_id, reserved_at) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(worker_id, work_date) DO NOTHING",
                    params![
                        worker_id.as_str(),
                        work_date.to_string(),
                        request_id.to_string(),
                        timestamp(Utc::now()),
                    ],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("reserve_worker: {e}")))?;

            if inserted == 1 {
                debug!(worker_id = %worker_id, %work_date, %request_id, "Worker reserved");
                return Ok(Reservation::Acquired);
            }

            match holder_of(self.conn(), worker_id, work_date).await? {
                Some(holder) if holder == request_id => return Ok(Reservation::AlreadyHeld),
                Some(holder) => {
                    return Err(DatabaseError::ReservationHeld {
                        worker_id: worker_id.to_string(),
                        work_date,
                        held_by: holder.to_string(),
                    });
                }
                // Released between our insert and lookup; try again.
                None => continue,
            }
        }

        warn!(worker_id = %worker_id, %work_date, "Reservation row kept changing hands");
        Err(DatabaseError::Constraint(format!(
            "could not settle reservation for worker {worker_id} on {work_date}"
        )))
    }

    async fn release_worker(
        &self,
        worker_id: &WorkerId,
        work_date: NaiveDate,
        request_id: RequestId,
    ) -> Result<bool, DatabaseError> {
        let _gate = self.write_gate.lock().await;
        let removed = self
            .conn()
            .execute(
                "DELETE FROM worker_reservations WHERE worker_id = ?1 AND work_date = ?2 AND request_id = ?3",
                params![worker_id.as_str(), work_date.to_string(), request_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_worker: {e}")))?;

        if removed > 0 {
            debug!(worker_id = %worker_id, %work_date, %request_id, "Worker released");
        }
        Ok(removed > 0)
    }

    async fn reservation_holder(
        &self,
        worker_id: &WorkerId,
        work_date: NaiveDate,
    ) -> Result<Option<RequestId>, DatabaseError> {
        holder_of(self.conn(), worker_id, work_date).await
    }

    // ── Audit log ───────────────────────────────────────────────────

    async fn append_log(&self, entry: &LogEntry) -> Result<(), DatabaseError> {
        let body = serde_json::to_string(entry)
            .map_err(|e| DatabaseError::Serialization(format!("append_log: {e}")))?;

        self.conn()
            .execute(
                "INSERT INTO labour_logs (id, request_id, actor, event, body, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    entry.id.to_string(),
                    entry.request_id.to_string(),
                    enum_str(&entry.actor)?,
                    enum_str(&entry.event)?,
                    body,
                    timestamp(entry.timestamp),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_log: {e}")))?;
        Ok(())
    }

    async fn list_logs(&self, request_id: RequestId) -> Result<Vec<LogEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT body FROM labour_logs WHERE request_id = ?1 ORDER BY created_at DESC, rowid DESC",
                params![request_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_logs: {e}")))?;

        let mut logs = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => logs.push(row_to_log(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("list_logs: {e}"))),
            }
        }
        Ok(logs)
    }
}
