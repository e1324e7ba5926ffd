//! Schema upgrades for the libSQL store.
//!
//! The schema version is kept in SQLite's `user_version` pragma. Entry `n`
//! of [`STEPS`] moves the schema from version `n` to `n + 1`, and runs in one
//! immediate transaction together with the version bump.

use libsql::{Connection, TransactionBehavior};
use tracing::{debug, info};

use crate::error::DatabaseError;

/// Schema steps, oldest first. Append only.
const STEPS: &[(&str, &str)] = &[
    (
        "requests and reservations",
        r#"
                CREATE TABLE IF NOT EXISTS labour_requests (
                    id TEXT PRIMARY KEY,
                    farmer_id TEXT NOT NULL,
                    land_id TEXT NOT NULL,
                    coordinator_id TEXT,
                    work_type TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    work_date TEXT NOT NULL,
                    district TEXT NOT NULL DEFAULT '',
                    version INTEGER NOT NULL DEFAULT 0,
                    body TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_labour_requests_farmer_status
                    ON labour_requests(farmer_id, status);
                CREATE INDEX IF NOT EXISTS idx_labour_requests_coordinator_status
                    ON labour_requests(coordinator_id, status);
                CREATE INDEX IF NOT EXISTS idx_labour_requests_date_status
                    ON labour_requests(work_date, status);
                CREATE INDEX IF NOT EXISTS idx_labour_requests_district_status
                    ON labour_requests(district, status);

                CREATE TABLE IF NOT EXISTS worker_reservations (
                    worker_id TEXT NOT NULL,
                    work_date TEXT NOT NULL,
                    request_id TEXT NOT NULL REFERENCES labour_requests(id),
                    reserved_at TEXT NOT NULL DEFAULT (datetime('now')),
                    PRIMARY KEY (worker_id, work_date)
                );
                CREATE INDEX IF NOT EXISTS idx_worker_reservations_request
                    ON worker_reservations(request_id);
        "#,
    ),
    (
        "audit log",
        r#"
                CREATE TABLE IF NOT EXISTS labour_logs (
                    id TEXT PRIMARY KEY,
                    request_id TEXT NOT NULL,
                    actor TEXT NOT NULL,
                    event TEXT NOT NULL,
                    body TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_labour_logs_request
                    ON labour_logs(request_id, created_at);
                CREATE INDEX IF NOT EXISTS idx_labour_logs_event
                    ON labour_logs(event, created_at);
        "#,
    ),
];

fn schema_error(context: &str, e: impl std::fmt::Display) -> DatabaseError {
    DatabaseError::Migration(format!("labour schema {context}: {e}"))
}

/// Bring the schema up to the version this build expects. Returns that version.
pub async fn upgrade(conn: &Connection) -> Result<u32, DatabaseError> {
    let target = STEPS.len() as u32;
    let found = schema_version(conn).await?;
    if found > target {
        return Err(schema_error(
            "check",
            format!("database is at v{found}, this build only knows v{target}"),
        ));
    }
    if found == target {
        debug!(version = found, "Labour schema current");
        return Ok(target);
    }

    for (done, (label, sql)) in STEPS.iter().enumerate().skip(found as usize) {
        let next = done as u32 + 1;
        let context = format!("step v{next} ({label})");
        info!(version = next, step = label, "Upgrading labour schema");

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(|e| schema_error(&context, e))?;
        tx.execute_batch(sql)
            .await
            .map_err(|e| schema_error(&context, e))?;
        tx.execute(&format!("PRAGMA user_version = {next}"), ())
            .await
            .map_err(|e| schema_error(&context, e))?;
        tx.commit().await.map_err(|e| schema_error(&context, e))?;
    }

    info!(from = found, to = target, "Labour schema upgraded");
    Ok(target)
}

/// Version recorded in the database file; 0 for a fresh one.
async fn schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let mut rows = conn
        .query("PRAGMA user_version", ())
        .await
        .map_err(|e| schema_error("version read", e))?;
    let Some(row) = rows.next().await.map_err(|e| schema_error("version read", e))? else {
        return Ok(0);
    };
    let raw: i64 = row.get(0).map_err(|e| schema_error("version read", e))?;
    u32::try_from(raw).map_err(|e| schema_error("version read", e))
}
