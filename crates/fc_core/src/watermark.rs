//! Per-remote exchange positions.
//!
//! `last_exported_*` moves only when a remote acknowledges a package, so an unacknowledged
//! incremental build can be rebuilt and resent. `last_imported_*` moves inside the apply
//! transaction of a package that carried a manifest.

use crate::app_error::{AppError, AppResult};
use crate::types::SyncWatermark;
use rusqlite::{params, Connection, OptionalExtension, Row};

const COLUMNS: &str = "remote_instance_id, last_exported_at_utc, last_exported_package_id, \
     last_imported_at_utc, last_imported_package_id, updated_at_utc";

fn from_row(row: &Row<'_>) -> rusqlite::Result<SyncWatermark> {
    Ok(SyncWatermark {
        remote_instance_id: row.get(0)?,
        last_exported_at_utc: row.get(1)?,
        last_exported_package_id: row.get(2)?,
        last_imported_at_utc: row.get(3)?,
        last_imported_package_id: row.get(4)?,
        updated_at_utc: row.get(5)?,
    })
}

pub fn watermark_get(conn: &Connection, remote_instance_id: &str) -> AppResult<Option<SyncWatermark>> {
    conn.query_row(
        &format!("SELECT {} FROM sync_watermarks WHERE remote_instance_id=?1", COLUMNS),
        [remote_instance_id],
        from_row,
    )
    .optional()
    .map_err(|e| AppError::db("FC_DB_QUERY_FAILED", "watermark", "failed to read watermark", &e))
}

pub fn watermark_list(conn: &Connection) -> AppResult<Vec<SyncWatermark>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM sync_watermarks ORDER BY remote_instance_id ASC",
            COLUMNS
        ))
        .map_err(|e| AppError::db("FC_DB_QUERY_FAILED", "watermark", "failed to prepare watermark query", &e))?;
    let rows = stmt
        .query_map([], from_row)
        .map_err(|e| AppError::db("FC_DB_QUERY_FAILED", "watermark", "failed to query watermarks", &e))?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| AppError::db("FC_DB_QUERY_FAILED", "watermark", "failed to read watermark row", &e))
}

/// Records that `remote_instance_id` holds everything up to `max_updated_at_utc`. Positions
/// never move backwards: acknowledging an older package is a no-op.
pub fn watermark_record_export(
    conn: &Connection,
    remote_instance_id: &str,
    package_id: &str,
    max_updated_at_utc: &str,
    now_utc: &str,
) -> AppResult<()> {
    conn.execute(
        "INSERT INTO sync_watermarks (remote_instance_id, last_exported_at_utc,
           last_exported_package_id, updated_at_utc)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(remote_instance_id) DO UPDATE SET
           last_exported_at_utc=excluded.last_exported_at_utc,
           last_exported_package_id=excluded.last_exported_package_id,
           updated_at_utc=excluded.updated_at_utc
         WHERE sync_watermarks.last_exported_at_utc IS NULL
            OR sync_watermarks.last_exported_at_utc <= excluded.last_exported_at_utc",
        params![remote_instance_id, max_updated_at_utc, package_id, now_utc],
    )
    .map_err(|e| AppError::db("FC_DB_WRITE_FAILED", "watermark", "failed to record export watermark", &e))?;
    Ok(())
}

pub fn watermark_record_import(
    conn: &Connection,
    remote_instance_id: &str,
    package_id: &str,
    max_updated_at_utc: &str,
    now_utc: &str,
) -> AppResult<()> {
    conn.execute(
        "INSERT INTO sync_watermarks (remote_instance_id, last_imported_at_utc,
           last_imported_package_id, updated_at_utc)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(remote_instance_id) DO UPDATE SET
           last_imported_at_utc=excluded.last_imported_at_utc,
           last_imported_package_id=excluded.last_imported_package_id,
           updated_at_utc=excluded.updated_at_utc
         WHERE sync_watermarks.last_imported_at_utc IS NULL
            OR sync_watermarks.last_imported_at_utc <= excluded.last_imported_at_utc",
        params![remote_instance_id, max_updated_at_utc, package_id, now_utc],
    )
    .map_err(|e| AppError::db("FC_DB_WRITE_FAILED", "watermark", "failed to record import watermark", &e))?;
    Ok(())
}
