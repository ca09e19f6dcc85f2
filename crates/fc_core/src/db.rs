use crate::app_error::{AppError, AppResult};
use rusqlite::Connection;
use std::fs;
use std::path::Path;

const MIGRATIONS: &[(i64, &str)] = &[(1, include_str!("../migrations/0001_init.sql"))];

pub const LATEST_SCHEMA_VERSION: i64 = 1;

fn migration_error(message: &str, version: i64, e: &rusqlite::Error) -> AppError {
    AppError::new(
        "FC_DB_MIGRATION_FAILED",
        "db",
        message,
        false,
        serde_json::json!({ "error": e.to_string(), "version": version }),
    )
}

pub fn open_db(db_path: &Path) -> AppResult<Connection> {
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            AppError::new(
                "FC_DB_OPEN_FAILED",
                "db",
                "failed to create database parent directory",
                false,
                serde_json::json!({ "error": e.to_string() }),
            )
        })?;
    }

    let conn = Connection::open(db_path).map_err(|e| {
        AppError::new(
            "FC_DB_OPEN_FAILED",
            "db",
            "failed to open sqlite database",
            false,
            serde_json::json!({ "error": e.to_string(), "path": db_path }),
        )
    })?;
    prepare_connection(&conn)?;
    Ok(conn)
}

/// Fresh in-memory store with the full schema; used by tests and dry runs.
pub fn open_db_in_memory() -> AppResult<Connection> {
    let conn = Connection::open_in_memory()
        .map_err(|e| AppError::db("FC_DB_OPEN_FAILED", "db", "failed to open in-memory database", &e))?;
    prepare_connection(&conn)?;
    Ok(conn)
}

fn prepare_connection(conn: &Connection) -> AppResult<()> {
    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(|e| AppError::db("FC_DB_OPEN_FAILED", "db", "failed to enable foreign_keys pragma", &e))?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(|e| AppError::db("FC_DB_OPEN_FAILED", "db", "failed to set busy timeout", &e))?;
    apply_migrations(conn)
}

pub fn apply_migrations(conn: &Connection) -> AppResult<()> {
    let current = schema_version(conn)?;
    if current > LATEST_SCHEMA_VERSION {
        return Err(AppError::new(
            "FC_DB_SCHEMA_INCOMPATIBLE",
            "db",
            "database schema version is newer than supported",
            false,
            serde_json::json!({ "current": current, "latest": LATEST_SCHEMA_VERSION }),
        ));
    }

    for (version, sql) in MIGRATIONS {
        if schema_version(conn)? >= *version {
            continue;
        }
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| migration_error("failed to begin migration transaction", *version, &e))?;
        tx.execute_batch(sql)
            .map_err(|e| migration_error("failed to apply migration", *version, &e))?;
        tx.pragma_update(None, "user_version", *version)
            .map_err(|e| migration_error("failed to set schema user_version", *version, &e))?;
        tx.commit()
            .map_err(|e| migration_error("failed to commit migration transaction", *version, &e))?;
        tracing::debug!(version = *version, "applied schema migration");
    }

    Ok(())
}

pub fn schema_version(conn: &Connection) -> AppResult<i64> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(|e| AppError::db("FC_DB_SCHEMA_INCOMPATIBLE", "db", "failed to read schema version", &e))
}
