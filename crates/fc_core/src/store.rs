//! Row-level read/upsert primitives over the replica database.
//!
//! Every function takes a plain `&Connection` so it runs unchanged inside an apply
//! transaction (`Transaction` derefs to `Connection`). Reads that feed merge decisions filter
//! soft-deleted rows explicitly.

use crate::app_error::{AppError, AppResult};
use crate::types::{AttachmentRecord, ConflictRecord, ProblemRecord, ProblemTagLink, TagRecord};
use rusqlite::{params, Connection, OptionalExtension, Params, Row};

const PROBLEM_COLUMNS: &str = "problem_id, title, symptom, root_cause, solution, environment_json, \
     severity, status, created_at_utc, created_by, updated_at_utc, updated_by_instance_id, \
     is_deleted, deleted_at_utc, source_kind";
const TAG_COLUMNS: &str =
    "tag_id, name, created_at_utc, updated_at_utc, updated_by_instance_id, is_deleted, deleted_at_utc";
const LINK_COLUMNS: &str = "link_id, problem_id, tag_id, created_at_utc, updated_at_utc, \
     updated_by_instance_id, is_deleted, deleted_at_utc";
const ATTACHMENT_COLUMNS: &str = "attachment_id, problem_id, original_file_name, content_hash, \
     size_bytes, mime_type, created_at_utc, updated_at_utc, updated_by_instance_id, is_deleted, \
     deleted_at_utc";

fn read_error(message: &str, e: &rusqlite::Error) -> AppError {
    AppError::db("FC_DB_QUERY_FAILED", "store", message, e)
}

fn write_error(message: &str, e: &rusqlite::Error) -> AppError {
    AppError::db("FC_DB_WRITE_FAILED", "store", message, e)
}

fn query_all<T, P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
    map: fn(&Row<'_>) -> rusqlite::Result<T>,
) -> AppResult<Vec<T>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| read_error("failed preparing query", &e))?;
    let rows = stmt
        .query_map(params, map)
        .map_err(|e| read_error("failed running query", &e))?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| read_error("failed reading row", &e))
}

fn query_one<T, P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
    map: fn(&Row<'_>) -> rusqlite::Result<T>,
) -> AppResult<Option<T>> {
    conn.query_row(sql, params, map)
        .optional()
        .map_err(|e| read_error("failed reading row", &e))
}

fn problem_from_row(row: &Row<'_>) -> rusqlite::Result<ProblemRecord> {
    Ok(ProblemRecord {
        problem_id: row.get(0)?,
        title: row.get(1)?,
        symptom: row.get(2)?,
        root_cause: row.get(3)?,
        solution: row.get(4)?,
        environment_json: row.get(5)?,
        severity: row.get(6)?,
        status: row.get(7)?,
        created_at_utc: row.get(8)?,
        created_by: row.get(9)?,
        updated_at_utc: row.get(10)?,
        updated_by_instance_id: row.get(11)?,
        is_deleted: row.get(12)?,
        deleted_at_utc: row.get(13)?,
        source_kind: row.get(14)?,
    })
}

fn tag_from_row(row: &Row<'_>) -> rusqlite::Result<TagRecord> {
    Ok(TagRecord {
        tag_id: row.get(0)?,
        name: row.get(1)?,
        created_at_utc: row.get(2)?,
        updated_at_utc: row.get(3)?,
        updated_by_instance_id: row.get(4)?,
        is_deleted: row.get(5)?,
        deleted_at_utc: row.get(6)?,
    })
}

fn link_from_row(row: &Row<'_>) -> rusqlite::Result<ProblemTagLink> {
    Ok(ProblemTagLink {
        link_id: row.get(0)?,
        problem_id: row.get(1)?,
        tag_id: row.get(2)?,
        created_at_utc: row.get(3)?,
        updated_at_utc: row.get(4)?,
        updated_by_instance_id: row.get(5)?,
        is_deleted: row.get(6)?,
        deleted_at_utc: row.get(7)?,
    })
}

fn attachment_from_row(row: &Row<'_>) -> rusqlite::Result<AttachmentRecord> {
    Ok(AttachmentRecord {
        attachment_id: row.get(0)?,
        problem_id: row.get(1)?,
        original_file_name: row.get(2)?,
        content_hash: row.get(3)?,
        size_bytes: row.get(4)?,
        mime_type: row.get(5)?,
        created_at_utc: row.get(6)?,
        updated_at_utc: row.get(7)?,
        updated_by_instance_id: row.get(8)?,
        is_deleted: row.get(9)?,
        deleted_at_utc: row.get(10)?,
    })
}

// Problems

pub fn get_problem(conn: &Connection, problem_id: &str) -> AppResult<Option<ProblemRecord>> {
    query_one(
        conn,
        &format!("SELECT {} FROM problems WHERE problem_id=?1", PROBLEM_COLUMNS),
        [problem_id],
        problem_from_row,
    )
}

pub fn problem_exists(conn: &Connection, problem_id: &str) -> AppResult<bool> {
    Ok(query_one(
        conn,
        "SELECT 1 FROM problems WHERE problem_id=?1",
        [problem_id],
        |row| row.get::<_, i64>(0),
    )?
    .is_some())
}

/// Insert-or-replace by id; every column takes the incoming value.
pub fn upsert_problem(conn: &Connection, p: &ProblemRecord) -> AppResult<()> {
    conn.execute(
        "INSERT INTO problems (problem_id, title, symptom, root_cause, solution, environment_json,
           severity, status, created_at_utc, created_by, updated_at_utc, updated_by_instance_id,
           is_deleted, deleted_at_utc, source_kind)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
         ON CONFLICT(problem_id) DO UPDATE SET
           title=excluded.title, symptom=excluded.symptom, root_cause=excluded.root_cause,
           solution=excluded.solution, environment_json=excluded.environment_json,
           severity=excluded.severity, status=excluded.status,
           created_at_utc=excluded.created_at_utc, created_by=excluded.created_by,
           updated_at_utc=excluded.updated_at_utc,
           updated_by_instance_id=excluded.updated_by_instance_id,
           is_deleted=excluded.is_deleted, deleted_at_utc=excluded.deleted_at_utc,
           source_kind=excluded.source_kind",
        params![
            p.problem_id,
            p.title,
            p.symptom,
            p.root_cause,
            p.solution,
            p.environment_json,
            p.severity,
            p.status,
            p.created_at_utc,
            p.created_by,
            p.updated_at_utc,
            p.updated_by_instance_id,
            p.is_deleted,
            p.deleted_at_utc,
            p.source_kind
        ],
    )
    .map_err(|e| write_error("failed to upsert problem", &e))?;
    Ok(())
}

/// Problems ordered by `updated_at_utc`; `updated_after` is exclusive.
pub fn list_problems(conn: &Connection, updated_after: Option<&str>) -> AppResult<Vec<ProblemRecord>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM problems WHERE (?1 IS NULL OR updated_at_utc > ?1)
             ORDER BY updated_at_utc ASC, problem_id ASC",
            PROBLEM_COLUMNS
        ),
        [updated_after],
        problem_from_row,
    )
}

/// Rebuilds the full-text projection for one problem; deleted problems drop out of it.
pub fn refresh_problem_fts(conn: &Connection, p: &ProblemRecord) -> AppResult<()> {
    conn.execute("DELETE FROM problems_fts WHERE problem_id=?1", [&p.problem_id])
        .map_err(|e| AppError::db("FC_FTS_REFRESH_FAILED", "fts", "failed clearing FTS row", &e))?;
    if p.is_deleted {
        return Ok(());
    }
    conn.execute(
        "INSERT INTO problems_fts(problem_id, title, symptom, root_cause, solution)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![p.problem_id, p.title, p.symptom, p.root_cause, p.solution],
    )
    .map_err(|e| AppError::db("FC_FTS_REFRESH_FAILED", "fts", "failed inserting FTS row", &e))?;
    Ok(())
}

pub fn search_problems(conn: &Connection, q: &str, limit: usize) -> AppResult<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT problem_id FROM problems_fts WHERE problems_fts MATCH ?1 ORDER BY rank LIMIT ?2")
        .map_err(|e| AppError::db("FC_FTS_QUERY_FAILED", "fts", "failed to prepare FTS query", &e))?;
    let rows = stmt
        .query_map(params![q, limit as i64], |row| row.get::<_, String>(0))
        .map_err(|e| AppError::db("FC_FTS_QUERY_FAILED", "fts", "failed running FTS query", &e))?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| AppError::db("FC_FTS_QUERY_FAILED", "fts", "failed reading FTS row", &e))
}

// Tags

pub fn get_tag(conn: &Connection, tag_id: &str) -> AppResult<Option<TagRecord>> {
    query_one(
        conn,
        &format!("SELECT {} FROM tags WHERE tag_id=?1", TAG_COLUMNS),
        [tag_id],
        tag_from_row,
    )
}

pub fn upsert_tag(conn: &Connection, t: &TagRecord) -> AppResult<()> {
    conn.execute(
        "INSERT INTO tags (tag_id, name, created_at_utc, updated_at_utc, updated_by_instance_id,
           is_deleted, deleted_at_utc)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(tag_id) DO UPDATE SET
           name=excluded.name, created_at_utc=excluded.created_at_utc,
           updated_at_utc=excluded.updated_at_utc,
           updated_by_instance_id=excluded.updated_by_instance_id,
           is_deleted=excluded.is_deleted, deleted_at_utc=excluded.deleted_at_utc",
        params![
            t.tag_id,
            t.name,
            t.created_at_utc,
            t.updated_at_utc,
            t.updated_by_instance_id,
            t.is_deleted,
            t.deleted_at_utc
        ],
    )
    .map_err(|e| write_error("failed to upsert tag", &e))?;
    Ok(())
}

/// Live tags in a fixed order, so name-based canonicalization is reproducible.
pub fn list_live_tags(conn: &Connection) -> AppResult<Vec<TagRecord>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM tags WHERE is_deleted=0 ORDER BY created_at_utc ASC, tag_id ASC",
            TAG_COLUMNS
        ),
        (),
        tag_from_row,
    )
}

pub fn list_tags(conn: &Connection, updated_after: Option<&str>) -> AppResult<Vec<TagRecord>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM tags WHERE (?1 IS NULL OR updated_at_utc > ?1)
             ORDER BY updated_at_utc ASC, tag_id ASC",
            TAG_COLUMNS
        ),
        [updated_after],
        tag_from_row,
    )
}

// Problem/tag links

pub fn live_links_for_problem(conn: &Connection, problem_id: &str) -> AppResult<Vec<ProblemTagLink>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM problem_tags WHERE problem_id=?1 AND is_deleted=0 ORDER BY tag_id ASC",
            LINK_COLUMNS
        ),
        [problem_id],
        link_from_row,
    )
}

/// Most recently touched soft-deleted link for (problem, tag), if any.
pub fn find_deleted_link(
    conn: &Connection,
    problem_id: &str,
    tag_id: &str,
) -> AppResult<Option<ProblemTagLink>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM problem_tags WHERE problem_id=?1 AND tag_id=?2 AND is_deleted=1
             ORDER BY updated_at_utc DESC, link_id ASC LIMIT 1",
            LINK_COLUMNS
        ),
        [problem_id, tag_id],
        link_from_row,
    )
}

pub fn insert_link(conn: &Connection, link: &ProblemTagLink) -> AppResult<()> {
    conn.execute(
        "INSERT INTO problem_tags (link_id, problem_id, tag_id, created_at_utc, updated_at_utc,
           updated_by_instance_id, is_deleted, deleted_at_utc)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            link.link_id,
            link.problem_id,
            link.tag_id,
            link.created_at_utc,
            link.updated_at_utc,
            link.updated_by_instance_id,
            link.is_deleted,
            link.deleted_at_utc
        ],
    )
    .map_err(|e| write_error("failed to insert problem tag link", &e))?;
    Ok(())
}

pub fn soft_delete_link(conn: &Connection, link_id: &str, now_utc: &str, instance_id: &str) -> AppResult<()> {
    conn.execute(
        "UPDATE problem_tags SET is_deleted=1, deleted_at_utc=?2, updated_at_utc=?2,
           updated_by_instance_id=?3
         WHERE link_id=?1",
        params![link_id, now_utc, instance_id],
    )
    .map_err(|e| write_error("failed to soft-delete problem tag link", &e))?;
    Ok(())
}

pub fn revive_link(conn: &Connection, link_id: &str, now_utc: &str, instance_id: &str) -> AppResult<()> {
    conn.execute(
        "UPDATE problem_tags SET is_deleted=0, deleted_at_utc=NULL, updated_at_utc=?2,
           updated_by_instance_id=?3
         WHERE link_id=?1",
        params![link_id, now_utc, instance_id],
    )
    .map_err(|e| write_error("failed to revive problem tag link", &e))?;
    Ok(())
}

/// Live tags currently linked to a problem, by name.
pub fn get_tags_for_problem(conn: &Connection, problem_id: &str) -> AppResult<Vec<TagRecord>> {
    query_all(
        conn,
        "SELECT t.tag_id, t.name, t.created_at_utc, t.updated_at_utc, t.updated_by_instance_id,
                t.is_deleted, t.deleted_at_utc
         FROM problem_tags pt JOIN tags t ON t.tag_id = pt.tag_id
         WHERE pt.problem_id=?1 AND pt.is_deleted=0 AND t.is_deleted=0
         ORDER BY t.name ASC, t.tag_id ASC",
        [problem_id],
        tag_from_row,
    )
}

/// Every link row (live and soft-deleted) joined with its tag, for export.
pub fn list_links_with_tags(conn: &Connection) -> AppResult<Vec<(ProblemTagLink, TagRecord)>> {
    query_all(
        conn,
        "SELECT pt.link_id, pt.problem_id, pt.tag_id, pt.created_at_utc, pt.updated_at_utc,
                pt.updated_by_instance_id, pt.is_deleted, pt.deleted_at_utc,
                t.tag_id, t.name, t.created_at_utc, t.updated_at_utc, t.updated_by_instance_id,
                t.is_deleted, t.deleted_at_utc
         FROM problem_tags pt JOIN tags t ON t.tag_id = pt.tag_id
         ORDER BY pt.problem_id ASC, t.name ASC, pt.link_id ASC",
        (),
        |row| {
            let link = link_from_row(row)?;
            let tag = TagRecord {
                tag_id: row.get(8)?,
                name: row.get(9)?,
                created_at_utc: row.get(10)?,
                updated_at_utc: row.get(11)?,
                updated_by_instance_id: row.get(12)?,
                is_deleted: row.get(13)?,
                deleted_at_utc: row.get(14)?,
            };
            Ok((link, tag))
        },
    )
}

// Attachments

pub fn get_attachment(conn: &Connection, attachment_id: &str) -> AppResult<Option<AttachmentRecord>> {
    query_one(
        conn,
        &format!("SELECT {} FROM attachments WHERE attachment_id=?1", ATTACHMENT_COLUMNS),
        [attachment_id],
        attachment_from_row,
    )
}

pub fn upsert_attachment(conn: &Connection, a: &AttachmentRecord) -> AppResult<()> {
    conn.execute(
        "INSERT INTO attachments (attachment_id, problem_id, original_file_name, content_hash,
           size_bytes, mime_type, created_at_utc, updated_at_utc, updated_by_instance_id,
           is_deleted, deleted_at_utc)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(attachment_id) DO UPDATE SET
           problem_id=excluded.problem_id, original_file_name=excluded.original_file_name,
           content_hash=excluded.content_hash, size_bytes=excluded.size_bytes,
           mime_type=excluded.mime_type, created_at_utc=excluded.created_at_utc,
           updated_at_utc=excluded.updated_at_utc,
           updated_by_instance_id=excluded.updated_by_instance_id,
           is_deleted=excluded.is_deleted, deleted_at_utc=excluded.deleted_at_utc",
        params![
            a.attachment_id,
            a.problem_id,
            a.original_file_name,
            a.content_hash,
            a.size_bytes,
            a.mime_type,
            a.created_at_utc,
            a.updated_at_utc,
            a.updated_by_instance_id,
            a.is_deleted,
            a.deleted_at_utc
        ],
    )
    .map_err(|e| write_error("failed to upsert attachment", &e))?;
    Ok(())
}

pub fn list_attachments(conn: &Connection, updated_after: Option<&str>) -> AppResult<Vec<AttachmentRecord>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM attachments WHERE (?1 IS NULL OR updated_at_utc > ?1)
             ORDER BY updated_at_utc ASC, attachment_id ASC",
            ATTACHMENT_COLUMNS
        ),
        [updated_after],
        attachment_from_row,
    )
}

// Conflict records (append-only)

pub fn insert_conflict(conn: &Connection, record: &ConflictRecord) -> AppResult<i64> {
    conn.execute(
        "INSERT INTO conflict_records (entity_type, entity_id, local_updated_at_utc,
           incoming_updated_at_utc, local_json, incoming_json, created_at_utc)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            record.entity_type,
            record.entity_id,
            record.local_updated_at_utc,
            record.incoming_updated_at_utc,
            record.local_json,
            record.incoming_json,
            record.created_at_utc
        ],
    )
    .map_err(|e| write_error("failed to insert conflict record", &e))?;
    Ok(conn.last_insert_rowid())
}

pub fn list_conflicts(conn: &Connection) -> AppResult<Vec<ConflictRecord>> {
    query_all(
        conn,
        "SELECT conflict_id, entity_type, entity_id, local_updated_at_utc, incoming_updated_at_utc,
                local_json, incoming_json, created_at_utc
         FROM conflict_records ORDER BY conflict_id ASC",
        (),
        |row| {
            Ok(ConflictRecord {
                conflict_id: row.get(0)?,
                entity_type: row.get(1)?,
                entity_id: row.get(2)?,
                local_updated_at_utc: row.get(3)?,
                incoming_updated_at_utc: row.get(4)?,
                local_json: row.get(5)?,
                incoming_json: row.get(6)?,
                created_at_utc: row.get(7)?,
            })
        },
    )
}
