//! Local write path: how a replica creates and edits its own rows.
//!
//! Every write stamps `updated_at_utc` with the caller's clock and `updated_by_instance_id`
//! with the replica's instance id, which is what later packages carry as the row version.
//! Changing a problem's tags or attachments bumps the problem's version too, so incremental
//! builds and conflict resolution see tag edits as edits of the problem. Each call commits its
//! writes together or not at all.

use crate::app_error::{AppError, AppResult};
use crate::attachment_vault::AttachmentVault;
use crate::package_apply::{converge_links, TagMergeMode};
use crate::store;
use crate::tag_reconcile::normalize_tag_name;
use crate::timestamp::normalize_utc;
use crate::types::{AttachmentRecord, ProblemRecord, TagRecord};
use rusqlite::{Connection, Transaction};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProblemDraft {
    /// Caller-chosen id; a fresh uuid when absent.
    pub problem_id: Option<String>,
    pub title: String,
    pub symptom: String,
    pub root_cause: String,
    pub solution: String,
    pub environment_json: Option<String>,
    pub severity: i64,
    pub status: i64,
    pub created_by: String,
}

fn not_found(kind: &str, id: &str) -> AppError {
    AppError::new(
        "FC_NOT_FOUND",
        "authoring",
        &format!("{} not found", kind),
        false,
        serde_json::json!({ "kind": kind, "id": id }),
    )
}

fn validate_environment(raw: &str) -> AppResult<()> {
    serde_json::from_str::<serde_json::Value>(raw)
        .map(|_| ())
        .map_err(|e| {
            AppError::new(
                "FC_INVALID_INPUT",
                "authoring",
                "environment must be a JSON document",
                false,
                serde_json::json!({ "error": e.to_string() }),
            )
        })
}

fn begin(conn: &Connection) -> AppResult<Transaction<'_>> {
    conn.unchecked_transaction()
        .map_err(|e| AppError::db("FC_DB_TX_FAILED", "authoring", "failed to begin write", &e))
}

fn commit(tx: Transaction<'_>) -> AppResult<()> {
    tx.commit()
        .map_err(|e| AppError::db("FC_DB_TX_FAILED", "authoring", "failed to commit write", &e))
}

fn live_problem(conn: &Connection, problem_id: &str) -> AppResult<ProblemRecord> {
    match store::get_problem(conn, problem_id)? {
        Some(p) if !p.is_deleted => Ok(p),
        _ => Err(not_found("problem", problem_id)),
    }
}

fn save_problem(conn: &Connection, problem: &ProblemRecord) -> AppResult<()> {
    store::upsert_problem(conn, problem)?;
    store::refresh_problem_fts(conn, problem)
}

fn touch_problem(conn: &Connection, problem_id: &str, instance_id: &str, now: &str) -> AppResult<()> {
    match store::get_problem(conn, problem_id)? {
        Some(mut problem) if !problem.is_deleted => {
            problem.updated_at_utc = now.to_string();
            problem.updated_by_instance_id = instance_id.to_string();
            save_problem(conn, &problem)
        }
        _ => Ok(()),
    }
}

pub fn create_problem(
    conn: &Connection,
    instance_id: &str,
    draft: &ProblemDraft,
    now_utc: &str,
) -> AppResult<ProblemRecord> {
    let now = normalize_utc(now_utc)?;
    let problem_id = draft
        .problem_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let tx = begin(conn)?;
    if store::problem_exists(&tx, &problem_id)? {
        return Err(AppError::new(
            "FC_ALREADY_EXISTS",
            "authoring",
            "problem id already in use",
            false,
            serde_json::json!({ "problem_id": problem_id }),
        ));
    }
    let environment_json = draft.environment_json.clone().unwrap_or_else(|| "{}".to_string());
    validate_environment(&environment_json)?;

    let problem = ProblemRecord {
        problem_id,
        title: draft.title.clone(),
        symptom: draft.symptom.clone(),
        root_cause: draft.root_cause.clone(),
        solution: draft.solution.clone(),
        environment_json,
        severity: draft.severity,
        status: draft.status,
        created_at_utc: now.clone(),
        created_by: draft.created_by.clone(),
        updated_at_utc: now,
        updated_by_instance_id: instance_id.to_string(),
        is_deleted: false,
        deleted_at_utc: None,
        source_kind: "local".to_string(),
    };
    save_problem(&tx, &problem)?;
    commit(tx)?;
    tracing::debug!(problem_id = %problem.problem_id, "problem created");
    Ok(problem)
}

/// Replaces the editable fields of a live problem. Identity and creation fields are kept.
pub fn update_problem(
    conn: &Connection,
    instance_id: &str,
    problem_id: &str,
    draft: &ProblemDraft,
    now_utc: &str,
) -> AppResult<ProblemRecord> {
    let now = normalize_utc(now_utc)?;
    let tx = begin(conn)?;
    let current = live_problem(&tx, problem_id)?;
    let environment_json = draft
        .environment_json
        .clone()
        .unwrap_or_else(|| current.environment_json.clone());
    validate_environment(&environment_json)?;

    let problem = ProblemRecord {
        title: draft.title.clone(),
        symptom: draft.symptom.clone(),
        root_cause: draft.root_cause.clone(),
        solution: draft.solution.clone(),
        environment_json,
        severity: draft.severity,
        status: draft.status,
        updated_at_utc: now,
        updated_by_instance_id: instance_id.to_string(),
        ..current
    };
    save_problem(&tx, &problem)?;
    commit(tx)?;
    Ok(problem)
}

pub fn soft_delete_problem(
    conn: &Connection,
    instance_id: &str,
    problem_id: &str,
    now_utc: &str,
) -> AppResult<ProblemRecord> {
    let now = normalize_utc(now_utc)?;
    let tx = begin(conn)?;
    let mut problem = live_problem(&tx, problem_id)?;
    problem.is_deleted = true;
    problem.deleted_at_utc = Some(now.clone());
    problem.updated_at_utc = now;
    problem.updated_by_instance_id = instance_id.to_string();
    save_problem(&tx, &problem)?;
    commit(tx)?;
    Ok(problem)
}

/// Makes `names` the problem's exact tag set. Names reuse live tags by normalized name;
/// unknown names mint new tags. Blank names are ignored.
pub fn set_problem_tags(
    conn: &Connection,
    instance_id: &str,
    problem_id: &str,
    names: &[String],
    now_utc: &str,
) -> AppResult<Vec<TagRecord>> {
    let now = normalize_utc(now_utc)?;
    let tx = begin(conn)?;
    live_problem(&tx, problem_id)?;

    let mut by_name: HashMap<String, TagRecord> = HashMap::new();
    for tag in store::list_live_tags(&tx)? {
        if let Some(key) = normalize_tag_name(&tag.name) {
            by_name.entry(key).or_insert(tag);
        }
    }

    let mut wanted = BTreeSet::new();
    let mut tags = Vec::new();
    for name in names {
        let Some(key) = normalize_tag_name(name) else {
            continue;
        };
        let tag = match by_name.get(&key) {
            Some(tag) => tag.clone(),
            None => {
                let tag = TagRecord {
                    tag_id: uuid::Uuid::new_v4().to_string(),
                    name: name.trim().to_string(),
                    created_at_utc: now.clone(),
                    updated_at_utc: now.clone(),
                    updated_by_instance_id: instance_id.to_string(),
                    is_deleted: false,
                    deleted_at_utc: None,
                };
                store::upsert_tag(&tx, &tag)?;
                by_name.insert(key, tag.clone());
                tag
            }
        };
        if wanted.insert(tag.tag_id.clone()) {
            tags.push(tag);
        }
    }

    let changes = converge_links(&tx, problem_id, &wanted, TagMergeMode::Replace, &now, instance_id)?;
    if changes.added + changes.revived + changes.removed > 0 {
        touch_problem(&tx, problem_id, instance_id, &now)?;
    }
    commit(tx)?;
    Ok(tags)
}

/// Stores `bytes` in the vault and records an attachment row for a live problem.
#[allow(clippy::too_many_arguments)]
pub fn attach_bytes(
    conn: &Connection,
    vault: &AttachmentVault,
    instance_id: &str,
    problem_id: &str,
    original_file_name: &str,
    mime_type: &str,
    bytes: &[u8],
    now_utc: &str,
) -> AppResult<AttachmentRecord> {
    let now = normalize_utc(now_utc)?;
    let tx = begin(conn)?;
    live_problem(&tx, problem_id)?;
    let content_hash = vault.put_bytes(bytes)?;

    let attachment = AttachmentRecord {
        attachment_id: uuid::Uuid::new_v4().to_string(),
        problem_id: problem_id.to_string(),
        original_file_name: original_file_name.to_string(),
        content_hash,
        size_bytes: bytes.len() as i64,
        mime_type: mime_type.to_string(),
        created_at_utc: now.clone(),
        updated_at_utc: now.clone(),
        updated_by_instance_id: instance_id.to_string(),
        is_deleted: false,
        deleted_at_utc: None,
    };
    store::upsert_attachment(&tx, &attachment)?;
    touch_problem(&tx, problem_id, instance_id, &now)?;
    commit(tx)?;
    Ok(attachment)
}

/// Soft-deletes an attachment row; the blob stays in the vault.
pub fn soft_delete_attachment(
    conn: &Connection,
    instance_id: &str,
    attachment_id: &str,
    now_utc: &str,
) -> AppResult<AttachmentRecord> {
    let now = normalize_utc(now_utc)?;
    let tx = begin(conn)?;
    let mut attachment = match store::get_attachment(&tx, attachment_id)? {
        Some(a) if !a.is_deleted => a,
        _ => return Err(not_found("attachment", attachment_id)),
    };
    attachment.is_deleted = true;
    attachment.deleted_at_utc = Some(now.clone());
    attachment.updated_at_utc = now.clone();
    attachment.updated_by_instance_id = instance_id.to_string();
    store::upsert_attachment(&tx, &attachment)?;
    touch_problem(&tx, &attachment.problem_id, instance_id, &now)?;
    commit(tx)?;
    Ok(attachment)
}
