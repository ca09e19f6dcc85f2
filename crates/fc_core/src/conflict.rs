//! Last-writer-wins resolution with an append-only conflict log.

use crate::app_error::AppResult;
use crate::canon_json::canonical_string_of;
use crate::store;
use crate::timestamp::parse_utc;
use crate::types::{AttachmentRecord, ConflictRecord, EntityKind, ProblemRecord, TagRecord};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Keep the local row when it carries the newer version; log the rejected incoming row.
    #[default]
    SkipIfLocalNewer,
    Overwrite,
}

impl ConflictPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::SkipIfLocalNewer => "skip_if_local_newer",
            ConflictPolicy::Overwrite => "overwrite",
        }
    }
}

/// A row that carries a replica version stamp and can be looked up in the target store.
pub trait SyncEntity: Serialize + PartialEq + Sized {
    const KIND: EntityKind;

    fn entity_id(&self) -> &str;
    fn updated_at_utc(&self) -> &str;
    fn updated_by_instance_id(&self) -> &str;
    fn load_local(conn: &Connection, entity_id: &str) -> AppResult<Option<Self>>;
}

impl SyncEntity for ProblemRecord {
    const KIND: EntityKind = EntityKind::Problem;

    fn entity_id(&self) -> &str {
        &self.problem_id
    }
    fn updated_at_utc(&self) -> &str {
        &self.updated_at_utc
    }
    fn updated_by_instance_id(&self) -> &str {
        &self.updated_by_instance_id
    }
    fn load_local(conn: &Connection, entity_id: &str) -> AppResult<Option<Self>> {
        store::get_problem(conn, entity_id)
    }
}

impl SyncEntity for TagRecord {
    const KIND: EntityKind = EntityKind::Tag;

    fn entity_id(&self) -> &str {
        &self.tag_id
    }
    fn updated_at_utc(&self) -> &str {
        &self.updated_at_utc
    }
    fn updated_by_instance_id(&self) -> &str {
        &self.updated_by_instance_id
    }
    fn load_local(conn: &Connection, entity_id: &str) -> AppResult<Option<Self>> {
        store::get_tag(conn, entity_id)
    }
}

impl SyncEntity for AttachmentRecord {
    const KIND: EntityKind = EntityKind::Attachment;

    fn entity_id(&self) -> &str {
        &self.attachment_id
    }
    fn updated_at_utc(&self) -> &str {
        &self.updated_at_utc
    }
    fn updated_by_instance_id(&self) -> &str {
        &self.updated_by_instance_id
    }
    fn load_local(conn: &Connection, entity_id: &str) -> AppResult<Option<Self>> {
        store::get_attachment(conn, entity_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Apply,
    /// Same version and same content as the local row.
    Unchanged,
    Conflict { conflict_id: i64 },
}

fn compare_timestamps(a: &str, b: &str) -> Ordering {
    match (parse_utc(a), parse_utc(b)) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

/// Orders two version stamps: timestamp first, then ordinal instance id.
pub fn compare_versions(
    a_updated_at: &str,
    a_instance: &str,
    b_updated_at: &str,
    b_instance: &str,
) -> Ordering {
    compare_timestamps(a_updated_at, b_updated_at).then_with(|| a_instance.cmp(b_instance))
}

/// Decides whether `incoming` may overwrite the target row. Reads the target row once; writes
/// only a conflict record, and only when the incoming row loses.
pub fn resolve<E: SyncEntity>(
    conn: &Connection,
    incoming: &E,
    policy: ConflictPolicy,
    now_utc: &str,
) -> AppResult<Resolution> {
    let Some(local) = E::load_local(conn, incoming.entity_id())? else {
        return Ok(Resolution::Apply);
    };
    if &local == incoming {
        return Ok(Resolution::Unchanged);
    }
    if policy == ConflictPolicy::Overwrite {
        return Ok(Resolution::Apply);
    }

    let order = compare_versions(
        incoming.updated_at_utc(),
        incoming.updated_by_instance_id(),
        local.updated_at_utc(),
        local.updated_by_instance_id(),
    );
    if order != Ordering::Less {
        return Ok(Resolution::Apply);
    }

    let record = ConflictRecord {
        conflict_id: 0,
        entity_type: E::KIND.as_str().to_string(),
        entity_id: incoming.entity_id().to_string(),
        local_updated_at_utc: local.updated_at_utc().to_string(),
        incoming_updated_at_utc: incoming.updated_at_utc().to_string(),
        local_json: canonical_string_of(&local)?,
        incoming_json: canonical_string_of(incoming)?,
        created_at_utc: now_utc.to_string(),
    };
    let conflict_id = store::insert_conflict(conn, &record)?;
    tracing::debug!(
        entity_type = E::KIND.as_str(),
        entity_id = incoming.entity_id(),
        conflict_id,
        "local row is newer; incoming row kept as conflict"
    );
    Ok(Resolution::Conflict { conflict_id })
}
