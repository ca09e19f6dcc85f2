use serde::{Deserialize, Serialize};

/// Entity kinds that take part in conflict resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Problem,
    Tag,
    Attachment,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Problem => "Problem",
            EntityKind::Tag => "Tag",
            EntityKind::Attachment => "Attachment",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemRecord {
    pub problem_id: String,
    pub title: String,
    pub symptom: String,
    pub root_cause: String,
    pub solution: String,
    pub environment_json: String,
    pub severity: i64,
    pub status: i64,
    pub created_at_utc: String,
    pub created_by: String,
    pub updated_at_utc: String,
    pub updated_by_instance_id: String,
    pub is_deleted: bool,
    pub deleted_at_utc: Option<String>,
    pub source_kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagRecord {
    pub tag_id: String,
    pub name: String,
    pub created_at_utc: String,
    pub updated_at_utc: String,
    pub updated_by_instance_id: String,
    pub is_deleted: bool,
    pub deleted_at_utc: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemTagLink {
    pub link_id: String,
    pub problem_id: String,
    pub tag_id: String,
    pub created_at_utc: String,
    pub updated_at_utc: String,
    pub updated_by_instance_id: String,
    pub is_deleted: bool,
    pub deleted_at_utc: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub attachment_id: String,
    pub problem_id: String,
    pub original_file_name: String,
    pub content_hash: String,
    pub size_bytes: i64,
    pub mime_type: String,
    pub created_at_utc: String,
    pub updated_at_utc: String,
    pub updated_by_instance_id: String,
    pub is_deleted: bool,
    pub deleted_at_utc: Option<String>,
}

/// One `ProblemTags` sheet row. Links travel as (problem, tag, name) triples; link identity
/// and audit fields are local to each replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingLink {
    pub problem_id: String,
    pub tag_id: String,
    pub tag_name: String,
    pub link_is_deleted: bool,
    pub tag_is_deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub conflict_id: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub local_updated_at_utc: String,
    pub incoming_updated_at_utc: String,
    pub local_json: String,
    pub incoming_json: String,
    pub created_at_utc: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncWatermark {
    pub remote_instance_id: String,
    pub last_exported_at_utc: Option<String>,
    pub last_exported_package_id: Option<String>,
    pub last_imported_at_utc: Option<String>,
    pub last_imported_package_id: Option<String>,
    pub updated_at_utc: String,
}
