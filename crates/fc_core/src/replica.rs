use crate::app_error::{AppError, AppResult};
use crate::attachment_vault::AttachmentVault;
use crate::conflict::ConflictPolicy;
use crate::db::open_db;
use crate::package_apply::TagMergeMode;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const REPLICA_JSON: &str = "replica.json";
const REPLICA_SCHEMA_VERSION: u32 = 1;

/// Descriptor persisted as `replica.json` at the replica root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaJsonV1 {
    pub schema_version: u32,
    pub instance_id: String,
    pub instance_kind: String,
    pub replica_slug: String,
    pub created_at_utc: String,
    pub db: ReplicaDbConfig,
    pub blobs: ReplicaBlobConfig,
    #[serde(default)]
    pub defaults: ReplicaDefaults,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaDbConfig {
    pub relative_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaBlobConfig {
    pub relative_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicaDefaults {
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    #[serde(default)]
    pub tag_merge_mode: TagMergeMode,
}

#[derive(Debug, Clone)]
pub struct ReplicaPaths {
    pub root: PathBuf,
    pub db: PathBuf,
    pub blobs_dir: PathBuf,
    pub packages_dir: PathBuf,
}

fn replica_error(code: &str, message: &str, details: serde_json::Value) -> AppError {
    AppError::new(code, "replica", message, false, details)
}

impl ReplicaJsonV1 {
    pub fn paths(&self, replica_path: &Path) -> ReplicaPaths {
        ReplicaPaths {
            root: replica_path.to_path_buf(),
            db: replica_path.join(&self.db.relative_path),
            blobs_dir: replica_path.join(&self.blobs.relative_path),
            packages_dir: replica_path.join("packages"),
        }
    }
}

/// Default layout, used before a descriptor exists.
pub fn replica_paths(replica_path: &Path) -> ReplicaPaths {
    ReplicaPaths {
        root: replica_path.to_path_buf(),
        db: replica_path.join("db/replica.sqlite"),
        blobs_dir: replica_path.join("store/blobs"),
        packages_dir: replica_path.join("packages"),
    }
}

pub fn replica_init(
    replica_path: &Path,
    replica_slug: &str,
    instance_kind: &str,
    created_at_utc: &str,
) -> AppResult<ReplicaJsonV1> {
    let descriptor = replica_path.join(REPLICA_JSON);
    if descriptor.exists() {
        return Err(replica_error(
            "FC_REPLICA_ALREADY_EXISTS",
            "replica.json already exists",
            serde_json::json!({ "path": descriptor }),
        ));
    }

    let paths = replica_paths(replica_path);
    for dir in [
        paths.db.parent().unwrap_or(replica_path),
        paths.blobs_dir.as_path(),
        paths.packages_dir.as_path(),
    ] {
        fs::create_dir_all(dir).map_err(|e| {
            replica_error(
                "FC_REPLICA_INIT_FAILED",
                "failed to create replica directory",
                serde_json::json!({ "error": e.to_string(), "path": dir }),
            )
        })?;
    }

    let replica = ReplicaJsonV1 {
        schema_version: REPLICA_SCHEMA_VERSION,
        instance_id: Uuid::new_v4().to_string(),
        instance_kind: instance_kind.to_string(),
        replica_slug: replica_slug.to_string(),
        created_at_utc: created_at_utc.to_string(),
        db: ReplicaDbConfig {
            relative_path: "db/replica.sqlite".to_string(),
        },
        blobs: ReplicaBlobConfig {
            relative_path: "store/blobs".to_string(),
        },
        defaults: ReplicaDefaults::default(),
    };

    replica_save(replica_path, &replica)?;
    tracing::info!(
        instance_id = %replica.instance_id,
        slug = %replica.replica_slug,
        "initialized replica"
    );
    Ok(replica)
}

pub fn replica_save(replica_path: &Path, replica: &ReplicaJsonV1) -> AppResult<()> {
    let bytes = serde_json::to_vec_pretty(replica).map_err(|e| {
        replica_error(
            "FC_REPLICA_INIT_FAILED",
            "failed to serialize replica.json",
            serde_json::json!({ "error": e.to_string() }),
        )
    })?;
    fs::write(replica_path.join(REPLICA_JSON), bytes).map_err(|e| {
        replica_error(
            "FC_REPLICA_INIT_FAILED",
            "failed to write replica.json",
            serde_json::json!({ "error": e.to_string() }),
        )
    })
}

pub fn replica_open(replica_path: &Path) -> AppResult<ReplicaJsonV1> {
    let path = replica_path.join(REPLICA_JSON);
    let bytes = fs::read(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            replica_error(
                "FC_REPLICA_JSON_MISSING",
                "replica.json is missing",
                serde_json::json!({ "path": path }),
            )
        } else {
            replica_error(
                "FC_REPLICA_JSON_INVALID",
                "failed to read replica.json",
                serde_json::json!({ "error": e.to_string(), "path": path }),
            )
        }
    })?;

    let value: serde_json::Value = serde_json::from_slice(&bytes).map_err(|e| {
        replica_error(
            "FC_REPLICA_JSON_INVALID",
            "failed to parse replica.json",
            serde_json::json!({ "error": e.to_string(), "path": path }),
        )
    })?;

    let schema_version = value
        .get("schema_version")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| {
            replica_error(
                "FC_REPLICA_JSON_INVALID",
                "replica schema_version missing or invalid",
                serde_json::json!({ "path": path }),
            )
        })?;
    if schema_version != u64::from(REPLICA_SCHEMA_VERSION) {
        return Err(replica_error(
            "FC_REPLICA_JSON_UNSUPPORTED_VERSION",
            "unsupported replica schema_version",
            serde_json::json!({ "expected": [REPLICA_SCHEMA_VERSION], "actual": schema_version }),
        ));
    }

    let replica: ReplicaJsonV1 = serde_json::from_value(value).map_err(|e| {
        replica_error(
            "FC_REPLICA_JSON_INVALID",
            "failed to parse replica schema v1",
            serde_json::json!({ "error": e.to_string(), "path": path }),
        )
    })?;
    if replica.instance_id.trim().is_empty() {
        return Err(replica_error(
            "FC_REPLICA_JSON_INVALID",
            "replica instance_id must not be blank",
            serde_json::json!({ "path": path }),
        ));
    }
    Ok(replica)
}

/// A replica opened for work: descriptor, migrated database and blob vault.
pub struct OpenReplica {
    pub descriptor: ReplicaJsonV1,
    pub paths: ReplicaPaths,
    pub conn: Connection,
    pub vault: AttachmentVault,
}

pub fn replica_connect(replica_path: &Path) -> AppResult<OpenReplica> {
    let descriptor = replica_open(replica_path)?;
    let paths = descriptor.paths(replica_path);
    let conn = open_db(&paths.db)?;
    let vault = AttachmentVault::new(paths.blobs_dir.clone());
    Ok(OpenReplica {
        descriptor,
        paths,
        conn,
        vault,
    })
}
