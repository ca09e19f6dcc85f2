//! Turns a replica's rows into a portable package directory.
//!
//! All reads run inside one deferred transaction so the workbook, attachment set and manifest
//! describe a single snapshot. Files are written to a hidden staging directory that is renamed
//! to `package_<id>` once the manifest is in place.

use crate::app_error::{AppError, AppResult};
use crate::attachment_vault::AttachmentVault;
use crate::canon_json::to_canonical_bytes;
use crate::db::LATEST_SCHEMA_VERSION;
use crate::hashing::{blake3_file_prefixed, blake3_hex_prefixed};
use crate::package::{
    blob_relative_path, BuildMode, ManifestCounts, ManifestStream, PackageManifestV1, ATTACHMENTS_DIR,
    MANIFEST_FILE, MANIFEST_VERSION,
};
use crate::replica::ReplicaJsonV1;
use crate::sheet_rows::{
    format_bool, ATTACHMENT_COLUMNS, PROBLEM_COLUMNS, PROBLEM_OPTIONAL_COLUMNS, PROBLEM_TAG_COLUMNS,
    TAG_COLUMNS,
};
use crate::store;
use crate::timestamp::{format_utc, now_utc};
use crate::types::{AttachmentRecord, ProblemRecord, ProblemTagLink, TagRecord};
use crate::watermark::watermark_get;
use crate::workbook::{
    Sheet, Workbook, WorkbookCodec, SHEET_ATTACHMENTS, SHEET_PROBLEMS, SHEET_PROBLEM_TAGS, SHEET_TAGS,
};
use rusqlite::Connection;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BuildScope {
    #[default]
    All,
    /// Only these problems and the tags/attachments that hang off them.
    Problems(Vec<String>),
}

impl BuildScope {
    fn includes(&self, problem_id: &str) -> bool {
        match self {
            BuildScope::All => true,
            BuildScope::Problems(ids) => ids.iter().any(|id| id == problem_id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub mode: BuildMode,
    pub scope: BuildScope,
    /// Required for incremental builds: whose export watermark to start from.
    pub target_remote_instance_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BuiltPackage {
    pub dir: PathBuf,
    pub manifest: PackageManifestV1,
}

fn build_error(message: &str, details: serde_json::Value) -> AppError {
    AppError::new("FC_PACKAGE_BUILD_FAILED", "package_build", message, false, details)
}

fn io_error(message: &str, path: &Path, e: std::io::Error) -> AppError {
    build_error(message, serde_json::json!({ "error": e.to_string(), "path": path }))
}

struct Selection {
    problems: Vec<ProblemRecord>,
    tags: Vec<TagRecord>,
    links: Vec<(ProblemTagLink, TagRecord)>,
    attachments: Vec<AttachmentRecord>,
}

impl Selection {
    fn max_updated_at(&self) -> Option<String> {
        self.problems
            .iter()
            .map(|p| &p.updated_at_utc)
            .chain(self.tags.iter().map(|t| &t.updated_at_utc))
            .chain(self.links.iter().map(|(l, _)| &l.updated_at_utc))
            .chain(self.attachments.iter().map(|a| &a.updated_at_utc))
            .max()
            .cloned()
    }
}

fn select(conn: &Connection, scope: &BuildScope, watermark: Option<&str>) -> AppResult<Selection> {
    let problems: Vec<ProblemRecord> = store::list_problems(conn, watermark)?
        .into_iter()
        .filter(|p| scope.includes(&p.problem_id))
        .collect();

    // A problem's link rows are its desired tag set on the importing side, so a problem whose
    // row or any link changed ships every link it has.
    let all_links = store::list_links_with_tags(conn)?;
    let mut relinked: HashSet<String> = problems.iter().map(|p| p.problem_id.clone()).collect();
    for (link, _) in &all_links {
        let changed = watermark.map_or(true, |w| link.updated_at_utc.as_str() > w);
        if changed && scope.includes(&link.problem_id) {
            relinked.insert(link.problem_id.clone());
        }
    }

    // One row per (problem, tag); a live link outranks soft-deleted history.
    let mut links: BTreeMap<(String, String), (ProblemTagLink, TagRecord)> = BTreeMap::new();
    for (link, tag) in all_links {
        if !relinked.contains(&link.problem_id) {
            continue;
        }
        let key = (link.problem_id.clone(), link.tag_id.clone());
        let replace = match links.get(&key) {
            None => true,
            Some((kept, _)) => kept.is_deleted && !link.is_deleted,
        };
        if replace {
            links.insert(key, (link, tag));
        }
    }
    let links: Vec<(ProblemTagLink, TagRecord)> = links.into_values().collect();

    let linked_tags: BTreeSet<&str> = links.iter().map(|(l, _)| l.tag_id.as_str()).collect();
    let tags: Vec<TagRecord> = store::list_tags(conn, watermark)?
        .into_iter()
        .filter(|t| matches!(scope, BuildScope::All) || linked_tags.contains(t.tag_id.as_str()))
        .collect();

    let attachments = store::list_attachments(conn, watermark)?
        .into_iter()
        .filter(|a| scope.includes(&a.problem_id))
        .collect();

    Ok(Selection {
        problems,
        tags,
        links,
        attachments,
    })
}

fn opt_text(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

fn to_workbook(selection: &Selection) -> Workbook {
    let mut problem_header: Vec<&str> = PROBLEM_COLUMNS.to_vec();
    problem_header.extend_from_slice(PROBLEM_OPTIONAL_COLUMNS);
    let mut problems = Sheet::with_header(SHEET_PROBLEMS, &problem_header);
    for p in &selection.problems {
        problems.push_row(vec![
            p.problem_id.clone(),
            p.title.clone(),
            p.symptom.clone(),
            p.root_cause.clone(),
            p.solution.clone(),
            p.environment_json.clone(),
            p.created_at_utc.clone(),
            p.created_by.clone(),
            p.updated_at_utc.clone(),
            p.updated_by_instance_id.clone(),
            format_bool(p.is_deleted),
            opt_text(&p.deleted_at_utc),
            p.source_kind.clone(),
            p.severity.to_string(),
            p.status.to_string(),
        ]);
    }

    let mut tags = Sheet::with_header(SHEET_TAGS, TAG_COLUMNS);
    for t in &selection.tags {
        tags.push_row(vec![
            t.tag_id.clone(),
            t.name.clone(),
            t.created_at_utc.clone(),
            t.updated_at_utc.clone(),
            t.updated_by_instance_id.clone(),
            format_bool(t.is_deleted),
        ]);
    }

    let mut links = Sheet::with_header(SHEET_PROBLEM_TAGS, PROBLEM_TAG_COLUMNS);
    for (link, tag) in &selection.links {
        links.push_row(vec![
            link.problem_id.clone(),
            link.tag_id.clone(),
            tag.name.clone(),
            format_bool(link.is_deleted),
            format_bool(tag.is_deleted),
        ]);
    }

    let mut attachments = Sheet::with_header(SHEET_ATTACHMENTS, ATTACHMENT_COLUMNS);
    for a in &selection.attachments {
        attachments.push_row(vec![
            a.attachment_id.clone(),
            a.problem_id.clone(),
            a.original_file_name.clone(),
            a.content_hash.clone(),
            a.size_bytes.to_string(),
            a.mime_type.clone(),
            a.created_at_utc.clone(),
            a.updated_at_utc.clone(),
            a.updated_by_instance_id.clone(),
            format_bool(a.is_deleted),
        ]);
    }

    let mut workbook = Workbook::default();
    workbook.push_sheet(problems);
    workbook.push_sheet(tags);
    workbook.push_sheet(links);
    workbook.push_sheet(attachments);
    workbook
}

/// Copies the blobs of live attachments into the staging directory. Returns streams for the
/// copied blobs and the hashes that were not in the vault.
fn stage_blobs(
    vault: &AttachmentVault,
    staging: &Path,
    attachments: &[AttachmentRecord],
) -> AppResult<(Vec<ManifestStream>, Vec<String>)> {
    let mut streams = Vec::new();
    let mut missing = Vec::new();
    let mut seen = HashSet::new();

    for attachment in attachments.iter().filter(|a| !a.is_deleted) {
        if !seen.insert(attachment.content_hash.clone()) {
            continue;
        }
        let source = vault.blob_path(&attachment.content_hash)?;
        if !source.is_file() {
            tracing::warn!(content_hash = %attachment.content_hash, "blob missing from vault; package will omit it");
            missing.push(attachment.content_hash.clone());
            continue;
        }
        let rel = blob_relative_path(&attachment.content_hash);
        let dest = staging.join(&rel);
        fs::copy(&source, &dest).map_err(|e| io_error("failed to copy blob into package", &dest, e))?;
        let (hash, bytes) = blake3_file_prefixed(&dest)?;
        streams.push(ManifestStream {
            relative_path: rel,
            hash,
            bytes,
        });
    }
    Ok((streams, missing))
}

/// Builds a package under `out_dir` and returns its directory and manifest.
pub fn build_package(
    conn: &mut Connection,
    replica: &ReplicaJsonV1,
    vault: &AttachmentVault,
    out_dir: &Path,
    options: &BuildOptions,
    codec: &dyn WorkbookCodec,
) -> AppResult<BuiltPackage> {
    let package_id = uuid::Uuid::new_v4().to_string();
    let created_at_utc = format_utc(now_utc())?;
    tracing::info!(%package_id, mode = ?options.mode, remote = ?options.target_remote_instance_id, "package build started");

    let tx = conn
        .transaction()
        .map_err(|e| AppError::db("FC_DB_TX_FAILED", "package_build", "failed to begin read transaction", &e))?;

    let watermark_used = match options.mode {
        BuildMode::Full => None,
        BuildMode::Incremental => {
            let remote = options.target_remote_instance_id.as_deref().ok_or_else(|| {
                AppError::new(
                    "FC_BUILD_REMOTE_REQUIRED",
                    "package_build",
                    "incremental builds need a target remote instance id",
                    false,
                    serde_json::json!({}),
                )
            })?;
            watermark_get(&tx, remote)?.and_then(|w| w.last_exported_at_utc)
        }
    };

    let selection = select(&tx, &options.scope, watermark_used.as_deref())?;
    tx.commit()
        .map_err(|e| AppError::db("FC_DB_TX_FAILED", "package_build", "failed to close read transaction", &e))?;
    tracing::debug!(
        problems = selection.problems.len(),
        tags = selection.tags.len(),
        links = selection.links.len(),
        attachments = selection.attachments.len(),
        watermark = ?watermark_used,
        "package rows selected"
    );

    let staging = out_dir.join(format!(".package_{}.partial", package_id));
    let attachments_dir = staging.join(ATTACHMENTS_DIR);
    fs::create_dir_all(&attachments_dir)
        .map_err(|e| io_error("failed to create package staging directory", &attachments_dir, e))?;

    let workbook_bytes = codec.encode(&to_workbook(&selection))?;
    let workbook_path = staging.join(codec.file_name());
    fs::write(&workbook_path, &workbook_bytes)
        .map_err(|e| io_error("failed to write package workbook", &workbook_path, e))?;

    let mut streams = vec![ManifestStream {
        relative_path: codec.file_name().to_string(),
        hash: blake3_hex_prefixed(&workbook_bytes),
        bytes: workbook_bytes.len() as u64,
    }];
    let (blob_streams, missing_blobs) = stage_blobs(vault, &staging, &selection.attachments)?;
    streams.extend(blob_streams);

    let manifest = PackageManifestV1 {
        manifest_version: MANIFEST_VERSION,
        package_id: package_id.clone(),
        schema_version: LATEST_SCHEMA_VERSION,
        created_at_utc,
        exporter_instance_id: replica.instance_id.clone(),
        exporter_instance_kind: replica.instance_kind.clone(),
        mode: options.mode,
        target_remote_instance_id: options.target_remote_instance_id.clone(),
        watermark_used,
        max_updated_at_utc: selection.max_updated_at(),
        counts: ManifestCounts {
            problems: selection.problems.len() as u64,
            tags: selection.tags.len() as u64,
            problem_tags: selection.links.len() as u64,
            attachments: selection.attachments.len() as u64,
        },
        streams,
        missing_blobs,
    };

    let manifest_value = serde_json::to_value(&manifest)
        .map_err(|e| build_error("failed to serialize package manifest", serde_json::json!({ "error": e.to_string() })))?;
    let manifest_path = staging.join(MANIFEST_FILE);
    fs::write(&manifest_path, to_canonical_bytes(&manifest_value)?)
        .map_err(|e| io_error("failed to write package manifest", &manifest_path, e))?;

    let dir = out_dir.join(format!("package_{}", package_id));
    fs::rename(&staging, &dir).map_err(|e| io_error("failed to finalize package directory", &dir, e))?;

    tracing::info!(
        %package_id,
        dir = %dir.display(),
        problems = manifest.counts.problems,
        attachments = manifest.counts.attachments,
        missing_blobs = manifest.missing_blobs.len(),
        "package build finished"
    );
    Ok(BuiltPackage { dir, manifest })
}
