use crate::app_error::{AppError, AppResult};
use crate::hashing::{blake3_file_prefixed, blake3_hex_prefixed};
use crate::workbook::{Workbook, WorkbookCodec};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const ATTACHMENTS_DIR: &str = "attachments";
pub const MANIFEST_VERSION: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildMode {
    Full,
    Incremental,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestStream {
    pub relative_path: String,
    pub hash: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestCounts {
    pub problems: u64,
    pub tags: u64,
    pub problem_tags: u64,
    pub attachments: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageManifestV1 {
    pub manifest_version: i64,
    pub package_id: String,
    pub schema_version: i64,
    pub created_at_utc: String,
    pub exporter_instance_id: String,
    pub exporter_instance_kind: String,
    pub mode: BuildMode,
    pub target_remote_instance_id: Option<String>,
    pub watermark_used: Option<String>,
    pub max_updated_at_utc: Option<String>,
    pub counts: ManifestCounts,
    pub streams: Vec<ManifestStream>,
    #[serde(default)]
    pub missing_blobs: Vec<String>,
}

impl PackageManifestV1 {
    pub fn stream(&self, relative_path: &str) -> Option<&ManifestStream> {
        self.streams.iter().find(|s| s.relative_path == relative_path)
    }
}

/// A package opened for reading: either a package directory or a bare workbook document.
#[derive(Debug, Clone)]
pub struct OpenedPackage {
    pub source_path: PathBuf,
    pub manifest: Option<PackageManifestV1>,
    pub workbook: Workbook,
    pub attachments_dir: Option<PathBuf>,
}

impl OpenedPackage {
    pub fn package_id(&self) -> Option<&str> {
        self.manifest.as_ref().map(|m| m.package_id.as_str())
    }

    /// Location of the blob for `content_hash` inside the bundle, when the bundle has one.
    pub fn blob_path(&self, content_hash: &str) -> Option<PathBuf> {
        let dir = self.attachments_dir.as_ref()?;
        let path = dir.join(content_hash);
        path.is_file().then_some(path)
    }
}

pub fn blob_relative_path(content_hash: &str) -> String {
    format!("{}/{}", ATTACHMENTS_DIR, content_hash)
}

fn package_error(code: &str, message: &str, details: serde_json::Value) -> AppError {
    AppError::new(code, "package", message, false, details)
}

pub fn read_manifest(path: &Path) -> AppResult<PackageManifestV1> {
    let bytes = fs::read(path).map_err(|e| {
        package_error(
            "FC_PACKAGE_CORRUPT",
            "failed to read package manifest",
            serde_json::json!({ "error": e.to_string(), "path": path }),
        )
    })?;
    let manifest: PackageManifestV1 = serde_json::from_slice(&bytes).map_err(|e| {
        package_error(
            "FC_PACKAGE_CORRUPT",
            "failed to parse package manifest",
            serde_json::json!({ "error": e.to_string(), "path": path }),
        )
    })?;
    if manifest.manifest_version != MANIFEST_VERSION {
        return Err(package_error(
            "FC_PACKAGE_UNSUPPORTED_VERSION",
            "unsupported package manifest version",
            serde_json::json!({ "expected": MANIFEST_VERSION, "actual": manifest.manifest_version }),
        ));
    }
    Ok(manifest)
}

fn read_document(path: &Path) -> AppResult<Vec<u8>> {
    fs::read(path).map_err(|e| {
        package_error(
            "FC_PACKAGE_CORRUPT",
            "failed to read package workbook",
            serde_json::json!({ "error": e.to_string(), "path": path }),
        )
    })
}

/// Opens a package. Fails on a missing or unreadable container and, when a manifest is
/// present, on a workbook whose bytes do not match the manifest checksum.
pub fn open_package(path: &Path, codec: &dyn WorkbookCodec) -> AppResult<OpenedPackage> {
    if !path.exists() {
        return Err(package_error(
            "FC_PACKAGE_NOT_FOUND",
            "package path does not exist",
            serde_json::json!({ "path": path }),
        ));
    }

    if path.is_file() {
        let bytes = read_document(path)?;
        return Ok(OpenedPackage {
            source_path: path.to_path_buf(),
            manifest: None,
            workbook: codec.decode(&bytes)?,
            attachments_dir: None,
        });
    }

    let manifest_path = path.join(MANIFEST_FILE);
    let manifest = if manifest_path.exists() {
        Some(read_manifest(&manifest_path)?)
    } else {
        None
    };

    let document_path = path.join(codec.file_name());
    let bytes = read_document(&document_path)?;
    if let Some(stream) = manifest.as_ref().and_then(|m| m.stream(codec.file_name())) {
        let actual = blake3_hex_prefixed(&bytes);
        if actual != stream.hash || bytes.len() as u64 != stream.bytes {
            return Err(package_error(
                "FC_PACKAGE_CORRUPT",
                "package workbook does not match manifest checksum",
                serde_json::json!({
                    "expected": stream.hash,
                    "actual": actual,
                    "expected_bytes": stream.bytes,
                    "actual_bytes": bytes.len()
                }),
            ));
        }
    }

    let attachments_dir = path.join(ATTACHMENTS_DIR);
    Ok(OpenedPackage {
        source_path: path.to_path_buf(),
        manifest,
        workbook: codec.decode(&bytes)?,
        attachments_dir: attachments_dir.is_dir().then_some(attachments_dir),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageVerifyReport {
    pub package_id: String,
    pub ok: bool,
    pub streams_checked: u64,
    pub missing: Vec<String>,
    pub mismatched: Vec<String>,
    /// Files under `attachments/` that the manifest does not list.
    pub unlisted: Vec<String>,
}

fn is_safe_relative(rel: &str) -> bool {
    let path = Path::new(rel);
    !rel.is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)))
}

fn unlisted_attachments(path: &Path, manifest: &PackageManifestV1) -> Vec<String> {
    let dir = path.join(ATTACHMENTS_DIR);
    if !dir.is_dir() {
        return Vec::new();
    }
    let mut unlisted: Vec<String> = walkdir::WalkDir::new(&dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            entry
                .path()
                .strip_prefix(path)
                .ok()
                .map(|rel| rel.to_string_lossy().replace('\\', "/"))
        })
        .filter(|rel| manifest.stream(rel).is_none())
        .collect();
    unlisted.sort();
    unlisted
}

/// Re-hashes every stream listed in a package manifest. Unlisted attachment files are
/// reported but do not fail verification.
pub fn verify_package(path: &Path) -> AppResult<PackageVerifyReport> {
    let manifest = read_manifest(&path.join(MANIFEST_FILE))?;
    let mut missing = Vec::new();
    let mut mismatched = Vec::new();
    let mut streams_checked = 0u64;

    for stream in &manifest.streams {
        if !is_safe_relative(&stream.relative_path) {
            mismatched.push(stream.relative_path.clone());
            continue;
        }
        let file = path.join(&stream.relative_path);
        if !file.is_file() {
            missing.push(stream.relative_path.clone());
            continue;
        }
        let (hash, bytes) = blake3_file_prefixed(&file)?;
        streams_checked += 1;
        if hash != stream.hash || bytes != stream.bytes {
            mismatched.push(stream.relative_path.clone());
        }
    }

    let unlisted = unlisted_attachments(path, &manifest);
    Ok(PackageVerifyReport {
        package_id: manifest.package_id,
        ok: missing.is_empty() && mismatched.is_empty(),
        streams_checked,
        missing,
        mismatched,
        unlisted,
    })
}
