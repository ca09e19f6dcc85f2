use crate::app_error::{AppError, AppResult};
use crate::hashing::{blake3_hex_prefixed, validate_blake3_prefixed, BLAKE3_PREFIX};
use crate::package::OpenedPackage;
use crate::types::AttachmentRecord;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// Content-addressed blob area of one replica: `<blobs_dir>/<2 hex>/<content_hash>`.
#[derive(Debug, Clone)]
pub struct AttachmentVault {
    blobs_dir: PathBuf,
}

/// A blob copy recorded during the transactional phase and performed after commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingBlobCopy {
    pub attachment_id: String,
    pub content_hash: String,
    pub source: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "error", rename_all = "snake_case")]
pub enum BlobCopyOutcome {
    Copied,
    AlreadyPresent,
    Failed(String),
}

/// What an attachment row needs from the blob side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobPlan {
    /// Soft-deleted rows propagate without touching blobs.
    RowOnly,
    Copy(PendingBlobCopy),
    Missing,
}

fn vault_error(code: &str, message: &str, details: serde_json::Value) -> AppError {
    AppError::new(code, "attachment_vault", message, false, details)
}

impl AttachmentVault {
    pub fn new(blobs_dir: PathBuf) -> Self {
        Self { blobs_dir }
    }

    pub fn blobs_dir(&self) -> &Path {
        &self.blobs_dir
    }

    pub fn blob_path(&self, content_hash: &str) -> AppResult<PathBuf> {
        validate_blake3_prefixed(content_hash)?;
        let digest = &content_hash[BLAKE3_PREFIX.len()..];
        Ok(self.blobs_dir.join(&digest[0..2]).join(content_hash))
    }

    pub fn exists(&self, content_hash: &str) -> AppResult<bool> {
        Ok(self.blob_path(content_hash)?.is_file())
    }

    /// Stores locally authored bytes; returns the content hash.
    pub fn put_bytes(&self, bytes: &[u8]) -> AppResult<String> {
        let content_hash = blake3_hex_prefixed(bytes);
        let path = self.blob_path(&content_hash)?;
        if path.exists() {
            return Ok(content_hash);
        }
        let parent = self.prefix_dir(&path)?;
        let mut temp = tempfile::NamedTempFile::new_in(&parent).map_err(|e| {
            vault_error(
                "FC_BLOB_WRITE_FAILED",
                "failed to create temporary blob file",
                serde_json::json!({ "error": e.to_string(), "path": parent }),
            )
        })?;
        temp.write_all(bytes).map_err(|e| {
            vault_error(
                "FC_BLOB_WRITE_FAILED",
                "failed to write blob bytes",
                serde_json::json!({ "error": e.to_string(), "path": path }),
            )
        })?;
        place(temp, &path)?;
        Ok(content_hash)
    }

    pub fn read_bytes(&self, content_hash: &str) -> AppResult<Vec<u8>> {
        let path = self.blob_path(content_hash)?;
        fs::read(&path).map_err(|e| {
            vault_error(
                "FC_BLOB_READ_FAILED",
                "failed to read blob bytes",
                serde_json::json!({ "error": e.to_string(), "path": path }),
            )
        })
    }

    /// Decides how an incoming attachment row is materialized. The blob must ship in the
    /// package itself; a blob already in this vault does not excuse a missing one.
    pub fn plan(&self, package: &OpenedPackage, attachment: &AttachmentRecord) -> BlobPlan {
        if attachment.is_deleted {
            return BlobPlan::RowOnly;
        }
        match package.blob_path(&attachment.content_hash) {
            Some(source) => BlobPlan::Copy(PendingBlobCopy {
                attachment_id: attachment.attachment_id.clone(),
                content_hash: attachment.content_hash.clone(),
                source,
            }),
            None => BlobPlan::Missing,
        }
    }

    /// Copies one blob into place unless it is already there. The bytes are hashed while
    /// streaming into a temporary file next to the destination; only a verified file is renamed
    /// into place.
    pub fn copy_pending(&self, copy: &PendingBlobCopy) -> BlobCopyOutcome {
        match self.try_copy(copy) {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(
                    content_hash = %copy.content_hash,
                    code = %err.code,
                    "blob copy failed"
                );
                BlobCopyOutcome::Failed(format!("{}: {}", err.code, err.message))
            }
        }
    }

    fn try_copy(&self, copy: &PendingBlobCopy) -> AppResult<BlobCopyOutcome> {
        let dest = self.blob_path(&copy.content_hash)?;
        if dest.is_file() {
            return Ok(BlobCopyOutcome::AlreadyPresent);
        }
        let parent = self.prefix_dir(&dest)?;

        let mut source = File::open(&copy.source).map_err(|e| {
            vault_error(
                "FC_BLOB_READ_FAILED",
                "failed to open source blob",
                serde_json::json!({ "error": e.to_string(), "path": copy.source }),
            )
        })?;
        let mut temp = tempfile::NamedTempFile::new_in(&parent).map_err(|e| {
            vault_error(
                "FC_BLOB_WRITE_FAILED",
                "failed to create temporary blob file",
                serde_json::json!({ "error": e.to_string(), "path": parent }),
            )
        })?;

        let mut hasher = blake3::Hasher::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = source.read(&mut buf).map_err(|e| {
                vault_error(
                    "FC_BLOB_READ_FAILED",
                    "failed to read source blob",
                    serde_json::json!({ "error": e.to_string(), "path": copy.source }),
                )
            })?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            temp.write_all(&buf[..n]).map_err(|e| {
                vault_error(
                    "FC_BLOB_WRITE_FAILED",
                    "failed to write blob bytes",
                    serde_json::json!({ "error": e.to_string(), "path": dest }),
                )
            })?;
        }

        let actual = format!("{}{}", BLAKE3_PREFIX, hasher.finalize().to_hex());
        if actual != copy.content_hash {
            return Err(vault_error(
                "FC_BLOB_HASH_MISMATCH",
                "source blob does not match its content hash",
                serde_json::json!({ "expected": copy.content_hash, "actual": actual, "path": copy.source }),
            ));
        }

        place(temp, &dest)
    }

    fn prefix_dir(&self, blob: &Path) -> AppResult<PathBuf> {
        let parent = blob
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.blobs_dir.clone());
        fs::create_dir_all(&parent).map_err(|e| {
            vault_error(
                "FC_BLOB_WRITE_FAILED",
                "failed to create blob prefix directory",
                serde_json::json!({ "error": e.to_string(), "path": parent }),
            )
        })?;
        Ok(parent)
    }
}

// A concurrent writer that got there first wrote the same content.
fn place(temp: tempfile::NamedTempFile, dest: &Path) -> AppResult<BlobCopyOutcome> {
    match temp.persist_noclobber(dest) {
        Ok(_) => Ok(BlobCopyOutcome::Copied),
        Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(BlobCopyOutcome::AlreadyPresent),
        Err(e) => Err(vault_error(
            "FC_BLOB_WRITE_FAILED",
            "failed to move blob into place",
            serde_json::json!({ "error": e.error.to_string(), "path": dest }),
        )),
    }
}
