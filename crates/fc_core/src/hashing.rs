use crate::app_error::{AppError, AppResult};
use std::fs::File;
use std::io;
use std::path::Path;

pub const BLAKE3_PREFIX: &str = "blake3:";

pub fn blake3_hex_prefixed(bytes: &[u8]) -> String {
    format!("{}{}", BLAKE3_PREFIX, blake3::hash(bytes).to_hex())
}

/// Streams a file through blake3 without loading it whole.
pub fn blake3_file_prefixed(path: &Path) -> AppResult<(String, u64)> {
    let mut file = File::open(path).map_err(|e| {
        AppError::new(
            "FC_HASH_READ_FAILED",
            "hash",
            "failed to open file for hashing",
            false,
            serde_json::json!({ "error": e.to_string(), "path": path }),
        )
    })?;
    let mut hasher = blake3::Hasher::new();
    let bytes = io::copy(&mut file, &mut hasher).map_err(|e| {
        AppError::new(
            "FC_HASH_READ_FAILED",
            "hash",
            "failed to read file for hashing",
            false,
            serde_json::json!({ "error": e.to_string(), "path": path }),
        )
    })?;
    Ok((format!("{}{}", BLAKE3_PREFIX, hasher.finalize().to_hex()), bytes))
}

pub fn validate_blake3_prefixed(s: &str) -> AppResult<()> {
    if !s.starts_with(BLAKE3_PREFIX) {
        return Err(AppError::new(
            "FC_HASH_INVALID_FORMAT",
            "hash",
            "hash must start with blake3:",
            false,
            serde_json::json!({ "value": s }),
        ));
    }
    let hex = &s[BLAKE3_PREFIX.len()..];
    if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
        return Err(AppError::new(
            "FC_HASH_DECODE_FAILED",
            "hash",
            "invalid lowercase hex digest",
            false,
            serde_json::json!({ "value": s }),
        ));
    }
    Ok(())
}
