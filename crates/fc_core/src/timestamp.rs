//! UTC timestamp parsing and the canonical text form persisted in the store.
//!
//! Canonical text is fixed width (`2024-05-01T08:30:00.0000000Z`), so lexical order in SQL
//! equals chronological order.

use crate::app_error::{AppError, AppResult};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

const CANONICAL_FORMAT: &[time::format_description::FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:7]Z");

fn parse_error(raw: &str, reason: &str) -> AppError {
    AppError::new(
        "FC_TIMESTAMP_INVALID",
        "timestamp",
        "failed to parse timestamp",
        false,
        serde_json::json!({ "value": raw, "reason": reason }),
    )
}

fn has_explicit_offset(time_part: &str) -> bool {
    time_part.ends_with('Z')
        || time_part.ends_with('z')
        || time_part.contains('+')
        || time_part.contains('-')
}

/// Parses a date-time with an explicit offset, or without one (assumed UTC).
pub fn parse_utc(raw: &str) -> AppResult<OffsetDateTime> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(parse_error(raw, "empty"));
    }

    let mut text = trimmed.to_string();
    if text.len() == 10 {
        text.push_str("T00:00:00");
    } else if text.as_bytes().get(10) == Some(&b' ') {
        text.replace_range(10..11, "T");
    }

    let time_part = text.get(11..).unwrap_or_default();
    if !has_explicit_offset(time_part) {
        text.push('Z');
    }

    OffsetDateTime::parse(&text, &Rfc3339)
        .map(|dt| dt.to_offset(UtcOffset::UTC))
        .map_err(|e| parse_error(raw, &e.to_string()))
}

pub fn format_utc(dt: OffsetDateTime) -> AppResult<String> {
    dt.to_offset(UtcOffset::UTC)
        .format(CANONICAL_FORMAT)
        .map_err(|e| {
            AppError::new(
                "FC_TIMESTAMP_FORMAT_FAILED",
                "timestamp",
                "failed to format timestamp",
                false,
                serde_json::json!({ "error": e.to_string() }),
            )
        })
}

/// Parses any accepted input form and returns canonical text.
pub fn normalize_utc(raw: &str) -> AppResult<String> {
    format_utc(parse_utc(raw)?)
}

pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// Stand-in for rows reconstructed without a real audit trail; any authored row beats it.
pub fn synthetic_epoch_text() -> String {
    "1970-01-01T00:00:00.0000000Z".to_string()
}
