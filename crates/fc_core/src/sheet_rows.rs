//! Converts package sheets into typed incoming rows.
//!
//! Only a missing `Problems` sheet is fatal. Missing columns are reported once per sheet and
//! read as empty cells; bad cells invalidate just their row.

use crate::app_error::{AppError, AppResult};
use crate::hashing::validate_blake3_prefixed;
use crate::timestamp::normalize_utc;
use crate::types::{AttachmentRecord, IncomingLink, ProblemRecord, TagRecord};
use crate::workbook::{
    HeaderIndex, Sheet, Workbook, SHEET_ATTACHMENTS, SHEET_PROBLEMS, SHEET_PROBLEM_TAGS, SHEET_TAGS,
};
use serde::{Deserialize, Serialize};

pub const PROBLEM_COLUMNS: &[&str] = &[
    "ProblemId",
    "Title",
    "Symptom",
    "RootCause",
    "Solution",
    "EnvironmentJson",
    "CreatedAtUtc",
    "CreatedBy",
    "UpdatedAtUtc",
    "UpdatedByInstanceId",
    "IsDeleted",
    "DeletedAtUtc",
    "SourceKind",
];
pub const PROBLEM_OPTIONAL_COLUMNS: &[&str] = &["Severity", "Status"];
pub const TAG_COLUMNS: &[&str] = &[
    "TagId",
    "Name",
    "CreatedAtUtc",
    "UpdatedAtUtc",
    "UpdatedByInstanceId",
    "IsDeleted",
];
pub const PROBLEM_TAG_COLUMNS: &[&str] = &[
    "ProblemId",
    "TagId",
    "TagName",
    "ProblemTagIsDeleted",
    "TagIsDeleted",
];
pub const ATTACHMENT_COLUMNS: &[&str] = &[
    "AttachmentId",
    "ProblemId",
    "OriginalFileName",
    "ContentHash",
    "SizeBytes",
    "MimeType",
    "CreatedAtUtc",
    "UpdatedAtUtc",
    "UpdatedByInstanceId",
    "IsDeleted",
];

const DEFAULT_MIME: &str = "application/octet-stream";

/// Rows per sheet as they appear in the document (header excluded).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetRowCounts {
    pub problems: u64,
    pub tags: u64,
    pub problem_tags: u64,
    pub attachments: u64,
}

#[derive(Debug, Clone, Default)]
pub struct IncomingBatch {
    pub problems: Vec<ProblemRecord>,
    pub tags: Vec<TagRecord>,
    pub links: Vec<IncomingLink>,
    pub attachments: Vec<AttachmentRecord>,
    pub in_file: SheetRowCounts,
    pub rejected: SheetRowCounts,
    pub errors: Vec<String>,
}

pub fn format_bool(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}

fn parse_bool(cell: &str) -> bool {
    cell.trim() == "1"
}

struct RowReader<'a> {
    sheet: &'a str,
    row_number: usize,
    index: &'a HeaderIndex,
    row: &'a [String],
}

impl<'a> RowReader<'a> {
    fn text(&self, column: &str) -> &'a str {
        self.index.cell(self.row, column)
    }

    fn required_id(&self, column: &str) -> Result<String, String> {
        let value = self.text(column).trim();
        if value.is_empty() {
            return Err(format!("{} row {}: blank {}", self.sheet, self.row_number, column));
        }
        Ok(value.to_string())
    }

    fn timestamp(&self, column: &str) -> Result<String, String> {
        let raw = self.text(column);
        normalize_utc(raw).map_err(|_| {
            format!(
                "{} row {}: unparseable {} '{}'",
                self.sheet, self.row_number, column, raw
            )
        })
    }

    fn optional_timestamp(&self, column: &str) -> Result<Option<String>, String> {
        if self.text(column).trim().is_empty() {
            return Ok(None);
        }
        self.timestamp(column).map(Some)
    }

    fn integer(&self, column: &str) -> Result<i64, String> {
        let raw = self.text(column).trim();
        if raw.is_empty() {
            return Ok(0);
        }
        raw.parse::<i64>().map_err(|_| {
            format!(
                "{} row {}: unparseable {} '{}'",
                self.sheet, self.row_number, column, raw
            )
        })
    }

    fn flag(&self, column: &str) -> bool {
        parse_bool(self.text(column))
    }
}

fn for_each_row<T>(
    sheet: &Sheet,
    required: &[&str],
    errors: &mut Vec<String>,
    mut parse: impl FnMut(&RowReader<'_>) -> Result<T, String>,
) -> (Vec<T>, u64, u64) {
    let index = HeaderIndex::from_header(sheet.header());
    for column in index.missing(required) {
        errors.push(format!(
            "sheet {} is missing required column: {}",
            sheet.name, column
        ));
    }

    let mut out = Vec::new();
    let mut rejected = 0u64;
    let data = sheet.data_rows();
    for (idx, row) in data.iter().enumerate() {
        let reader = RowReader {
            sheet: &sheet.name,
            row_number: idx + 2,
            index: &index,
            row,
        };
        match parse(&reader) {
            Ok(value) => out.push(value),
            Err(message) => {
                tracing::warn!(%message, "rejected package row");
                errors.push(message);
                rejected += 1;
            }
        }
    }
    (out, data.len() as u64, rejected)
}

fn parse_problem(r: &RowReader<'_>) -> Result<ProblemRecord, String> {
    let problem_id = r.required_id("ProblemId")?;
    let created_at_utc = r.timestamp("CreatedAtUtc")?;
    let updated_at_utc = r.timestamp("UpdatedAtUtc")?;
    let is_deleted = r.flag("IsDeleted");
    let deleted_at_utc = r.optional_timestamp("DeletedAtUtc")?;
    let environment_json = match r.text("EnvironmentJson").trim() {
        "" => "{}".to_string(),
        other => other.to_string(),
    };
    let source_kind = match r.text("SourceKind").trim() {
        "" => "import".to_string(),
        other => other.to_string(),
    };

    Ok(ProblemRecord {
        problem_id,
        title: r.text("Title").to_string(),
        symptom: r.text("Symptom").to_string(),
        root_cause: r.text("RootCause").to_string(),
        solution: r.text("Solution").to_string(),
        environment_json,
        severity: r.integer("Severity")?,
        status: r.integer("Status")?,
        created_at_utc,
        created_by: r.text("CreatedBy").trim().to_string(),
        deleted_at_utc: if is_deleted {
            deleted_at_utc.or_else(|| Some(updated_at_utc.clone()))
        } else {
            None
        },
        updated_at_utc,
        updated_by_instance_id: r.text("UpdatedByInstanceId").trim().to_string(),
        is_deleted,
        source_kind,
    })
}

fn parse_tag(r: &RowReader<'_>) -> Result<TagRecord, String> {
    let tag_id = r.required_id("TagId")?;
    let created_at_utc = r.timestamp("CreatedAtUtc")?;
    let updated_at_utc = r.timestamp("UpdatedAtUtc")?;
    let is_deleted = r.flag("IsDeleted");
    Ok(TagRecord {
        tag_id,
        name: r.text("Name").to_string(),
        created_at_utc,
        deleted_at_utc: is_deleted.then(|| updated_at_utc.clone()),
        updated_at_utc,
        updated_by_instance_id: r.text("UpdatedByInstanceId").trim().to_string(),
        is_deleted,
    })
}

fn parse_link(r: &RowReader<'_>) -> Result<IncomingLink, String> {
    Ok(IncomingLink {
        problem_id: r.required_id("ProblemId")?,
        tag_id: r.required_id("TagId")?,
        tag_name: r.text("TagName").to_string(),
        link_is_deleted: r.flag("ProblemTagIsDeleted"),
        tag_is_deleted: r.flag("TagIsDeleted"),
    })
}

fn parse_attachment(r: &RowReader<'_>) -> Result<AttachmentRecord, String> {
    let attachment_id = r.required_id("AttachmentId")?;
    let problem_id = r.required_id("ProblemId")?;
    let content_hash = r.required_id("ContentHash")?;
    validate_blake3_prefixed(&content_hash).map_err(|_| {
        format!(
            "{} row {}: invalid ContentHash '{}'",
            r.sheet, r.row_number, content_hash
        )
    })?;
    let created_at_utc = r.timestamp("CreatedAtUtc")?;
    let updated_at_utc = r.timestamp("UpdatedAtUtc")?;
    let is_deleted = r.flag("IsDeleted");
    let mime_type = match r.text("MimeType").trim() {
        "" => DEFAULT_MIME.to_string(),
        other => other.to_string(),
    };
    Ok(AttachmentRecord {
        attachment_id,
        problem_id,
        original_file_name: r.text("OriginalFileName").trim().to_string(),
        content_hash,
        size_bytes: r.integer("SizeBytes")?,
        mime_type,
        created_at_utc,
        deleted_at_utc: is_deleted.then(|| updated_at_utc.clone()),
        updated_at_utc,
        updated_by_instance_id: r.text("UpdatedByInstanceId").trim().to_string(),
        is_deleted,
    })
}

/// Reads every known sheet. The only error is a missing `Problems` sheet.
pub fn read_batch(workbook: &Workbook) -> AppResult<IncomingBatch> {
    let problems_sheet = workbook.sheet(SHEET_PROBLEMS).ok_or_else(|| {
        AppError::new(
            "FC_PACKAGE_SHEET_MISSING",
            "package",
            "package is missing the mandatory Problems sheet",
            false,
            serde_json::json!({
                "sheet": SHEET_PROBLEMS,
                "present": workbook.sheets.iter().map(|s| s.name.clone()).collect::<Vec<_>>()
            }),
        )
    })?;

    let mut batch = IncomingBatch::default();

    let (problems, in_file, rejected) =
        for_each_row(problems_sheet, PROBLEM_COLUMNS, &mut batch.errors, parse_problem);
    batch.problems = problems;
    batch.in_file.problems = in_file;
    batch.rejected.problems = rejected;

    if let Some(sheet) = workbook.sheet(SHEET_TAGS) {
        let (tags, in_file, rejected) = for_each_row(sheet, TAG_COLUMNS, &mut batch.errors, parse_tag);
        batch.tags = tags;
        batch.in_file.tags = in_file;
        batch.rejected.tags = rejected;
    }

    if let Some(sheet) = workbook.sheet(SHEET_PROBLEM_TAGS) {
        let (links, in_file, rejected) =
            for_each_row(sheet, PROBLEM_TAG_COLUMNS, &mut batch.errors, parse_link);
        batch.links = links;
        batch.in_file.problem_tags = in_file;
        batch.rejected.problem_tags = rejected;
    }

    if let Some(sheet) = workbook.sheet(SHEET_ATTACHMENTS) {
        let (attachments, in_file, rejected) =
            for_each_row(sheet, ATTACHMENT_COLUMNS, &mut batch.errors, parse_attachment);
        batch.attachments = attachments;
        batch.in_file.attachments = in_file;
        batch.rejected.attachments = rejected;
    }

    Ok(batch)
}
