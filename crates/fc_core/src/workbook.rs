//! Tabular document model shared by the package builder and applier.
//!
//! A workbook is a list of named sheets; each sheet is rows of text cells whose first row is
//! the header. How a workbook is laid out on disk is the codec's business: the engine only ever
//! calls `decode`/`encode`.

use crate::app_error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const SHEET_PROBLEMS: &str = "Problems";
pub const SHEET_TAGS: &str = "Tags";
pub const SHEET_PROBLEM_TAGS: &str = "ProblemTags";
pub const SHEET_ATTACHMENTS: &str = "Attachments";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sheet {
    pub name: String,
    pub rows: Vec<Vec<String>>,
}

impl Sheet {
    pub fn with_header(name: &str, header: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            rows: vec![header.iter().map(|h| h.to_string()).collect()],
        }
    }

    pub fn push_row(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    pub fn header(&self) -> &[String] {
        self.rows.first().map(|r| r.as_slice()).unwrap_or(&[])
    }

    pub fn data_rows(&self) -> &[Vec<String>] {
        if self.rows.is_empty() {
            &[]
        } else {
            &self.rows[1..]
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workbook {
    pub sheets: Vec<Sheet>,
}

impl Workbook {
    /// Sheet lookup ignores case and surrounding whitespace.
    pub fn sheet(&self, name: &str) -> Option<&Sheet> {
        let wanted = normalize_header(name);
        self.sheets.iter().find(|s| normalize_header(&s.name) == wanted)
    }

    pub fn push_sheet(&mut self, sheet: Sheet) {
        self.sheets.push(sheet);
    }
}

/// "Read sheet → rows" / "write rows → sheet" seam for concrete document formats.
pub trait WorkbookCodec {
    /// File name of the document inside a package directory.
    fn file_name(&self) -> &'static str;
    fn decode(&self, bytes: &[u8]) -> AppResult<Workbook>;
    fn encode(&self, workbook: &Workbook) -> AppResult<Vec<u8>>;
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonWorkbookFile {
    format: String,
    version: u32,
    sheets: Vec<Sheet>,
}

const JSON_WORKBOOK_FORMAT: &str = "fc-workbook";

/// Workbook stored as a single JSON document (`workbook.json`).
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonWorkbookCodec;

impl WorkbookCodec for JsonWorkbookCodec {
    fn file_name(&self) -> &'static str {
        "workbook.json"
    }

    fn decode(&self, bytes: &[u8]) -> AppResult<Workbook> {
        let file: JsonWorkbookFile = serde_json::from_slice(bytes).map_err(|e| {
            AppError::new(
                "FC_PACKAGE_CORRUPT",
                "workbook",
                "failed to parse workbook document",
                false,
                serde_json::json!({ "error": e.to_string() }),
            )
        })?;
        if file.format != JSON_WORKBOOK_FORMAT || file.version != 1 {
            return Err(AppError::new(
                "FC_PACKAGE_CORRUPT",
                "workbook",
                "unsupported workbook document format",
                false,
                serde_json::json!({ "format": file.format, "version": file.version }),
            ));
        }
        Ok(Workbook { sheets: file.sheets })
    }

    fn encode(&self, workbook: &Workbook) -> AppResult<Vec<u8>> {
        let file = JsonWorkbookFile {
            format: JSON_WORKBOOK_FORMAT.to_string(),
            version: 1,
            sheets: workbook.sheets.clone(),
        };
        serde_json::to_vec_pretty(&file).map_err(|e| {
            AppError::new(
                "FC_PACKAGE_BUILD_FAILED",
                "workbook",
                "failed to encode workbook document",
                false,
                serde_json::json!({ "error": e.to_string() }),
            )
        })
    }
}

fn normalize_header(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Column positions by header name, matched case-insensitively after trimming.
#[derive(Debug, Clone)]
pub struct HeaderIndex {
    columns: HashMap<String, usize>,
}

impl HeaderIndex {
    pub fn from_header(header: &[String]) -> Self {
        let mut columns = HashMap::new();
        for (idx, name) in header.iter().enumerate() {
            columns.entry(normalize_header(name)).or_insert(idx);
        }
        Self { columns }
    }

    pub fn has(&self, column: &str) -> bool {
        self.columns.contains_key(&normalize_header(column))
    }

    /// Required columns absent from the header, in the order given.
    pub fn missing(&self, required: &[&str]) -> Vec<String> {
        required
            .iter()
            .filter(|c| !self.has(c))
            .map(|c| c.to_string())
            .collect()
    }

    /// Cell text; absent columns and short rows read as "".
    pub fn cell<'a>(&self, row: &'a [String], column: &str) -> &'a str {
        self.columns
            .get(&normalize_header(column))
            .and_then(|idx| row.get(*idx))
            .map(|s| s.as_str())
            .unwrap_or("")
    }
}
