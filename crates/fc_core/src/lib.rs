pub mod app_error;
pub mod attachment_vault;
pub mod authoring;
pub mod canon_json;
pub mod conflict;
pub mod db;
pub mod hashing;
pub mod package;
pub mod package_apply;
pub mod package_build;
pub mod replica;
pub mod sheet_rows;
pub mod store;
pub mod tag_reconcile;
pub mod timestamp;
pub mod types;
pub mod watermark;
pub mod workbook;

pub use app_error::{AppError, AppResult};
