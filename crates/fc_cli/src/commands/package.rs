use crate::cli::{ModeArg, PolicyArg, TagModeArg};
use fc_core::app_error::AppResult;
use fc_core::conflict::ConflictPolicy;
use fc_core::package::{open_package, verify_package, BuildMode};
use fc_core::package_apply::{apply_package, ApplyOptions, CancelFlag, TagMergeMode};
use fc_core::package_build::{build_package, BuildOptions, BuildScope};
use fc_core::replica::replica_connect;
use fc_core::workbook::JsonWorkbookCodec;
use std::path::Path;

pub fn run_build(
    replica_path: &str,
    out_dir: &str,
    mode: ModeArg,
    remote: Option<String>,
    problems: Vec<String>,
) -> AppResult<()> {
    let mut opened = replica_connect(Path::new(replica_path))?;
    let options = BuildOptions {
        mode: match mode {
            ModeArg::Full => BuildMode::Full,
            ModeArg::Incremental => BuildMode::Incremental,
        },
        scope: if problems.is_empty() {
            BuildScope::All
        } else {
            BuildScope::Problems(problems)
        },
        target_remote_instance_id: remote,
    };
    let built = build_package(
        &mut opened.conn,
        &opened.descriptor,
        &opened.vault,
        Path::new(out_dir),
        &options,
        &JsonWorkbookCodec,
    )?;
    crate::print_json(&serde_json::json!({
        "package_dir": built.dir,
        "manifest": built.manifest,
    }))
}

pub fn run_apply(
    replica_path: &str,
    package_path: &str,
    policy: Option<PolicyArg>,
    tag_mode: Option<TagModeArg>,
) -> AppResult<()> {
    let mut opened = replica_connect(Path::new(replica_path))?;
    let defaults = &opened.descriptor.defaults;
    let options = ApplyOptions {
        conflict_policy: match policy {
            Some(PolicyArg::SkipIfLocalNewer) => ConflictPolicy::SkipIfLocalNewer,
            Some(PolicyArg::Overwrite) => ConflictPolicy::Overwrite,
            None => defaults.conflict_policy,
        },
        tag_merge_mode: match tag_mode {
            Some(TagModeArg::Replace) => TagMergeMode::Replace,
            Some(TagModeArg::Merge) => TagMergeMode::Merge,
            None => defaults.tag_merge_mode,
        },
    };
    let package = open_package(Path::new(package_path), &JsonWorkbookCodec)?;
    let report = apply_package(
        &mut opened.conn,
        &opened.vault,
        &package,
        options,
        &CancelFlag::new(),
        &opened.descriptor.instance_id,
    )?;
    crate::print_json(&report)
}

/// Prints the verification report; returns whether the package verified clean.
pub fn run_verify(package_path: &str) -> AppResult<bool> {
    let report = verify_package(Path::new(package_path))?;
    crate::print_json(&report)?;
    Ok(report.ok)
}
