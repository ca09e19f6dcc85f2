//! Merges one package into a replica.
//!
//! The transactional phase (`apply_in_transaction`) runs against any `&Connection`: the real
//! entry point hands it an IMMEDIATE transaction, tests may hand it an in-memory database.
//! Blob copies are collected as `PendingBlobCopy` values and performed only after commit, so a
//! failed or interrupted copy never rolls back rows and can be re-driven by applying the same
//! package again.

use crate::app_error::{AppError, AppResult};
use crate::attachment_vault::{AttachmentVault, BlobCopyOutcome, BlobPlan, PendingBlobCopy};
use crate::conflict::{resolve, ConflictPolicy, Resolution};
use crate::package::OpenedPackage;
use crate::sheet_rows::{read_batch, IncomingBatch};
use crate::store;
use crate::tag_reconcile::reconcile_tags;
use crate::timestamp::{format_utc, now_utc, synthetic_epoch_text};
use crate::types::{IncomingLink, ProblemTagLink, TagRecord};
use crate::watermark::watermark_record_import;
use rusqlite::{Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagMergeMode {
    /// A problem's live links become exactly the package's set.
    #[default]
    Replace,
    /// The package's set is added to the live links; nothing is unlinked.
    Merge,
}

impl TagMergeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagMergeMode::Replace => "replace",
            TagMergeMode::Merge => "merge",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyOptions {
    pub conflict_policy: ConflictPolicy,
    pub tag_merge_mode: TagMergeMode,
}

/// Cooperative cancellation, checked between phases and between items.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyPhase {
    Validating,
    Reconciling,
    Applying,
    Committed,
    CopyingBlobs,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityOutcome {
    Applied,
    SkippedUnchanged,
    SkippedConflict,
    SkippedError,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCounts {
    pub in_file: u64,
    pub imported: u64,
    pub skipped: u64,
    pub conflicted: u64,
}

impl EntityCounts {
    fn from_sheet(in_file: u64, rejected: u64) -> Self {
        Self {
            in_file,
            skipped: rejected,
            ..Self::default()
        }
    }

    pub fn record(&mut self, outcome: EntityOutcome) {
        match outcome {
            EntityOutcome::Applied => self.imported += 1,
            EntityOutcome::SkippedUnchanged | EntityOutcome::SkippedError => self.skipped += 1,
            EntityOutcome::SkippedConflict => {
                self.skipped += 1;
                self.conflicted += 1;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkCounts {
    pub in_file: u64,
    pub skipped: u64,
    pub added: u64,
    pub revived: u64,
    pub removed: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobCounts {
    pub copied: u64,
    pub already_present: u64,
    pub failed: u64,
    /// Copies not attempted because the apply was cancelled after commit.
    pub pending: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub package_id: Option<String>,
    pub source_path: String,
    pub phase: ApplyPhase,
    pub conflict_policy: ConflictPolicy,
    pub tag_merge_mode: TagMergeMode,
    pub problems: EntityCounts,
    pub tags: EntityCounts,
    pub attachments: EntityCounts,
    pub links: LinkCounts,
    pub blobs: BlobCounts,
    pub missing_attachment_files: u64,
    pub tag_remaps: u64,
    /// Tags rebuilt from link rows with epoch audit fields; best-effort reconstructions.
    pub derived_tags: Vec<String>,
    pub errors: Vec<String>,
    pub started_at_utc: String,
    pub finished_at_utc: Option<String>,
}

impl ApplyReport {
    pub fn imported_count(&self) -> u64 {
        self.problems.imported + self.tags.imported + self.attachments.imported
    }

    pub fn skipped_count(&self) -> u64 {
        self.problems.skipped + self.tags.skipped + self.attachments.skipped
    }

    pub fn conflict_count(&self) -> u64 {
        self.problems.conflicted + self.tags.conflicted + self.attachments.conflicted
    }
}

/// Result of the transactional phase, before commit.
#[derive(Debug, Clone)]
pub struct TransactionalApply {
    pub report: ApplyReport,
    pub pending_copies: Vec<PendingBlobCopy>,
}

pub struct ApplyContext<'a> {
    pub vault: &'a AttachmentVault,
    pub options: ApplyOptions,
    pub cancel: &'a CancelFlag,
    pub local_instance_id: &'a str,
    pub now_utc: &'a str,
}

impl ApplyContext<'_> {
    fn check_cancel(&self) -> AppResult<()> {
        if self.cancel.is_cancelled() {
            return Err(AppError::new(
                "FC_APPLY_CANCELLED",
                "apply",
                "package apply was cancelled before commit; nothing was written",
                true,
                serde_json::json!({}),
            ));
        }
        Ok(())
    }
}

fn enter(report: &mut ApplyReport, phase: ApplyPhase) {
    tracing::debug!(?phase, package_id = ?report.package_id, "apply phase");
    report.phase = phase;
}

/// Writes every row of `batch` through `conn` without committing.
pub fn apply_in_transaction(
    conn: &Connection,
    ctx: &ApplyContext<'_>,
    package: &OpenedPackage,
    batch: IncomingBatch,
) -> AppResult<TransactionalApply> {
    let mut report = ApplyReport {
        package_id: package.package_id().map(str::to_string),
        source_path: package.source_path.display().to_string(),
        phase: ApplyPhase::Validating,
        conflict_policy: ctx.options.conflict_policy,
        tag_merge_mode: ctx.options.tag_merge_mode,
        problems: EntityCounts::from_sheet(batch.in_file.problems, batch.rejected.problems),
        tags: EntityCounts::from_sheet(batch.in_file.tags, batch.rejected.tags),
        attachments: EntityCounts::from_sheet(batch.in_file.attachments, batch.rejected.attachments),
        links: LinkCounts {
            in_file: batch.in_file.problem_tags,
            skipped: batch.rejected.problem_tags,
            ..LinkCounts::default()
        },
        blobs: BlobCounts::default(),
        missing_attachment_files: 0,
        tag_remaps: 0,
        derived_tags: Vec::new(),
        errors: batch.errors.clone(),
        started_at_utc: ctx.now_utc.to_string(),
        finished_at_utc: None,
    };

    enter(&mut report, ApplyPhase::Reconciling);
    ctx.check_cancel()?;
    let existing = store::list_live_tags(conn)?;
    let reconciliation = reconcile_tags(&existing, &batch.tags, &batch.links);
    report.tag_remaps = reconciliation.remap.len() as u64;
    report.tags.skipped += (batch.tags.len() - reconciliation.tags.len()) as u64;

    enter(&mut report, ApplyPhase::Applying);
    let policy = ctx.options.conflict_policy;

    let mut lost_problems = HashSet::new();
    for problem in &batch.problems {
        ctx.check_cancel()?;
        let outcome = match resolve(conn, problem, policy, ctx.now_utc)? {
            Resolution::Apply => {
                store::upsert_problem(conn, problem)?;
                store::refresh_problem_fts(conn, problem)?;
                EntityOutcome::Applied
            }
            Resolution::Unchanged => EntityOutcome::SkippedUnchanged,
            Resolution::Conflict { .. } => {
                lost_problems.insert(problem.problem_id.clone());
                EntityOutcome::SkippedConflict
            }
        };
        report.problems.record(outcome);
    }

    for tag in &reconciliation.tags {
        ctx.check_cancel()?;
        let outcome = match resolve(conn, tag, policy, ctx.now_utc)? {
            // A failed tag statement leaves the transaction usable; the unique live-name index is
            // the only data-driven way it can fail.
            Resolution::Apply => match store::upsert_tag(conn, tag) {
                Ok(()) => EntityOutcome::Applied,
                Err(err) => {
                    tracing::warn!(tag_id = %tag.tag_id, code = %err.code, "tag row not applied");
                    report.errors.push(format!(
                        "Tags: tag {} '{}' was not applied: {}",
                        tag.tag_id, tag.name, err.message
                    ));
                    EntityOutcome::SkippedError
                }
            },
            Resolution::Unchanged => EntityOutcome::SkippedUnchanged,
            Resolution::Conflict { .. } => EntityOutcome::SkippedConflict,
        };
        report.tags.record(outcome);
    }

    let exporter = package
        .manifest
        .as_ref()
        .map(|m| m.exporter_instance_id.clone())
        .unwrap_or_default();
    for unbacked in &reconciliation.unbacked {
        ctx.check_cancel()?;
        if store::get_tag(conn, &unbacked.tag_id)?.is_some() {
            continue;
        }
        let epoch = synthetic_epoch_text();
        let derived = TagRecord {
            tag_id: unbacked.tag_id.clone(),
            name: unbacked.name.clone(),
            created_at_utc: epoch.clone(),
            updated_at_utc: epoch.clone(),
            updated_by_instance_id: exporter.clone(),
            is_deleted: unbacked.is_deleted,
            deleted_at_utc: unbacked.is_deleted.then(|| epoch.clone()),
        };
        match store::upsert_tag(conn, &derived) {
            Ok(()) => {
                tracing::warn!(tag_id = %derived.tag_id, name = %derived.name, "tag derived from link rows");
                report.derived_tags.push(derived.tag_id);
            }
            Err(err) => report.errors.push(format!(
                "ProblemTags: tag {} '{}' could not be derived: {}",
                derived.tag_id, derived.name, err.message
            )),
        }
    }

    apply_links(conn, ctx, &reconciliation.links, &lost_problems, &mut report)?;

    let mut pending_copies = Vec::new();
    let mut planned_hashes = HashSet::new();
    for attachment in &batch.attachments {
        ctx.check_cancel()?;
        if !store::problem_exists(conn, &attachment.problem_id)? {
            report.errors.push(format!(
                "Attachments: attachment {} references unknown problem {}",
                attachment.attachment_id, attachment.problem_id
            ));
            report.attachments.record(EntityOutcome::SkippedError);
            continue;
        }

        // A losing row is a conflict whether or not its blob shipped.
        let resolution = resolve(conn, attachment, policy, ctx.now_utc)?;
        if matches!(resolution, Resolution::Conflict { .. }) {
            report.attachments.record(EntityOutcome::SkippedConflict);
            continue;
        }

        let plan = ctx.vault.plan(package, attachment);
        if plan == BlobPlan::Missing {
            tracing::warn!(
                attachment_id = %attachment.attachment_id,
                content_hash = %attachment.content_hash,
                "attachment blob missing from package"
            );
            report
                .errors
                .push(format!("missing attachment file: {}", attachment.content_hash));
            report.missing_attachment_files += 1;
            report.attachments.record(EntityOutcome::SkippedError);
            continue;
        }

        let wants_copy = match resolution {
            Resolution::Apply => {
                store::upsert_attachment(conn, attachment)?;
                true
            }
            Resolution::Unchanged => !ctx.vault.exists(&attachment.content_hash)?,
            Resolution::Conflict { .. } => false,
        };
        if let BlobPlan::Copy(copy) = plan {
            if wants_copy && planned_hashes.insert(copy.content_hash.clone()) {
                pending_copies.push(copy);
            }
        }
        report.attachments.record(match resolution {
            Resolution::Apply => EntityOutcome::Applied,
            Resolution::Unchanged => EntityOutcome::SkippedUnchanged,
            Resolution::Conflict { .. } => EntityOutcome::SkippedConflict,
        });
    }

    if let Some(manifest) = package.manifest.as_ref() {
        if let Some(max_updated) = manifest.max_updated_at_utc.as_deref() {
            if manifest.exporter_instance_id != ctx.local_instance_id {
                watermark_record_import(
                    conn,
                    &manifest.exporter_instance_id,
                    &manifest.package_id,
                    max_updated,
                    ctx.now_utc,
                )?;
            }
        }
    }

    ctx.check_cancel()?;
    Ok(TransactionalApply {
        report,
        pending_copies,
    })
}

fn apply_links(
    conn: &Connection,
    ctx: &ApplyContext<'_>,
    links: &[IncomingLink],
    lost_problems: &HashSet<String>,
    report: &mut ApplyReport,
) -> AppResult<()> {
    let mut by_problem: BTreeMap<&str, Vec<&IncomingLink>> = BTreeMap::new();
    for link in links {
        by_problem.entry(link.problem_id.as_str()).or_default().push(link);
    }

    // tag id -> Some(is_deleted), None when the tag is unknown
    let mut tag_state: HashMap<String, Option<bool>> = HashMap::new();

    for (problem_id, rows) in by_problem {
        ctx.check_cancel()?;
        if lost_problems.contains(problem_id) {
            report.links.skipped += rows.len() as u64;
            continue;
        }
        if !store::problem_exists(conn, problem_id)? {
            for link in &rows {
                report.errors.push(format!(
                    "ProblemTags: link {} -> {} references unknown problem",
                    link.problem_id, link.tag_id
                ));
            }
            report.links.skipped += rows.len() as u64;
            continue;
        }

        let mut wanted = BTreeSet::new();
        for link in rows {
            let state = match tag_state.get(&link.tag_id) {
                Some(state) => *state,
                None => {
                    let state = store::get_tag(conn, &link.tag_id)?.map(|t| t.is_deleted);
                    tag_state.insert(link.tag_id.clone(), state);
                    state
                }
            };
            match state {
                None => {
                    report.errors.push(format!(
                        "ProblemTags: link {} -> {} references unknown tag",
                        link.problem_id, link.tag_id
                    ));
                    report.links.skipped += 1;
                }
                Some(tag_deleted) => {
                    if !(link.link_is_deleted || link.tag_is_deleted || tag_deleted) {
                        wanted.insert(link.tag_id.clone());
                    }
                }
            }
        }

        let changes = converge_links(
            conn,
            problem_id,
            &wanted,
            ctx.options.tag_merge_mode,
            ctx.now_utc,
            ctx.local_instance_id,
        )?;
        report.links.added += changes.added;
        report.links.revived += changes.revived;
        report.links.removed += changes.removed;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkChanges {
    pub added: u64,
    pub revived: u64,
    pub removed: u64,
}

/// Converges one problem's live links on `wanted` without touching links that already match.
/// A wanted tag revives its soft-deleted link before a fresh link is minted.
pub fn converge_links(
    conn: &Connection,
    problem_id: &str,
    wanted: &BTreeSet<String>,
    mode: TagMergeMode,
    now_utc: &str,
    instance_id: &str,
) -> AppResult<LinkChanges> {
    let mut changes = LinkChanges::default();
    let live = store::live_links_for_problem(conn, problem_id)?;
    let live_tags: HashSet<&str> = live.iter().map(|l| l.tag_id.as_str()).collect();

    if mode == TagMergeMode::Replace {
        for link in live.iter().filter(|l| !wanted.contains(&l.tag_id)) {
            store::soft_delete_link(conn, &link.link_id, now_utc, instance_id)?;
            changes.removed += 1;
        }
    }

    for tag_id in wanted.iter().filter(|t| !live_tags.contains(t.as_str())) {
        match store::find_deleted_link(conn, problem_id, tag_id)? {
            Some(dead) => {
                store::revive_link(conn, &dead.link_id, now_utc, instance_id)?;
                changes.revived += 1;
            }
            None => {
                store::insert_link(
                    conn,
                    &ProblemTagLink {
                        link_id: uuid::Uuid::new_v4().to_string(),
                        problem_id: problem_id.to_string(),
                        tag_id: tag_id.clone(),
                        created_at_utc: now_utc.to_string(),
                        updated_at_utc: now_utc.to_string(),
                        updated_by_instance_id: instance_id.to_string(),
                        is_deleted: false,
                        deleted_at_utc: None,
                    },
                )?;
                changes.added += 1;
            }
        }
    }
    Ok(changes)
}

/// Performs deferred blob copies in order. Cancellation leaves the rest counted as pending.
pub fn copy_blobs(
    vault: &AttachmentVault,
    pending: &[PendingBlobCopy],
    cancel: &CancelFlag,
    report: &mut ApplyReport,
) {
    enter(report, ApplyPhase::CopyingBlobs);
    for (idx, copy) in pending.iter().enumerate() {
        if cancel.is_cancelled() {
            let remaining = (pending.len() - idx) as u64;
            report.blobs.pending = remaining;
            report
                .errors
                .push(format!("blob copies interrupted: {} remaining", remaining));
            return;
        }
        match vault.copy_pending(copy) {
            BlobCopyOutcome::Copied => report.blobs.copied += 1,
            BlobCopyOutcome::AlreadyPresent => report.blobs.already_present += 1,
            BlobCopyOutcome::Failed(message) => {
                report.blobs.failed += 1;
                report.errors.push(format!(
                    "blob copy failed for {}: {}",
                    copy.content_hash, message
                ));
            }
        }
    }
    enter(report, ApplyPhase::Done);
}

/// Applies a whole package: validate, one IMMEDIATE transaction, commit, then blob copies.
/// Any error before commit rolls back every row.
pub fn apply_package(
    conn: &mut Connection,
    vault: &AttachmentVault,
    package: &OpenedPackage,
    options: ApplyOptions,
    cancel: &CancelFlag,
    local_instance_id: &str,
) -> AppResult<ApplyReport> {
    let now = format_utc(now_utc())?;
    tracing::info!(
        package_id = ?package.package_id(),
        source = %package.source_path.display(),
        policy = options.conflict_policy.as_str(),
        tag_mode = options.tag_merge_mode.as_str(),
        "package apply started"
    );

    let result = run_apply(conn, vault, package, options, cancel, local_instance_id, &now);
    match &result {
        Ok(report) => tracing::info!(
            package_id = ?report.package_id,
            imported = report.imported_count(),
            skipped = report.skipped_count(),
            conflicts = report.conflict_count(),
            errors = report.errors.len(),
            "package apply finished"
        ),
        Err(err) => tracing::warn!(
            phase = ?ApplyPhase::Failed,
            code = %err.code,
            message = %err.message,
            "package apply failed"
        ),
    }
    result
}

fn run_apply(
    conn: &mut Connection,
    vault: &AttachmentVault,
    package: &OpenedPackage,
    options: ApplyOptions,
    cancel: &CancelFlag,
    local_instance_id: &str,
    now: &str,
) -> AppResult<ApplyReport> {
    let batch = read_batch(&package.workbook)?;

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| AppError::db("FC_DB_TX_FAILED", "apply", "failed to begin apply transaction", &e))?;
    let ctx = ApplyContext {
        vault,
        options,
        cancel,
        local_instance_id,
        now_utc: now,
    };
    let TransactionalApply {
        mut report,
        pending_copies,
    } = apply_in_transaction(&tx, &ctx, package, batch)?;
    tx.commit()
        .map_err(|e| AppError::db("FC_DB_TX_FAILED", "apply", "failed to commit apply transaction", &e))?;
    enter(&mut report, ApplyPhase::Committed);

    copy_blobs(vault, &pending_copies, cancel, &mut report);
    report.finished_at_utc = Some(format_utc(now_utc())?);
    Ok(report)
}
