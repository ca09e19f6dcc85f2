use fc_core::attachment_vault::AttachmentVault;
use fc_core::authoring::{create_problem, set_problem_tags, update_problem, ProblemDraft};
use fc_core::db::open_db;
use fc_core::hashing::blake3_hex_prefixed;
use fc_core::package::{open_package, BuildMode, ManifestCounts, ManifestStream, PackageManifestV1};
use fc_core::package_apply::{
    apply_in_transaction, apply_package, copy_blobs, ApplyContext, ApplyOptions, ApplyPhase,
    ApplyReport, CancelFlag, TagMergeMode,
};
use fc_core::sheet_rows::read_batch;
use fc_core::conflict::ConflictPolicy;
use fc_core::store;
use fc_core::tag_reconcile::normalize_tag_name;
use fc_core::watermark::watermark_get;
use fc_core::workbook::{JsonWorkbookCodec, Sheet, Workbook, WorkbookCodec};
use rusqlite::Connection;
use std::path::{Path, PathBuf};

const LOCAL: &str = "local-instance";
const PEER: &str = "peer-instance";
const T0: &str = "2024-05-01T08:00:00.0000000Z";
const T1: &str = "2024-05-02T08:00:00.0000000Z";
const T2: &str = "2024-05-03T08:00:00.0000000Z";

struct Replica {
    _temp: tempfile::TempDir,
    root: PathBuf,
    conn: Connection,
    vault: AttachmentVault,
}

fn replica() -> Replica {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().to_path_buf();
    let conn = open_db(&root.join("replica.sqlite")).expect("open db");
    let vault = AttachmentVault::new(root.join("blobs"));
    Replica {
        _temp: temp,
        root,
        conn,
        vault,
    }
}

fn cells(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

fn problems_sheet(rows: &[Vec<String>]) -> Sheet {
    let mut sheet = Sheet::with_header(
        "Problems",
        &[
            "ProblemId",
            "Title",
            "Symptom",
            "RootCause",
            "Solution",
            "EnvironmentJson",
            "Severity",
            "Status",
            "CreatedAtUtc",
            "CreatedBy",
            "UpdatedAtUtc",
            "UpdatedByInstanceId",
            "IsDeleted",
            "DeletedAtUtc",
            "SourceKind",
        ],
    );
    for row in rows {
        sheet.push_row(row.clone());
    }
    sheet
}

fn problem_row(id: &str, title: &str, updated_at: &str) -> Vec<String> {
    cells(&[
        id, title, "pump stalls", "worn seal", "replace seal", "{}", "2", "1", T0, "tech", updated_at,
        PEER, "0", "", "local",
    ])
}

fn tags_sheet(rows: &[(&str, &str)]) -> Sheet {
    let mut sheet = Sheet::with_header(
        "Tags",
        &["TagId", "Name", "CreatedAtUtc", "UpdatedAtUtc", "UpdatedByInstanceId", "IsDeleted"],
    );
    for (id, name) in rows {
        sheet.push_row(cells(&[id, name, T0, T0, PEER, "0"]));
    }
    sheet
}

fn tags_sheet_with_deletes(rows: &[(&str, &str, bool)]) -> Sheet {
    let mut sheet = Sheet::with_header(
        "Tags",
        &["TagId", "Name", "CreatedAtUtc", "UpdatedAtUtc", "UpdatedByInstanceId", "IsDeleted"],
    );
    for (id, name, deleted) in rows {
        let flag = if *deleted { "1" } else { "0" };
        sheet.push_row(cells(&[id, name, T0, T0, PEER, flag]));
    }
    sheet
}

fn links_sheet(rows: &[(&str, &str, &str)]) -> Sheet {
    let mut sheet = Sheet::with_header(
        "ProblemTags",
        &["ProblemId", "TagId", "TagName", "ProblemTagIsDeleted", "TagIsDeleted"],
    );
    for (problem_id, tag_id, name) in rows {
        sheet.push_row(cells(&[problem_id, tag_id, name, "0", "0"]));
    }
    sheet
}

fn attachments_sheet(rows: &[(&str, &str, &str)]) -> Sheet {
    let mut sheet = Sheet::with_header(
        "Attachments",
        &[
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
        ],
    );
    for (id, problem_id, content) in rows {
        let hash = blake3_hex_prefixed(content.as_bytes());
        let size = content.len().to_string();
        sheet.push_row(cells(&[
            id, problem_id, "photo.jpg", &hash, &size, "image/jpeg", T0, T0, PEER, "0",
        ]));
    }
    sheet
}

fn workbook(sheets: Vec<Sheet>) -> Workbook {
    Workbook { sheets }
}

/// Writes a package directory: the workbook document plus `attachments/` when blobs are given.
fn write_package(dir: &Path, workbook: &Workbook, blobs: &[&str]) -> PathBuf {
    std::fs::create_dir_all(dir).expect("package dir");
    let bytes = JsonWorkbookCodec.encode(workbook).expect("encode");
    std::fs::write(dir.join(JsonWorkbookCodec.file_name()), bytes).expect("write workbook");
    if !blobs.is_empty() {
        let attachments = dir.join("attachments");
        std::fs::create_dir_all(&attachments).expect("attachments dir");
        for blob in blobs {
            std::fs::write(attachments.join(blake3_hex_prefixed(blob.as_bytes())), blob)
                .expect("write blob");
        }
    }
    dir.to_path_buf()
}

fn write_manifest(dir: &Path, exporter: &str, max_updated: Option<&str>) {
    let document = std::fs::read(dir.join(JsonWorkbookCodec.file_name())).expect("read workbook");
    let manifest = PackageManifestV1 {
        manifest_version: 1,
        package_id: "pkg-1".to_string(),
        schema_version: 1,
        created_at_utc: T2.to_string(),
        exporter_instance_id: exporter.to_string(),
        exporter_instance_kind: "field".to_string(),
        mode: BuildMode::Full,
        target_remote_instance_id: None,
        watermark_used: None,
        max_updated_at_utc: max_updated.map(str::to_string),
        counts: ManifestCounts::default(),
        streams: vec![ManifestStream {
            relative_path: JsonWorkbookCodec.file_name().to_string(),
            hash: blake3_hex_prefixed(&document),
            bytes: document.len() as u64,
        }],
        missing_blobs: Vec::new(),
    };
    std::fs::write(
        dir.join("manifest.json"),
        serde_json::to_vec_pretty(&manifest).expect("manifest json"),
    )
    .expect("write manifest");
}

fn apply(replica: &mut Replica, package: &Path, options: ApplyOptions) -> ApplyReport {
    let opened = open_package(package, &JsonWorkbookCodec).expect("open package");
    apply_package(
        &mut replica.conn,
        &replica.vault,
        &opened,
        options,
        &CancelFlag::new(),
        LOCAL,
    )
    .expect("apply package")
}

fn tag_names(conn: &Connection, problem_id: &str) -> Vec<String> {
    let mut names: Vec<String> = store::get_tags_for_problem(conn, problem_id)
        .expect("tags for problem")
        .into_iter()
        .map(|t| t.name)
        .collect();
    names.sort();
    names
}

fn standard_package(dir: &Path) -> PathBuf {
    write_package(
        dir,
        &workbook(vec![
            problems_sheet(&[problem_row("p1", "Pump stalls", T1)]),
            tags_sheet(&[("tag-a", "Hydraulics"), ("tag-b", "Seals")]),
            links_sheet(&[("p1", "tag-a", "Hydraulics"), ("p1", "tag-b", "Seals")]),
            attachments_sheet(&[("a1", "p1", "photo-bytes")]),
        ]),
        &["photo-bytes"],
    )
}

#[test]
fn first_import_brings_problem_tags_and_blob() {
    let mut replica = replica();
    let package = standard_package(&replica.root.join("incoming"));

    let report = apply(&mut replica, &package, ApplyOptions::default());
    assert_eq!(report.phase, ApplyPhase::Done);
    assert_eq!(report.problems.imported, 1);
    assert_eq!(report.tags.imported, 2);
    assert_eq!(report.attachments.imported, 1);
    assert_eq!(report.imported_count(), 4);
    assert_eq!(report.conflict_count(), 0);
    assert_eq!(report.links.added, 2);
    assert_eq!(report.blobs.copied, 1);
    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert!(report.finished_at_utc.is_some());

    assert_eq!(tag_names(&replica.conn, "p1"), vec!["Hydraulics", "Seals"]);
    let hash = blake3_hex_prefixed(b"photo-bytes");
    assert_eq!(replica.vault.read_bytes(&hash).expect("blob"), b"photo-bytes");
    assert_eq!(
        store::search_problems(&replica.conn, "seal", 10).expect("search"),
        vec!["p1".to_string()]
    );
}

#[test]
fn reapplying_the_same_package_changes_nothing() {
    let mut replica = replica();
    let package = standard_package(&replica.root.join("incoming"));
    apply(&mut replica, &package, ApplyOptions::default());

    let again = apply(&mut replica, &package, ApplyOptions::default());
    assert_eq!(again.imported_count(), 0);
    assert_eq!(again.skipped_count(), 4);
    assert_eq!(again.conflict_count(), 0);
    assert_eq!(again.links.added + again.links.revived + again.links.removed, 0);
    assert_eq!(again.blobs.copied, 0);
    assert!(store::list_conflicts(&replica.conn).expect("conflicts").is_empty());
}

#[test]
fn newer_local_edit_survives_and_is_recorded_as_conflict() {
    let mut replica = replica();
    let package = standard_package(&replica.root.join("incoming"));
    apply(&mut replica, &package, ApplyOptions::default());

    let draft = ProblemDraft {
        title: "Pump stalls under load".to_string(),
        symptom: "pump stalls".to_string(),
        created_by: "tech".to_string(),
        ..ProblemDraft::default()
    };
    update_problem(&replica.conn, LOCAL, "p1", &draft, T2).expect("local edit");

    let report = apply(&mut replica, &package, ApplyOptions::default());
    assert_eq!(report.problems.conflicted, 1);
    assert_eq!(report.conflict_count(), 1);
    assert_eq!(report.links.skipped, 2);

    let problem = store::get_problem(&replica.conn, "p1").expect("get").expect("present");
    assert_eq!(problem.title, "Pump stalls under load");
    assert_eq!(problem.updated_by_instance_id, LOCAL);

    let conflicts = store::list_conflicts(&replica.conn).expect("conflicts");
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].entity_id, "p1");
    assert_eq!(conflicts[0].local_updated_at_utc, T2);
    assert_eq!(conflicts[0].incoming_updated_at_utc, T1);
}

#[test]
fn overwrite_policy_takes_the_package_row() {
    let mut replica = replica();
    let package = standard_package(&replica.root.join("incoming"));
    apply(&mut replica, &package, ApplyOptions::default());
    let draft = ProblemDraft {
        title: "local title".to_string(),
        ..ProblemDraft::default()
    };
    update_problem(&replica.conn, LOCAL, "p1", &draft, T2).expect("local edit");

    let report = apply(
        &mut replica,
        &package,
        ApplyOptions {
            conflict_policy: ConflictPolicy::Overwrite,
            tag_merge_mode: TagMergeMode::Replace,
        },
    );
    assert_eq!(report.problems.imported, 1);
    assert_eq!(report.conflict_count(), 0);
    let problem = store::get_problem(&replica.conn, "p1").expect("get").expect("present");
    assert_eq!(problem.title, "Pump stalls");
}

#[test]
fn replace_mode_converges_links_and_revives_old_ones() {
    let mut replica = replica();
    let tags = [("tag-a", "A"), ("tag-b", "B"), ("tag-c", "C")];
    let first = write_package(
        &replica.root.join("first"),
        &workbook(vec![
            problems_sheet(&[problem_row("p1", "t", T0)]),
            tags_sheet(&tags),
            links_sheet(&[("p1", "tag-a", "A"), ("p1", "tag-b", "B")]),
        ]),
        &[],
    );
    apply(&mut replica, &first, ApplyOptions::default());

    let second = write_package(
        &replica.root.join("second"),
        &workbook(vec![
            problems_sheet(&[problem_row("p1", "t", T1)]),
            tags_sheet(&tags),
            links_sheet(&[("p1", "tag-b", "B"), ("p1", "tag-c", "C")]),
        ]),
        &[],
    );
    let report = apply(&mut replica, &second, ApplyOptions::default());
    assert_eq!((report.links.added, report.links.removed), (1, 1));
    assert_eq!(tag_names(&replica.conn, "p1"), vec!["B", "C"]);

    let third = write_package(
        &replica.root.join("third"),
        &workbook(vec![
            problems_sheet(&[problem_row("p1", "t", T2)]),
            tags_sheet(&tags),
            links_sheet(&[("p1", "tag-a", "A"), ("p1", "tag-b", "B"), ("p1", "tag-c", "C")]),
        ]),
        &[],
    );
    let report = apply(&mut replica, &third, ApplyOptions::default());
    assert_eq!(report.links.revived, 1);
    assert_eq!(report.links.added, 0);
    assert_eq!(tag_names(&replica.conn, "p1"), vec!["A", "B", "C"]);
}

#[test]
fn merge_mode_only_adds_links() {
    let mut replica = replica();
    let tags = [("tag-a", "A"), ("tag-b", "B"), ("tag-c", "C")];
    let first = write_package(
        &replica.root.join("first"),
        &workbook(vec![
            problems_sheet(&[problem_row("p1", "t", T0)]),
            tags_sheet(&tags),
            links_sheet(&[("p1", "tag-a", "A"), ("p1", "tag-b", "B")]),
        ]),
        &[],
    );
    apply(&mut replica, &first, ApplyOptions::default());

    let second = write_package(
        &replica.root.join("second"),
        &workbook(vec![
            problems_sheet(&[problem_row("p1", "t", T1)]),
            tags_sheet(&tags),
            links_sheet(&[("p1", "tag-c", "C")]),
        ]),
        &[],
    );
    let report = apply(
        &mut replica,
        &second,
        ApplyOptions {
            conflict_policy: ConflictPolicy::SkipIfLocalNewer,
            tag_merge_mode: TagMergeMode::Merge,
        },
    );
    assert_eq!(report.links.removed, 0);
    assert_eq!(report.links.added, 1);
    assert_eq!(tag_names(&replica.conn, "p1"), vec!["A", "B", "C"]);
}

#[test]
fn tag_names_stay_unique_when_two_peers_mint_the_same_name() {
    let mut replica = replica();
    let local = create_problem(
        &replica.conn,
        LOCAL,
        &ProblemDraft {
            problem_id: Some("p0".to_string()),
            title: "local".to_string(),
            ..ProblemDraft::default()
        },
        T0,
    )
    .expect("create");
    let local_tags = set_problem_tags(&replica.conn, LOCAL, &local.problem_id, &["Network".to_string()], T0)
        .expect("tags");
    let local_tag_id = local_tags[0].tag_id.clone();

    let package = write_package(
        &replica.root.join("incoming"),
        &workbook(vec![
            problems_sheet(&[problem_row("p1", "t", T1)]),
            tags_sheet(&[("peer-net", " network ")]),
            links_sheet(&[("p1", "peer-net", "network")]),
        ]),
        &[],
    );
    let report = apply(&mut replica, &package, ApplyOptions::default());
    assert_eq!(report.tag_remaps, 1);

    let named_network: Vec<_> = store::list_live_tags(&replica.conn)
        .expect("tags")
        .into_iter()
        .filter(|t| normalize_tag_name(&t.name).as_deref() == Some("network"))
        .collect();
    assert_eq!(named_network.len(), 1);
    assert_eq!(named_network[0].tag_id, local_tag_id);
    assert!(store::get_tag(&replica.conn, "peer-net").expect("get").is_none());

    let linked = store::get_tags_for_problem(&replica.conn, "p1").expect("links");
    assert_eq!(linked.len(), 1);
    assert_eq!(linked[0].tag_id, local_tag_id);
}

#[test]
fn bare_workbook_imports_rows_but_reports_missing_files() {
    let mut replica = replica();
    let file = replica.root.join("bare.json");
    let document = workbook(vec![
        problems_sheet(&[problem_row("p1", "t", T0)]),
        attachments_sheet(&[("a1", "p1", "never-shipped")]),
    ]);
    std::fs::write(&file, JsonWorkbookCodec.encode(&document).expect("encode")).expect("write");

    let report = apply(&mut replica, &file, ApplyOptions::default());
    assert_eq!(report.problems.imported, 1);
    assert_eq!(report.missing_attachment_files, 1);
    assert_eq!(report.attachments.skipped, 1);
    let expected = format!("missing attachment file: {}", blake3_hex_prefixed(b"never-shipped"));
    assert!(report.errors.contains(&expected), "{:?}", report.errors);
    assert!(store::get_attachment(&replica.conn, "a1").expect("get").is_none());
}

#[test]
fn package_without_problems_sheet_is_rejected_whole() {
    let mut replica = replica();
    let package = write_package(
        &replica.root.join("incoming"),
        &workbook(vec![tags_sheet(&[("tag-a", "A")])]),
        &[],
    );
    let opened = open_package(&package, &JsonWorkbookCodec).expect("open");
    let err = apply_package(
        &mut replica.conn,
        &replica.vault,
        &opened,
        ApplyOptions::default(),
        &CancelFlag::new(),
        LOCAL,
    )
    .expect_err("missing sheet");
    assert_eq!(err.code, "FC_PACKAGE_SHEET_MISSING");
    assert!(store::list_live_tags(&replica.conn).expect("tags").is_empty());
}

#[test]
fn malformed_rows_are_rejected_one_by_one() {
    let mut replica = replica();
    let mut bad_time = problem_row("p2", "t", T0);
    bad_time[10] = "yesterday".to_string();
    let mut blank_id = problem_row("p3", "t", T0);
    blank_id[0] = "  ".to_string();
    let package = write_package(
        &replica.root.join("incoming"),
        &workbook(vec![problems_sheet(&[problem_row("p1", "t", T0), bad_time, blank_id])]),
        &[],
    );

    let report = apply(&mut replica, &package, ApplyOptions::default());
    assert_eq!(report.problems.in_file, 3);
    assert_eq!(report.problems.imported, 1);
    assert_eq!(report.problems.skipped, 2);
    assert!(report
        .errors
        .iter()
        .any(|e| e.starts_with("Problems row 3: unparseable UpdatedAtUtc")));
    assert!(report.errors.iter().any(|e| e == "Problems row 4: blank ProblemId"));
    assert!(store::problem_exists(&replica.conn, "p1").expect("exists"));
    assert!(!store::problem_exists(&replica.conn, "p2").expect("exists"));
}

#[test]
fn link_rows_pointing_at_nothing_are_row_errors() {
    let mut replica = replica();
    let package = write_package(
        &replica.root.join("incoming"),
        &workbook(vec![
            problems_sheet(&[problem_row("p1", "t", T0)]),
            tags_sheet(&[("tag-a", "A")]),
            links_sheet(&[("p1", "tag-a", "A"), ("p1", "ghost", ""), ("p9", "tag-a", "A")]),
        ]),
        &[],
    );
    let report = apply(&mut replica, &package, ApplyOptions::default());
    assert_eq!(report.links.added, 1);
    assert_eq!(report.links.skipped, 2);
    assert!(report.errors.iter().any(|e| e.contains("ghost references unknown tag")));
    assert!(report.errors.iter().any(|e| e.contains("p9 -> tag-a references unknown problem")));
}

#[test]
fn cancelled_apply_writes_nothing() {
    let mut replica = replica();
    let package = standard_package(&replica.root.join("incoming"));
    let opened = open_package(&package, &JsonWorkbookCodec).expect("open");
    let cancel = CancelFlag::new();
    cancel.cancel();

    let err = apply_package(
        &mut replica.conn,
        &replica.vault,
        &opened,
        ApplyOptions::default(),
        &cancel,
        LOCAL,
    )
    .expect_err("cancelled");
    assert_eq!(err.code, "FC_APPLY_CANCELLED");
    assert!(err.retryable);
    assert!(!store::problem_exists(&replica.conn, "p1").expect("exists"));
    assert!(!replica.vault.exists(&blake3_hex_prefixed(b"photo-bytes")).expect("exists"));
}

#[test]
fn links_without_tags_sheet_derive_placeholder_tags() {
    let mut replica = replica();
    let package = write_package(
        &replica.root.join("incoming"),
        &workbook(vec![
            problems_sheet(&[problem_row("p1", "t", T0)]),
            links_sheet(&[("p1", "tag-x", "Valves"), ("p1", "tag-y", "Leaks")]),
        ]),
        &[],
    );
    let report = apply(&mut replica, &package, ApplyOptions::default());
    let mut derived = report.derived_tags.clone();
    derived.sort();
    assert_eq!(derived, vec!["tag-x".to_string(), "tag-y".to_string()]);
    assert_eq!(tag_names(&replica.conn, "p1"), vec!["Leaks", "Valves"]);

    let tag = store::get_tag(&replica.conn, "tag-x").expect("get").expect("derived");
    assert_eq!(tag.created_at_utc, "1970-01-01T00:00:00.0000000Z");
    assert_eq!(tag.updated_at_utc, "1970-01-01T00:00:00.0000000Z");
}

#[test]
fn shared_blob_is_stored_once() {
    let mut replica = replica();
    let package = write_package(
        &replica.root.join("incoming"),
        &workbook(vec![
            problems_sheet(&[problem_row("p1", "t", T0), problem_row("p2", "t", T0)]),
            attachments_sheet(&[("a1", "p1", "same"), ("a2", "p2", "same")]),
        ]),
        &["same"],
    );
    let report = apply(&mut replica, &package, ApplyOptions::default());
    assert_eq!(report.attachments.imported, 2);
    assert_eq!(report.blobs.copied, 1);

    let files = walkdir::WalkDir::new(replica.vault.blobs_dir())
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .count();
    assert_eq!(files, 1);
}

#[test]
fn failed_blob_copy_keeps_rows_and_is_redriven_by_reapply() {
    let mut replica = replica();
    let dir = replica.root.join("incoming");
    let package = standard_package(&dir);
    let blob = dir.join("attachments").join(blake3_hex_prefixed(b"photo-bytes"));
    std::fs::write(&blob, b"corrupted").expect("tamper blob");

    let report = apply(&mut replica, &package, ApplyOptions::default());
    assert_eq!(report.attachments.imported, 1);
    assert_eq!(report.blobs.failed, 1);
    assert!(report.errors.iter().any(|e| e.contains("FC_BLOB_HASH_MISMATCH")));
    assert!(store::get_attachment(&replica.conn, "a1").expect("get").is_some());

    std::fs::write(&blob, b"photo-bytes").expect("repair blob");
    let report = apply(&mut replica, &package, ApplyOptions::default());
    assert_eq!(report.attachments.skipped, 1);
    assert_eq!(report.blobs.copied, 1);
    assert!(replica
        .vault
        .exists(&blake3_hex_prefixed(b"photo-bytes"))
        .expect("exists"));
}

#[test]
fn soft_deletes_travel_as_rows() {
    let mut replica = replica();
    let package = standard_package(&replica.root.join("first"));
    apply(&mut replica, &package, ApplyOptions::default());

    let mut deleted = problem_row("p1", "Pump stalls", T2);
    deleted[12] = "1".to_string();
    let package = write_package(
        &replica.root.join("second"),
        &workbook(vec![problems_sheet(&[deleted])]),
        &[],
    );
    let report = apply(&mut replica, &package, ApplyOptions::default());
    assert_eq!(report.problems.imported, 1);

    let problem = store::get_problem(&replica.conn, "p1").expect("get").expect("kept");
    assert!(problem.is_deleted);
    assert_eq!(problem.deleted_at_utc.as_deref(), Some(T2));
}

#[test]
fn manifest_checksum_mismatch_refuses_the_package() {
    let replica = replica();
    let dir = replica.root.join("incoming");
    standard_package(&dir);
    write_manifest(&dir, PEER, Some(T1));
    let document = dir.join(JsonWorkbookCodec.file_name());
    let mut bytes = std::fs::read(&document).expect("read");
    bytes.push(b'\n');
    std::fs::write(&document, bytes).expect("tamper");

    let err = open_package(&dir, &JsonWorkbookCodec).expect_err("corrupt");
    assert_eq!(err.code, "FC_PACKAGE_CORRUPT");
}

#[test]
fn manifest_packages_advance_the_import_watermark() {
    let mut replica = replica();
    let dir = replica.root.join("incoming");
    standard_package(&dir);
    write_manifest(&dir, PEER, Some(T1));

    let report = apply(&mut replica, &dir, ApplyOptions::default());
    assert_eq!(report.package_id.as_deref(), Some("pkg-1"));

    let mark = watermark_get(&replica.conn, PEER).expect("get").expect("recorded");
    assert_eq!(mark.last_imported_at_utc.as_deref(), Some(T1));
    assert_eq!(mark.last_imported_package_id.as_deref(), Some("pkg-1"));
    assert!(mark.last_exported_at_utc.is_none());
}

#[test]
fn live_tag_keeps_its_name_when_a_deleted_tag_with_that_name_comes_first() {
    let mut replica = replica();
    let package = write_package(
        &replica.root.join("incoming"),
        &workbook(vec![
            problems_sheet(&[problem_row("p1", "Router drops", T0)]),
            tags_sheet_with_deletes(&[("t-old", "Net", true), ("t-new", "net", false)]),
            links_sheet(&[("p1", "t-new", "net")]),
        ]),
        &[],
    );

    let report = apply(&mut replica, &package, ApplyOptions::default());
    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert_eq!(report.links.added, 1);
    assert_eq!(tag_names(&replica.conn, "p1"), vec!["net"]);

    let live = store::list_live_tags(&replica.conn).expect("tags");
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].tag_id, "t-new");
}

#[test]
fn cancelling_after_commit_leaves_copies_pending_until_reapply() {
    let mut replica = replica();
    let package = write_package(
        &replica.root.join("incoming"),
        &workbook(vec![
            problems_sheet(&[problem_row("p1", "t", T0)]),
            attachments_sheet(&[("a1", "p1", "first-photo"), ("a2", "p1", "second-photo")]),
        ]),
        &["first-photo", "second-photo"],
    );
    let opened = open_package(&package, &JsonWorkbookCodec).expect("open");
    let batch = read_batch(&opened.workbook).expect("batch");

    let running = CancelFlag::new();
    let tx = replica.conn.transaction().expect("begin");
    let ctx = ApplyContext {
        vault: &replica.vault,
        options: ApplyOptions::default(),
        cancel: &running,
        local_instance_id: LOCAL,
        now_utc: T2,
    };
    let staged = apply_in_transaction(&tx, &ctx, &opened, batch).expect("apply rows");
    tx.commit().expect("commit");
    assert_eq!(staged.pending_copies.len(), 2);

    let mut report = staged.report;
    let cancelled = CancelFlag::new();
    cancelled.cancel();
    copy_blobs(&replica.vault, &staged.pending_copies, &cancelled, &mut report);
    assert_eq!(report.phase, ApplyPhase::CopyingBlobs);
    assert_eq!(report.blobs.pending, 2);
    assert_eq!(report.blobs.copied, 0);
    assert!(report
        .errors
        .contains(&"blob copies interrupted: 2 remaining".to_string()));
    assert!(store::get_attachment(&replica.conn, "a2").expect("get").is_some());
    assert!(!replica.vault.exists(&blake3_hex_prefixed(b"first-photo")).expect("exists"));

    let again = apply(&mut replica, &package, ApplyOptions::default());
    assert_eq!(again.phase, ApplyPhase::Done);
    assert_eq!(again.attachments.skipped, 2);
    assert_eq!(again.blobs.copied, 2);
    assert_eq!(again.blobs.pending, 0);
    assert!(replica.vault.exists(&blake3_hex_prefixed(b"second-photo")).expect("exists"));
}

#[test]
fn newer_local_attachment_wins_even_when_package_lacks_the_blob() {
    let mut replica = replica();
    let package = standard_package(&replica.root.join("first"));
    apply(&mut replica, &package, ApplyOptions::default());

    let mut local = store::get_attachment(&replica.conn, "a1").expect("get").expect("row");
    local.original_file_name = "renamed.jpg".to_string();
    local.updated_at_utc = T2.to_string();
    local.updated_by_instance_id = LOCAL.to_string();
    store::upsert_attachment(&replica.conn, &local).expect("local edit");

    let stale = write_package(
        &replica.root.join("second"),
        &workbook(vec![
            problems_sheet(&[problem_row("p1", "Pump stalls", T1)]),
            attachments_sheet(&[("a1", "p1", "photo-bytes")]),
        ]),
        &[],
    );
    let report = apply(&mut replica, &stale, ApplyOptions::default());
    assert_eq!(report.attachments.conflicted, 1);
    assert_eq!(report.missing_attachment_files, 0);
    assert!(report.errors.is_empty(), "{:?}", report.errors);

    let conflicts = store::list_conflicts(&replica.conn).expect("conflicts");
    assert!(conflicts
        .iter()
        .any(|c| c.entity_type == "Attachment" && c.entity_id == "a1"));
    let kept = store::get_attachment(&replica.conn, "a1").expect("get").expect("row");
    assert_eq!(kept.original_file_name, "renamed.jpg");
}
