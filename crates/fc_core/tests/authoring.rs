use fc_core::attachment_vault::AttachmentVault;
use fc_core::authoring::{
    attach_bytes, create_problem, set_problem_tags, soft_delete_attachment, soft_delete_problem,
    update_problem, ProblemDraft,
};
use fc_core::db::open_db_in_memory;
use fc_core::store;

const ME: &str = "instance-1";
const T0: &str = "2024-05-01T08:00:00Z";
const T1: &str = "2024-05-02T08:00:00Z";

fn draft(id: &str) -> ProblemDraft {
    ProblemDraft {
        problem_id: Some(id.to_string()),
        title: "Display flickers".to_string(),
        symptom: "flicker at boot".to_string(),
        created_by: "tech".to_string(),
        ..ProblemDraft::default()
    }
}

#[test]
fn create_stamps_version_and_rejects_duplicates() {
    let conn = open_db_in_memory().expect("db");
    let created = create_problem(&conn, ME, &draft("p1"), T0).expect("create");
    assert_eq!(created.updated_at_utc, "2024-05-01T08:00:00.0000000Z");
    assert_eq!(created.updated_by_instance_id, ME);
    assert_eq!(created.environment_json, "{}");
    assert_eq!(created.source_kind, "local");

    let err = create_problem(&conn, ME, &draft("p1"), T0).expect_err("duplicate");
    assert_eq!(err.code, "FC_ALREADY_EXISTS");

    let mut bad_env = draft("p2");
    bad_env.environment_json = Some("{not json".to_string());
    let err = create_problem(&conn, ME, &bad_env, T0).expect_err("bad env");
    assert_eq!(err.code, "FC_INVALID_INPUT");
}

#[test]
fn generated_ids_are_uuids() {
    let conn = open_db_in_memory().expect("db");
    let mut anonymous = draft("unused");
    anonymous.problem_id = None;
    let created = create_problem(&conn, ME, &anonymous, T0).expect("create");
    assert!(uuid::Uuid::parse_str(&created.problem_id).is_ok());
}

#[test]
fn tags_reuse_names_and_bump_the_problem_version() {
    let conn = open_db_in_memory().expect("db");
    create_problem(&conn, ME, &draft("p1"), T0).expect("p1");
    create_problem(&conn, ME, &draft("p2"), T0).expect("p2");

    let first = set_problem_tags(&conn, ME, "p1", &["Display".to_string(), " ".to_string()], T0)
        .expect("tags p1");
    let second = set_problem_tags(&conn, ME, "p2", &["  DISPLAY ".to_string()], T1).expect("tags p2");
    assert_eq!(first.len(), 1);
    assert_eq!(second[0].tag_id, first[0].tag_id);
    assert_eq!(store::list_live_tags(&conn).expect("tags").len(), 1);

    let p2 = store::get_problem(&conn, "p2").expect("get").expect("p2");
    assert_eq!(p2.updated_at_utc, "2024-05-02T08:00:00.0000000Z");

    set_problem_tags(&conn, ME, "p2", &["Display".to_string()], "2024-05-03T08:00:00Z").expect("same set");
    let p2 = store::get_problem(&conn, "p2").expect("get").expect("p2");
    assert_eq!(p2.updated_at_utc, "2024-05-02T08:00:00.0000000Z");
}

#[test]
fn deleted_problems_refuse_edits() {
    let conn = open_db_in_memory().expect("db");
    create_problem(&conn, ME, &draft("p1"), T0).expect("create");
    let deleted = soft_delete_problem(&conn, ME, "p1", T1).expect("delete");
    assert!(deleted.is_deleted);
    assert_eq!(deleted.deleted_at_utc.as_deref(), Some("2024-05-02T08:00:00.0000000Z"));

    let err = update_problem(&conn, ME, "p1", &draft("p1"), T1).expect_err("edit deleted");
    assert_eq!(err.code, "FC_NOT_FOUND");
    let err = set_problem_tags(&conn, ME, "p1", &["x".to_string()], T1).expect_err("tag deleted");
    assert_eq!(err.code, "FC_NOT_FOUND");
    assert!(store::search_problems(&conn, "flicker", 10).expect("search").is_empty());
}

#[test]
fn attachments_store_blobs_and_soft_delete_rows() {
    let temp = tempfile::tempdir().expect("tempdir");
    let conn = open_db_in_memory().expect("db");
    let vault = AttachmentVault::new(temp.path().to_path_buf());
    create_problem(&conn, ME, &draft("p1"), T0).expect("create");

    let attachment = attach_bytes(&conn, &vault, ME, "p1", "boot.log", "text/plain", b"boot log", T1)
        .expect("attach");
    assert_eq!(attachment.size_bytes, 8);
    assert!(vault.exists(&attachment.content_hash).expect("exists"));

    let removed = soft_delete_attachment(&conn, ME, &attachment.attachment_id, T1).expect("remove");
    assert!(removed.is_deleted);
    assert!(vault.exists(&attachment.content_hash).expect("blob kept"));
    let err = soft_delete_attachment(&conn, ME, &attachment.attachment_id, T1).expect_err("twice");
    assert_eq!(err.code, "FC_NOT_FOUND");
}

#[test]
fn failed_version_bump_rolls_back_tag_and_attachment_writes() {
    let temp = tempfile::tempdir().expect("tempdir");
    let conn = open_db_in_memory().expect("db");
    let vault = AttachmentVault::new(temp.path().to_path_buf());
    create_problem(&conn, ME, &draft("p1"), T0).expect("create");
    conn.execute_batch(
        "CREATE TRIGGER freeze_problems BEFORE UPDATE ON problems
         BEGIN SELECT RAISE(ABORT, 'problems are frozen'); END;",
    )
    .expect("trigger");

    set_problem_tags(&conn, ME, "p1", &["Display".to_string()], T1).expect_err("bump fails");
    assert!(store::list_live_tags(&conn).expect("tags").is_empty());
    assert!(store::get_tags_for_problem(&conn, "p1").expect("links").is_empty());

    attach_bytes(&conn, &vault, ME, "p1", "boot.log", "text/plain", b"boot log", T1)
        .expect_err("bump fails");
    assert!(store::list_attachments(&conn, None).expect("attachments").is_empty());

    let p1 = store::get_problem(&conn, "p1").expect("get").expect("p1");
    assert_eq!(p1.updated_at_utc, "2024-05-01T08:00:00.0000000Z");
}
