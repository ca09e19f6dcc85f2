use fc_core::app_error::{AppError, AppResult};
use fc_core::authoring::{attach_bytes, create_problem, set_problem_tags, soft_delete_problem, ProblemDraft};
use fc_core::replica::replica_connect;
use fc_core::store::search_problems;
use std::path::Path;

pub struct AddArgs<'a> {
    pub id: Option<String>,
    pub title: &'a str,
    pub symptom: &'a str,
    pub root_cause: &'a str,
    pub solution: &'a str,
    pub created_by: &'a str,
}

pub fn run_add(replica_path: &str, args: AddArgs<'_>, now: &str) -> AppResult<()> {
    let opened = replica_connect(Path::new(replica_path))?;
    let draft = ProblemDraft {
        problem_id: args.id,
        title: args.title.to_string(),
        symptom: args.symptom.to_string(),
        root_cause: args.root_cause.to_string(),
        solution: args.solution.to_string(),
        created_by: args.created_by.to_string(),
        ..ProblemDraft::default()
    };
    let problem = create_problem(&opened.conn, &opened.descriptor.instance_id, &draft, now)?;
    crate::print_json(&problem)
}

pub fn run_tag(replica_path: &str, problem_id: &str, names: &[String], now: &str) -> AppResult<()> {
    let opened = replica_connect(Path::new(replica_path))?;
    let tags = set_problem_tags(&opened.conn, &opened.descriptor.instance_id, problem_id, names, now)?;
    crate::print_json(&tags)
}

pub fn run_attach(
    replica_path: &str,
    problem_id: &str,
    file_path: &str,
    mime: Option<&str>,
    now: &str,
) -> AppResult<()> {
    let opened = replica_connect(Path::new(replica_path))?;
    let path = Path::new(file_path);
    let bytes = std::fs::read(path).map_err(|e| {
        AppError::new(
            "FC_INPUT_READ_FAILED",
            "cli",
            "failed to read attachment file",
            false,
            serde_json::json!({ "error": e.to_string(), "path": path }),
        )
    })?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| file_path.to_string());
    let attachment = attach_bytes(
        &opened.conn,
        &opened.vault,
        &opened.descriptor.instance_id,
        problem_id,
        &file_name,
        mime.unwrap_or("application/octet-stream"),
        &bytes,
        now,
    )?;
    crate::print_json(&attachment)
}

pub fn run_delete(replica_path: &str, problem_id: &str, now: &str) -> AppResult<()> {
    let opened = replica_connect(Path::new(replica_path))?;
    let problem = soft_delete_problem(&opened.conn, &opened.descriptor.instance_id, problem_id, now)?;
    crate::print_json(&problem)
}

pub fn run_search(replica_path: &str, query: &str, limit: usize) -> AppResult<()> {
    let opened = replica_connect(Path::new(replica_path))?;
    let ids = search_problems(&opened.conn, query, limit)?;
    crate::print_json(&ids)
}
