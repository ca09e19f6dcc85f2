mod cli;
mod commands {
    pub mod conflicts;
    pub mod package;
    pub mod problem;
    pub mod replica;
    pub mod watermark;
}

use clap::Parser;
use cli::{Cli, Command, ConflictsCmd, PackageCmd, ProblemCmd, ReplicaCmd, WatermarkCmd};
use fc_core::app_error::{AppError, AppResult};
use fc_core::timestamp::{format_utc, normalize_utc, now_utc};
use tracing_subscriber::EnvFilter;

/// Pretty JSON on stdout; logs go to stderr.
pub(crate) fn print_json<T: serde::Serialize>(value: &T) -> AppResult<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| AppError::internal(&format!("failed to render output: {}", e)))?;
    println!("{}", text);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn resolve_now(raw: Option<&str>) -> AppResult<String> {
    match raw {
        Some(raw) => normalize_utc(raw),
        None => format_utc(now_utc()),
    }
}

fn run(cli: Cli) -> AppResult<i32> {
    let now = resolve_now(cli.now.as_deref())?;
    match cli.cmd {
        Command::Replica { cmd } => match cmd {
            ReplicaCmd::Init {
                replica_path,
                replica_slug,
                kind,
            } => commands::replica::run_init(&replica_path, &replica_slug, &kind, &now)?,
            ReplicaCmd::Show { replica_path } => commands::replica::run_show(&replica_path)?,
        },
        Command::Problem { cmd } => match cmd {
            ProblemCmd::Add {
                replica_path,
                id,
                title,
                symptom,
                root_cause,
                solution,
                created_by,
            } => commands::problem::run_add(
                &replica_path,
                commands::problem::AddArgs {
                    id,
                    title: &title,
                    symptom: &symptom,
                    root_cause: &root_cause,
                    solution: &solution,
                    created_by: &created_by,
                },
                &now,
            )?,
            ProblemCmd::Tag {
                replica_path,
                problem_id,
                names,
            } => commands::problem::run_tag(&replica_path, &problem_id, &names, &now)?,
            ProblemCmd::Attach {
                replica_path,
                problem_id,
                file_path,
                mime,
            } => commands::problem::run_attach(
                &replica_path,
                &problem_id,
                &file_path,
                mime.as_deref(),
                &now,
            )?,
            ProblemCmd::Delete {
                replica_path,
                problem_id,
            } => commands::problem::run_delete(&replica_path, &problem_id, &now)?,
            ProblemCmd::Search {
                replica_path,
                query,
                limit,
            } => commands::problem::run_search(&replica_path, &query, limit)?,
        },
        Command::Package { cmd } => match cmd {
            PackageCmd::Build {
                replica_path,
                out_dir,
                mode,
                remote,
                problems,
            } => commands::package::run_build(&replica_path, &out_dir, mode, remote, problems)?,
            PackageCmd::Apply {
                replica_path,
                package_path,
                policy,
                tag_mode,
            } => commands::package::run_apply(&replica_path, &package_path, policy, tag_mode)?,
            PackageCmd::Verify { package_path } => {
                if !commands::package::run_verify(&package_path)? {
                    return Ok(2);
                }
            }
        },
        Command::Watermark { cmd } => match cmd {
            WatermarkCmd::Show { replica_path } => commands::watermark::run_show(&replica_path)?,
            WatermarkCmd::Ack {
                replica_path,
                package_path,
                remote,
            } => commands::watermark::run_ack(&replica_path, &package_path, remote, &now)?,
        },
        Command::Conflicts { cmd } => match cmd {
            ConflictsCmd::List { replica_path } => commands::conflicts::run_list(&replica_path)?,
        },
    }
    Ok(0)
}

fn main() {
    init_tracing();
    match run(Cli::parse()) {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{}: {}", err.code, err.message);
            std::process::exit(1);
        }
    }
}
