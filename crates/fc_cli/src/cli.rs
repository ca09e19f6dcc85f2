use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "fc_cli")]
#[command(about = "Field knowledge replica CLI")]
pub struct Cli {
    /// Clock override for authored rows (RFC 3339; no offset means UTC).
    #[arg(long, global = true)]
    pub now: Option<String>,
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand)]
pub enum Command {
    Replica {
        #[command(subcommand)]
        cmd: ReplicaCmd,
    },
    Problem {
        #[command(subcommand)]
        cmd: ProblemCmd,
    },
    Package {
        #[command(subcommand)]
        cmd: PackageCmd,
    },
    Watermark {
        #[command(subcommand)]
        cmd: WatermarkCmd,
    },
    Conflicts {
        #[command(subcommand)]
        cmd: ConflictsCmd,
    },
}

#[derive(Subcommand)]
pub enum ReplicaCmd {
    Init {
        replica_path: String,
        replica_slug: String,
        #[arg(long, default_value = "field")]
        kind: String,
    },
    Show {
        replica_path: String,
    },
}

#[derive(Subcommand)]
pub enum ProblemCmd {
    Add {
        replica_path: String,
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        symptom: String,
        #[arg(long = "root-cause", default_value = "")]
        root_cause: String,
        #[arg(long, default_value = "")]
        solution: String,
        #[arg(long = "created-by", default_value = "")]
        created_by: String,
    },
    Tag {
        replica_path: String,
        problem_id: String,
        names: Vec<String>,
    },
    Attach {
        replica_path: String,
        problem_id: String,
        file_path: String,
        #[arg(long)]
        mime: Option<String>,
    },
    Delete {
        replica_path: String,
        problem_id: String,
    },
    Search {
        replica_path: String,
        query: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum ModeArg {
    Full,
    Incremental,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum PolicyArg {
    SkipIfLocalNewer,
    Overwrite,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum TagModeArg {
    Replace,
    Merge,
}

#[derive(Subcommand)]
pub enum PackageCmd {
    Build {
        replica_path: String,
        out_dir: String,
        #[arg(long, value_enum, default_value_t = ModeArg::Full)]
        mode: ModeArg,
        #[arg(long)]
        remote: Option<String>,
        #[arg(long = "problem")]
        problems: Vec<String>,
    },
    Apply {
        replica_path: String,
        package_path: String,
        #[arg(long, value_enum)]
        policy: Option<PolicyArg>,
        #[arg(long = "tag-mode", value_enum)]
        tag_mode: Option<TagModeArg>,
    },
    Verify {
        package_path: String,
    },
}

#[derive(Subcommand)]
pub enum WatermarkCmd {
    Show {
        replica_path: String,
    },
    Ack {
        replica_path: String,
        package_path: String,
        #[arg(long)]
        remote: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum ConflictsCmd {
    List { replica_path: String },
}
