use fc_core::app_error::AppResult;
use fc_core::db::{open_db, schema_version};
use fc_core::replica::{replica_connect, replica_init};
use std::path::Path;

pub fn run_init(replica_path: &str, replica_slug: &str, kind: &str, now: &str) -> AppResult<()> {
    let path = Path::new(replica_path);
    let replica = replica_init(path, replica_slug, kind, now)?;
    open_db(&replica.paths(path).db)?;
    crate::print_json(&replica)
}

pub fn run_show(replica_path: &str) -> AppResult<()> {
    let opened = replica_connect(Path::new(replica_path))?;
    let version = schema_version(&opened.conn)?;
    crate::print_json(&serde_json::json!({
        "replica": opened.descriptor,
        "schema_version": version,
        "paths": {
            "db": opened.paths.db,
            "blobs": opened.paths.blobs_dir,
            "packages": opened.paths.packages_dir,
        }
    }))
}
