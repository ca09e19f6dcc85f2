use fc_core::app_error::AppResult;
use fc_core::replica::replica_connect;
use fc_core::store::list_conflicts;
use std::path::Path;

pub fn run_list(replica_path: &str) -> AppResult<()> {
    let opened = replica_connect(Path::new(replica_path))?;
    crate::print_json(&list_conflicts(&opened.conn)?)
}
