use fc_core::app_error::{AppError, AppResult};
use fc_core::package::{read_manifest, MANIFEST_FILE};
use fc_core::replica::replica_connect;
use fc_core::watermark::{watermark_get, watermark_list, watermark_record_export};
use std::path::Path;

pub fn run_show(replica_path: &str) -> AppResult<()> {
    let opened = replica_connect(Path::new(replica_path))?;
    crate::print_json(&watermark_list(&opened.conn)?)
}

/// Records that a remote has applied a package this replica built.
pub fn run_ack(replica_path: &str, package_path: &str, remote: Option<String>, now: &str) -> AppResult<()> {
    let opened = replica_connect(Path::new(replica_path))?;
    let manifest = read_manifest(&Path::new(package_path).join(MANIFEST_FILE))?;
    if manifest.exporter_instance_id != opened.descriptor.instance_id {
        return Err(AppError::new(
            "FC_WATERMARK_FOREIGN_PACKAGE",
            "watermark",
            "package was built by another replica",
            false,
            serde_json::json!({
                "exporter_instance_id": manifest.exporter_instance_id,
                "instance_id": opened.descriptor.instance_id
            }),
        ));
    }
    let remote = remote
        .or_else(|| manifest.target_remote_instance_id.clone())
        .ok_or_else(|| {
            AppError::new(
                "FC_WATERMARK_REMOTE_REQUIRED",
                "watermark",
                "no remote given and the package names no target remote",
                false,
                serde_json::json!({ "package_id": manifest.package_id }),
            )
        })?;

    if let Some(max_updated) = manifest.max_updated_at_utc.as_deref() {
        watermark_record_export(&opened.conn, &remote, &manifest.package_id, max_updated, now)?;
    }
    crate::print_json(&watermark_get(&opened.conn, &remote)?)
}
