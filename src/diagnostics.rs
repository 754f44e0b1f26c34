//! State dump for post-mortem debugging of a failed installation.
use std::path::Path;

use crate::util::fs::list_dir_names;

/// Log the mount table, the block device table and the contents of every
/// media search path.
///
/// Every part is collected independently; a part that cannot be read is logged
/// as such and does not stop the rest.
#[tracing::instrument(skip_all)]
pub fn snapshot<P: AsRef<Path>>(roots: &[P]) {
    tracing::info!("Collecting system state after failed installation");

    match lsblk::Mount::list() {
        Ok(mounts) => mounts.for_each(|m| {
            tracing::info!(device = ?m.device, mountpoint = ?m.mountpoint, "mount");
        }),
        Err(e) => tracing::warn!(?e, "Cannot read mount table"),
    }

    match lsblk::BlockDevice::list() {
        Ok(devices) => devices.iter().for_each(|d| {
            tracing::info!(
                name = %d.name,
                fullname = ?d.fullname,
                label = ?d.label,
                disk = d.is_disk(),
                part = d.is_part(),
                "block device"
            );
        }),
        Err(e) => tracing::warn!(?e, "Cannot read block devices"),
    }

    for root in roots.iter().map(AsRef::as_ref) {
        match list_dir_names(root) {
            Ok(entries) if entries.is_empty() && !root.exists() => {
                tracing::info!(path = %root.display(), "missing");
            }
            Ok(entries) => tracing::info!(path = %root.display(), ?entries, "directory"),
            Err(e) => tracing::warn!(path = %root.display(), ?e, "Cannot list directory"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn test_snapshot_lists_media_roots() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("system.qcow2"), "").unwrap();
        let gone = root.path().join("gone");
        snapshot(&[root.path(), gone.as_path()]);
        assert!(logs_contain("system.qcow2"));
        assert!(logs_contain("missing"));
    }
}
