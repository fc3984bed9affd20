//! Free-space checks for the backup volume

use std::path::{Path, PathBuf};
use sysinfo::Disks;

/// Bytes available on the volume holding `path`
///
/// Picks the disk with the longest mount point that contains the path.
/// Returns `None` when no mounted disk matches.
pub fn available_space(path: &Path) -> Option<u64> {
    let target = existing_ancestor(path);
    let disks = Disks::new_with_refreshed_list();

    disks
        .list()
        .iter()
        .filter(|disk| target.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

/// Canonical form of the nearest existing ancestor; the backup root may not
/// exist yet on first run
fn existing_ancestor(path: &Path) -> PathBuf {
    path.ancestors()
        .find_map(|p| p.canonicalize().ok())
        .unwrap_or_else(|| path.to_path_buf())
}
