//! btrfs filesystem and subvolume validation.
//!
//! Snapshots can only be created on the filesystem that holds the source
//! subvolume, and `btrfs receive` needs a btrfs mount on the other side.
//! These checks catch misconfiguration before any child process is spawned.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use tracing::debug;

const MOUNTS_FILE: &str = "/proc/mounts";

// btrfs subvolume roots always have inode 256
const SUBVOLUME_INODE: u64 = 256;

/// Check whether `path` lies inside a mounted btrfs filesystem.
pub fn is_btrfs(path: &Path) -> std::io::Result<bool> {
    let mounts = fs::read_to_string(MOUNTS_FILE)?;
    let path = std::path::absolute(path)?;
    let fstype = fstype_of(&path.to_string_lossy(), &mounts);
    debug!("filesystem type of {} is {:?}", path.display(), fstype);
    Ok(fstype.as_deref() == Some("btrfs"))
}

/// Check whether `path` is the root of a btrfs subvolume.
pub fn is_subvolume(path: &Path) -> std::io::Result<bool> {
    if !is_btrfs(path)? {
        return Ok(false);
    }
    let meta = fs::metadata(path)?;
    Ok(meta.ino() == SUBVOLUME_INODE)
}

/// Find the filesystem type of the longest mountpoint prefix of `path`
/// in mounts-file formatted `mounts` content.
fn fstype_of(path: &str, mounts: &str) -> Option<String> {
    let mut best_match = "";
    let mut best_fstype = None;
    for line in mounts.lines() {
        let mut fields = line.split(' ').skip(1);
        let (Some(mountpoint), Some(fstype)) = (fields.next(), fields.next()) else {
            continue;
        };
        if path.starts_with(mountpoint) && mountpoint.len() > best_match.len() {
            best_match = mountpoint;
            best_fstype = Some(fstype.to_string());
        }
    }
    best_fstype
}
