//! The replication source: a local btrfs subvolume with a snapshot
//! directory on the same filesystem. The source creates read-only
//! snapshots, produces send streams and exclusively owns the lock
//! journal stored in its snapshot directory.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use tracing::{debug, info};

use crate::snapshot;
use crate::utils::errors::{BackupError, Result};
use crate::utils::fscheck;

use super::local::{delete_subvolume, list_dir};
use super::{run_local, EndpointOptions, Source};

pub struct LocalSource {
    subvolume: PathBuf,
    snapshot_dir: PathBuf,
    opts: EndpointOptions,
}

impl LocalSource {
    /// `snapshot_folder` may be absolute or relative to the subvolume.
    pub fn new(subvolume: &Path, snapshot_folder: &Path, opts: EndpointOptions) -> Result<Self> {
        let subvolume = std::path::absolute(subvolume)?;
        let snapshot_dir = if snapshot_folder.is_absolute() {
            snapshot_folder.to_path_buf()
        } else {
            subvolume.join(snapshot_folder)
        };
        Ok(Self {
            subvolume,
            snapshot_dir,
            opts,
        })
    }
}

impl Source for LocalSource {
    fn snapshot_dir(&self) -> &Path {
        &self.snapshot_dir
    }

    /// Create the snapshot directory if needed and validate that the
    /// subvolume really is one.
    fn prepare(&self) -> Result<()> {
        if !self.snapshot_dir.exists() {
            info!("creating directory: {}", self.snapshot_dir.display());
            fs::create_dir_all(&self.snapshot_dir)?;
        }
        if self.opts.fs_checks && !fscheck::is_subvolume(&self.subvolume)? {
            return Err(BackupError::EndpointUnavailable(format!(
                "{} does not seem to be a btrfs subvolume",
                self.subvolume.display()
            )));
        }
        Ok(())
    }

    /// Take a read-only snapshot of the subvolume under `basename`, then
    /// sync disks so the snapshot is sendable immediately.
    fn snapshot(&self, basename: &str) -> Result<()> {
        let target = self.snapshot_dir.join(basename);
        if target.exists() {
            return Err(BackupError::SnapshotExists(
                target.to_string_lossy().into_owned(),
            ));
        }
        info!("{} -> {}", self.subvolume.display(), target.display());
        let mut cmd = Command::new("btrfs");
        cmd.args(["subvolume", "snapshot", "-r"])
            .arg(&self.subvolume)
            .arg(&target);
        run_local(cmd, "btrfs subvolume snapshot")
            .map_err(|e| BackupError::SnapshotFailed(e.to_string()))?;

        debug!("syncing disks");
        run_local(Command::new("sync"), "sync")
            .map_err(|e| BackupError::SnapshotFailed(e.to_string()))?;
        Ok(())
    }

    fn list(&self) -> Result<BTreeSet<String>> {
        let names = list_dir(&self.snapshot_dir).map_err(|e| {
            BackupError::EndpointUnavailable(format!("{}: {}", self.snapshot_dir.display(), e))
        })?;
        Ok(snapshot::filter_listing(&self.opts.prefix, names))
    }

    /// Spawn `btrfs send` for `basename`, incremental against `parent`
    /// when given. The caller wires the returned child's stdout into a
    /// destination's receiver.
    fn send(&self, basename: &str, parent: Option<&str>) -> Result<Child> {
        let mut cmd = Command::new("btrfs");
        cmd.arg("send");
        if self.opts.btrfs_debug {
            cmd.arg("-vv");
        }
        if self.opts.quiet {
            cmd.arg("-q");
        }
        if let Some(parent) = parent {
            cmd.arg("-p").arg(self.snapshot_dir.join(parent));
        }
        cmd.arg(self.snapshot_dir.join(basename))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        debug!("executing: {}", crate::utils::command_line(&cmd));
        cmd.spawn()
            .map_err(|e| BackupError::TransferFailed(format!("spawning btrfs send: {}", e)))
    }

    fn delete(&self, basename: &str) -> Result<()> {
        delete_subvolume(&self.snapshot_dir, basename, &self.opts)
    }
}
