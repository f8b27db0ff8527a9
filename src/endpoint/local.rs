//! Local btrfs destination: a directory on another (or the same) btrfs
//! filesystem reached through the ordinary filesystem API plus the
//! `btrfs` command-line tools.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use tracing::{debug, info};

use crate::snapshot;
use crate::utils::errors::{BackupError, Result};
use crate::utils::fscheck;

use super::{run_local, Destination, EndpointOptions};

pub struct LocalDestination {
    path: PathBuf,
    key: String,
    opts: EndpointOptions,
}

impl LocalDestination {
    pub fn new(spec: &str, opts: EndpointOptions) -> Result<Self> {
        let path = std::path::absolute(Path::new(spec))?;
        let key = path.to_string_lossy().into_owned();
        Ok(Self { path, key, opts })
    }
}

impl Destination for LocalDestination {
    fn key(&self) -> &str {
        &self.key
    }

    fn prepare(&self) -> Result<()> {
        if !self.path.exists() {
            info!("creating directory: {}", self.path.display());
            fs::create_dir_all(&self.path)?;
        }
        if self.opts.fs_checks && !fscheck::is_btrfs(&self.path)? {
            return Err(BackupError::EndpointUnavailable(format!(
                "{} does not seem to be on a btrfs filesystem",
                self.path.display()
            )));
        }
        Ok(())
    }

    fn list(&self) -> Result<BTreeSet<String>> {
        let names = list_dir(&self.path)
            .map_err(|e| BackupError::EndpointUnavailable(format!("{}: {}", self.key, e)))?;
        Ok(snapshot::filter_listing(&self.opts.prefix, names))
    }

    fn receive(&self, stream: Stdio, basename: &str) -> Result<Child> {
        let mut cmd = Command::new("btrfs");
        cmd.arg("receive");
        if self.opts.btrfs_debug {
            cmd.arg("-vv");
        }
        cmd.arg(&self.path)
            .stdin(stream)
            .stdout(if self.opts.quiet {
                Stdio::null()
            } else {
                Stdio::inherit()
            })
            .stderr(Stdio::piped());
        debug!(
            "receiving {} via: {}",
            basename,
            crate::utils::command_line(&cmd)
        );
        cmd.spawn().map_err(|e| {
            BackupError::TransferFailed(format!("spawning btrfs receive: {}", e))
        })
    }

    fn delete(&self, basename: &str) -> Result<()> {
        delete_subvolume(&self.path, basename, &self.opts)
    }
}

/// Plain directory listing as a vec of file names.
pub(crate) fn list_dir(path: &Path) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(path)? {
        names.push(entry?.file_name().to_string_lossy().into_owned());
    }
    Ok(names)
}

/// Delete one snapshot under `dir`, honoring the read-write conversion and
/// subvolume-sync options. Succeeds silently when the snapshot is absent.
pub(crate) fn delete_subvolume(
    dir: &Path,
    basename: &str,
    opts: &EndpointOptions,
) -> Result<()> {
    let path = dir.join(basename);
    if !path.exists() {
        debug!("{} already absent, nothing to delete", path.display());
        return Ok(());
    }
    if opts.convert_rw {
        let mut cmd = Command::new("btrfs");
        cmd.args(["property", "set", "-ts"])
            .arg(&path)
            .args(["ro", "false"]);
        run_local(cmd, "btrfs property set")?;
    }
    let mut cmd = Command::new("btrfs");
    cmd.args(["subvolume", "delete"]).arg(&path);
    run_local(cmd, "btrfs subvolume delete")?;
    if opts.subvolume_sync {
        let mut cmd = Command::new("btrfs");
        cmd.args(["subvolume", "sync"]).arg(dir);
        run_local(cmd, "btrfs subvolume sync")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_list_filters_by_prefix_and_shape() {
        let dir = TempDir::new().unwrap();
        for name in [
            "20240115-120000",
            "home-20240116-120000",
            ".outstanding_transfers",
            "junk",
        ] {
            fs::create_dir(dir.path().join(name)).unwrap();
        }

        let opts = EndpointOptions {
            prefix: "home-".into(),
            ..Default::default()
        };
        let dest = LocalDestination::new(dir.path().to_str().unwrap(), opts).unwrap();
        let listed = dest.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed.contains("home-20240116-120000"));
    }

    #[test]
    fn test_list_missing_directory_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let gone = dir.path().join("gone");
        let dest = LocalDestination::new(gone.to_str().unwrap(), EndpointOptions::default())
            .unwrap();
        match dest.list() {
            Err(BackupError::EndpointUnavailable(_)) => {}
            other => panic!("expected EndpointUnavailable, got {:?}", other),
        }
    }

    #[test]
    fn test_delete_absent_snapshot_is_silent() {
        let dir = TempDir::new().unwrap();
        let dest = LocalDestination::new(dir.path().to_str().unwrap(), EndpointOptions::default())
            .unwrap();
        dest.delete("20240115-120000").unwrap();
    }

    #[test]
    fn test_prepare_creates_directory() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a/b");
        let dest = LocalDestination::new(nested.to_str().unwrap(), EndpointOptions::default())
            .unwrap();
        dest.prepare().unwrap();
        assert!(nested.is_dir());
    }
}
