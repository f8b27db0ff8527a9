//! Replication endpoints.
//!
//! The coordinator sees both sides of a transfer through traits: the
//! [`Source`] it replicates from and the [`Destination`]s it streams to.
//! Concrete destinations are a directory on another btrfs filesystem
//! ([`local::LocalDestination`]), a remote host reached over SSH
//! ([`ssh::SshDestination`]) and an arbitrary command fed on stdin
//! ([`shell::ShellDestination`]); the source is [`source::LocalSource`],
//! which also owns the lock journal directory.

pub mod local;
pub mod shell;
pub mod source;
pub mod ssh;

use std::collections::BTreeSet;
use std::path::Path;
use std::process::{Child, Stdio};

use crate::utils::errors::{BackupError, Result};

pub use local::LocalDestination;
pub use shell::ShellDestination;
pub use source::LocalSource;
pub use ssh::SshDestination;

/// Settings shared by every endpoint of a run.
#[derive(Debug, Clone, Default)]
pub struct EndpointOptions {
    /// Prefix snapshot basenames must carry.
    pub prefix: String,
    /// Extra `-o OPT` ssh_config options for every ssh invocation.
    pub ssh_opts: Vec<String>,
    /// Convert snapshots to read-write before deletion.
    pub convert_rw: bool,
    /// Run `btrfs subvolume sync` after deletions.
    pub subvolume_sync: bool,
    /// Pass `-vv` to `btrfs send` / `btrfs receive`.
    pub btrfs_debug: bool,
    /// Validate btrfs filesystems / subvolumes before use.
    pub fs_checks: bool,
    /// Suppress receiver stdout chatter.
    pub quiet: bool,
}

/// The replication source: creates read-only snapshots of its tracked
/// subvolume, produces send streams, and owns the snapshot directory
/// that also hosts the lock journal.
pub trait Source {
    /// Directory holding the snapshots and the lock journal.
    fn snapshot_dir(&self) -> &Path;

    /// Create the snapshot directory if needed and validate the source.
    fn prepare(&self) -> Result<()>;

    /// Take a read-only snapshot of the subvolume under `basename`.
    fn snapshot(&self, basename: &str) -> Result<()>;

    /// Snapshot basenames currently stored, filtered by the active prefix.
    fn list(&self) -> Result<BTreeSet<String>>;

    /// Spawn the producer of the send stream for `basename`, incremental
    /// against `parent` when given.
    fn send(&self, basename: &str, parent: Option<&str>) -> Result<Child>;

    /// Remove a snapshot. Succeeds silently when it is already absent.
    fn delete(&self, basename: &str) -> Result<()>;
}

/// One backup location. Implementations spawn the actual consumer process
/// in `receive` so the coordinator can pipe `btrfs send` straight into it.
pub trait Destination {
    /// Stable identity recorded in the lock journal.
    fn key(&self) -> &str;

    /// Whether `list` reflects real state. Write-only endpoints return
    /// false and are skipped by cleanup and retention.
    fn supports_listing(&self) -> bool {
        true
    }

    /// Create missing directories, check reachability.
    fn prepare(&self) -> Result<()> {
        Ok(())
    }

    /// Snapshot basenames currently stored, filtered by the active prefix.
    fn list(&self) -> Result<BTreeSet<String>>;

    /// Spawn the process that materializes `basename` from the send
    /// stream handed over as `stream`.
    fn receive(&self, stream: Stdio, basename: &str) -> Result<Child>;

    /// Remove a snapshot. Succeeds silently when it is already absent.
    fn delete(&self, basename: &str) -> Result<()>;
}

/// Build a destination from its CLI string (which is also its journal
/// key): `shell://CMD`, `ssh://[user@]host[:port]/abs/path`, or a local
/// path.
pub fn parse_destination(
    spec: &str,
    opts: &EndpointOptions,
) -> Result<Box<dyn Destination>> {
    if let Some(cmd) = spec.strip_prefix("shell://") {
        if cmd.trim().is_empty() {
            return Err(BackupError::InvalidDestination(
                "shell:// destination without a command".into(),
            ));
        }
        Ok(Box::new(ShellDestination::new(cmd, opts.clone())))
    } else if let Some(rest) = spec.strip_prefix("ssh://") {
        let url = SshUrl::parse(rest)?;
        Ok(Box::new(SshDestination::new(url, opts.clone())))
    } else {
        Ok(Box::new(LocalDestination::new(spec, opts.clone())?))
    }
}

/// Run a local command to completion, mapping spawn failures and non-zero
/// exits to `CommandFailed` with the captured stderr.
pub(crate) fn run_local(mut cmd: std::process::Command, what: &str) -> Result<std::process::Output> {
    tracing::debug!("executing: {}", crate::utils::command_line(&cmd));
    let output = cmd
        .output()
        .map_err(|e| BackupError::CommandFailed(format!("{}: {}", what, e)))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(BackupError::CommandFailed(format!(
            "{}: {}: {}",
            what,
            output.status,
            stderr.trim()
        )));
    }
    Ok(output)
}

/// Parsed form of `[user@]host[:port]/abs/path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshUrl {
    pub username: Option<String>,
    pub hostname: String,
    pub port: Option<u16>,
    pub path: String,
}

impl SshUrl {
    pub fn parse(rest: &str) -> Result<Self> {
        let bad = |msg: &str| BackupError::InvalidDestination(format!("ssh://{}: {}", rest, msg));

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => return Err(bad("missing remote path")),
        };
        if path == "/" || path.is_empty() {
            return Err(bad("missing remote path"));
        }
        let (username, hostport) = match authority.rsplit_once('@') {
            Some((user, rest)) => (Some(user.to_string()), rest),
            None => (None, authority),
        };
        let (hostname, port) = match hostport.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| bad("invalid port number"))?;
                (host, Some(port))
            }
            None => (hostport, None),
        };
        if hostname.is_empty() {
            return Err(bad("missing hostname"));
        }
        Ok(Self {
            username,
            hostname: hostname.to_string(),
            port,
            path: normalize_path(path),
        })
    }

    /// `[user@]host`, the ssh connect argument.
    pub fn connect_string(&self) -> String {
        match &self.username {
            Some(user) => format!("{}@{}", user, self.hostname),
            None => self.hostname.clone(),
        }
    }

    /// Canonical `ssh://` form used as the journal key.
    pub fn canonical(&self) -> String {
        let mut s = String::from("ssh://");
        if let Some(user) = &self.username {
            s.push_str(user);
            s.push('@');
        }
        s.push_str(&self.hostname);
        if let Some(port) = self.port {
            s.push_str(&format!(":{}", port));
        }
        s.push_str(&self.path);
        s
    }
}

/// Lexically normalize a path: collapse duplicate separators and strip a
/// trailing slash. No symlink resolution.
fn normalize_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for part in path.split('/').filter(|p| !p.is_empty() && *p != ".") {
        out.push('/');
        out.push_str(part);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ssh_url_full() {
        let url = SshUrl::parse("root@nas:2222/mnt/backup").unwrap();
        assert_eq!(
            url,
            SshUrl {
                username: Some("root".into()),
                hostname: "nas".into(),
                port: Some(2222),
                path: "/mnt/backup".into(),
            }
        );
        assert_eq!(url.canonical(), "ssh://root@nas:2222/mnt/backup");
        assert_eq!(url.connect_string(), "root@nas");
    }

    #[test]
    fn test_parse_ssh_url_minimal() {
        let url = SshUrl::parse("nas/b").unwrap();
        assert_eq!(url.username, None);
        assert_eq!(url.port, None);
        assert_eq!(url.canonical(), "ssh://nas/b");
        assert_eq!(url.connect_string(), "nas");
    }

    #[test]
    fn test_parse_ssh_url_rejects_bad_input() {
        assert!(SshUrl::parse("nas").is_err());
        assert!(SshUrl::parse("nas/").is_err());
        assert!(SshUrl::parse("/only/path").is_err());
        assert!(SshUrl::parse("nas:notaport/b").is_err());
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/mnt//backup/"), "/mnt/backup");
        assert_eq!(normalize_path("/./mnt/./b"), "/mnt/b");
    }

    #[test]
    fn test_parse_destination_selects_kind() {
        let opts = EndpointOptions::default();
        let shell = parse_destination("shell://cat > /dev/null", &opts).unwrap();
        assert!(shell.key().starts_with("shell://"));
        assert!(!shell.supports_listing());

        let ssh = parse_destination("ssh://nas/b", &opts).unwrap();
        assert_eq!(ssh.key(), "ssh://nas/b");

        let local = parse_destination("/mnt/backup", &opts).unwrap();
        assert_eq!(local.key(), "/mnt/backup");
    }

    #[test]
    fn test_parse_destination_rejects_empty_shell() {
        let opts = EndpointOptions::default();
        assert!(parse_destination("shell://", &opts).is_err());
        assert!(parse_destination("shell://   ", &opts).is_err());
    }
}
