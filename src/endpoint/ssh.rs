//! SSH destination: every operation is an `ssh` invocation against the
//! remote host, with the send stream piped into a remote `btrfs receive`.

use std::collections::BTreeSet;
use std::process::{Child, Command, Stdio};

use tracing::debug;

use crate::snapshot;
use crate::utils::errors::{BackupError, Result};

use super::{Destination, EndpointOptions, SshUrl};

pub struct SshDestination {
    url: SshUrl,
    key: String,
    opts: EndpointOptions,
}

impl SshDestination {
    pub fn new(url: SshUrl, opts: EndpointOptions) -> Self {
        let key = url.canonical();
        Self { url, key, opts }
    }

    /// Assemble the argument vector for one remote command: port and
    /// ssh_config options first, then the connect string, then the remote
    /// words. Options apply uniformly to every invocation.
    fn ssh_args<'a, I>(&self, remote: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut args = Vec::new();
        if let Some(port) = self.url.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        for opt in &self.opts.ssh_opts {
            args.push("-o".to_string());
            args.push(opt.clone());
        }
        args.push(self.url.connect_string());
        args.extend(remote.into_iter().map(str::to_string));
        args
    }

    fn remote_path(&self, basename: &str) -> String {
        format!("{}/{}", self.url.path, basename)
    }

    /// Remote words for one guarded deletion. The existence check comes
    /// first and short-circuits the whole conversion-and-delete group, so
    /// an already-absent snapshot succeeds without running anything else.
    fn delete_args(&self, path: &str) -> Vec<String> {
        let mut words: Vec<String> = Vec::new();
        words.extend(["test", "!", "-e", path, "||"].map(str::to_string));
        if self.opts.convert_rw {
            words.push("{".to_string());
            words.extend(
                ["btrfs", "property", "set", "-ts", path, "ro", "false", "&&"]
                    .map(str::to_string),
            );
            words.extend(["btrfs", "subvolume", "delete", path, ";", "}"].map(str::to_string));
        } else {
            words.extend(["btrfs", "subvolume", "delete", path].map(str::to_string));
        }
        if self.opts.subvolume_sync {
            words.push("&&".to_string());
            words.extend(["btrfs", "subvolume", "sync", self.url.path.as_str()].map(str::to_string));
        }
        words
    }

    fn run_remote(&self, remote: Vec<&str>, what: &str) -> Result<std::process::Output> {
        let mut cmd = Command::new("ssh");
        cmd.args(self.ssh_args(remote));
        debug!("executing: {}", crate::utils::command_line(&cmd));
        let output = cmd
            .output()
            .map_err(|e| BackupError::EndpointUnavailable(format!("{}: {}: {}", self.key, what, e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackupError::EndpointUnavailable(format!(
                "{}: {}: {}: {}",
                self.key,
                what,
                output.status,
                stderr.trim()
            )));
        }
        Ok(output)
    }
}

impl Destination for SshDestination {
    fn key(&self) -> &str {
        &self.key
    }

    fn prepare(&self) -> Result<()> {
        self.run_remote(vec!["mkdir", "-p", self.url.path.as_str()], "mkdir")?;
        Ok(())
    }

    fn list(&self) -> Result<BTreeSet<String>> {
        let output = self.run_remote(vec!["ls", "-1a", self.url.path.as_str()], "ls")?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let names = stdout
            .lines()
            .filter(|line| *line != "." && *line != "..")
            .map(str::to_string)
            .collect::<Vec<_>>();
        Ok(snapshot::filter_listing(&self.opts.prefix, names))
    }

    fn receive(&self, stream: Stdio, basename: &str) -> Result<Child> {
        let mut remote = vec!["btrfs", "receive"];
        if self.opts.btrfs_debug {
            remote.push("-vv");
        }
        remote.push(&self.url.path);

        let mut cmd = Command::new("ssh");
        cmd.args(self.ssh_args(remote))
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
        cmd.spawn()
            .map_err(|e| BackupError::TransferFailed(format!("spawning ssh: {}", e)))
    }

    fn delete(&self, basename: &str) -> Result<()> {
        let path = self.remote_path(basename);
        let words = self.delete_args(&path);
        self.run_remote(words.iter().map(String::as_str).collect(), "delete")
            .map_err(|e| BackupError::CommandFailed(e.to_string()))?;
        Ok(())
    }
}
