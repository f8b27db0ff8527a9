//! Write-only shell destination: the send stream is piped into a user
//! command. No listing and no deletion, so every run issues full sends;
//! the user opted out of state tracking.

use std::collections::BTreeSet;
use std::process::{Child, Command, Stdio};

use tracing::debug;

use crate::utils::errors::{BackupError, Result};

use super::{Destination, EndpointOptions};

/// Placeholder in the command replaced with the basename being received.
pub const DEST_PLACEHOLDER: &str = "%DEST%";

pub struct ShellDestination {
    command: String,
    key: String,
    opts: EndpointOptions,
}

impl ShellDestination {
    pub fn new(command: &str, opts: EndpointOptions) -> Self {
        Self {
            command: command.to_string(),
            key: format!("shell://{}", command),
            opts,
        }
    }

    fn command_for(&self, basename: &str) -> String {
        self.command.replace(DEST_PLACEHOLDER, basename)
    }
}

impl Destination for ShellDestination {
    fn key(&self) -> &str {
        &self.key
    }

    fn supports_listing(&self) -> bool {
        false
    }

    fn list(&self) -> Result<BTreeSet<String>> {
        Ok(BTreeSet::new())
    }

    fn receive(&self, stream: Stdio, basename: &str) -> Result<Child> {
        let command = self.command_for(basename);
        debug!("receiving {} via: sh -c {:?}", basename, command);
        Command::new("sh")
            .arg("-c")
            .arg(&command)
            .stdin(stream)
            .stdout(if self.opts.quiet {
                Stdio::null()
            } else {
                Stdio::inherit()
            })
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BackupError::TransferFailed(format!("spawning {:?}: {}", command, e)))
    }

    fn delete(&self, _basename: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_expansion() {
        let dest = ShellDestination::new(
            "cat > /backups/%DEST%.stream",
            EndpointOptions::default(),
        );
        assert_eq!(
            dest.command_for("20240115-120000"),
            "cat > /backups/20240115-120000.stream"
        );
    }

    #[test]
    fn test_listing_is_empty_and_delete_is_noop() {
        let dest = ShellDestination::new("cat > /dev/null", EndpointOptions::default());
        assert!(!dest.supports_listing());
        assert!(dest.list().unwrap().is_empty());
        dest.delete("20240115-120000").unwrap();
    }

    #[test]
    fn test_receive_pipes_stream_into_command() {
        let dest = ShellDestination::new("cat > /dev/null", EndpointOptions::default());
        let mut producer = Command::new("sh")
            .args(["-c", "printf abc"])
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let stream = producer.stdout.take().unwrap();
        let mut child = dest
            .receive(Stdio::from(stream), "20240115-120000")
            .unwrap();
        assert!(child.wait().unwrap().success());
        assert!(producer.wait().unwrap().success());
    }
}
