//! Command-line interface.
//!
//! Arguments can be spliced in from files: a token `@FILE` is replaced,
//! before parsing, by the non-blank non-comment lines of FILE (one
//! argument per line, recursively). This keeps cron entries short while
//! the real invocation lives in a readable file.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::endpoint::EndpointOptions;
use crate::utils::errors::{BackupError, Result};

/// Recursion cap for `@FILE` splicing; anything deeper is a cycle.
const MAX_INCLUDE_DEPTH: usize = 8;

#[derive(Parser, Debug)]
#[command(
    name = "snapsend",
    version,
    about = "Incremental btrfs snapshot replication",
    long_about = "Snapshots a btrfs subvolume and replicates it incrementally to one or \
                  more destinations: a local btrfs directory, ssh://[user@]host[:port]/path, \
                  or shell://COMMAND receiving the send stream on stdin."
)]
pub struct Args {
    /// Subvolume to back up
    pub source: PathBuf,

    /// Destinations: /path, ssh://[user@]host[:port]/path or shell://CMD
    /// (with --locked-dests they may also come from the lock journal)
    pub destinations: Vec<String>,

    /// Prefix for snapshot basenames
    #[arg(short = 'p', long, default_value = "")]
    pub snapshot_prefix: String,

    /// Snapshot folder on the source filesystem, relative to the source
    /// subvolume or absolute
    #[arg(short = 'f', long, default_value = "snapshot")]
    pub snapshot_folder: PathBuf,

    /// Keep only the latest N snapshots on the source (0 = keep all)
    #[arg(short = 'N', long, default_value_t = 0, value_name = "INT")]
    pub num_snapshots: usize,

    /// Keep only the latest N backups per destination (0 = keep all)
    #[arg(short = 'n', long, default_value_t = 0, value_name = "INT")]
    pub num_backups: usize,

    /// Don't create a new snapshot (cleanup, transfer and retention still run)
    #[arg(long)]
    pub no_snapshot: bool,

    /// Don't transfer anything
    #[arg(long)]
    pub no_transfer: bool,

    /// Also act on every destination recorded in the lock journal
    #[arg(long)]
    pub locked_dests: bool,

    /// Drop the lock entries matching the given destinations and exit
    #[arg(long)]
    pub remove_locks: bool,

    /// Set verbosity level
    #[arg(short = 'v', long, default_value = "info", value_name = "LEVEL")]
    pub verbosity: Verbosity,

    /// Shortcut for '--no-progress --verbosity warning'
    #[arg(short, long)]
    pub quiet: bool,

    /// Don't display progress during transfers (no pv)
    #[arg(short = 'P', long)]
    pub no_progress: bool,

    /// Don't check whether source / destination is a btrfs subvolume / filesystem
    #[arg(short = 'C', long)]
    pub skip_fs_checks: bool,

    /// Convert read-only snapshots to read-write before deleting them
    #[arg(short = 'w', long)]
    pub convert_rw: bool,

    /// Run 'btrfs subvolume sync' after deleting subvolumes
    #[arg(short = 's', long)]
    pub sync: bool,

    /// Enable debugging on btrfs send / receive
    #[arg(short = 'd', long)]
    pub btrfs_debug: bool,

    /// Pass an extra ssh_config option to every ssh(1) invocation
    #[arg(long = "ssh-opt", value_name = "OPT")]
    pub ssh_opts: Vec<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verbosity {
    Debug,
    Info,
    Warning,
    Error,
}

impl Args {
    /// Verbosity with the --quiet shortcut applied.
    pub fn effective_verbosity(&self) -> Verbosity {
        if self.quiet && matches!(self.verbosity, Verbosity::Debug | Verbosity::Info) {
            Verbosity::Warning
        } else {
            self.verbosity
        }
    }

    pub fn progress_enabled(&self) -> bool {
        !(self.no_progress || self.quiet)
    }

    pub fn validate(&self) -> Result<()> {
        if self.destinations.is_empty() && !self.locked_dests && !self.remove_locks {
            return Err(BackupError::InvalidArguments(
                "at least one destination is required (or --locked-dests / --remove-locks)"
                    .into(),
            ));
        }
        Ok(())
    }

    pub fn endpoint_options(&self) -> EndpointOptions {
        EndpointOptions {
            prefix: self.snapshot_prefix.clone(),
            ssh_opts: self.ssh_opts.clone(),
            convert_rw: self.convert_rw,
            subvolume_sync: self.sync,
            btrfs_debug: self.btrfs_debug,
            fs_checks: !self.skip_fs_checks,
            quiet: matches!(
                self.effective_verbosity(),
                Verbosity::Warning | Verbosity::Error
            ),
        }
    }
}

/// Expand `@FILE` tokens into the argument stream. The first element (the
/// program name) passes through untouched.
pub fn expand_arg_files<I>(args: I) -> Result<Vec<String>>
where
    I: IntoIterator<Item = String>,
{
    let mut out = Vec::new();
    let mut iter = args.into_iter();
    if let Some(program) = iter.next() {
        out.push(program);
    }
    for arg in iter {
        match arg.strip_prefix('@') {
            Some(path) => splice_file(path, &mut out, 0)?,
            None => out.push(arg),
        }
    }
    Ok(out)
}

fn splice_file(path: &str, out: &mut Vec<String>, depth: usize) -> Result<()> {
    if depth >= MAX_INCLUDE_DEPTH {
        return Err(BackupError::InvalidArguments(format!(
            "argument files nested more than {} levels deep (cycle?): {}",
            MAX_INCLUDE_DEPTH, path
        )));
    }
    let content = std::fs::read_to_string(path).map_err(|e| {
        BackupError::InvalidArguments(format!("cannot read argument file {}: {}", path, e))
    })?;
    for line in content.lines() {
        let line = line.trim_start().trim_end_matches('\r');
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.strip_prefix('@') {
            Some(nested) => splice_file(nested, out, depth + 1)?,
            None => out.push(line.to_string()),
        }
    }
    Ok(())
}
