//! The per-run replication coordinator.
//!
//! One run proceeds in fixed order: load the lock journal, expand the
//! destination set from it when asked, repair torn transfers left by
//! earlier runs, take the new snapshot, stream every missing snapshot to
//! every destination (incrementally where a common parent exists), and
//! finally apply retention on both sides. A failed transfer never aborts
//! the run; it leaves its lock in the journal, breaks off the plan for
//! that destination only, and turns into a non-zero exit at the end.

use std::collections::{BTreeMap, BTreeSet};
use std::process::Stdio;

use tracing::{debug, error, info, warn};

use crate::endpoint::{parse_destination, Destination, EndpointOptions, Source};
use crate::journal::LockJournal;
use crate::pipeline::{self, Pipeline, RunGuard};
use crate::retention;
use crate::snapshot;
use crate::utils::errors::{BackupError, Result};

/// Per-run policy switches, bundled so nothing lives in global state.
#[derive(Debug, Clone)]
pub struct Policy {
    pub create_snapshot: bool,
    pub do_transfer: bool,
    /// Source snapshots to keep, 0 = all.
    pub retain_source: usize,
    /// Backups to keep per destination, 0 = all.
    pub retain_destination: usize,
    /// Pull additional destinations out of the lock journal.
    pub locked_dests_only: bool,
    /// Drop matching lock entries and stop.
    pub remove_locks: bool,
    /// Interpose pv when available.
    pub progress: bool,
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub created_snapshot: Option<String>,
    pub transferred: usize,
    pub cleaned: usize,
    pub failures: usize,
}

impl RunReport {
    pub fn success(&self) -> bool {
        self.failures == 0
    }
}

pub struct Coordinator {
    source: Box<dyn Source>,
    destinations: Vec<Box<dyn Destination>>,
    policy: Policy,
    opts: EndpointOptions,
    guard: RunGuard,
}

/// Listing per destination key; `None` marks an endpoint whose listing
/// failed, which excludes it from cleanup, planning and retention.
type DestSets = BTreeMap<String, Option<BTreeSet<String>>>;

impl Coordinator {
    pub fn new(
        source: Box<dyn Source>,
        destinations: Vec<Box<dyn Destination>>,
        policy: Policy,
        opts: EndpointOptions,
        guard: RunGuard,
    ) -> Self {
        Self {
            source,
            destinations,
            policy,
            opts,
            guard,
        }
    }

    pub fn run(mut self) -> Result<RunReport> {
        let mut report = RunReport::default();

        self.source.prepare()?;
        let mut journal = LockJournal::load(self.source.snapshot_dir())?;
        self.expand_destinations(&journal);

        if self.policy.remove_locks {
            let keys: BTreeSet<String> = self
                .destinations
                .iter()
                .map(|d| d.key().to_string())
                .collect();
            let removed = journal.remove_dest_entries(&keys)?;
            info!("dropped {} lock entries", removed);
            return Ok(report);
        }

        // one listing per destination, reused by cleanup, planning and
        // retention; kept in sync as transfers and deletions happen
        let mut dest_sets = self.prepare_and_list(&mut report);

        self.clean_stale_transfers(&mut journal, &mut dest_sets, &mut report)?;

        if self.policy.create_snapshot {
            let basename = snapshot::new_basename(&self.opts.prefix);
            self.source.snapshot(&basename)?;
            info!("created snapshot {}", basename);
            report.created_snapshot = Some(basename);
        }

        if self.policy.do_transfer {
            self.execute_transfers(&mut journal, &mut dest_sets, &mut report)?;
        }

        self.apply_retention(&journal, &dest_sets, &mut report);

        if self.guard.interrupted() {
            return Err(BackupError::Interrupted);
        }
        Ok(report)
    }

    /// Resolve journal destination keys back into endpoints when
    /// `--locked-dests` is active. Keys that parse to nothing usable are
    /// warned about and skipped.
    fn expand_destinations(&mut self, journal: &LockJournal) {
        if !self.policy.locked_dests_only {
            return;
        }
        let present: BTreeSet<String> = self
            .destinations
            .iter()
            .map(|d| d.key().to_string())
            .collect();
        for key in journal.dest_keys() {
            if present.contains(&key) {
                continue;
            }
            match parse_destination(&key, &self.opts) {
                Ok(dest) => {
                    info!("picked up locked destination {}", key);
                    self.destinations.push(dest);
                }
                Err(e) => warn!("ignoring locked destination {}: {}", key, e),
            }
        }
    }

    fn prepare_and_list(&self, report: &mut RunReport) -> DestSets {
        let mut dest_sets = DestSets::new();
        for dest in &self.destinations {
            let listed = match dest.prepare().and_then(|_| dest.list()) {
                Ok(set) => Some(set),
                Err(e) => {
                    warn!("skipping destination {}: {}", dest.key(), e);
                    report.failures += 1;
                    None
                }
            };
            dest_sets.insert(dest.key().to_string(), listed);
        }
        dest_sets
    }

    /// Every journal entry marks a torn copy at its destination: delete
    /// the copy if it is still there, then release the lock. Locks for
    /// destinations outside this run (or whose listing failed) stay put.
    fn clean_stale_transfers(
        &self,
        journal: &mut LockJournal,
        dest_sets: &mut DestSets,
        report: &mut RunReport,
    ) -> Result<()> {
        for (basename, keys) in journal.entries().clone() {
            for key in keys {
                let Some(dest) = self.destinations.iter().find(|d| d.key() == key) else {
                    debug!("lock {} -> {} references a destination outside this run", basename, key);
                    continue;
                };
                let Some(Some(listed)) = dest_sets.get_mut(&key) else {
                    continue;
                };
                if listed.contains(&basename) {
                    info!("deleting torn transfer {} at {}", basename, key);
                    match dest.delete(&basename) {
                        Ok(()) => {
                            listed.remove(&basename);
                            journal.unlock(&basename, &key)?;
                            report.cleaned += 1;
                        }
                        Err(e) => {
                            // keep the lock so the next run retries
                            warn!("could not delete {} at {}: {}", basename, key, e);
                            report.failures += 1;
                        }
                    }
                } else {
                    debug!("lock {} -> {} has nothing to clean up", basename, key);
                    journal.unlock(&basename, &key)?;
                    report.cleaned += 1;
                }
            }
        }
        Ok(())
    }

    fn execute_transfers(
        &self,
        journal: &mut LockJournal,
        dest_sets: &mut DestSets,
        report: &mut RunReport,
    ) -> Result<()> {
        let source_set = self.source.list()?;
        let use_pv = self.policy.progress && pipeline::pv_available();

        for dest in &self.destinations {
            let Some(Some(dest_set)) = dest_sets.get_mut(dest.key()) else {
                continue;
            };
            let plan = plan_sends(&source_set, dest_set);
            if plan.is_empty() {
                debug!("{} is up to date", dest.key());
                continue;
            }
            for (basename, parent) in plan {
                if self.guard.interrupted() {
                    return Err(BackupError::Interrupted);
                }
                journal.lock(&basename, dest.key())?;
                match self.transfer(&basename, parent.as_deref(), dest.as_ref(), use_pv) {
                    Ok(()) => {
                        journal.unlock(&basename, dest.key())?;
                        dest_set.insert(basename);
                        report.transferred += 1;
                    }
                    Err(BackupError::Interrupted) => return Err(BackupError::Interrupted),
                    Err(e) => {
                        error!("transfer of {} to {} failed: {}", basename, dest.key(), e);
                        report.failures += 1;
                        // the parent chain here is broken; other
                        // destinations may still be reachable
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// One transfer edge: `btrfs send | [pv] | receiver`.
    fn transfer(
        &self,
        basename: &str,
        parent: Option<&str>,
        dest: &dyn Destination,
        use_pv: bool,
    ) -> Result<()> {
        match parent {
            Some(parent) => info!("sending {} to {} (parent {})", basename, dest.key(), parent),
            None => info!("sending {} to {} (full)", basename, dest.key()),
        }

        let mut pipeline = Pipeline::new(&self.guard);
        let mut send = self.source.send(basename, parent)?;
        let mut stream = send
            .stdout
            .take()
            .ok_or_else(|| BackupError::TransferFailed("btrfs send has no stdout".into()))?;
        pipeline.push("btrfs send", send);

        if use_pv {
            let mut pv = pipeline::spawn_pv(Stdio::from(stream))?;
            stream = pv
                .stdout
                .take()
                .ok_or_else(|| BackupError::TransferFailed("pv has no stdout".into()))?;
            pipeline.push("pv", pv);
        }

        let receiver = dest.receive(Stdio::from(stream), basename)?;
        pipeline.push("receive", receiver);
        pipeline.wait()
    }

    /// Count-based retention with pinning on both sides. Deletion errors
    /// degrade to warnings; the snapshots will be retried next run.
    fn apply_retention(&self, journal: &LockJournal, dest_sets: &DestSets, report: &mut RunReport) {
        if self.policy.retain_source > 0 {
            match self.source.list() {
                Ok(source_set) => {
                    let listed: Vec<&BTreeSet<String>> =
                        dest_sets.values().filter_map(|s| s.as_ref()).collect();
                    let pinned = retention::source_pins(&source_set, journal, &listed);
                    for name in
                        retention::removable(&source_set, self.policy.retain_source, &pinned)
                    {
                        info!("removing source snapshot {}", name);
                        if let Err(e) = self.source.delete(&name) {
                            warn!("could not remove {}: {}", name, e);
                            report.failures += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!("skipping source retention: {}", e);
                    report.failures += 1;
                }
            }
        }

        if self.policy.retain_destination > 0 {
            for dest in &self.destinations {
                if !dest.supports_listing() {
                    continue;
                }
                let Some(Some(dest_set)) = dest_sets.get(dest.key()) else {
                    continue;
                };
                let pinned = retention::destination_pins(dest_set);
                for name in
                    retention::removable(dest_set, self.policy.retain_destination, &pinned)
                {
                    info!("removing backup {} at {}", name, dest.key());
                    if let Err(e) = dest.delete(&name) {
                        warn!("could not remove {} at {}: {}", name, dest.key(), e);
                        report.failures += 1;
                    }
                }
            }
        }
    }
}

/// Transfer plan for one destination: missing snapshots in ascending
/// order, each with the parent it will be sent against. Every planned
/// send counts its predecessors as present, so a chain of pending
/// snapshots replicates as one full (or small incremental) send followed
/// by minimal increments.
pub fn plan_sends(
    source_set: &BTreeSet<String>,
    dest_set: &BTreeSet<String>,
) -> Vec<(String, Option<String>)> {
    let mut common: BTreeSet<String> = source_set.intersection(dest_set).cloned().collect();
    let mut plan = Vec::new();
    for basename in source_set.difference(dest_set) {
        let parent = snapshot::find_parent(&common, basename).map(str::to_string);
        plan.push((basename.clone(), parent));
        common.insert(basename.clone());
    }
    plan
}
