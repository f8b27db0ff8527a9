//! The lock journal: persisted record of in-flight transfers.
//!
//! Every `(snapshot, destination)` transfer edge is recorded in
//! `.outstanding_transfers` in the source snapshot directory before the
//! first byte is streamed and removed once the receiver exits cleanly. An
//! entry that survives a run marks the destination copy as torn; the next
//! run deletes it there and retransmits.
//!
//! The file is a JSON object keyed by snapshot basename:
//!
//! ```json
//! { "20240115-120100": ["ssh://nas/backup", "/mnt/backup"] }
//! ```
//!
//! All mutations are persisted immediately via write-temp-then-rename so a
//! crash at any point leaves either the pre-image or the post-image.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::utils::errors::{BackupError, Result};

/// Journal file name inside the source snapshot directory.
pub const JOURNAL_FILE: &str = ".outstanding_transfers";

/// Sibling temp file used for atomic replacement.
const JOURNAL_TMP_FILE: &str = ".outstanding_transfers.tmp";

/// On-disk shape of the journal: snapshot basename to the destination
/// keys with an open transfer. Sorted maps keep the file stable across
/// rewrites.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(transparent)]
struct Entries(BTreeMap<String, BTreeSet<String>>);

#[derive(Debug)]
pub struct LockJournal {
    path: PathBuf,
    tmp_path: PathBuf,
    entries: Entries,
}

impl LockJournal {
    /// Load the journal from `dir`. A missing file is an empty journal.
    /// An unparseable file is fatal: silently starting over could lose
    /// locks or trigger double transfers.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(JOURNAL_FILE);
        let tmp_path = dir.join(JOURNAL_TMP_FILE);
        let entries = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                BackupError::CorruptJournal(format!(
                    "{}: {} (inspect or remove the file to proceed)",
                    path.display(),
                    e
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Entries::default(),
            Err(e) => return Err(e.into()),
        };
        debug!("loaded lock journal from {}: {:?}", path.display(), entries);
        Ok(Self {
            path,
            tmp_path,
            entries,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.0.is_empty()
    }

    pub fn entries(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.entries.0
    }

    /// Basenames that have at least one live lock.
    pub fn locked_snapshots(&self) -> BTreeSet<String> {
        self.entries.0.keys().cloned().collect()
    }

    /// Every destination key appearing in any entry.
    pub fn dest_keys(&self) -> BTreeSet<String> {
        self.entries.0.values().flatten().cloned().collect()
    }

    pub fn contains(&self, basename: &str, dest_key: &str) -> bool {
        self.entries
            .0
            .get(basename)
            .map(|keys| keys.contains(dest_key))
            .unwrap_or(false)
    }

    /// Record that a transfer of `basename` to `dest_key` is about to start.
    pub fn lock(&mut self, basename: &str, dest_key: &str) -> Result<()> {
        self.entries
            .0
            .entry(basename.to_string())
            .or_default()
            .insert(dest_key.to_string());
        debug!("lock set: {} -> {}", basename, dest_key);
        self.persist()
    }

    /// Clear the lock for one transfer edge. Empty entries are dropped.
    pub fn unlock(&mut self, basename: &str, dest_key: &str) -> Result<()> {
        if let Some(keys) = self.entries.0.get_mut(basename) {
            keys.remove(dest_key);
            if keys.is_empty() {
                self.entries.0.remove(basename);
            }
        }
        debug!("lock cleared: {} -> {}", basename, dest_key);
        self.persist()
    }

    /// Drop every entry referencing one of `dest_keys`, returning how many
    /// edges were removed.
    pub fn remove_dest_entries(&mut self, dest_keys: &BTreeSet<String>) -> Result<usize> {
        let mut removed = 0;
        self.entries.0.retain(|_, keys| {
            let before = keys.len();
            keys.retain(|k| !dest_keys.contains(k));
            removed += before - keys.len();
            !keys.is_empty()
        });
        if removed > 0 {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Write the journal to disk: temp file in the same directory, fsync,
    /// rename over the live file.
    fn persist(&self) -> Result<()> {
        let content = serde_json::to_vec_pretty(&self.entries)?;
        let mut file = fs::File::create(&self.tmp_path)?;
        file.write_all(&content)?;
        file.sync_all()?;
        fs::rename(&self.tmp_path, &self.path)?;
        Ok(())
    }
}
