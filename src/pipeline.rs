//! Child-process pipelines for streaming transfers.
//!
//! A transfer is `btrfs send | [pv] | btrfs receive` (possibly behind ssh
//! or a user command) linked by OS pipes; the coordinator never buffers
//! stream bytes itself. The [`Pipeline`] owns every child it spawns: all
//! of them are waited on before a transfer counts as complete, stderr is
//! drained on background threads so a chatty child cannot stall the
//! stream, and unwaited children are killed on drop.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{debug, warn};

use crate::utils::errors::{BackupError, Result};

/// Tracks live child processes and the interrupt state for one run.
///
/// On SIGINT or SIGTERM a watcher thread marks the run interrupted and
/// sends SIGTERM to every registered child, so a coordinator blocked in
/// `wait()` on a long transfer returns promptly.
#[derive(Clone)]
pub struct RunGuard {
    inner: Arc<GuardInner>,
}

struct GuardInner {
    interrupted: AtomicBool,
    pids: Mutex<Vec<i32>>,
}

impl RunGuard {
    /// Install the signal watcher. Called once per run.
    pub fn install() -> std::io::Result<Self> {
        let guard = Self {
            inner: Arc::new(GuardInner {
                interrupted: AtomicBool::new(false),
                pids: Mutex::new(Vec::new()),
            }),
        };
        let inner = Arc::clone(&guard.inner);
        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        std::thread::spawn(move || {
            for signal in signals.forever() {
                warn!("received signal {}, terminating child processes", signal);
                inner.interrupted.store(true, Ordering::SeqCst);
                let pids = inner.pids.lock().unwrap();
                for pid in pids.iter() {
                    unsafe {
                        libc::kill(*pid, libc::SIGTERM);
                    }
                }
            }
        });
        Ok(guard)
    }

    /// A guard that never fires, for tests.
    #[cfg(test)]
    pub fn disarmed() -> Self {
        Self {
            inner: Arc::new(GuardInner {
                interrupted: AtomicBool::new(false),
                pids: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::SeqCst)
    }

    fn track(&self, pid: u32) {
        self.inner.pids.lock().unwrap().push(pid as i32);
    }

    fn untrack(&self, pid: u32) {
        self.inner.pids.lock().unwrap().retain(|p| *p != pid as i32);
    }
}

struct Stage {
    name: String,
    child: Child,
    stderr: Option<JoinHandle<String>>,
}

/// An in-flight chain of child processes linked by pipes.
pub struct Pipeline {
    guard: RunGuard,
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(guard: &RunGuard) -> Self {
        Self {
            guard: guard.clone(),
            stages: Vec::new(),
        }
    }

    /// Adopt a spawned child. If its stderr was piped, a drain thread
    /// starts collecting it for the failure report.
    pub fn push(&mut self, name: &str, mut child: Child) {
        let stderr = child.stderr.take().map(|mut pipe| {
            std::thread::spawn(move || {
                let mut buf = String::new();
                let _ = pipe.read_to_string(&mut buf);
                buf
            })
        });
        self.guard.track(child.id());
        self.stages.push(Stage {
            name: name.to_string(),
            child,
            stderr,
        });
    }

    /// Wait for every stage, upstream first. Any non-zero exit turns into
    /// `TransferFailed` carrying the stage name and its captured stderr;
    /// an interrupt observed during the wait wins over individual exits.
    pub fn wait(mut self) -> Result<()> {
        let mut failures = Vec::new();
        for mut stage in std::mem::take(&mut self.stages) {
            let waited = stage.child.wait();
            self.guard.untrack(stage.child.id());
            let stderr = stage
                .stderr
                .take()
                .and_then(|h| h.join().ok())
                .unwrap_or_default();
            match waited {
                Ok(status) => {
                    debug!("{} exited with {}", stage.name, status);
                    if !status.success() {
                        let mut msg = format!("{} exited with {}", stage.name, status);
                        let stderr = stderr.trim();
                        if !stderr.is_empty() {
                            msg.push_str(&format!(": {}", stderr));
                        }
                        failures.push(msg);
                    }
                }
                Err(e) => failures.push(format!("wait on {} failed: {}", stage.name, e)),
            }
        }
        if self.guard.interrupted() {
            return Err(BackupError::Interrupted);
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(BackupError::TransferFailed(failures.join("; ")))
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        for stage in &mut self.stages {
            let _ = stage.child.kill();
            let _ = stage.child.wait();
            self.guard.untrack(stage.child.id());
        }
    }
}

/// Probe for `pv` once per run; progress display is skipped when absent.
pub fn pv_available() -> bool {
    Command::new("pv")
        .arg("--help")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Spawn `pv` between two pipeline stages, consuming `input` and exposing
/// its stdout for the next stage.
pub fn spawn_pv(input: Stdio) -> std::io::Result<Child> {
    Command::new("pv")
        .stdin(input)
        .stdout(Stdio::piped())
        .spawn()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_stage_pipeline_succeeds() {
        let guard = RunGuard::disarmed();
        let mut pipeline = Pipeline::new(&guard);

        let mut producer = Command::new("sh")
            .args(["-c", "printf 'stream-bytes'"])
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let stream = producer.stdout.take().unwrap();
        pipeline.push("producer", producer);

        let consumer = Command::new("cat")
            .stdin(Stdio::from(stream))
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        pipeline.push("consumer", consumer);

        pipeline.wait().unwrap();
    }

    #[test]
    fn test_failing_stage_reports_name_and_stderr() {
        let guard = RunGuard::disarmed();
        let mut pipeline = Pipeline::new(&guard);
        let child = Command::new("sh")
            .args(["-c", "echo boom >&2; exit 3"])
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        pipeline.push("receiver", child);

        match pipeline.wait() {
            Err(BackupError::TransferFailed(msg)) => {
                assert!(msg.contains("receiver"), "{}", msg);
                assert!(msg.contains("boom"), "{}", msg);
            }
            other => panic!("expected TransferFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_all_stages_are_reported() {
        let guard = RunGuard::disarmed();
        let mut pipeline = Pipeline::new(&guard);
        pipeline.push("first", Command::new("false").spawn().unwrap());
        pipeline.push("second", Command::new("true").spawn().unwrap());

        match pipeline.wait() {
            Err(BackupError::TransferFailed(msg)) => {
                assert!(msg.contains("first"));
                assert!(!msg.contains("second"));
            }
            other => panic!("expected TransferFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_drop_kills_unwaited_children() {
        let guard = RunGuard::disarmed();
        let mut pipeline = Pipeline::new(&guard);
        let child = Command::new("sleep").arg("60").spawn().unwrap();
        let pid = child.id();
        pipeline.push("sleeper", child);
        drop(pipeline);

        // the process must be gone; signal 0 probes for existence
        let alive = unsafe { libc::kill(pid as i32, 0) } == 0;
        assert!(!alive);
    }
}
