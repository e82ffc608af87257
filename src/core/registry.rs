use crate::config::types::{ExternalPid, RelativePid};
use crate::observability::metrics::SupervisorMetrics;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// Identifies one launch behind an external PID.
///
/// The portal may hand a PID out again once its previous owner is gone;
/// work captured against one launch checks the generation before acting.
pub type Generation = u64;

/// What `record_started` did with a `SpawnStarted` report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartedOutcome {
    /// The relative PID is now known.
    Resolved,
    /// The portal sent PID 0; the process died before becoming visible.
    NoRelativePid,
    /// The PID is not tracked (already exited, or never launched here).
    Untracked,
    /// A different relative PID was already recorded; the first one is kept.
    Conflict { kept: RelativePid },
}

/// What `record_exited` did with a `SpawnExited` report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitedOutcome {
    /// The status was stored for a later query.
    Stored,
    /// The PID was in the ignore set; the status was dropped.
    Ignored,
    /// The PID is not tracked; nothing was stored.
    Untracked,
}

#[derive(Clone, Copy, Debug)]
struct Tracked {
    relative: RelativePid,
    generation: Generation,
}

#[derive(Clone, Copy, Debug)]
struct Exited {
    raw_status: u32,
    generation: Generation,
}

/// Bookkeeping for processes launched through the portal.
///
/// A PID is in at most one of `running` and `exited`. A running entry holds
/// [`RelativePid::UNKNOWN`] until `SpawnStarted` resolves it, and is never
/// re-resolved afterwards.
#[derive(Debug, Default)]
pub struct ProcessTable {
    running: HashMap<ExternalPid, Tracked>,
    exited: HashMap<ExternalPid, Exited>,
    ignore_status: HashSet<ExternalPid>,
    next_generation: Generation,
}

impl ProcessTable {
    pub fn is_tracked(&self, pid: ExternalPid) -> bool {
        self.running.contains_key(&pid)
    }

    pub fn relative_pid(&self, pid: ExternalPid) -> Option<RelativePid> {
        self.running.get(&pid).map(|t| t.relative)
    }

    /// Launch generation of the tracked process behind `pid`.
    pub fn generation(&self, pid: ExternalPid) -> Option<Generation> {
        self.running.get(&pid).map(|t| t.generation)
    }

    pub fn has_exit_status(&self, pid: ExternalPid) -> bool {
        self.exited.contains_key(&pid)
    }

    pub fn is_ignored(&self, pid: ExternalPid) -> bool {
        self.ignore_status.contains(&pid)
    }

    pub fn tracked_count(&self) -> usize {
        self.running.len()
    }

    pub fn unclaimed_count(&self) -> usize {
        self.exited.len()
    }

    pub fn take_exit_status(&mut self, pid: ExternalPid) -> Option<u32> {
        self.exited.remove(&pid).map(|e| e.raw_status)
    }

    /// Like `take_exit_status`, but only if the status belongs to `generation`.
    pub fn take_exit_status_of(&mut self, pid: ExternalPid, generation: Generation) -> Option<u32> {
        match self.exited.get(&pid) {
            Some(exited) if exited.generation == generation => self.take_exit_status(pid),
            _ => None,
        }
    }

    /// Drop the exit status of `pid` when it arrives instead of storing it.
    pub fn ignore_exit(&mut self, pid: ExternalPid) {
        self.ignore_status.insert(pid);
    }

    fn record_spawned(&mut self, pid: ExternalPid) -> Generation {
        if self.exited.remove(&pid).is_some() {
            warn!("Discarding unclaimed exit status of reused PID {}", pid);
        }
        self.ignore_status.remove(&pid);
        self.next_generation += 1;
        let generation = self.next_generation;
        self.running.insert(
            pid,
            Tracked {
                relative: RelativePid::UNKNOWN,
                generation,
            },
        );
        generation
    }

    fn record_started(&mut self, pid: ExternalPid, relative: RelativePid) -> StartedOutcome {
        let Some(entry) = self.running.get_mut(&pid) else {
            return StartedOutcome::Untracked;
        };
        if !relative.is_known() {
            return StartedOutcome::NoRelativePid;
        }
        if entry.relative.is_known() && entry.relative != relative {
            return StartedOutcome::Conflict {
                kept: entry.relative,
            };
        }
        entry.relative = relative;
        StartedOutcome::Resolved
    }

    fn record_exited(&mut self, pid: ExternalPid, raw_status: u32) -> ExitedOutcome {
        let tracked = self.running.remove(&pid);
        if self.ignore_status.remove(&pid) {
            return ExitedOutcome::Ignored;
        }
        let Some(tracked) = tracked else {
            return ExitedOutcome::Untracked;
        };
        self.exited.insert(
            pid,
            Exited {
                raw_status,
                generation: tracked.generation,
            },
        );
        ExitedOutcome::Stored
    }
}

/// Process table behind one mutex, with one condition variable broadcast
/// after every state transition.
///
/// When built with metrics, the tracked-process gauge is written while the
/// lock is held, so it always matches the table.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    table: Mutex<ProcessTable>,
    changed: Condvar,
    metrics: Option<Arc<SupervisorMetrics>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(metrics: Arc<SupervisorMetrics>) -> Self {
        Self {
            metrics: Some(metrics),
            ..Self::default()
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProcessTable> {
        // Every mutation leaves the table consistent, so a poisoned lock is still usable.
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, table: &ProcessTable) {
        if let Some(metrics) = &self.metrics {
            metrics.tracked_processes.set(table.tracked_count() as u64);
        }
    }

    /// Track a PID the portal just acknowledged, with an unknown relative PID.
    pub fn record_spawned(&self, pid: ExternalPid) -> Generation {
        let mut table = self.lock();
        let generation = table.record_spawned(pid);
        self.publish(&table);
        drop(table);
        self.changed.notify_all();
        generation
    }

    pub fn record_started(&self, pid: ExternalPid, relative: RelativePid) -> StartedOutcome {
        let outcome = self.lock().record_started(pid, relative);
        match outcome {
            StartedOutcome::Resolved => {
                debug!("Resolved {} => {}", pid, relative);
                self.changed.notify_all();
            }
            StartedOutcome::NoRelativePid => {
                info!("PID {} has no relative PID", pid);
            }
            StartedOutcome::Untracked => {
                warn!("Process {} is already dead or not tracked", pid);
            }
            StartedOutcome::Conflict { kept } => {
                warn!(
                    "Ignoring relative PID {} for {}, already resolved to {}",
                    relative, pid, kept
                );
            }
        }
        outcome
    }

    pub fn record_exited(&self, pid: ExternalPid, raw_status: u32) -> ExitedOutcome {
        let mut table = self.lock();
        let outcome = table.record_exited(pid, raw_status);
        self.publish(&table);
        drop(table);
        match outcome {
            ExitedOutcome::Stored => debug!("Stored exit status 0x{:x} for {}", raw_status, pid),
            ExitedOutcome::Ignored => debug!("Ignored exit status of {}", pid),
            ExitedOutcome::Untracked => warn!("Exit reported for untracked PID {}", pid),
        }
        self.changed.notify_all();
        outcome
    }

    /// Remove and return the stored exit status without blocking.
    pub fn take_exit_status(&self, pid: ExternalPid) -> Option<u32> {
        self.lock().take_exit_status(pid)
    }

    /// Run `f` under the lock, then wake every waiter.
    pub fn update<T>(&self, f: impl FnOnce(&mut ProcessTable) -> T) -> T {
        let mut table = self.lock();
        let result = f(&mut table);
        self.publish(&table);
        drop(table);
        self.changed.notify_all();
        result
    }

    /// Run `f` under the lock without waking anyone.
    pub fn inspect<T>(&self, f: impl FnOnce(&ProcessTable) -> T) -> T {
        f(&self.lock())
    }

    /// Block until `predicate` yields a value, re-checking after every wake.
    ///
    /// The predicate runs with the lock held and may consume table entries.
    pub fn wait_until<T>(&self, mut predicate: impl FnMut(&mut ProcessTable) -> Option<T>) -> T {
        let mut table = self.lock();
        loop {
            if let Some(value) = predicate(&mut table) {
                return value;
            }
            table = self
                .changed
                .wait(table)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn tracked_count(&self) -> usize {
        self.lock().tracked_count()
    }
}
