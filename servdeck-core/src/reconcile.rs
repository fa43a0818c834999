//! Startup reconciliation
//!
//! The running snapshot is only a hint. Each entry is checked against the live
//! OS process table and the registry is corrected to match what is actually
//! alive. Reconciliation never fails: a pid that cannot be looked up resolves to
//! Stopped.

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::{ProjectId, RunningSnapshot, TrackedProcess};
use crate::registry::ProjectRegistry;

/// A live process as seen in the OS process table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    /// Unix seconds
    pub started_at: u64,
}

/// Read access to the OS process table.
pub trait ProcessTable: Send + Sync {
    /// Look up a live process by pid. `Ok(None)` means no such process.
    fn lookup(&self, pid: u32) -> Result<Option<ProcessInfo>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Liveness {
    Alive(ProcessInfo),
    Gone,
    /// The pid is alive but started at a different time than the tracked process.
    Reused { expected: u64, actual: u64 },
}

/// Check whether a tracked process is still the one we launched.
///
/// Without a recorded start time only the pid can be compared, so a recycled
/// pid is indistinguishable from the original process.
pub fn check_liveness(table: &dyn ProcessTable, tracked: &TrackedProcess) -> Liveness {
    match table.lookup(tracked.pid) {
        Ok(Some(info)) => match tracked.started_at {
            Some(expected) if expected != info.started_at => Liveness::Reused {
                expected,
                actual: info.started_at,
            },
            Some(_) => Liveness::Alive(info),
            None => {
                debug!(pid = tracked.pid, "no start time recorded, trusting pid alone");
                Liveness::Alive(info)
            }
        },
        Ok(None) => Liveness::Gone,
        Err(e) => {
            warn!(pid = tracked.pid, error = %e, "process lookup failed, treating as exited");
            Liveness::Gone
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Projects found alive and marked running, with their pids
    pub restored: Vec<(ProjectId, u32)>,
    /// Projects whose process is gone (or was replaced) and are now stopped
    pub stopped: Vec<ProjectId>,
    /// Snapshot entries for projects that no longer exist
    pub orphaned: Vec<ProjectId>,
}

pub fn reconcile(
    registry: &mut ProjectRegistry,
    snapshot: &RunningSnapshot,
    table: &dyn ProcessTable,
) -> ReconcileReport {
    let mut report = ReconcileReport::default();

    for (id, tracked) in snapshot {
        let Some(project) = registry.get_mut(id) else {
            debug!(project = %id, pid = tracked.pid, "discarding snapshot entry for removed project");
            report.orphaned.push(id.clone());
            continue;
        };

        match check_liveness(table, tracked) {
            Liveness::Alive(info) => {
                project.mark_running(info.pid, Some(info.started_at));
                info!(project = %id, pid = info.pid, "restored running server");
                report.restored.push((id.clone(), info.pid));
            }
            Liveness::Reused { expected, actual } => {
                warn!(project = %id, pid = tracked.pid, expected, actual, "pid was reused, marking stopped");
                project.mark_stopped();
                report.stopped.push(id.clone());
            }
            Liveness::Gone => {
                project.mark_stopped();
                report.stopped.push(id.clone());
            }
        }
    }

    report
}
