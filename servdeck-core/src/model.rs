//! Project model for servdeck
//!
//! A project is a local dev-server folder the user registered. It is launched
//! as at most one OS process at a time; while that process is alive the record
//! is `Running` and carries its pid.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Unique identifier for a project (UUID string)
pub type ProjectId = String;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectStatus {
    #[default]
    Stopped,
    Running,
}

impl ProjectStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ProjectStatus::Stopped => "Stopped",
            ProjectStatus::Running => "Running",
        }
    }

    pub fn icon(&self) -> &'static str {
        match self {
            ProjectStatus::Stopped => "○",
            ProjectStatus::Running => "●",
        }
    }
}

/// The launcher invocations a project supports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Build,
    Clean,
    Run,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Build => write!(f, "build"),
            Operation::Clean => write!(f, "clean"),
            Operation::Run => write!(f, "run"),
        }
    }
}

/// A configured project.
///
/// `status`, `process_id` and `server_url` are session-volatile: they are
/// written to disk but reset on load, and only change through
/// [`ProjectRecord::mark_running`] and [`ProjectRecord::mark_stopped`] so that
/// a pid is present exactly when the record is running.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProjectRecord {
    pub id: ProjectId,
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    status: ProjectStatus,
    #[serde(default)]
    process_id: Option<u32>,
    #[serde(default)]
    server_url: Option<String>,
    #[serde(default)]
    pub is_built: bool,
    /// Start time (unix seconds) of the tracked process, used to detect pid reuse.
    #[serde(skip)]
    process_started_at: Option<u64>,
}

impl ProjectRecord {
    pub fn new(id: ProjectId, name: String, path: PathBuf, is_built: bool) -> Self {
        Self {
            id,
            name,
            path,
            status: ProjectStatus::Stopped,
            process_id: None,
            server_url: None,
            is_built,
            process_started_at: None,
        }
    }

    pub fn status(&self) -> ProjectStatus {
        self.status
    }

    pub fn is_running(&self) -> bool {
        self.status == ProjectStatus::Running
    }

    pub fn process_id(&self) -> Option<u32> {
        self.process_id
    }

    pub fn process_started_at(&self) -> Option<u64> {
        self.process_started_at
    }

    pub fn server_url(&self) -> Option<&str> {
        self.server_url.as_deref()
    }

    /// The process this record is tracking, if any.
    pub fn tracked_process(&self) -> Option<TrackedProcess> {
        self.process_id.map(|pid| TrackedProcess {
            pid,
            started_at: self.process_started_at,
        })
    }

    pub fn mark_running(&mut self, pid: u32, started_at: Option<u64>) {
        self.status = ProjectStatus::Running;
        self.process_id = Some(pid);
        self.process_started_at = started_at;
        self.server_url = None;
    }

    pub fn mark_stopped(&mut self) {
        self.status = ProjectStatus::Stopped;
        self.process_id = None;
        self.process_started_at = None;
        self.server_url = None;
    }

    /// Clear the fields that only make sense for a live session.
    pub fn reset_session(&mut self) {
        self.mark_stopped();
    }

    /// Take the persisted fields from a copy another process wrote, keeping
    /// this session's run state.
    pub fn adopt_saved(&mut self, saved: &ProjectRecord) {
        self.name.clone_from(&saved.name);
        self.path.clone_from(&saved.path);
        self.is_built = saved.is_built;
    }

    /// Record the detected server URL unless one was already seen for this run.
    /// Returns `true` when the URL was latched.
    pub fn latch_server_url(&mut self, url: &str) -> bool {
        if !self.is_running() || self.server_url.is_some() {
            return false;
        }
        self.server_url = Some(url.to_string());
        true
    }
}

/// A pid believed to belong to a project, plus its start time when known.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "SnapshotEntry", into = "SnapshotEntry")]
pub struct TrackedProcess {
    pub pid: u32,
    pub started_at: Option<u64>,
}

/// On-disk form of a snapshot entry: a bare pid, or a pid with its start time.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum SnapshotEntry {
    Pid(u32),
    Tracked {
        pid: u32,
        #[serde(default)]
        started_at: Option<u64>,
    },
}

impl From<SnapshotEntry> for TrackedProcess {
    fn from(entry: SnapshotEntry) -> Self {
        match entry {
            SnapshotEntry::Pid(pid) => TrackedProcess {
                pid,
                started_at: None,
            },
            SnapshotEntry::Tracked { pid, started_at } => TrackedProcess { pid, started_at },
        }
    }
}

impl From<TrackedProcess> for SnapshotEntry {
    fn from(tracked: TrackedProcess) -> Self {
        match tracked.started_at {
            None => SnapshotEntry::Pid(tracked.pid),
            Some(started_at) => SnapshotEntry::Tracked {
                pid: tracked.pid,
                started_at: Some(started_at),
            },
        }
    }
}

/// Projects believed running at last observation, keyed by project id.
pub type RunningSnapshot = BTreeMap<ProjectId, TrackedProcess>;

/// How a stop request ended. Every outcome leaves the record stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    /// The process tree exited within the timeout
    Terminated,
    /// The tree was killed after the timeout expired
    TimedOut,
    /// Nothing was tracked for the project
    NotRunning,
    /// The tracked pid had already exited
    AlreadyExited,
    /// The pid now belongs to a different process and was left alone
    PidReused,
    /// The termination signal could not be delivered
    Failed { details: String },
}

impl StopOutcome {
    pub fn describe(&self) -> String {
        match self {
            StopOutcome::Terminated => "Server stopped successfully.".into(),
            StopOutcome::TimedOut => "Server did not exit in time and was killed.".into(),
            StopOutcome::NotRunning => "Server was not running.".into(),
            StopOutcome::AlreadyExited => "Server had already exited.".into(),
            StopOutcome::PidReused => {
                "Tracked pid now belongs to another process; not signalled.".into()
            }
            StopOutcome::Failed { details } => format!("Could not confirm stop: {}", details),
        }
    }
}

/// What to do with running servers when the shell closes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownChoice {
    /// Stop every running server, then exit
    StopAll,
    /// Exit and leave servers running; they are picked up again on next launch
    LeaveRunning,
    /// Abort the close
    Cancel,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Exit,
    Cancelled,
}
