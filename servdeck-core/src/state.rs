use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{info, warn};

use crate::config::Settings;
use crate::error::{Recovered, Result, ServdeckError};
use crate::model::{ProjectId, ProjectRecord};
use crate::reconcile::{ProcessTable, ReconcileReport, reconcile};
use crate::reducer::{Effects, EventEnvelope, reduce};
use crate::registry::ProjectRegistry;
use crate::store::{PendingChanges, ProjectStore};

/// Which output stream a log line came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

#[derive(Clone, Debug)]
pub struct LogLine {
    pub at: SystemTime,
    pub project_id: ProjectId,
    pub stream: LogStream,
    pub text: String,
}

impl LogLine {
    pub fn system(id: &str, at: SystemTime, text: String) -> Self {
        Self {
            at,
            project_id: id.to_string(),
            stream: LogStream::System,
            text,
        }
    }
}

/// In-memory session log: a bounded buffer per project plus a merged one.
#[derive(Debug)]
pub struct LogStore {
    pub cap: usize,
    pub per_project: BTreeMap<ProjectId, VecDeque<LogLine>>,
    pub merged: VecDeque<LogLine>,
    /// Lines ever pushed to `merged`; a cursor for incremental readers
    pushed: u64,
}

impl LogStore {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            per_project: BTreeMap::new(),
            merged: VecDeque::new(),
            pushed: 0,
        }
    }

    pub fn push(&mut self, id: &str, line: LogLine) {
        let q = self.per_project.entry(id.to_string()).or_default();
        q.push_back(line.clone());
        while q.len() > self.cap {
            q.pop_front();
        }

        self.merged.push_back(line);
        self.pushed += 1;
        while self.merged.len() > self.cap {
            self.merged.pop_front();
        }
    }

    pub fn cursor(&self) -> u64 {
        self.pushed
    }

    /// Merged lines pushed after `cursor`, oldest first. Lines that already
    /// fell out of the buffer are skipped.
    pub fn merged_since(&self, cursor: u64) -> impl Iterator<Item = &LogLine> {
        let fresh = self.pushed.saturating_sub(cursor);
        let fresh = usize::try_from(fresh).unwrap_or(usize::MAX);
        self.merged
            .iter()
            .skip(self.merged.len().saturating_sub(fresh))
    }

    pub fn clear(&mut self, id: &str) {
        self.per_project.remove(id);
        // merged keeps its lines; it is a rolling view across projects
    }

    pub fn lines(&self, id: &str) -> impl Iterator<Item = &LogLine> {
        self.per_project.get(id).into_iter().flatten()
    }
}

/// Everything the command path owns: settings, the registry, the session log,
/// and the store that persists them.
#[derive(Debug)]
pub struct AppState {
    pub settings: Settings,
    pub registry: ProjectRegistry,
    pub logs: LogStore,
    pub last_event_id: u64,
    store: Option<ProjectStore>,
    /// Registry changes not yet written
    project_changes: PendingChanges,
    /// Snapshot changes not yet written
    snapshot_changes: PendingChanges,
    warnings: Vec<ServdeckError>,
}

impl AppState {
    /// Load the registry from the store. A broken file leaves an empty
    /// registry and a warning.
    pub fn load(settings: Settings, store: ProjectStore) -> Self {
        let (records, warning) = store.load_projects().into_parts();
        let mut state = Self {
            logs: LogStore::new(settings.log_capacity),
            settings,
            registry: ProjectRegistry::from_records(records),
            last_event_id: 0,
            store: Some(store),
            project_changes: PendingChanges::default(),
            snapshot_changes: PendingChanges::default(),
            warnings: Vec::new(),
        };
        state.warn(warning);
        state
    }

    /// A state that never touches the filesystem.
    pub fn in_memory(settings: Settings, registry: ProjectRegistry) -> Self {
        Self {
            logs: LogStore::new(settings.log_capacity),
            settings,
            registry,
            last_event_id: 0,
            store: None,
            project_changes: PendingChanges::default(),
            snapshot_changes: PendingChanges::default(),
            warnings: Vec::new(),
        }
    }

    /// Reconcile the persisted running snapshot against the live process table,
    /// then rewrite the snapshot so it only lists what is really running.
    pub fn restore_running(&mut self, table: &dyn ProcessTable) -> ReconcileReport {
        let snapshot = match &self.store {
            Some(store) => store.load_running_snapshot(),
            None => Recovered::ok(Default::default()),
        };
        let (snapshot, warning) = snapshot.into_parts();
        self.warn(warning);

        for id in snapshot.keys() {
            self.snapshot_changes.touch(id);
        }
        let report = reconcile(&mut self.registry, &snapshot, table);
        for (id, pid) in &report.restored {
            if let Some(project) = self.registry.get(id) {
                let text = format!("[RESTORED] Found running server: {} (PID: {})", project.name, pid);
                self.logs.push(id, LogLine::system(id, SystemTime::now(), text));
            }
        }
        if !snapshot.is_empty() {
            self.persist_snapshot();
        }
        report
    }

    pub fn add_project(&mut self, folder: &Path, name: Option<&str>) -> Result<ProjectId> {
        let folder = std::fs::canonicalize(folder).map_err(|_| ServdeckError::PathNotFound {
            path: folder.to_path_buf(),
        })?;
        if !folder.is_dir() {
            return Err(ServdeckError::PathNotFound { path: folder });
        }

        let id = self
            .registry
            .add(&folder, &self.settings.build_output_dir)
            .id
            .clone();
        if let Some(name) = name {
            self.registry.rename(&id, name)?;
        }
        info!(project = %id, path = %folder.display(), "added project");
        self.project_changes.touch(&id);
        self.persist_projects();
        Ok(id)
    }

    pub fn rename_project(&mut self, id: &str, name: &str) -> Result<()> {
        self.registry.rename(id, name)?;
        self.project_changes.touch(id);
        self.persist_projects();
        Ok(())
    }

    pub fn set_project_path(&mut self, id: &str, path: PathBuf) -> Result<()> {
        self.registry.set_path(id, path)?;
        self.project_changes.touch(id);
        self.persist_projects();
        Ok(())
    }

    /// Drop a project from the registry. Callers stop it first.
    pub fn remove_project(&mut self, id: &str) -> Option<ProjectRecord> {
        let removed = self.registry.remove(id)?;
        self.logs.clear(id);
        info!(project = %id, "removed project");
        self.project_changes.remove(id);
        self.snapshot_changes.remove(id);
        self.persist_projects();
        self.persist_snapshot();
        Some(removed)
    }

    /// Apply a controller event on the command path and write whatever it changed.
    pub fn apply(&mut self, env: &EventEnvelope) -> Effects {
        let effects = reduce(self, env);
        let id = env.event.project_id();
        if effects.save_projects {
            self.project_changes.touch(id);
            self.persist_projects();
        }
        if effects.save_snapshot {
            self.snapshot_changes.touch(id);
            self.persist_snapshot();
        }
        effects
    }

    /// Write this session's registry changes, merged with whatever other
    /// servdeck processes wrote, and pick up their changes in turn.
    pub fn persist_projects(&mut self) {
        let Some(store) = &self.store else { return };
        match store.save_projects_merged(self.registry.records(), &self.project_changes) {
            Ok(saved) => {
                self.registry.absorb(saved);
                self.project_changes.clear();
            }
            Err(e) => self.warn(Some(e)),
        }
    }

    pub fn persist_snapshot(&mut self) {
        let Some(store) = &self.store else { return };
        let result =
            store.save_running_snapshot_merged(&self.registry.running_snapshot(), &self.snapshot_changes);
        match result {
            Ok(()) => self.snapshot_changes.clear(),
            Err(e) => self.warn(Some(e)),
        }
    }

    fn warn(&mut self, warning: Option<ServdeckError>) {
        if let Some(e) = warning {
            self.report_warning(e);
        }
    }

    /// Queue a recoverable problem for the user.
    pub fn report_warning(&mut self, warning: ServdeckError) {
        warn!(error = %warning, "recoverable error");
        self.warnings.push(warning);
    }

    /// Warnings for the user since the last call.
    pub fn take_warnings(&mut self) -> Vec<ServdeckError> {
        std::mem::take(&mut self.warnings)
    }
}
