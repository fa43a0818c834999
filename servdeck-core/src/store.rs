//! Persistence for the project registry and the running snapshot.
//!
//! Both files are pretty JSON, rewritten in full on every save through a
//! temp file in the same directory that is renamed over the target.
//!
//! Several servdeck processes may share one data directory, so the merged
//! saves re-read the file first and only replace the entries the caller
//! changed since its last write.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::config::AppPaths;
use crate::error::{Recovered, Result, ServdeckError};
use crate::model::{ProjectId, ProjectRecord, RunningSnapshot};

/// Ids a process changed since its last successful write.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PendingChanges {
    pub touched: BTreeSet<ProjectId>,
    pub removed: BTreeSet<ProjectId>,
}

impl PendingChanges {
    pub fn touch(&mut self, id: &str) {
        self.removed.remove(id);
        self.touched.insert(id.to_string());
    }

    pub fn remove(&mut self, id: &str) {
        self.touched.remove(id);
        self.removed.insert(id.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.touched.is_empty() && self.removed.is_empty()
    }

    pub fn clear(&mut self) {
        self.touched.clear();
        self.removed.clear();
    }

    fn owns(&self, id: &str) -> bool {
        self.touched.contains(id) || self.removed.contains(id)
    }
}

#[derive(Clone, Debug)]
pub struct ProjectStore {
    projects_path: PathBuf,
    snapshot_path: PathBuf,
}

impl ProjectStore {
    pub fn new(paths: &AppPaths) -> Self {
        Self::with_files(paths.projects_file(), paths.snapshot_file())
    }

    pub fn with_files(projects_path: PathBuf, snapshot_path: PathBuf) -> Self {
        Self {
            projects_path,
            snapshot_path,
        }
    }

    pub fn projects_path(&self) -> &Path {
        &self.projects_path
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    /// Load the registry. Session fields come back reset, because nothing
    /// loaded from disk has been checked against the live process table yet.
    pub fn load_projects(&self) -> Recovered<Vec<ProjectRecord>> {
        let mut loaded = read_json::<Vec<ProjectRecord>>(&self.projects_path);
        for project in &mut loaded.value {
            project.reset_session();
        }
        loaded
    }

    pub fn save_projects(&self, projects: &[ProjectRecord]) -> Result<()> {
        write_json_atomic(&self.projects_path, projects)?;
        debug!(count = projects.len(), path = %self.projects_path.display(), "saved projects");
        Ok(())
    }

    /// Write `local`'s changed records over the current file contents.
    ///
    /// Records on disk that `changes` does not name are kept as written by
    /// whoever wrote them last, and records another process removed stay
    /// removed. Returns the list that was written. An unreadable file is
    /// replaced by `local` as a whole.
    pub fn save_projects_merged(
        &self,
        local: &[ProjectRecord],
        changes: &PendingChanges,
    ) -> Result<Vec<ProjectRecord>> {
        let (on_disk, warning) = read_json::<Vec<ProjectRecord>>(&self.projects_path).into_parts();
        if warning.is_some() {
            self.save_projects(local)?;
            return Ok(local.to_vec());
        }

        let mine = |id: &str| local.iter().find(|p| p.id == id);
        let mut merged = Vec::with_capacity(on_disk.len().max(local.len()));
        for record in on_disk {
            if changes.removed.contains(&record.id) {
                continue;
            }
            match mine(&record.id).filter(|_| changes.touched.contains(&record.id)) {
                Some(changed) => merged.push(changed.clone()),
                None => merged.push(record),
            }
        }
        for record in local {
            if changes.touched.contains(&record.id) && !merged.iter().any(|p| p.id == record.id) {
                merged.push(record.clone());
            }
        }

        self.save_projects(&merged)?;
        Ok(merged)
    }

    pub fn load_running_snapshot(&self) -> Recovered<RunningSnapshot> {
        read_json(&self.snapshot_path)
    }

    pub fn save_running_snapshot(&self, snapshot: &RunningSnapshot) -> Result<()> {
        write_json_atomic(&self.snapshot_path, snapshot)?;
        debug!(count = snapshot.len(), path = %self.snapshot_path.display(), "saved running snapshot");
        Ok(())
    }

    /// Snapshot counterpart of [`ProjectStore::save_projects_merged`]: entries
    /// for ids in `changes` come from `local`, every other entry is kept.
    pub fn save_running_snapshot_merged(
        &self,
        local: &RunningSnapshot,
        changes: &PendingChanges,
    ) -> Result<()> {
        let (mut merged, warning) = self.load_running_snapshot().into_parts();
        if warning.is_some() {
            return self.save_running_snapshot(local);
        }

        merged.retain(|id, _| !changes.owns(id));
        for (id, tracked) in local {
            if changes.touched.contains(id) {
                merged.insert(id.clone(), *tracked);
            }
        }
        self.save_running_snapshot(&merged)
    }
}

fn read_json<T: DeserializeOwned + Default>(path: &Path) -> Recovered<T> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Recovered::ok(T::default()),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable file, using empty default");
            return Recovered::fallback(T::default(), ServdeckError::persistence(path, e));
        }
    };

    match serde_json::from_str(&text) {
        Ok(value) => Recovered::ok(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "malformed file, using empty default");
            Recovered::fallback(T::default(), ServdeckError::persistence(path, e))
        }
    }
}

fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let content =
        serde_json::to_string_pretty(value).map_err(|e| ServdeckError::persistence(path, e))?;

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| ServdeckError::persistence(dir, e))?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| ServdeckError::persistence(dir, e))?;
    tmp.write_all(content.as_bytes())
        .map_err(|e| ServdeckError::persistence(path, e))?;
    tmp.flush().map_err(|e| ServdeckError::persistence(path, e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| ServdeckError::persistence(path, e))?;
    tmp.persist(path)
        .map_err(|e| ServdeckError::persistence(path, e.error))?;

    Ok(())
}
