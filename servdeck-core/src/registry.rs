//! Project registry
//!
//! Ordered collection of project records; insertion order is display order.
//! Ids are fresh v4 UUIDs and are never reused.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, ServdeckError};
use crate::model::{ProjectId, ProjectRecord, RunningSnapshot};
use crate::artifacts::has_build_output;

#[derive(Clone, Debug, Default)]
pub struct ProjectRegistry {
    projects: Vec<ProjectRecord>,
}

impl ProjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from loaded records, dropping later duplicates of an id.
    pub fn from_records(records: Vec<ProjectRecord>) -> Self {
        let mut seen = BTreeSet::new();
        let mut projects = Vec::with_capacity(records.len());
        for record in records {
            if seen.insert(record.id.clone()) {
                projects.push(record);
            } else {
                warn!(project = %record.id, "dropping duplicate project id");
            }
        }
        Self { projects }
    }

    /// Replace the records with a list just written to disk, in its order.
    /// Known projects keep their run state; new ones arrive stopped.
    pub fn absorb(&mut self, saved: Vec<ProjectRecord>) {
        let mut previous = std::mem::take(&mut self.projects);
        for mut record in saved {
            match previous.iter().position(|p| p.id == record.id) {
                Some(index) => {
                    let mut mine = previous.swap_remove(index);
                    mine.adopt_saved(&record);
                    self.projects.push(mine);
                }
                None => {
                    record.reset_session();
                    self.projects.push(record);
                }
            }
        }
        for dropped in previous {
            debug!(project = %dropped.id, "project removed by another process");
        }
    }

    /// Register a folder as a new project. The name defaults to the folder's
    /// base name and `is_built` comes from the build-output check.
    pub fn add(&mut self, folder: &Path, build_output_dir: &str) -> &ProjectRecord {
        let id = self.fresh_id();
        let name = folder
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| folder.display().to_string());
        let is_built = has_build_output(folder, build_output_dir);

        let index = self.projects.len();
        self.projects
            .push(ProjectRecord::new(id, name, folder.to_path_buf(), is_built));
        &self.projects[index]
    }

    fn fresh_id(&self) -> ProjectId {
        loop {
            let id = Uuid::new_v4().to_string();
            if self.get(&id).is_none() {
                return id;
            }
        }
    }

    pub fn rename(&mut self, id: &str, name: &str) -> Result<()> {
        self.require_mut(id)?.name = name.to_string();
        Ok(())
    }

    pub fn set_path(&mut self, id: &str, path: PathBuf) -> Result<()> {
        self.require_mut(id)?.path = path;
        Ok(())
    }

    /// Remove a project. Unknown ids are a no-op.
    pub fn remove(&mut self, id: &str) -> Option<ProjectRecord> {
        let index = self.projects.iter().position(|p| p.id == id)?;
        Some(self.projects.remove(index))
    }

    pub fn get(&self, id: &str) -> Option<&ProjectRecord> {
        self.projects.iter().find(|p| p.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut ProjectRecord> {
        self.projects.iter_mut().find(|p| p.id == id)
    }

    pub fn require(&self, id: &str) -> Result<&ProjectRecord> {
        self.get(id)
            .ok_or_else(|| ServdeckError::ProjectNotFound(id.to_string()))
    }

    pub fn require_mut(&mut self, id: &str) -> Result<&mut ProjectRecord> {
        self.get_mut(id)
            .ok_or_else(|| ServdeckError::ProjectNotFound(id.to_string()))
    }

    /// Find a project by exact id, exact name, or unique id prefix.
    pub fn resolve(&self, query: &str) -> Result<&ProjectRecord> {
        if let Some(project) = self.get(query) {
            return Ok(project);
        }

        let by_name: Vec<_> = self.projects.iter().filter(|p| p.name == query).collect();
        if let [project] = by_name.as_slice() {
            return Ok(*project);
        }

        let by_prefix: Vec<_> = self
            .projects
            .iter()
            .filter(|p| !query.is_empty() && p.id.starts_with(query))
            .collect();
        match by_prefix.as_slice() {
            [project] => Ok(*project),
            _ => Err(ServdeckError::ProjectNotFound(query.to_string())),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProjectRecord> {
        self.projects.iter()
    }

    pub fn records(&self) -> &[ProjectRecord] {
        &self.projects
    }

    pub fn len(&self) -> usize {
        self.projects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }

    pub fn running(&self) -> impl Iterator<Item = &ProjectRecord> {
        self.projects.iter().filter(|p| p.is_running())
    }

    /// The snapshot to persist: every running project and its tracked pid.
    pub fn running_snapshot(&self) -> RunningSnapshot {
        self.running()
            .filter_map(|p| p.tracked_process().map(|t| (p.id.clone(), t)))
            .collect()
    }
}
