//! Error types shared by every servdeck component.

use std::path::PathBuf;

use crate::model::{Operation, ProjectId};

pub type Result<T> = std::result::Result<T, ServdeckError>;

#[derive(Debug, thiserror::Error)]
pub enum ServdeckError {
    /// The project's working directory is missing.
    #[error("project path does not exist: {}", path.display())]
    PathNotFound { path: PathBuf },

    /// The launcher executable could not be started.
    #[error("failed to spawn `{program}` for {project}: {source}")]
    Spawn {
        project: ProjectId,
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The pid no longer resolves to a live process.
    #[error("no live process with pid {pid}")]
    ProcessLookup { pid: u32 },

    #[error("{}: {details}", path.display())]
    Persistence { path: PathBuf, details: String },

    /// A build, clean or run is already outstanding for the project.
    #[error("{id} is busy: {running} already in progress")]
    ConcurrentOperation { id: ProjectId, running: Operation },

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("project {id} has no build output yet, build it before running")]
    BuildRequired { id: ProjectId },

    #[error("no launcher command configured for {operation}")]
    EmptyCommand { operation: Operation },

    #[error("settings {}: {details}", path.display())]
    Config { path: PathBuf, details: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ServdeckError {
    pub(crate) fn persistence(path: impl Into<PathBuf>, details: impl ToString) -> Self {
        ServdeckError::Persistence {
            path: path.into(),
            details: details.to_string(),
        }
    }
}

/// A value loaded with a fall-back default, plus the error that forced the
/// fall-back (if any). Loading never fails the application start.
#[derive(Debug)]
pub struct Recovered<T> {
    pub value: T,
    pub warning: Option<ServdeckError>,
}

impl<T> Recovered<T> {
    pub fn ok(value: T) -> Self {
        Self {
            value,
            warning: None,
        }
    }

    pub fn fallback(value: T, warning: ServdeckError) -> Self {
        Self {
            value,
            warning: Some(warning),
        }
    }

    pub fn into_parts(self) -> (T, Option<ServdeckError>) {
        (self.value, self.warning)
    }
}
