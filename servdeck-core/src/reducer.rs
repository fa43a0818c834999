use std::time::SystemTime;

use crate::model::{Operation, ProjectId, StopOutcome};
use crate::state::{AppState, LogLine, LogStream};
use crate::url::find_url;

#[derive(Clone, Debug)]
pub enum ControllerEvent {
    /// A launcher process was spawned
    Started {
        id: ProjectId,
        operation: Operation,
        command: String,
        pid: u32,
        started_at: Option<u64>,
    },
    /// One line of process output
    LogLine {
        id: ProjectId,
        operation: Operation,
        stream: LogStream,
        text: String,
    },
    /// A run exited on its own
    Exited {
        id: ProjectId,
        pid: u32,
        code: Option<i32>,
    },
    /// A build or clean ran to completion
    OperationFinished {
        id: ProjectId,
        operation: Operation,
        code: Option<i32>,
    },
    /// A stop request finished (successfully or best-effort)
    Stopped { id: ProjectId, outcome: StopOutcome },
}

impl ControllerEvent {
    pub fn project_id(&self) -> &ProjectId {
        match self {
            ControllerEvent::Started { id, .. }
            | ControllerEvent::LogLine { id, .. }
            | ControllerEvent::Exited { id, .. }
            | ControllerEvent::OperationFinished { id, .. }
            | ControllerEvent::Stopped { id, .. } => id,
        }
    }
}

#[derive(Clone, Debug)]
pub struct EventEnvelope {
    pub id: u64,
    pub at: SystemTime,
    pub event: ControllerEvent,
}

/// Persistence writes an event requires.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Effects {
    pub save_projects: bool,
    pub save_snapshot: bool,
}

impl Effects {
    fn both() -> Self {
        Self {
            save_projects: true,
            save_snapshot: true,
        }
    }
}

pub fn reduce(state: &mut AppState, env: &EventEnvelope) -> Effects {
    state.last_event_id = env.id;
    let mut effects = Effects::default();

    match &env.event {
        ControllerEvent::Started {
            id,
            operation,
            command,
            pid,
            started_at,
        } => {
            let Some(project) = state.registry.get_mut(id) else {
                return effects;
            };
            if *operation == Operation::Run {
                project.mark_running(*pid, *started_at);
                let header = [
                    format!("Starting server for: {}", project.name),
                    format!("Path: {}", project.path.display()),
                ];
                state.logs.clear(id);
                for text in header {
                    state.logs.push(id, LogLine::system(id, env.at, text));
                }
                effects.save_snapshot = true;
            }
            state.logs.push(
                id,
                LogLine::system(id, env.at, format!("Running command: {} (pid {})", command, pid)),
            );
        }

        ControllerEvent::LogLine {
            id,
            operation,
            stream,
            text,
        } => {
            state.logs.push(
                id,
                LogLine {
                    at: env.at,
                    project_id: id.clone(),
                    stream: *stream,
                    text: text.clone(),
                },
            );

            if *operation != Operation::Run || *stream == LogStream::System {
                return effects;
            }
            let Some(url) = find_url(text) else {
                return effects;
            };
            let latched = state
                .registry
                .get_mut(id)
                .is_some_and(|project| project.latch_server_url(url));
            if latched {
                state.logs.push(
                    id,
                    LogLine::system(id, env.at, format!("✓ Server URL detected: {}", url)),
                );
                effects.save_projects = true;
            }
        }

        ControllerEvent::Exited { id, pid, code } => {
            let Some(project) = state.registry.get_mut(id) else {
                return effects;
            };
            // A late exit from an earlier run must not stop the current one.
            if project.process_id() != Some(*pid) {
                return effects;
            }
            project.mark_stopped();
            state.logs.push(
                id,
                LogLine::system(id, env.at, format!("process exited with code: {}", code_label(*code))),
            );
            effects = Effects::both();
        }

        ControllerEvent::OperationFinished {
            id,
            operation,
            code,
        } => {
            let Some(project) = state.registry.get_mut(id) else {
                return effects;
            };
            let succeeded = *code == Some(0);
            match (operation, succeeded) {
                (Operation::Build, true) => project.is_built = true,
                (Operation::Clean, true) => project.is_built = false,
                _ => {}
            }
            let text = if succeeded {
                format!("{} succeeded", operation)
            } else {
                format!("{} failed with exit code: {}", operation, code_label(*code))
            };
            state.logs.push(id, LogLine::system(id, env.at, text));
            effects.save_projects = succeeded;
        }

        ControllerEvent::Stopped { id, outcome } => {
            let Some(project) = state.registry.get_mut(id) else {
                return effects;
            };
            project.mark_stopped();
            state
                .logs
                .push(id, LogLine::system(id, env.at, outcome.describe()));
            effects = Effects::both();
        }
    }

    effects
}

fn code_label(code: Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "none (terminated by signal)".into(),
    }
}
