//! The command path: one owner for the registry, the controller and the
//! event stream. Every registry change happens here, one event at a time.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::info;

use servdeck_core::Result;
use servdeck_core::config::{AppPaths, Settings};
use servdeck_core::model::{
    Operation, ProjectId, ProjectRecord, ShutdownChoice, ShutdownOutcome, StopOutcome,
};
use servdeck_core::reconcile::{ProcessTable, ReconcileReport};
use servdeck_core::reducer::EventEnvelope;
use servdeck_core::state::AppState;
use servdeck_core::store::ProjectStore;

use crate::controller::ProcessController;

/// How often owned children are checked for exit
const REAP_INTERVAL: Duration = Duration::from_millis(200);

pub struct App {
    pub state: AppState,
    controller: ProcessController,
    events: mpsc::UnboundedReceiver<EventEnvelope>,
    /// Applied on the command path but not yet handed to the caller
    pending: VecDeque<EventEnvelope>,
    reap_interval: Interval,
}

impl App {
    /// Load settings and the registry from `paths`, then reconcile servers
    /// left running by a previous session.
    pub fn open(paths: &AppPaths, table: Arc<dyn ProcessTable>) -> (Self, ReconcileReport) {
        let (settings, warning) = Settings::load(&paths.settings_file()).into_parts();
        let mut state = AppState::load(settings, ProjectStore::new(paths));
        if let Some(warning) = warning {
            state.report_warning(warning);
        }
        let report = state.restore_running(table.as_ref());
        info!(
            root = %paths.root().display(),
            projects = state.registry.len(),
            restored = report.restored.len(),
            "opened"
        );
        (Self::with_state(state, table), report)
    }

    pub fn with_state(state: AppState, table: Arc<dyn ProcessTable>) -> Self {
        let (event_tx, events) = mpsc::unbounded_channel();
        let controller = ProcessController::new(state.settings.launcher.clone(), table, event_tx);
        let mut reap_interval = tokio::time::interval(REAP_INTERVAL);
        reap_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self {
            state,
            controller,
            events,
            pending: VecDeque::new(),
            reap_interval,
        }
    }

    pub fn resolve(&self, query: &str) -> Result<ProjectId> {
        Ok(self.state.registry.resolve(query)?.id.clone())
    }

    fn project(&self, id: &str) -> Result<ProjectRecord> {
        self.state.registry.require(id).cloned()
    }

    /// The operation occupying a project right now, counting restored servers.
    pub fn activity(&self, id: &str) -> Option<Operation> {
        self.controller.busy(id).or_else(|| {
            self.state
                .registry
                .get(id)
                .filter(|p| p.is_running())
                .map(|_| Operation::Run)
        })
    }

    pub fn add(&mut self, folder: &Path, name: Option<&str>) -> Result<ProjectId> {
        self.state.add_project(folder, name)
    }

    pub fn rename(&mut self, query: &str, name: &str) -> Result<ProjectId> {
        let id = self.resolve(query)?;
        self.state.rename_project(&id, name)?;
        Ok(id)
    }

    pub fn set_path(&mut self, query: &str, path: PathBuf) -> Result<ProjectId> {
        let id = self.resolve(query)?;
        self.state.set_project_path(&id, path)?;
        Ok(id)
    }

    /// Remove a project, stopping anything it has running first.
    pub async fn remove(&mut self, query: &str) -> Result<Option<ProjectRecord>> {
        let id = self.resolve(query)?;
        if self.activity(&id).is_some() {
            self.stop(&id).await?;
        }
        Ok(self.state.remove_project(&id))
    }

    pub fn build(&mut self, query: &str) -> Result<ProjectId> {
        self.launch(query, Operation::Build)
    }

    pub fn clean(&mut self, query: &str) -> Result<ProjectId> {
        self.launch(query, Operation::Clean)
    }

    /// Launch the project's server. When the start fails the record stays
    /// stopped.
    pub fn run(&mut self, query: &str) -> Result<ProjectId> {
        self.launch(query, Operation::Run)
    }

    /// Queued events are applied first so the checks see a current record,
    /// and again afterwards even when the controller refused.
    fn launch(&mut self, query: &str, operation: Operation) -> Result<ProjectId> {
        let id = self.resolve(query)?;
        self.pump();
        let project = self.project(&id)?;
        let started = match operation {
            Operation::Build => self.controller.build(&project),
            Operation::Clean => self.controller.clean(&project),
            Operation::Run => self
                .controller
                .start(&project, self.state.settings.require_build_before_run),
        };
        self.pump();
        started.map(|_| id)
    }

    pub async fn stop(&mut self, query: &str) -> Result<StopOutcome> {
        let id = self.resolve(query)?;
        let timeout = self.state.settings.stop_timeout();
        Ok(self.stop_with(&id, timeout).await)
    }

    async fn stop_with(&mut self, id: &str, timeout: Duration) -> StopOutcome {
        let outcome = match self.project(id) {
            Ok(project) => self.controller.stop(&project, timeout).await,
            Err(_) => StopOutcome::NotRunning,
        };
        self.pump();
        outcome
    }

    /// The detected server URL, `None` until the server has printed one.
    pub fn server_url(&self, query: &str) -> Result<Option<String>> {
        let id = self.resolve(query)?;
        Ok(self
            .state
            .registry
            .require(&id)?
            .server_url()
            .map(str::to_string))
    }

    /// Apply everything already queued without waiting.
    pub fn pump(&mut self) {
        while let Ok(env) = self.events.try_recv() {
            self.state.apply(&env);
            self.pending.push_back(env);
        }
    }

    /// Wait for the next event, reaping exited children and restored servers
    /// meanwhile. The event has already been applied to `state` when it is
    /// returned.
    pub async fn next_event(&mut self) -> EventEnvelope {
        if let Some(env) = self.pending.pop_front() {
            return env;
        }
        loop {
            tokio::select! {
                _ = self.reap_interval.tick() => {
                    self.controller.reap();
                    if self.controller.reap_detached(self.state.registry.iter()) {
                        self.pump();
                        if let Some(env) = self.pending.pop_front() {
                            return env;
                        }
                    }
                }
                Some(env) = self.events.recv() => {
                    self.state.apply(&env);
                    return env;
                }
            }
        }
    }

    pub fn running_count(&self) -> usize {
        self.state.registry.running().count()
    }

    /// Close the session. With nothing running this always exits.
    pub async fn shutdown(&mut self, choice: ShutdownChoice) -> ShutdownOutcome {
        if self.running_count() == 0 {
            return ShutdownOutcome::Exit;
        }
        match choice {
            ShutdownChoice::Cancel => ShutdownOutcome::Cancelled,
            ShutdownChoice::LeaveRunning => {
                self.pump();
                self.state.persist_snapshot();
                info!(running = self.running_count(), "leaving servers running");
                ShutdownOutcome::Exit
            }
            ShutdownChoice::StopAll => {
                let timeout = self.state.settings.shutdown_stop_timeout();
                let mut ids: Vec<ProjectId> =
                    self.state.registry.running().map(|p| p.id.clone()).collect();
                for id in self.controller.live_ids() {
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                }
                for id in ids {
                    let outcome = self.stop_with(&id, timeout).await;
                    info!(project = %id, ?outcome, "stopped at exit");
                }
                self.state.persist_snapshot();
                ShutdownOutcome::Exit
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process_table::SysinfoProcessTable;
    use servdeck_core::ServdeckError;
    use servdeck_core::config::LauncherConfig;
    use servdeck_core::model::ProjectStatus;
    use servdeck_core::reducer::ControllerEvent;
    use std::time::Instant;
    use tempfile::TempDir;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    fn table() -> Arc<dyn ProcessTable> {
        Arc::new(SysinfoProcessTable::new())
    }

    fn settings(run: &str, build: &str, require_build: bool) -> Settings {
        Settings {
            launcher: LauncherConfig {
                run: sh(run),
                build: sh(build),
                clean: sh("rm -rf bin"),
            },
            require_build_before_run: require_build,
            stop_timeout_ms: 3000,
            shutdown_stop_timeout_ms: 3000,
            ..Settings::default()
        }
    }

    fn open_with_project(dir: &TempDir, settings: Settings) -> (App, ProjectId, AppPaths) {
        let paths = AppPaths::with_root(dir.path().join("data"));
        let folder = dir.path().join("WeatherApi");
        std::fs::create_dir_all(&folder).unwrap();

        let state = AppState::load(settings, ProjectStore::new(&paths));
        let mut app = App::with_state(state, table());
        let id = app.add(&folder, None).unwrap();
        (app, id, paths)
    }

    /// Process events until a build or clean for `id` finishes; returns its
    /// exit code.
    async fn wait_for_operation(app: &mut App, id: &str) -> Option<i32> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let env = tokio::time::timeout_at(deadline, app.next_event())
                .await
                .expect("operation finished within 10s");
            if let ControllerEvent::OperationFinished { id: done, code, .. } = env.event {
                if done == id {
                    return code;
                }
            }
        }
    }

    async fn wait_until(app: &mut App, what: &str, done: impl Fn(&App) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !done(&*app) {
            match tokio::time::timeout_at(deadline, app.next_event()).await {
                Ok(_) => {}
                Err(_) => panic!("timed out waiting for {}", what),
            }
        }
    }

    #[tokio::test]
    async fn test_run_before_build_is_refused() {
        let dir = TempDir::new().unwrap();
        let (mut app, id, _) = open_with_project(&dir, settings("sleep 30", "true", true));

        let err = app.run(&id).unwrap_err();
        assert!(matches!(err, ServdeckError::BuildRequired { .. }));
        let project = app.state.registry.get(&id).unwrap();
        assert_eq!(project.status(), ProjectStatus::Stopped);
        assert!(project.process_id().is_none());
    }

    #[tokio::test]
    async fn test_build_then_run() {
        let dir = TempDir::new().unwrap();
        let build = "mkdir -p bin && echo built > bin/app.dll";
        let (mut app, id, paths) = open_with_project(&dir, settings("sleep 30", build, true));
        assert!(!app.state.registry.get(&id).unwrap().is_built);

        app.build(&id).unwrap();
        assert_eq!(wait_for_operation(&mut app, &id).await, Some(0));
        assert!(app.state.registry.get(&id).unwrap().is_built);

        app.run(&id).unwrap();
        let project = app.state.registry.get(&id).unwrap();
        assert!(project.is_running());
        let pid = project.process_id().unwrap();
        assert!(table().lookup(pid).unwrap().is_some());

        let on_disk = ProjectStore::new(&paths).load_running_snapshot().value;
        assert_eq!(on_disk[&id].pid, pid);

        let outcome = app.stop(&id).await.unwrap();
        assert_eq!(outcome, StopOutcome::Terminated);
        assert!(!app.state.registry.get(&id).unwrap().is_running());
        assert!(ProjectStore::new(&paths).load_running_snapshot().value.is_empty());
    }

    #[tokio::test]
    async fn test_first_url_wins() {
        let dir = TempDir::new().unwrap();
        let run = "echo 'Now listening on: http://localhost:5123'; \
                   echo 'also https://localhost:7001'; echo ready; sleep 30";
        let (mut app, id, paths) = open_with_project(&dir, settings(run, "true", false));
        assert!(app.server_url(&id).unwrap().is_none());

        app.run(&id).unwrap();
        let watched = id.clone();
        wait_until(&mut app, "ready line", move |app| {
            app.state.logs.lines(&watched).any(|l| l.text == "ready")
        })
        .await;

        assert_eq!(
            app.server_url(&id).unwrap().as_deref(),
            Some("http://localhost:5123")
        );
        let saved = ProjectStore::new(&paths).load_projects();
        assert!(saved.warning.is_none());

        app.stop(&id).await.unwrap();
        assert!(app.server_url(&id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stop_when_not_running_is_noop() {
        let dir = TempDir::new().unwrap();
        let (mut app, id, _) = open_with_project(&dir, settings("sleep 30", "true", false));

        let outcome = app.stop(&id).await.unwrap();
        assert_eq!(outcome, StopOutcome::NotRunning);
        assert_eq!(
            app.state.registry.get(&id).unwrap().status(),
            ProjectStatus::Stopped
        );
    }

    #[tokio::test]
    async fn test_concurrent_build_is_refused() {
        let dir = TempDir::new().unwrap();
        let build = "sleep 1 && mkdir -p bin && touch bin/x";
        let (mut app, id, _) = open_with_project(&dir, settings("sleep 30", build, true));

        app.build(&id).unwrap();
        assert!(matches!(
            app.build(&id),
            Err(ServdeckError::ConcurrentOperation {
                running: Operation::Build,
                ..
            })
        ));
        assert!(matches!(
            app.run(&id),
            Err(ServdeckError::ConcurrentOperation { .. })
        ));
        assert_eq!(wait_for_operation(&mut app, &id).await, Some(0));
        assert!(app.state.registry.get(&id).unwrap().is_built);
    }

    #[tokio::test]
    async fn test_server_exit_marks_stopped() {
        let dir = TempDir::new().unwrap();
        let (mut app, id, paths) =
            open_with_project(&dir, settings("echo bye; exit 2", "true", false));

        app.run(&id).unwrap();
        let watched = id.clone();
        wait_until(&mut app, "exit", move |app| {
            !app.state.registry.get(&watched).unwrap().is_running()
        })
        .await;

        let texts: Vec<_> = app.state.logs.lines(&id).map(|l| l.text.clone()).collect();
        assert!(texts.contains(&"bye".to_string()));
        assert!(texts.contains(&"process exited with code: 2".to_string()));
        assert!(ProjectStore::new(&paths).load_running_snapshot().value.is_empty());
    }

    #[tokio::test]
    async fn test_remove_stops_running_server() {
        let dir = TempDir::new().unwrap();
        let (mut app, id, paths) = open_with_project(&dir, settings("sleep 30", "true", false));

        app.run(&id).unwrap();
        let pid = app.state.registry.get(&id).unwrap().process_id().unwrap();

        let removed = app.remove(&id).await.unwrap().unwrap();
        assert_eq!(removed.id, id);
        assert!(app.state.registry.is_empty());
        assert!(table().lookup(pid).unwrap().is_none());
        assert!(ProjectStore::new(&paths).load_projects().value.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_cancel_keeps_running() {
        let dir = TempDir::new().unwrap();
        let (mut app, id, paths) = open_with_project(&dir, settings("sleep 30", "true", false));
        assert_eq!(app.shutdown(ShutdownChoice::Cancel).await, ShutdownOutcome::Exit);

        app.run(&id).unwrap();
        assert_eq!(
            app.shutdown(ShutdownChoice::Cancel).await,
            ShutdownOutcome::Cancelled
        );
        assert!(app.state.registry.get(&id).unwrap().is_running());

        assert_eq!(
            app.shutdown(ShutdownChoice::StopAll).await,
            ShutdownOutcome::Exit
        );
        assert_eq!(app.running_count(), 0);
        assert!(ProjectStore::new(&paths).load_running_snapshot().value.is_empty());
    }

    #[tokio::test]
    async fn test_left_running_server_is_restored_and_stoppable() {
        let dir = TempDir::new().unwrap();
        let (mut app, id, paths) = open_with_project(&dir, settings("sleep 30", "true", false));

        app.run(&id).unwrap();
        let pid = app.state.registry.get(&id).unwrap().process_id().unwrap();
        assert_eq!(
            app.shutdown(ShutdownChoice::LeaveRunning).await,
            ShutdownOutcome::Exit
        );
        drop(app);

        let (mut app, report) = App::open(&paths, table());
        assert_eq!(report.restored, vec![(id.clone(), pid)]);
        let project = app.state.registry.get(&id).unwrap();
        assert!(project.is_running());
        assert!(
            app.state
                .logs
                .lines(&id)
                .any(|l| l.text
                    == format!("[RESTORED] Found running server: WeatherApi (PID: {})", pid))
        );
        assert!(matches!(
            app.run(&id),
            Err(ServdeckError::ConcurrentOperation { .. })
        ));

        let outcome = app.stop(&id).await.unwrap();
        assert_eq!(outcome, StopOutcome::Terminated);
        assert!(!app.state.registry.get(&id).unwrap().is_running());
        assert!(table().lookup(pid).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dead_snapshot_entry_is_dropped_on_open() {
        let dir = TempDir::new().unwrap();
        let (app, id, paths) = open_with_project(&dir, settings("sleep 30", "true", false));
        drop(app);

        std::fs::write(paths.snapshot_file(), format!(r#"{{"{}": 4000000}}"#, id)).unwrap();
        let (app, report) = App::open(&paths, table());

        assert_eq!(report.stopped, vec![id.clone()]);
        assert!(!app.state.registry.get(&id).unwrap().is_running());
        assert!(ProjectStore::new(&paths).load_running_snapshot().value.is_empty());
    }

    /// Leave a server running, reopen, then kill it behind servdeck's back.
    async fn restore_then_kill(dir: &TempDir) -> (App, ProjectId, u32) {
        let (mut app, id, paths) = open_with_project(dir, settings("sleep 30", "true", false));
        app.run(&id).unwrap();
        let pid = app.state.registry.get(&id).unwrap().process_id().unwrap();
        app.shutdown(ShutdownChoice::LeaveRunning).await;
        drop(app);

        let (app, report) = App::open(&paths, table());
        assert_eq!(report.restored, vec![(id.clone(), pid)]);
        crate::tree::force_exit(pid).await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while table().lookup(pid).unwrap().is_some() {
            assert!(Instant::now() < deadline, "pid {} still alive", pid);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        (app, id, pid)
    }

    #[tokio::test]
    async fn test_dead_restored_server_can_run_again() {
        let dir = TempDir::new().unwrap();
        let (mut app, id, old_pid) = restore_then_kill(&dir).await;

        app.run(&id).unwrap();
        let project = app.state.registry.get(&id).unwrap();
        assert!(project.is_running());
        assert_ne!(project.process_id(), Some(old_pid));

        assert_eq!(app.stop(&id).await.unwrap(), StopOutcome::Terminated);
    }

    #[tokio::test]
    async fn test_restored_server_exit_is_noticed() {
        let dir = TempDir::new().unwrap();
        let (mut app, id, _) = restore_then_kill(&dir).await;

        wait_until(&mut app, "restored server marked stopped", |app| {
            !app.state.registry.get(&id).unwrap().is_running()
        })
        .await;
        assert_eq!(app.running_count(), 0);
        assert_eq!(
            app.state.logs.lines(&id).last().unwrap().text,
            StopOutcome::AlreadyExited.describe()
        );
    }
}
