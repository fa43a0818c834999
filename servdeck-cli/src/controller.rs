//! Process controller
//!
//! Spawns launcher processes for projects, streams their output as events, and
//! stops their process trees. At most one process runs per project: a build,
//! clean or run holds the slot until its exit event is queued or it is
//! stopped.
//!
//! The controller never touches the registry. Everything it observes goes out
//! as an [`EventEnvelope`] and is applied on the command path.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use servdeck_core::config::LauncherConfig;
use servdeck_core::model::{Operation, ProjectId, ProjectRecord, StopOutcome, TrackedProcess};
use servdeck_core::reconcile::{Liveness, ProcessTable, check_liveness};
use servdeck_core::reducer::{ControllerEvent, EventEnvelope};
use servdeck_core::state::LogStream;
use servdeck_core::{Result, ServdeckError};

use crate::tree;

/// How long an exit waits for its output readers to hit EOF
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
/// How long a stopped process's readers may flush what is left in the pipes
const STOP_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);
/// Wait after SIGKILL before giving up on a tree
const KILL_GRACE: Duration = Duration::from_millis(1500);
const PID_POLL_INTERVAL: Duration = Duration::from_millis(100);

struct ProcessHandle {
    operation: Operation,
    child: Child,
    pid: u32,
    readers: Vec<JoinHandle<()>>,
    exit: Option<Exit>,
}

/// An exit seen by `reap`, held back until the output readers finish.
struct Exit {
    code: Option<i32>,
    drain_deadline: Instant,
}

impl ProcessHandle {
    /// Give the readers a moment to pass on buffered output, then cut them
    /// off so nothing from this process is logged after it was stopped.
    async fn close_output(&mut self) {
        let drain = async {
            for reader in &mut self.readers {
                let _ = reader.await;
            }
        };
        if tokio::time::timeout(STOP_DRAIN_TIMEOUT, drain).await.is_err() {
            debug!(pid = self.pid, "output still open after stop, dropping the rest");
        }
        for reader in &self.readers {
            reader.abort();
        }
    }
}

pub struct ProcessController {
    launcher: LauncherConfig,
    processes: BTreeMap<ProjectId, ProcessHandle>,
    table: Arc<dyn ProcessTable>,
    event_tx: mpsc::UnboundedSender<EventEnvelope>,
    next_id: Arc<AtomicU64>,
}

impl ProcessController {
    pub fn new(
        launcher: LauncherConfig,
        table: Arc<dyn ProcessTable>,
        event_tx: mpsc::UnboundedSender<EventEnvelope>,
    ) -> Self {
        Self {
            launcher,
            processes: BTreeMap::new(),
            table,
            event_tx,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// The operation currently holding the project's slot, if any.
    pub fn busy(&self, id: &str) -> Option<Operation> {
        self.processes.get(id).map(|h| h.operation)
    }

    /// Projects with a live child owned by this controller.
    pub fn live_ids(&self) -> Vec<ProjectId> {
        self.processes.keys().cloned().collect()
    }

    /// Launch the project's server.
    pub fn start(&mut self, project: &ProjectRecord, require_build: bool) -> Result<u32> {
        self.ensure_idle(project)?;
        ensure_dir(project)?;
        if require_build && !project.is_built {
            return Err(ServdeckError::BuildRequired {
                id: project.id.clone(),
            });
        }
        self.spawn(project, Operation::Run)
    }

    /// Start a build. Completion arrives as `OperationFinished`.
    pub fn build(&mut self, project: &ProjectRecord) -> Result<u32> {
        self.ensure_idle(project)?;
        ensure_dir(project)?;
        self.spawn(project, Operation::Build)
    }

    /// Start a clean. Completion arrives as `OperationFinished`.
    pub fn clean(&mut self, project: &ProjectRecord) -> Result<u32> {
        self.ensure_idle(project)?;
        ensure_dir(project)?;
        self.spawn(project, Operation::Clean)
    }

    fn ensure_idle(&self, project: &ProjectRecord) -> Result<()> {
        if let Some(running) = self.busy(&project.id) {
            return Err(ServdeckError::ConcurrentOperation {
                id: project.id.clone(),
                running,
            });
        }
        // restored from a previous session: not our child, so ask the OS
        if project.is_running() && self.settle_detached(project).is_none() {
            return Err(ServdeckError::ConcurrentOperation {
                id: project.id.clone(),
                running: Operation::Run,
            });
        }
        Ok(())
    }

    /// Check a running project this controller holds no child for. When its
    /// process is gone, emits `Stopped` and returns the outcome.
    fn settle_detached(&self, project: &ProjectRecord) -> Option<StopOutcome> {
        let outcome = match project.tracked_process() {
            None => StopOutcome::AlreadyExited,
            Some(tracked) => match check_liveness(self.table.as_ref(), &tracked) {
                Liveness::Alive(_) => return None,
                Liveness::Gone => StopOutcome::AlreadyExited,
                Liveness::Reused { .. } => StopOutcome::PidReused,
            },
        };
        info!(project = %project.id, ?outcome, "restored process is gone");
        self.emit(ControllerEvent::Stopped {
            id: project.id.clone(),
            outcome: outcome.clone(),
        });
        Some(outcome)
    }

    /// Poll running projects this controller did not spawn and converge the
    /// ones whose process has exited. Returns whether any were found.
    pub fn reap_detached<'a>(&self, projects: impl IntoIterator<Item = &'a ProjectRecord>) -> bool {
        let mut settled = false;
        for project in projects {
            if project.is_running() && !self.processes.contains_key(&project.id) {
                settled |= self.settle_detached(project).is_some();
            }
        }
        settled
    }

    fn spawn(&mut self, project: &ProjectRecord, operation: Operation) -> Result<u32> {
        let argv = self.launcher.argv(operation);
        let Some((program, args)) = argv.split_first() else {
            return Err(ServdeckError::EmptyCommand { operation });
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&project.path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        tree::detach(&mut cmd);

        let spawn_error = |source| ServdeckError::Spawn {
            project: project.id.clone(),
            program: program.clone(),
            source,
        };
        let mut child = cmd.spawn().map_err(spawn_error)?;
        let Some(pid) = child.id() else {
            return Err(spawn_error(std::io::Error::other(
                "process exited before it could be tracked",
            )));
        };
        let started_at = match self.table.lookup(pid) {
            Ok(info) => info.map(|i| i.started_at),
            Err(e) => {
                debug!(pid, error = %e, "could not read process start time");
                None
            }
        };

        // Started goes out before any output so the record is running first.
        self.emit(ControllerEvent::Started {
            id: project.id.clone(),
            operation,
            command: argv.join(" "),
            pid,
            started_at,
        });

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(self.spawn_reader(&project.id, operation, LogStream::Stdout, stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(self.spawn_reader(&project.id, operation, LogStream::Stderr, stderr));
        }

        info!(project = %project.id, %operation, pid, "spawned");
        self.processes.insert(
            project.id.clone(),
            ProcessHandle {
                operation,
                child,
                pid,
                readers,
                exit: None,
            },
        );
        Ok(pid)
    }

    fn spawn_reader<R>(
        &self,
        id: &str,
        operation: Operation,
        stream: LogStream,
        pipe: R,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let tx = self.event_tx.clone();
        let next_id = self.next_id.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            let mut reader = BufReader::new(pipe);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let text = String::from_utf8_lossy(&buf);
                        let text = text.trim_end_matches(['\r', '\n']);
                        if text.is_empty() {
                            continue;
                        }
                        let env = EventEnvelope {
                            id: next_id.fetch_add(1, Ordering::SeqCst),
                            at: SystemTime::now(),
                            event: ControllerEvent::LogLine {
                                id: id.clone(),
                                operation,
                                stream,
                                text: text.to_string(),
                            },
                        };
                        if tx.send(env).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(project = %id, ?stream, error = %e, "output reader stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Check owned children for exits. Each exit is reported once its output
    /// has been drained, so the last lines land before the exit event, and
    /// the project keeps its slot until that event is queued.
    pub fn reap(&mut self) {
        let now = Instant::now();
        let mut finished = Vec::new();
        for (id, handle) in &mut self.processes {
            if handle.exit.is_none() {
                let code = match handle.child.try_wait() {
                    Ok(Some(status)) => status.code(),
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(project = %id, pid = handle.pid, error = %e, "wait failed, treating as exited");
                        None
                    }
                };
                handle.exit = Some(Exit {
                    code,
                    drain_deadline: now + READER_DRAIN_TIMEOUT,
                });
            }
            let Some(exit) = &handle.exit else { continue };
            let drained = handle.readers.iter().all(JoinHandle::is_finished);
            if drained || now >= exit.drain_deadline {
                if !drained {
                    debug!(project = %id, pid = handle.pid, "output still open after exit, reporting anyway");
                }
                finished.push(id.clone());
            }
        }

        for id in finished {
            let Some(handle) = self.processes.remove(&id) else {
                continue;
            };
            for reader in &handle.readers {
                reader.abort();
            }
            let code = handle.exit.and_then(|exit| exit.code);
            info!(project = %id, operation = %handle.operation, pid = handle.pid, ?code, "process exited");
            self.emit(match handle.operation {
                Operation::Run => ControllerEvent::Exited {
                    id,
                    pid: handle.pid,
                    code,
                },
                operation => ControllerEvent::OperationFinished {
                    id,
                    operation,
                    code,
                },
            });
        }
    }

    /// Stop whatever the project has running and wait up to `timeout` for the
    /// tree to exit before killing it. Never fails: the outcome says how far
    /// it got, and the record is stopped either way.
    pub async fn stop(&mut self, project: &ProjectRecord, timeout: Duration) -> StopOutcome {
        let outcome = if let Some(mut handle) = self.processes.remove(&project.id) {
            info!(project = %project.id, operation = %handle.operation, pid = handle.pid, "stopping");
            let outcome = terminate_child(&mut handle, timeout).await;
            handle.close_output().await;
            outcome
        } else if let Some(tracked) = project.tracked_process() {
            info!(project = %project.id, pid = tracked.pid, "stopping restored process");
            self.stop_by_pid(tracked, timeout).await
        } else {
            StopOutcome::NotRunning
        };

        if outcome != StopOutcome::NotRunning {
            self.emit(ControllerEvent::Stopped {
                id: project.id.clone(),
                outcome: outcome.clone(),
            });
        }
        outcome
    }

    /// Stop a process we did not spawn, known only by pid.
    async fn stop_by_pid(&self, tracked: TrackedProcess, timeout: Duration) -> StopOutcome {
        match check_liveness(self.table.as_ref(), &tracked) {
            Liveness::Gone => return StopOutcome::AlreadyExited,
            Liveness::Reused { expected, actual } => {
                warn!(pid = tracked.pid, expected, actual, "pid was reused, not signalling");
                return StopOutcome::PidReused;
            }
            Liveness::Alive(_) => {}
        }
        if tracked.started_at.is_none() {
            warn!(pid = tracked.pid, "no start time recorded; pid reuse cannot be ruled out");
        }

        if let Err(e) = tree::request_exit(tracked.pid).await {
            return StopOutcome::Failed {
                details: e.to_string(),
            };
        }
        if self.wait_for_exit(&tracked, timeout).await {
            return StopOutcome::Terminated;
        }

        warn!(pid = tracked.pid, "did not exit in time, killing");
        if let Err(e) = tree::force_exit(tracked.pid).await {
            return StopOutcome::Failed {
                details: e.to_string(),
            };
        }
        if self.wait_for_exit(&tracked, KILL_GRACE).await {
            StopOutcome::TimedOut
        } else {
            StopOutcome::Failed {
                details: format!("pid {} still alive after kill", tracked.pid),
            }
        }
    }

    async fn wait_for_exit(&self, tracked: &TrackedProcess, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !matches!(check_liveness(self.table.as_ref(), tracked), Liveness::Alive(_)) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(PID_POLL_INTERVAL).await;
        }
    }

    fn emit(&self, event: ControllerEvent) {
        let _ = self.event_tx.send(EventEnvelope {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            at: SystemTime::now(),
            event,
        });
    }
}

fn ensure_dir(project: &ProjectRecord) -> Result<()> {
    if project.path.is_dir() {
        Ok(())
    } else {
        Err(ServdeckError::PathNotFound {
            path: project.path.clone(),
        })
    }
}

async fn terminate_child(handle: &mut ProcessHandle, timeout: Duration) -> StopOutcome {
    let pid = handle.pid;
    if let Ok(Some(_)) = handle.child.try_wait() {
        sweep(pid).await;
        return StopOutcome::AlreadyExited;
    }

    if let Err(e) = tree::request_exit(pid).await {
        warn!(pid, error = %e, "could not signal process tree, killing leader");
        let _ = handle.child.start_kill();
    }

    if tokio::time::timeout(timeout, handle.child.wait()).await.is_ok() {
        sweep(pid).await;
        return StopOutcome::Terminated;
    }

    warn!(pid, "did not exit in time, killing");
    if let Err(e) = tree::force_exit(pid).await {
        warn!(pid, error = %e, "could not kill process tree, killing leader");
        let _ = handle.child.start_kill();
    }
    match tokio::time::timeout(KILL_GRACE, handle.child.wait()).await {
        Ok(_) => StopOutcome::TimedOut,
        Err(_) => StopOutcome::Failed {
            details: format!("pid {} still alive after kill", pid),
        },
    }
}

/// Kill anything left in the tree after its leader exited.
async fn sweep(pid: u32) {
    if let Err(e) = tree::force_exit(pid).await {
        debug!(pid, error = %e, "sweep after exit failed");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process_table::SysinfoProcessTable;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    fn controller(
        launcher: LauncherConfig,
    ) -> (ProcessController, mpsc::UnboundedReceiver<EventEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let table: Arc<dyn ProcessTable> = Arc::new(SysinfoProcessTable::new());
        (ProcessController::new(launcher, table, tx), rx)
    }

    fn project(dir: &TempDir, built: bool) -> ProjectRecord {
        ProjectRecord::new("p1".into(), "api".into(), dir.path().to_path_buf(), built)
    }

    /// Reap until an exit-type event for the project shows up; returns every
    /// event seen, in order.
    async fn collect_until_exit(
        controller: &mut ProcessController,
        rx: &mut mpsc::UnboundedReceiver<EventEnvelope>,
    ) -> Vec<ControllerEvent> {
        let mut seen = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            controller.reap();
            while let Ok(env) = rx.try_recv() {
                let done = matches!(
                    env.event,
                    ControllerEvent::Exited { .. } | ControllerEvent::OperationFinished { .. }
                );
                seen.push(env.event);
                if done {
                    return seen;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no exit event within 10s: {:?}", seen);
    }

    #[tokio::test]
    async fn test_run_requires_build() {
        let dir = TempDir::new().unwrap();
        let (mut controller, mut rx) = controller(LauncherConfig::default());

        let err = controller.start(&project(&dir, false), true).unwrap_err();
        assert!(matches!(err, ServdeckError::BuildRequired { .. }));
        assert!(controller.busy("p1").is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_missing_directory_is_rejected() {
        let (mut controller, _rx) = controller(LauncherConfig::default());
        let gone = ProjectRecord::new(
            "p1".into(),
            "api".into(),
            PathBuf::from("/nonexistent/servdeck/project"),
            true,
        );
        let err = controller.start(&gone, false).unwrap_err();
        assert!(matches!(err, ServdeckError::PathNotFound { .. }));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let dir = TempDir::new().unwrap();
        let launcher = LauncherConfig {
            run: vec!["/nonexistent/servdeck-launcher".into()],
            ..LauncherConfig::default()
        };
        let (mut controller, mut rx) = controller(launcher);

        let err = controller.start(&project(&dir, true), true).unwrap_err();
        assert!(matches!(err, ServdeckError::Spawn { .. }));
        assert!(controller.busy("p1").is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_output_then_exit_in_order() {
        let dir = TempDir::new().unwrap();
        let launcher = LauncherConfig {
            run: sh("echo one; echo two >&2; echo; exit 3"),
            ..LauncherConfig::default()
        };
        let (mut controller, mut rx) = controller(launcher);
        let pid = controller.start(&project(&dir, true), true).unwrap();

        let events = collect_until_exit(&mut controller, &mut rx).await;
        assert!(matches!(events[0], ControllerEvent::Started { pid: p, .. } if p == pid));

        let lines: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ControllerEvent::LogLine { stream, text, .. } => Some((*stream, text.as_str())),
                _ => None,
            })
            .collect();
        assert!(lines.contains(&(LogStream::Stdout, "one")));
        assert!(lines.contains(&(LogStream::Stderr, "two")));
        assert_eq!(lines.len(), 2);

        assert!(matches!(
            events.last(),
            Some(ControllerEvent::Exited { code: Some(3), .. })
        ));
        assert!(controller.busy("p1").is_none());
    }

    #[tokio::test]
    async fn test_second_build_is_rejected_while_first_runs() {
        let dir = TempDir::new().unwrap();
        let launcher = LauncherConfig {
            build: sh("sleep 1"),
            ..LauncherConfig::default()
        };
        let (mut controller, mut rx) = controller(launcher);
        let p = project(&dir, false);

        controller.build(&p).unwrap();
        let err = controller.build(&p).unwrap_err();
        assert!(matches!(
            err,
            ServdeckError::ConcurrentOperation {
                running: Operation::Build,
                ..
            }
        ));

        let events = collect_until_exit(&mut controller, &mut rx).await;
        assert!(matches!(
            events.last(),
            Some(ControllerEvent::OperationFinished {
                operation: Operation::Build,
                code: Some(0),
                ..
            })
        ));
        let started = events
            .iter()
            .filter(|e| matches!(e, ControllerEvent::Started { .. }))
            .count();
        assert_eq!(started, 1);
    }

    #[tokio::test]
    async fn test_stop_not_running_is_noop() {
        let dir = TempDir::new().unwrap();
        let (mut controller, mut rx) = controller(LauncherConfig::default());

        let outcome = controller
            .stop(&project(&dir, true), Duration::from_secs(1))
            .await;
        assert_eq!(outcome, StopOutcome::NotRunning);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_kills_whole_tree() {
        let dir = TempDir::new().unwrap();
        let launcher = LauncherConfig {
            run: sh("sleep 60 & echo $!; wait"),
            ..LauncherConfig::default()
        };
        let (mut controller, mut rx) = controller(launcher);
        let mut p = project(&dir, true);
        let pid = controller.start(&p, true).unwrap();
        p.mark_running(pid, None);

        let mut worker = None;
        let deadline = Instant::now() + Duration::from_secs(10);
        while worker.is_none() && Instant::now() < deadline {
            while let Ok(env) = rx.try_recv() {
                if let ControllerEvent::LogLine { text, .. } = env.event {
                    worker = text.trim().parse::<u32>().ok();
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let worker = worker.expect("worker pid printed");

        let outcome = controller.stop(&p, Duration::from_secs(3)).await;
        assert_eq!(outcome, StopOutcome::Terminated);

        let table = SysinfoProcessTable::new();
        let deadline = Instant::now() + Duration::from_secs(3);
        while table.lookup(worker).unwrap().is_some() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(table.lookup(worker).unwrap().is_none());
        assert!(table.lookup(pid).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stop_by_pid_skips_reused_pid() {
        let dir = TempDir::new().unwrap();
        let (mut controller, _rx) = controller(LauncherConfig::default());
        let mut p = project(&dir, true);
        // our own pid with a start time it cannot have
        p.mark_running(std::process::id(), Some(1));

        let outcome = controller.stop(&p, Duration::from_millis(200)).await;
        assert_eq!(outcome, StopOutcome::PidReused);
    }

    #[tokio::test]
    async fn test_slot_is_held_until_finish_is_queued() {
        let dir = TempDir::new().unwrap();
        let launcher = LauncherConfig {
            build: sh("echo built"),
            ..LauncherConfig::default()
        };
        let (mut controller, mut rx) = controller(launcher);
        controller.build(&project(&dir, false)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut finished = false;
        loop {
            controller.reap();
            while let Ok(env) = rx.try_recv() {
                finished |= matches!(env.event, ControllerEvent::OperationFinished { .. });
            }
            match controller.busy("p1") {
                Some(Operation::Build) => assert!(!finished),
                None => break,
                Some(other) => panic!("unexpected operation {other}"),
            }
            assert!(Instant::now() < deadline, "build never finished");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(finished, "slot freed before OperationFinished was sent");
    }

    #[tokio::test]
    async fn test_no_output_after_stop() {
        let dir = TempDir::new().unwrap();
        let launcher = LauncherConfig {
            run: sh("trap '' TERM; while :; do i=0; while [ $i -lt 200 ]; do echo http://localhost:1; i=$((i+1)); done; sleep 0.05; done"),
            ..LauncherConfig::default()
        };
        let (mut controller, mut rx) = controller(launcher);
        let mut p = project(&dir, true);
        let pid = controller.start(&p, true).unwrap();
        p.mark_running(pid, None);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let outcome = controller.stop(&p, Duration::from_millis(200)).await;
        assert_eq!(outcome, StopOutcome::TimedOut);
        tokio::time::sleep(Duration::from_millis(300)).await;

        let mut events = Vec::new();
        while let Ok(env) = rx.try_recv() {
            events.push(env.event);
        }
        let stopped = events
            .iter()
            .position(|e| matches!(e, ControllerEvent::Stopped { .. }))
            .expect("stop reported");
        assert!(
            !events[stopped..]
                .iter()
                .any(|e| matches!(e, ControllerEvent::LogLine { .. })),
            "output logged after stop"
        );
    }

    #[tokio::test]
    async fn test_start_over_dead_restored_process() {
        let dir = TempDir::new().unwrap();
        let launcher = LauncherConfig {
            run: sh("sleep 5"),
            ..LauncherConfig::default()
        };
        let (mut controller, mut rx) = controller(launcher);
        let mut p = project(&dir, true);
        p.mark_running(4_000_000, None);

        let pid = controller.start(&p, true).unwrap();
        assert!(matches!(
            rx.try_recv().unwrap().event,
            ControllerEvent::Stopped {
                outcome: StopOutcome::AlreadyExited,
                ..
            }
        ));
        assert!(matches!(
            rx.try_recv().unwrap().event,
            ControllerEvent::Started { pid: started, .. } if started == pid
        ));

        p.mark_running(pid, None);
        controller.stop(&p, Duration::from_secs(3)).await;
    }

    #[tokio::test]
    async fn test_live_restored_process_blocks_start() {
        let dir = TempDir::new().unwrap();
        let (mut controller, mut rx) = controller(LauncherConfig::default());
        let mut p = project(&dir, true);
        p.mark_running(std::process::id(), None);

        let err = controller.start(&p, true).unwrap_err();
        assert!(matches!(
            err,
            ServdeckError::ConcurrentOperation {
                running: Operation::Run,
                ..
            }
        ));
        assert!(!controller.reap_detached([&p]));
        assert!(rx.try_recv().is_err());
    }
}
