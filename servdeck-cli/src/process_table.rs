use std::sync::Mutex;

use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};

use servdeck_core::Result;
use servdeck_core::reconcile::{ProcessInfo, ProcessTable};

/// The OS process table, read through sysinfo.
pub struct SysinfoProcessTable {
    sys: Mutex<System>,
}

impl SysinfoProcessTable {
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SysinfoProcessTable {
    fn lookup(&self, pid: u32) -> Result<Option<ProcessInfo>> {
        let mut sys = self.sys.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let sys_pid = Pid::from_u32(pid);
        sys.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);

        let Some(process) = sys.process(sys_pid) else {
            return Ok(None);
        };
        // An exited child that nobody reaped yet still has a table entry.
        if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) {
            return Ok(None);
        }
        Ok(Some(ProcessInfo {
            pid,
            started_at: process.start_time(),
        }))
    }
}
