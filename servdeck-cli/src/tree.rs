//! Process-tree detachment and termination.
//!
//! Every launcher process is started as the leader of its own group (own
//! session on Unix), so stopping a project reaches the workers it spawned.

use std::io;

use tokio::process::Command;

/// Make the child the root of a tree that can be signalled as one unit and
/// that outlives servdeck if left running.
#[cfg(unix)]
pub fn detach(cmd: &mut Command) {
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            // our read end of its output pipes goes away when servdeck exits
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
            Ok(())
        });
    }
}

#[cfg(windows)]
pub fn detach(cmd: &mut Command) {
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW);
}

/// Ask the tree rooted at `pid` to exit. A tree that is already gone is not
/// an error.
#[cfg(unix)]
pub async fn request_exit(pid: u32) -> io::Result<()> {
    signal_tree(pid, libc::SIGTERM)
}

/// Kill the tree rooted at `pid`.
#[cfg(unix)]
pub async fn force_exit(pid: u32) -> io::Result<()> {
    signal_tree(pid, libc::SIGKILL)
}

#[cfg(unix)]
fn signal_tree(pid: u32, signal: i32) -> io::Result<()> {
    let pid = i32::try_from(pid).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    if unsafe { libc::killpg(pid, signal) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::ESRCH) {
        return Err(err);
    }

    // not a group leader (or the group is empty): fall back to the pid itself
    if unsafe { libc::kill(pid, signal) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

#[cfg(windows)]
pub async fn request_exit(pid: u32) -> io::Result<()> {
    taskkill(pid, false).await
}

#[cfg(windows)]
pub async fn force_exit(pid: u32) -> io::Result<()> {
    taskkill(pid, true).await
}

#[cfg(windows)]
async fn taskkill(pid: u32, force: bool) -> io::Result<()> {
    let pid = pid.to_string();
    let mut args = vec!["/PID", pid.as_str(), "/T"];
    if force {
        args.push("/F");
    }
    let output = Command::new("taskkill").args(&args).output().await?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    // exit code 128: no such process
    if output.status.code() == Some(128) || stderr.contains("not found") {
        return Ok(());
    }
    Err(io::Error::other(stderr.trim().to_string()))
}
