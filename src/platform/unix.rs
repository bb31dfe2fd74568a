use std::process::ExitStatus;

use tokio::process::Command;
use tracing::{debug, warn};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;

use super::KILL_GRACE;

/// No-op handle on Unix — process group cleanup uses killpg with the child PID.
pub struct ProcessGroupHandle;

pub fn configure_process_group(cmd: &mut Command) {
    cmd.process_group(0);
}

pub fn post_spawn_setup(_child_pid: Option<u32>) -> Option<ProcessGroupHandle> {
    // On Unix, the process group is configured before spawn via process_group(0).
    None
}

pub async fn terminate_child(
    child: &mut tokio::process::Child,
    child_pid: Option<u32>,
    _group_handle: Option<&ProcessGroupHandle>,
) -> Option<ExitStatus> {
    let Some(pid) = child_pid else {
        // No PID means spawn likely failed; just kill.
        let _ = child.kill().await;
        return child.wait().await.ok();
    };

    let pgid = Pid::from_raw(pid as i32);
    match killpg(pgid, Signal::SIGTERM) {
        Ok(()) => {
            debug!(pid, "sent SIGTERM to process group");
        }
        Err(nix::errno::Errno::ESRCH) => {
            debug!(pid, "process group already exited");
            return child.wait().await.ok();
        }
        Err(e) => {
            warn!(pid, error = %e, "killpg(SIGTERM) failed, falling back to kill");
            let _ = child.kill().await;
            return child.wait().await.ok();
        }
    }

    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(pid, "child exited after SIGTERM");
            Some(status)
        }
        _ => {
            warn!(pid, "child did not exit within grace period, sending SIGKILL");
            let _ = child.kill().await;
            child.wait().await.ok()
        }
    }
}
