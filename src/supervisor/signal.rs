use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::Child;
use tracing::{debug, warn};

/// Terminate `child` and its process group: SIGTERM, then SIGKILL once
/// `grace` runs out. Group members that outlive the leader are killed too.
pub async fn terminate(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    let group = child.id();
    request_exit(child, group);

    let status = match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(pid = group, "no exit within {grace:?}; killing");
            force_kill(child, group);
            child.wait().await
        }
    };
    if let Some(group) = group {
        sweep_group(group);
    }
    status
}

#[cfg(unix)]
fn signal_group(group: u32, signal: libc::c_int) -> bool {
    let Ok(pgid) = i32::try_from(group) else {
        return false;
    };
    unsafe { libc::kill(-pgid, signal) == 0 }
}

#[cfg(unix)]
fn request_exit(child: &mut Child, group: Option<u32>) {
    let delivered = group.is_some_and(|g| signal_group(g, libc::SIGTERM));
    if !delivered {
        debug!(pid = group, "SIGTERM not delivered; killing directly");
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn request_exit(child: &mut Child, _group: Option<u32>) {
    let _ = child.start_kill();
}

#[cfg(unix)]
fn force_kill(child: &mut Child, group: Option<u32>) {
    if let Some(group) = group {
        signal_group(group, libc::SIGKILL);
    }
    let _ = child.start_kill();
}

#[cfg(not(unix))]
fn force_kill(child: &mut Child, _group: Option<u32>) {
    let _ = child.start_kill();
}

/// SIGKILL whatever is left in a process group whose leader is gone.
#[cfg(unix)]
pub fn sweep_group(group: u32) {
    if signal_group(group, libc::SIGKILL) {
        debug!(pgid = group, "killed leftover group members");
    }
}

#[cfg(not(unix))]
pub fn sweep_group(_group: u32) {}

/// Whether a process with this pid currently exists.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Without a liveness probe every recorded holder counts as running, so a
/// marker left by a crash has to be removed by hand.
#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    true
}

/// Ask another devctl process to end its session.
#[cfg(unix)]
pub fn request_stop(pid: u32) -> io::Result<()> {
    let pid = i32::try_from(pid).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    if unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
pub fn request_stop(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "stopping another session needs unix signals",
    ))
}
