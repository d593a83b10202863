//! Classic double-fork daemonisation.

use std::os::fd::AsRawFd;

use anyhow::{Context, Result};
use nix::unistd::{chdir, dup2, fork, setsid, ForkResult};

/// Detach from the controlling terminal.
///
/// Fork, become a session leader, fork again so the daemon can never
/// reacquire a terminal, then point stdio at /dev/null. The original
/// process exits 0 once the daemon is on its way.
pub fn daemonise() -> Result<()> {
    // Forking a single-threaded process that has not spawned threads yet
    // is the one situation where fork is straightforward.
    #[allow(unsafe_code)]
    match unsafe { fork() }.context("first fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    setsid().context("setsid failed")?;

    #[allow(unsafe_code)]
    match unsafe { fork() }.context("second fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    chdir("/").context("chdir to / failed")?;

    let null = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .context("cannot open /dev/null")?;
    for fd in 0..=2 {
        dup2(null.as_raw_fd(), fd).context("cannot redirect stdio")?;
    }
    Ok(())
}
