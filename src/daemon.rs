//! Daemonization, PID file, and the open-files limit (spec.md §6.4–§6.5).
//!
//! Grounded on `original_source/src/misc/hev-utils.c`'s `run_as_daemon`
//! and `set_limit_nofile`: the PID file is opened *before* forking (so
//! the already-open handle survives into the daemonized child across
//! `daemon(3)`'s fork/setsid/chdir/redirect-stdio), then the child's own
//! pid is written into it.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use log::warn;

/// Best-effort `setrlimit(RLIMIT_NOFILE, ...)` (spec.md §6.4: failure is
/// logged, not fatal, matching the teacher's tolerance for environments
/// that cap this below the requested value).
pub fn set_limit_nofile(limit: u64) {
    let limit = libc::rlimit {
        rlim_cur: limit,
        rlim_max: limit,
    };
    let rc = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &limit) };
    if rc != 0 {
        warn!(
            "failed to set RLIMIT_NOFILE to {}: {}",
            limit.rlim_cur,
            io::Error::last_os_error()
        );
    }
}

/// Forks into the background via `daemon(3)`, then writes the
/// daemonized process's pid to `pid_file` if one is configured
/// (spec.md §6.5).
pub fn daemonize(pid_file: Option<&Path>) -> anyhow::Result<()> {
    let pid_handle = match pid_file {
        Some(path) => Some(
            File::create(path)
                .map_err(|e| anyhow::anyhow!("failed to open pid file {}: {e}", path.display()))?,
        ),
        None => None,
    };

    // nochdir=0, noclose=0: match the teacher's `daemon(0, 0)` exactly.
    if unsafe { libc::daemon(0, 0) } != 0 {
        return Err(anyhow::anyhow!(
            "daemon() failed: {}",
            io::Error::last_os_error()
        ));
    }

    if let Some(mut file) = pid_handle {
        writeln!(file, "{}", std::process::id())?;
    }

    Ok(())
}
