//! Process signal handling (spec.md §6.3, §4.8): `SIGINT` triggers the
//! same graceful stop the rest of the program uses; `SIGPIPE` is
//! ignored so a peer closing a socket mid-write surfaces as a normal
//! `EPIPE` I/O error instead of killing the process.
//!
//! The teacher dispatches signals through `g3_daemon::signal`'s
//! `AsyncSignalAction` registry (`register_reload`/`register_offline`/
//! `register_quit`); that crate's signal module isn't in this pack, and
//! this program has exactly one signal action, so it goes straight
//! against `tokio::signal::unix`.

use log::info;
use tokio::signal::unix::{signal, SignalKind};

use crate::controller::Controller;

/// Ignores `SIGPIPE` and spawns a task that calls `controller.stop()`
/// once on the first `SIGINT`.
pub fn install(controller: &std::sync::Arc<Controller>) -> std::io::Result<()> {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let mut sigint = signal(SignalKind::interrupt())?;
    let controller = controller.clone();
    tokio::spawn(async move {
        sigint.recv().await;
        info!("signal: received SIGINT, shutting down");
        controller.stop();
    });

    Ok(())
}
