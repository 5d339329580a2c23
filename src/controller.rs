//! T2 TProxy controller (spec.md §4.8, Data Model §3 `TProxy`): resolves
//! the process-lifetime shared context once, then spawns `workers` OS
//! threads, each running one [`Worker`] under its own single-threaded
//! tokio runtime, and fans shutdown out to all of them.
//!
//! Grounded on `original_source/src/hev-socks5-tproxy.c`
//! (`hev_socks5_tproxy_run`'s per-worker thread spawn, main worker
//! reusing the caller's listener fds while the rest bind their own) and
//! `g3proxy/src/main.rs`'s `spawn_workers` (one `current_thread` runtime
//! per worker OS thread, readiness observed before the process considers
//! startup complete).

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::info;
use slog::Logger;
use tokio::sync::watch;

use crate::config::Config;
use crate::error::InitError;
use crate::serve::{self, worker::Worker};

/// Owns every worker thread and the shutdown signal that reaches them
/// all at once (spec.md §4.8 "quit broadcasts to every worker").
pub struct Controller {
    stop_tx: watch::Sender<bool>,
    handles: Mutex<Option<Vec<JoinHandle<()>>>>,
}

impl Controller {
    /// Resolves the shared context, spawns one thread per configured
    /// worker, and blocks until every worker has either bound its
    /// listeners or failed to (spec.md §7 "Fatal init"). On any worker's
    /// bind failure, every already-started worker is stopped and joined
    /// before the error is returned, so a failed `start` never leaks
    /// live threads.
    pub async fn start(config: Arc<Config>, logger: Logger) -> Result<Controller, InitError> {
        let shared = serve::build_shared(&config, logger)
            .await
            .map_err(|e| InitError::Resolve("socks5.address", e))?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), String>>();
        let worker_count = config.workers();
        let mut handles = Vec::with_capacity(worker_count);

        for id in 0..worker_count {
            let config = config.clone();
            let shared = shared.clone();
            let stop_rx = stop_rx.clone();
            let ready_tx = ready_tx.clone();

            let handle = std::thread::Builder::new()
                .name(format!("socks5-tproxy-worker-{id}"))
                .spawn(move || {
                    let rt = match tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    {
                        Ok(rt) => rt,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e.to_string()));
                            return;
                        }
                    };
                    let worker = Worker {
                        id,
                        is_main: id == 0,
                    };
                    let _ = rt.block_on(worker.run(config, shared, stop_rx, ready_tx));
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
        drop(ready_tx);

        let mut failure = None;
        for _ in 0..worker_count {
            match ready_rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(e)) if failure.is_none() => failure = Some(e),
                Ok(Err(_)) => {}
                Err(_) => {}
            }
        }

        let controller = Controller {
            stop_tx,
            handles: Mutex::new(Some(handles)),
        };
        if let Some(e) = failure {
            controller.stop();
            controller.join();
            return Err(InitError::WorkerInit(e));
        }

        info!("controller: {worker_count} worker(s) started");
        Ok(controller)
    }

    /// Broadcasts shutdown to every worker (spec.md §4.8, §9 "quit → all
    /// listener loops eventually exit"). Idempotent: a second call is a
    /// no-op since the watch channel already holds `true`.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Blocks until every worker thread has returned. Safe to call
    /// through a shared `Arc<Controller>` (the signal handler holds one
    /// to call [`Controller::stop`]); the handles are taken once and a
    /// second call is a no-op.
    pub fn join(&self) {
        let handles = self.handles.lock().unwrap().take();
        let Some(handles) = handles else {
            return;
        };
        for handle in handles {
            let _ = handle.join();
        }
        info!("controller: all workers joined");
    }
}
