//! Process entry point (spec.md §6.1): CLI parsing, config load, logger
//! init, resource-limit/signal setup, optional daemonization, then the
//! controller's worker fleet for the life of the process.
//!
//! Mirrors the teacher's `main.rs`/`opts.rs`/`signal.rs` split, scaled
//! down to one config shape and one controller instead of g3proxy's
//! reload-capable, multi-kind server registry.

mod addr;
mod build;
mod config;
mod controller;
mod daemon;
mod error;
mod log;
mod opts;
mod serve;
mod signal;
mod socket;
mod socks5;
mod tsock;

use std::process::ExitCode;
use std::sync::Arc;

const EXIT_BAD_ARGS: u8 = 255; // -1
const EXIT_BAD_CONFIG: u8 = 254; // -2
const EXIT_TPROXY_INIT: u8 = 251; // -5

fn main() -> ExitCode {
    let args = match opts::parse_args() {
        Ok(args) => args,
        Err(_) => return ExitCode::from(EXIT_BAD_ARGS),
    };

    let cfg = match config::Config::load(&args.config_file) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("config error: {e}");
            return ExitCode::from(EXIT_BAD_CONFIG);
        }
    };

    if args.test_config {
        println!("config ok");
        return ExitCode::SUCCESS;
    }

    let logger = log::build_process_logger(cfg.misc.log_file.as_deref().map(std::path::Path::new), cfg.misc.log_level);

    daemon::set_limit_nofile(cfg.misc.limit_nofile);

    if args.daemonize {
        if let Err(e) = daemon::daemonize(cfg.misc.pid_file.as_deref().map(std::path::Path::new)) {
            eprintln!("failed to daemonize: {e}");
            return ExitCode::from(EXIT_TPROXY_INIT);
        }
    }

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to build main runtime: {e}");
            return ExitCode::from(EXIT_TPROXY_INIT);
        }
    };

    runtime.block_on(run(Arc::new(cfg), logger))
}

async fn run(cfg: Arc<config::Config>, logger: ::slog::Logger) -> ExitCode {
    let controller = match controller::Controller::start(cfg, logger).await {
        Ok(controller) => Arc::new(controller),
        Err(e) => {
            eprintln!("tproxy init failed: {e}");
            return ExitCode::from(EXIT_TPROXY_INIT);
        }
    };

    if let Err(e) = signal::install(&controller) {
        eprintln!("failed to install signal handlers: {e}");
        controller.stop();
    }

    // worker threads block the whole process alive; join them on a
    // blocking thread so the reactor driving the signal task above
    // keeps running until SIGINT fires.
    let join_handle = {
        let controller = controller.clone();
        tokio::task::spawn_blocking(move || controller.join())
    };
    let _ = join_handle.await;

    ExitCode::SUCCESS
}
