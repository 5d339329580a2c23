//! Ambient logging: a process-wide `slog::Logger` (async term/file drain)
//! bridged onto the `log` facade, plus structured per-session completion
//! records under [`task`].
//!
//! Grounded on `g3proxy/src/log/mod.rs` (module shape, `LOG_TYPE_*`
//! constants) and `g3proxy/src/log/task/tcp_connect.rs` (structured
//! completion logging via `slog_info!` with key/value pairs). The
//! construction of the drain itself follows the standard slog-term +
//! slog-async recipe the teacher's `g3_daemon::log::create_logger`
//! wraps, since that crate ships without its `src/` in this pack.

pub mod task;

use std::fs::OpenOptions;
use std::path::Path;

use slog::{o, Drain, Logger};

use crate::config::LogLevel;

/// Build the process logger. With no `log_file` configured, logs go to
/// the terminal; otherwise to the given file, both non-blocking via
/// `slog-async`. Also bridges the `log` crate facade onto the same
/// drain via `slog-stdlog`, so teacher-style free-function `log::warn!`
/// calls and structured `slog::Logger` calls share one sink.
pub fn build_process_logger(log_file: Option<&Path>, level: LogLevel) -> Logger {
    let min_level = to_slog_level(level);

    let logger = match log_file {
        Some(path) => match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                let decorator = slog_term::PlainDecorator::new(file);
                let drain = slog_term::FullFormat::new(decorator).build().fuse();
                let drain = slog::LevelFilter::new(drain, min_level).fuse();
                let drain = slog_async::Async::new(drain).build().fuse();
                Logger::root(drain, o!("pid" => std::process::id()))
            }
            Err(e) => {
                eprintln!("cannot open log file {}: {e}, logging to stderr", path.display());
                term_logger(min_level)
            }
        },
        None => term_logger(min_level),
    };

    let _ = slog_stdlog::init_with_level(level_to_log_crate(level));
    logger
}

fn term_logger(min_level: slog::Level) -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog::LevelFilter::new(drain, min_level).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!("pid" => std::process::id()))
}

fn to_slog_level(level: LogLevel) -> slog::Level {
    match level {
        LogLevel::Debug => slog::Level::Debug,
        LogLevel::Info => slog::Level::Info,
        LogLevel::Warn => slog::Level::Warning,
        LogLevel::Error => slog::Level::Error,
    }
}

fn level_to_log_crate(level: LogLevel) -> log::LevelFilter {
    match level {
        LogLevel::Debug => log::LevelFilter::Debug,
        LogLevel::Info => log::LevelFilter::Info,
        LogLevel::Warn => log::LevelFilter::Warn,
        LogLevel::Error => log::LevelFilter::Error,
    }
}

/// A per-worker child logger, tagged with the worker id, passed down
/// into every session the worker serves (spec.md §6.2).
pub fn worker_logger(root: &Logger, worker_id: usize) -> Logger {
    root.new(o!("worker_id" => worker_id))
}
