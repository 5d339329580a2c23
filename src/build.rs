//! Build-time constants (spec.md §6.1 `--version` output).
//!
//! The teacher derives these from a companion build script emitting
//! `G3_BUILD_*` env vars (rustc version/channel, host/target triple,
//! feature flags for optional backends); this binary has none of that
//! variability, so `CARGO_PKG_*` alone is enough.

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
