//! CLI argument parsing (spec.md §6.1), trimmed from the teacher's
//! `opts.rs` builder down to this program's actual flags: one config
//! path, version, daemonize, and test-config.

use std::path::PathBuf;

use clap::{value_parser, Arg, ArgAction, Command};

use crate::build;

pub struct ProcArgs {
    pub config_file: PathBuf,
    pub daemonize: bool,
    pub test_config: bool,
}

pub fn parse_args() -> anyhow::Result<ProcArgs> {
    let app = Command::new(build::PKG_NAME)
        .version(build::VERSION)
        .help_template("{bin} CONFIG_PATH\nVersion: {version}\n")
        .version_template("Version: {version}\n")
        .arg(
            Arg::new("config-file")
                .value_name("CONFIG_PATH")
                .required(true)
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("daemonize")
                .help("run as a daemon")
                .short('d')
                .long("daemonize")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("test-config")
                .help("load and validate the config, then exit")
                .short('t')
                .long("test-config")
                .action(ArgAction::SetTrue),
        );

    let args = app.try_get_matches().map_err(|e| {
        e.print().ok();
        anyhow::anyhow!("bad arguments")
    })?;

    Ok(ProcArgs {
        config_file: args
            .get_one::<PathBuf>("config-file")
            .expect("required")
            .clone(),
        daemonize: args.get_flag("daemonize"),
        test_config: args.get_flag("test-config"),
    })
}
