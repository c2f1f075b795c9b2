// src/bin/psprofile.rs

use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use psprofile::{
    cli::{Cli, dispatcher},
    core::config::{self, ProcessEnv, ProfileConfig},
    session::{ProfileSession, SessionError},
    system::executor::ExecutionError,
};
use std::env;

/// Sets up logging, opens the profile session, dispatches the action and
/// reports any error in one place.
fn main() {
    init_logging();

    if let Err(e) = run_cli(Cli::parse()) {
        // A failing command already printed its own output; mirror its exit code.
        if let Some(SessionError::Execution(ExecutionError::NonZeroExitStatus { code, .. })) =
            e.downcast_ref::<SessionError>()
        {
            std::process::exit(*code);
        }
        eprintln!("\n{}: {:#}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

/// `RUST_LOG` wins; otherwise `PS_PROFILE_DEBUG` picks the level.
fn init_logging() {
    if env::var_os("RUST_LOG").is_some() {
        env_logger::init();
        return;
    }
    let level = config::log_filter_for(config::debug_level(&ProcessEnv));
    env_logger::Builder::new().filter_level(level).init();
}

fn run_cli(cli: Cli) -> Result<()> {
    log::debug!("CLI args parsed: {:?}", cli);
    let config = ProfileConfig::load().context("Failed to load the psprofile configuration")?;
    let session = ProfileSession::open(config)?;
    dispatcher::dispatch(cli.args, &session)
}
