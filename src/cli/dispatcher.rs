use anyhow::{Result, anyhow};
use colored::Colorize;

use crate::{cli::handlers, session::ProfileSession};

/// A CLI action, its aliases, and the handler that runs it.
struct CommandDefinition {
    name: &'static str,
    aliases: &'static [&'static str],
    handler: fn(Vec<String>, &ProfileSession) -> Result<()>,
}

/// Every action the CLI understands.
static COMMAND_REGISTRY: &[CommandDefinition] = &[
    CommandDefinition {
        name: "deps",
        aliases: &[],
        handler: handlers::deps::handle,
    },
    CommandDefinition {
        name: "events",
        aliases: &[],
        handler: handlers::events::handle,
    },
    CommandDefinition {
        name: "invoke",
        aliases: &["run"],
        handler: handlers::invoke::handle,
    },
    CommandDefinition {
        name: "list",
        aliases: &["ls"],
        handler: handlers::list::handle,
    },
    CommandDefinition {
        name: "load",
        aliases: &[],
        handler: handlers::load::handle,
    },
    CommandDefinition {
        name: "manifest",
        aliases: &[],
        handler: handlers::manifest::handle,
    },
    CommandDefinition {
        name: "probe",
        aliases: &[],
        handler: handlers::probe::handle,
    },
    CommandDefinition {
        name: "resolve",
        aliases: &["which"],
        handler: handlers::resolve::handle,
    },
];

/// Finds a command definition by its name or alias.
fn find_command(name: &str) -> Option<&'static CommandDefinition> {
    COMMAND_REGISTRY
        .iter()
        .find(|cmd| cmd.name == name || cmd.aliases.contains(&name))
}

/// Names of every action, for help and error output.
pub fn command_names() -> Vec<&'static str> {
    COMMAND_REGISTRY.iter().map(|cmd| cmd.name).collect()
}

/// Routes `psprofile <action> [args...]` to the action's handler.
pub fn dispatch(all_args: Vec<String>, session: &ProfileSession) -> Result<()> {
    log::debug!("Dispatching args: {:?}", all_args);

    let mut args = all_args.into_iter();
    let Some(action) = args.next() else {
        println!("{}", t!("cli.no_action").yellow());
        println!("  {}", command_names().join(", ").cyan());
        return Ok(());
    };

    match find_command(&action) {
        Some(command) => (command.handler)(args.collect(), session),
        None => Err(anyhow!(format!(
            t!("cli.error.unknown_action"),
            action = action,
            actions = command_names().join(", ")
        ))),
    }
}
