use anyhow::Result;
use clap::Parser;

use crate::session::ProfileSession;

#[derive(Parser, Debug, Default)]
#[command(
    no_binary_name = true,
    about = "Runs a profile command through the configured shell, loading its fragment first."
)]
#[command(trailing_var_arg = true)]
struct InvokeArgs {
    /// The command to run.
    command: String,

    /// Arguments passed to the command as literals.
    #[arg(allow_hyphen_values = true)]
    params: Vec<String>,
}

pub fn handle(args: Vec<String>, session: &ProfileSession) -> Result<()> {
    let invoke_args = InvokeArgs::try_parse_from(&args)?;
    log::info!(
        "Invoking '{}' with {} argument(s) via '{}'.",
        invoke_args.command,
        invoke_args.params.len(),
        session.config().shell
    );
    session.invoke(&invoke_args.command, &invoke_args.params)?;
    Ok(())
}
