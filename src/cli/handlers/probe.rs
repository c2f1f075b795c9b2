use anyhow::Result;
use clap::Parser;
use colored::*;

use crate::{constants::DEFAULT_THROTTLE, session::ProfileSession};

#[derive(Parser, Debug, Default)]
#[command(
    no_binary_name = true,
    about = "Checks which external tools are installed on PATH."
)]
struct ProbeArgs {
    /// Tool names to look for.
    #[arg(required = true)]
    names: Vec<String>,

    /// Maximum number of concurrent lookups.
    #[arg(long, short, default_value_t = DEFAULT_THROTTLE)]
    throttle: usize,
}

pub fn handle(args: Vec<String>, session: &ProfileSession) -> Result<()> {
    let probe_args = ProbeArgs::try_parse_from(&args)?;
    let results = session
        .probe()
        .probe_many(probe_args.names, probe_args.throttle);

    let mut missing = 0;
    for (name, found) in &results {
        match found {
            Some(path) => println!("  {} {:<20} {}", "✔".green(), name.cyan(), path.display()),
            None => {
                missing += 1;
                println!("  {} {:<20} {}", "✘".red(), name.yellow(), t!("probe.not_found").dimmed());
            }
        }
    }
    println!(
        "\n{}",
        format!(t!("probe.summary"), found = results.len() - missing, total = results.len())
    );
    Ok(())
}
