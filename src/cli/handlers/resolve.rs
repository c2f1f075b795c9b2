use anyhow::Result;
use clap::Parser;
use colored::*;

use crate::session::{ProfileSession, Resolution};

#[derive(Parser, Debug, Default)]
#[command(
    no_binary_name = true,
    about = "Resolves a command name, loading its fragment if needed."
)]
struct ResolveArgs {
    /// The command (function, alias or executable) to resolve.
    command: String,
}

pub fn handle(args: Vec<String>, session: &ProfileSession) -> Result<()> {
    let resolve_args = ResolveArgs::try_parse_from(&args)?;
    let name = resolve_args.command.as_str();

    match session.resolve(name) {
        Resolution::Defined(command) => {
            println!(
                "{}",
                format!(t!("resolve.defined"), name = name.cyan(), kind = command.command_type)
            );
            print_origin(&command.name, &command.fragment);
        }
        Resolution::Loaded { command, fragment } => {
            let fragment = fragment.unwrap_or_else(|| command.fragment.clone());
            println!(
                "{}",
                format!(t!("resolve.loaded"), name = name.cyan(), fragment = fragment.green())
            );
            print_origin(&command.name, &command.fragment);
        }
        Resolution::External(path) => {
            println!(
                "{}",
                format!(t!("resolve.external"), name = name.cyan(), path = path.display())
            );
        }
        Resolution::NotFound => {
            println!("{}", format!(t!("resolve.not_found"), name = name.yellow()));
        }
    }
    Ok(())
}

fn print_origin(target: &str, fragment: &str) {
    println!("  {:<10} {}", t!("resolve.label.target").blue(), target);
    println!("  {:<10} {}", t!("resolve.label.fragment").blue(), fragment);
}
