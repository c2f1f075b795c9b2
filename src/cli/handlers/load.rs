use anyhow::{Context, Result};
use clap::Parser;
use colored::*;

use crate::{models::LoadOutcome, session::ProfileSession};

#[derive(Parser, Debug, Default)]
#[command(
    no_binary_name = true,
    about = "Loads a fragment (and its dependencies) into the session."
)]
struct LoadArgs {
    /// The fragment name, without the `.ps1` extension.
    fragment: String,

    /// Run the fragment again even if it is already loaded. Dependencies are always loaded.
    #[arg(long, short)]
    force: bool,

    /// Skip the fragment's declared dependencies.
    #[arg(long)]
    no_deps: bool,
}

pub fn handle(args: Vec<String>, session: &ProfileSession) -> Result<()> {
    let load_args = LoadArgs::try_parse_from(&args)?;
    let name = load_args.fragment.as_str();
    let loader = session.loader();

    let result = if load_args.force {
        loader.reload(name)
    } else {
        loader.load(name, !load_args.no_deps)
    };
    let outcome = result.with_context(|| format!(t!("load.error.failed"), name = name))?;

    let message = match outcome {
        LoadOutcome::Loaded => format!(t!("load.loaded"), name = name.green()),
        LoadOutcome::AlreadyLoaded => format!(t!("load.already_loaded"), name = name.cyan()),
        LoadOutcome::InProgress => format!(t!("load.in_progress"), name = name.cyan()),
        LoadOutcome::Missing => {
            let path = loader.fragment_path(name);
            format!(t!("load.missing"), name = name.yellow(), path = path.display())
        }
        LoadOutcome::NotRegistered => format!(t!("load.not_registered"), name = name.yellow()),
    };
    println!("{}", message);

    let order = session.scope().execution_order();
    if order.len() > 1 {
        println!("  {:<10} {}", t!("load.label.order").blue(), order.join(" -> "));
    }
    Ok(())
}
