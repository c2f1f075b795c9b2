use anyhow::Result;
use clap::Parser;
use colored::*;
use std::collections::BTreeMap;

use crate::{
    models::{LoadState, RegistryEntry},
    session::ProfileSession,
};

#[derive(Parser, Debug, Default)]
#[command(
    no_binary_name = true,
    about = "Lists registered commands grouped by the fragment that provides them."
)]
struct ListArgs {
    /// Only show fragments whose name contains this text.
    filter: Option<String>,
}

pub fn handle(args: Vec<String>, session: &ProfileSession) -> Result<()> {
    let list_args = ListArgs::try_parse_from(&args)?;
    let filter = list_args.filter.map(|f| f.to_ascii_lowercase());

    let mut by_fragment: BTreeMap<String, Vec<RegistryEntry>> = BTreeMap::new();
    for entry in session.registry().entries() {
        by_fragment
            .entry(entry.fragment_name.clone())
            .or_default()
            .push(entry);
    }
    by_fragment.retain(|fragment, _| {
        filter
            .as_deref()
            .is_none_or(|f| fragment.to_ascii_lowercase().contains(f))
    });

    if by_fragment.is_empty() {
        println!("{}", t!("list.empty").yellow());
        return Ok(());
    }

    println!(
        "\n--- {} ({}) ---",
        t!("list.header"),
        session.loader().manifest().source()
    );
    for (fragment, mut entries) in by_fragment {
        entries.sort_by(|a, b| a.command_name.cmp(&b.command_name));
        let state = session.loader().state(&fragment);
        println!("{} {}", fragment.bold(), paint_state(state));
        for entry in entries {
            println!(
                "  {:<28} {}",
                entry.command_name.cyan(),
                entry.command_type.to_string().dimmed()
            );
        }
    }
    Ok(())
}

fn paint_state(state: LoadState) -> ColoredString {
    let text = format!("[{}]", state);
    match state {
        LoadState::Loaded => text.green(),
        LoadState::Failed => text.red(),
        LoadState::Loading => text.yellow(),
        LoadState::NotLoaded => text.dimmed(),
    }
}
