use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use colored::*;

use crate::{
    constants::MANIFEST_FILENAME,
    core::{manifest, paths},
    session::ProfileSession,
};

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
enum ManifestAction {
    /// Show every fragment with its dependencies and exported commands.
    #[default]
    Inspect,
    /// Delete the compiled manifest cache so the next session rescans.
    Clear,
}

#[derive(Parser, Debug, Default)]
#[command(
    no_binary_name = true,
    about = "Inspects the fragment manifest or clears its compiled cache."
)]
struct ManifestArgs {
    #[arg(value_enum, default_value_t = ManifestAction::Inspect)]
    action: ManifestAction,
}

pub fn handle(args: Vec<String>, session: &ProfileSession) -> Result<()> {
    let manifest_args = ManifestArgs::try_parse_from(&args)?;
    match manifest_args.action {
        ManifestAction::Inspect => inspect(session),
        ManifestAction::Clear => clear(session),
    }
}

fn inspect(session: &ProfileSession) -> Result<()> {
    let config = session.config();
    let manifest = session.loader().manifest();

    println!("\n--- {} ---", t!("manifest.header"));
    println!("  {:<14} {}", t!("manifest.label.profile_dir").blue(), config.profile_dir.display());
    println!(
        "  {:<14} {}",
        t!("manifest.label.manifest_file").blue(),
        config.profile_dir.join(MANIFEST_FILENAME).display()
    );
    match &config.cache_dir {
        Some(dir) => println!(
            "  {:<14} {}",
            t!("manifest.label.cache_file").blue(),
            paths::manifest_cache_path(dir).display()
        ),
        None => println!("  {:<14} {}", t!("manifest.label.cache_file").blue(), t!("manifest.cache_disabled").dimmed()),
    }
    println!("  {:<14} {}", t!("manifest.label.source").blue(), manifest.source());

    if manifest.is_empty() {
        println!("\n{}", t!("manifest.empty").yellow());
        return Ok(());
    }

    for entry in manifest.entries() {
        println!("\n{}", entry.name.bold());
        if let Some(file) = &entry.file {
            println!("  {:<10} {}", t!("manifest.label.file").blue(), file.display());
        }
        if !entry.requires.is_empty() {
            println!("  {:<10} {}", t!("manifest.label.requires").blue(), entry.requires.join(", "));
        }
        let commands: Vec<String> = entry
            .commands
            .iter()
            .map(|c| format!("{} {}", c.name.cyan(), format!("({})", c.command_type).dimmed()))
            .collect();
        if !commands.is_empty() {
            println!("  {:<10} {}", t!("manifest.label.commands").blue(), commands.join(", "));
        }
    }
    Ok(())
}

fn clear(session: &ProfileSession) -> Result<()> {
    let Some(cache_dir) = session.config().cache_dir.as_deref() else {
        println!("{}", t!("manifest.cache_disabled").yellow());
        return Ok(());
    };
    let removed = manifest::clear_cache(cache_dir)
        .with_context(|| t!("manifest.error.clear_failed"))?;
    if removed {
        println!("{}", t!("manifest.cleared").green());
    } else {
        println!("{}", t!("manifest.nothing_to_clear").dimmed());
    }
    Ok(())
}
