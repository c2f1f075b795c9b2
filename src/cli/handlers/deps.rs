use anyhow::{Result, anyhow};
use clap::Parser;
use colored::*;
use std::collections::HashSet;

use crate::{
    core::{fragment, loader::FragmentLoader},
    session::ProfileSession,
};

#[derive(Parser, Debug, Default)]
#[command(
    no_binary_name = true,
    about = "Shows the dependency tree of a fragment without loading it."
)]
struct DepsArgs {
    /// The fragment name.
    fragment: String,

    /// Limit the depth of the tree display.
    #[arg(long, short)]
    depth: Option<usize>,
}

pub fn handle(args: Vec<String>, session: &ProfileSession) -> Result<()> {
    let deps_args = DepsArgs::try_parse_from(&args)?;
    let name = deps_args.fragment.trim();
    if !fragment::is_valid_fragment_name(name) {
        return Err(anyhow!(format!(t!("deps.error.invalid_name"), name = name)));
    }

    let loader = session.loader();
    println!("{}", name.bold());
    let mut seen = HashSet::from([name.to_ascii_lowercase()]);
    print_children(loader, name, "", 1, deps_args.depth, &mut seen);
    Ok(())
}

fn print_children(
    loader: &FragmentLoader,
    name: &str,
    prefix: &str,
    level: usize,
    max_depth: Option<usize>,
    seen: &mut HashSet<String>,
) {
    if max_depth.is_some_and(|max| level > max) {
        return;
    }
    let path = loader.fragment_path(name);
    let children = loader.fragment_dependencies(name, Some(&path));
    let count = children.len();

    for (i, child) in children.iter().enumerate() {
        let last = i + 1 == count;
        let branch = if last { "└── " } else { "├── " };
        let child_path = loader.fragment_path(child);
        let mut label = child.cyan().to_string();
        if !child_path.is_file() {
            label = format!("{} {}", label, t!("deps.label.missing").red());
        }

        let key = child.to_ascii_lowercase();
        if !seen.insert(key.clone()) {
            println!("{}{}{} {}", prefix, branch, label, t!("deps.label.cycle").yellow());
            continue;
        }
        println!("{}{}{}", prefix, branch, label);
        let next_prefix = format!("{}{}", prefix, if last { "    " } else { "│   " });
        print_children(loader, child, &next_prefix, level + 1, max_depth, seen);
        seen.remove(&key);
    }
}
