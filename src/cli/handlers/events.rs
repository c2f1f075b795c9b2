use anyhow::Result;
use clap::Parser;
use colored::*;

use crate::{
    cli::dispatcher,
    core::events::SamplingStats,
    models::{Severity, WideEvent},
    session::ProfileSession,
};

#[derive(Parser, Debug, Default)]
#[command(
    no_binary_name = true,
    about = "Shows sampling statistics and the events kept during this run. \
             Pass another action after the options to observe it."
)]
#[command(trailing_var_arg = true)]
struct EventsArgs {
    /// Print the report as JSON.
    #[arg(long)]
    json: bool,

    /// An action to run first, e.g. `events resolve Invoke-Git`.
    #[arg(allow_hyphen_values = true)]
    action: Vec<String>,
}

pub fn handle(args: Vec<String>, session: &ProfileSession) -> Result<()> {
    let events_args = EventsArgs::try_parse_from(&args)?;
    if events_args.action.first().is_some_and(|a| a == "events") {
        return Err(anyhow::anyhow!(t!("events.error.nested")));
    }

    // Report even when the observed action fails.
    let observed = if events_args.action.is_empty() {
        Ok(())
    } else {
        dispatcher::dispatch(events_args.action, session)
    };

    let stats = session.events().sampling_stats();
    let events = session.events().events();
    if events_args.json {
        let report = serde_json::json!({ "stats": stats, "events": events });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_stats(&stats);
        print_events(&events);
    }
    observed
}

fn print_stats(stats: &SamplingStats) {
    println!("\n--- {} ---", t!("events.header.stats"));
    let rows = [
        (t!("events.label.total"), stats.total_events.to_string()),
        (t!("events.label.kept"), stats.kept_events.to_string()),
        (t!("events.label.dropped"), stats.dropped_events.to_string()),
        (t!("events.label.errors"), format!("{} / {}", stats.errors_kept, stats.error_count)),
        (t!("events.label.slow"), stats.slow_events.to_string()),
        (t!("events.label.store_failures"), stats.store_failures.to_string()),
        (t!("events.label.sample_rate"), stats.sample_rate.to_string()),
        (t!("events.label.threshold"), format!("{} ms", stats.slow_threshold_ms)),
    ];
    for (label, value) in rows {
        println!("  {:<16} {}", label.blue(), value);
    }
}

fn print_events(events: &[WideEvent]) {
    if events.is_empty() {
        println!("\n{}", t!("events.empty").dimmed());
        return;
    }
    println!("\n--- {} ---", t!("events.header.events"));
    for event in events {
        let severity = event.severity_text.to_string();
        let severity = match event.severity_text {
            Severity::Error | Severity::Fatal => severity.red(),
            Severity::Warn => severity.yellow(),
            _ => severity.normal(),
        };
        let duration = event
            .duration_ms
            .map(|ms| format!("{:.1} ms", ms))
            .unwrap_or_default();
        println!(
            "{} {:<5} {:<20} {:>10} {}",
            event.timestamp.format("%H:%M:%S%.3f").to_string().dimmed(),
            severity,
            event.event_name.cyan(),
            duration,
            format!("{:?}", event.retention_reason).dimmed()
        );
        if let Some(error) = &event.error {
            println!("      {} {}", error.kind.red(), error.message);
        }
    }
}
