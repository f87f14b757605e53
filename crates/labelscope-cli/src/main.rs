//! # labelscope
//!
//! Command-line companion for labelscope: replays scheduler traces against
//! a fresh registry and decodes the labels a live process has published.

#![deny(unsafe_code)]

mod inspect;
mod replay;

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use labelscope_runtime::{HostCapabilities, Registry};
use labelscope_settings::LabelscopeSettings;
use tracing::debug;

use crate::inspect::{Entry, Inspection, inspect, parse_addr};
use crate::replay::{ReplayReport, parse_trace, replay};

/// Execution-context label tooling.
#[derive(Parser, Debug)]
#[command(name = "labelscope", about = "Replay and inspect execution-context labels")]
struct Cli {
    /// Settings file to use instead of `~/.labelscope/settings.json`.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Feed a JSON-lines scheduler trace into a fresh registry.
    Replay {
        /// Trace file, one op per line.
        trace: PathBuf,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Decode the label surface of a running process.
    Inspect(InspectArgs),
}

#[derive(Args, Debug)]
#[command(group = clap::ArgGroup::new("entry").required(true))]
struct InspectArgs {
    /// Target process id.
    #[arg(long)]
    pid: u32,

    /// Address of the surface header.
    #[arg(long, group = "entry", value_parser = parse_addr)]
    header: Option<u64>,

    /// Address of the `labelscope_anchor` symbol.
    #[arg(long, group = "entry", value_parser = parse_addr)]
    anchor: Option<u64>,

    /// Only print this context's labels.
    #[arg(long)]
    context: Option<u64>,

    /// Print the result as JSON.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(cli.settings.as_deref())?;
    if settings.logging.json {
        labelscope_core::logging::init_json_subscriber(&settings.logging.level);
    } else {
        labelscope_core::logging::init_subscriber(&settings.logging.level);
    }

    match cli.command {
        Command::Replay { trace, json } => run_replay(&settings, &trace, json),
        Command::Inspect(args) => run_inspect(&args),
    }
}

fn load_settings(path: Option<&std::path::Path>) -> Result<LabelscopeSettings> {
    let settings = match path {
        Some(path) if !path.exists() => {
            anyhow::bail!("Settings file not found: {}", path.display())
        }
        Some(path) => labelscope_settings::load_settings_from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => labelscope_settings::get_settings().clone(),
    };
    Ok(settings)
}

fn run_replay(settings: &LabelscopeSettings, trace: &std::path::Path, json: bool) -> Result<()> {
    let file = File::open(trace)
        .with_context(|| format!("Failed to open trace: {}", trace.display()))?;
    let ops = parse_trace(BufReader::new(file))?;
    debug!(ops = ops.len(), trace = %trace.display(), "replaying trace");

    let registry = Registry::from_settings(settings);
    let _ = registry.bind_host(HostCapabilities::full());
    let report = replay(&registry, &ops)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", render_report(&report));
    }
    Ok(())
}

fn render_report(report: &ReplayReport) -> String {
    use std::fmt::Write as _;

    let mut out = String::new();
    for printed in &report.printed {
        let _ = writeln!(out, "print {} {}", printed.context, printed.labels);
    }
    for snapshot in &report.contexts {
        let parent = snapshot
            .parent
            .map_or_else(|| "-".to_string(), |p| p.to_string());
        let published = if snapshot.published { "" } else { " (unpublished)" };
        let _ = writeln!(
            out,
            "{} parent={parent}{published} {}",
            snapshot.context, snapshot.labels
        );
    }
    let stats = &report.stats;
    let _ = writeln!(
        out,
        "live={} created={} destroyed={} stale={} orphaned={} unpublished={}",
        stats.live, stats.created, stats.destroyed, stats.stale_events, stats.orphaned, stats.unpublished
    );
    out
}

#[cfg(target_os = "linux")]
fn run_inspect(args: &InspectArgs) -> Result<()> {
    let entry = match (args.header, args.anchor) {
        (Some(addr), _) => Entry::Header(addr),
        (None, Some(addr)) => Entry::Anchor(addr),
        (None, None) => anyhow::bail!("one of --header or --anchor is required"),
    };
    let mem = labelscope_runtime::ProcMemory::open(args.pid)
        .with_context(|| format!("Failed to open memory of pid {}", args.pid))?;
    let found = inspect(mem, entry, args.context)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&found)?);
        return Ok(());
    }
    match found {
        Inspection::Context { context, labels } => {
            println!("{context}");
            for label in labels {
                println!("  {}={}", label.key, label.value);
            }
        }
        Inspection::Overview {
            header,
            live,
            current,
            contexts,
        } => {
            println!("header={header:#x} live={live}");
            match current.context {
                Some(ctx) => println!("current {ctx}"),
                None => println!("current -"),
            }
            for label in &current.labels {
                println!("  {}={}", label.key, label.value);
            }
            let ids: Vec<String> = contexts.iter().map(ToString::to_string).collect();
            println!("contexts {}", ids.join(" "));
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn run_inspect(_args: &InspectArgs) -> Result<()> {
    anyhow::bail!("inspect reads /proc/<pid>/mem and is only available on Linux")
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::io::Write;

    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn inspect_requires_an_entry_address() {
        let err = Cli::try_parse_from(["labelscope", "inspect", "--pid", "1"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);

        let cli = Cli::try_parse_from(["labelscope", "inspect", "--pid", "1", "--anchor", "0x1000"]).unwrap();
        let Command::Inspect(args) = cli.command else {
            panic!("expected inspect");
        };
        assert_eq!(args.anchor, Some(0x1000));
        assert_eq!(args.header, None);
    }

    #[test]
    fn settings_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"registry": {{"capacity": 64}}}}"#).unwrap();
        let settings = load_settings(Some(file.path())).unwrap();
        assert_eq!(settings.registry.capacity, 64);
        assert!(load_settings(Some(std::path::Path::new("/nonexistent/labelscope.json"))).is_err());
    }

    #[test]
    fn replay_report_renders_contexts_and_stats() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"op":"create","child":2,"trigger":1,"labels":[["job","ingest"]]}}"#).unwrap();
        writeln!(file, r#"{{"op":"before","ctx":2}}"#).unwrap();
        writeln!(file, r#"{{"op":"print"}}"#).unwrap();
        writeln!(file, r#"{{"op":"after","ctx":2}}"#).unwrap();

        let ops = parse_trace(BufReader::new(File::open(file.path()).unwrap())).unwrap();
        let registry = Registry::new(labelscope_runtime::RegistryConfig::default());
        let _ = registry.bind_host(HostCapabilities::full());
        let report = replay(&registry, &ops).unwrap();

        let rendered = render_report(&report);
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(
            lines,
            [
                "print ctx#2 {job=\"ingest\"}",
                "ctx#1 parent=- {}",
                "ctx#2 parent=ctx#1 {job=\"ingest\"}",
                "live=2 created=1 destroyed=0 stale=0 orphaned=0 unpublished=0",
            ]
        );
    }
}
