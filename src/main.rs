use anyhow::{Context, Result};
use clap::Parser;
use scrutinize::cli::{Cli, Command};
use scrutinize::config::Config;
use scrutinize::coordinator;
use scrutinize::output::LogReader;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

const KINDS: [&str; 7] = ["gc", "collection", "worker", "mock", "sql", "test", "fixture"];

fn dump(log: &Path, kind: Option<&str>) -> Result<()> {
    if let Some(kind) = kind {
        if !KINDS.contains(&kind) {
            anyhow::bail!(
                "Invalid value for --type: {} (expected one of {})",
                kind,
                KINDS.join(", ")
            );
        }
    }

    let mut reader =
        LogReader::open(log).with_context(|| format!("Failed to open {}", log.display()))?;
    let events = reader
        .events()
        .with_context(|| format!("Failed to decode {}", log.display()))?;

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    for event in events.iter().filter(|e| kind.map_or(true, |k| e.kind() == k)) {
        serde_json::to_writer(&mut out, event)?;
        writeln!(out)?;
    }
    out.flush()?;

    if reader.truncated() {
        eprintln!(
            "warning: {} ends in a truncated segment; {} complete events read",
            log.display(),
            events.len()
        );
    }
    Ok(())
}

fn merge(output: &Path, segments: &[PathBuf]) -> Result<()> {
    let report = coordinator::merge_files(output, segments)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    for (path, reason) in &report.skipped {
        eprintln!("warning: skipped {}: {}", path.display(), reason);
    }
    if report.recovered() > 0 {
        eprintln!(
            "warning: {} truncated segment(s) recovered up to their last complete event",
            report.recovered()
        );
    }
    println!(
        "Merged {} of {} segment(s) into {}",
        report.merged.len(),
        segments.len(),
        output.display()
    );
    Ok(())
}

fn check(path: &Path) -> Result<()> {
    let config =
        Config::load(path).with_context(|| format!("Invalid configuration {}", path.display()))?;
    println!("Output: {}", config.output_path.display());
    for name in &config.mocks {
        println!("Function: {}", name);
    }
    println!("GC: {}", if config.enable_gc { "enabled" } else { "disabled" });
    match config.sql {
        Some(mode) => println!("SQL: {:?} via {}", mode, config.sql_target),
        None => println!("SQL: disabled"),
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();

    // Initialize tracing if --debug flag is set
    init_tracing(args.debug);

    match args.command {
        Command::Dump { log, kind } => dump(&log, kind.as_deref()),
        Command::Merge { output, segments } => merge(&output, &segments),
        Command::Check { config } => check(&config),
    }
}
