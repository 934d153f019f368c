//! `rebind` - update class references of a snapshot store in place

mod cli;
mod logging;

use anyhow::{bail, Context, Result};
use rebind_core::{save_renames, MigrationDriver, MigrationError, MigrationReport, RulesConfig};
use rebind_store::SnapshotStore;
use std::io::{BufRead, Write};
use std::process::ExitCode;

fn main() -> ExitCode {
    let matches = cli::command().get_matches();
    let options = match cli::Options::from_matches(&matches) {
        Ok(options) => options,
        Err(err) => {
            eprintln!("error: {err:#}");
            return ExitCode::FAILURE;
        }
    };
    logging::init(options.verbosity);

    match run(&options) {
        Ok(report) => match print_report(&report, options.json) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("error: {err:#}");
                ExitCode::FAILURE
            }
        },
        Err(err) => {
            tracing::error!("Stopped processing, due to: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(options: &cli::Options) -> Result<MigrationReport> {
    if !options.file.exists() {
        bail!("no such store: {}", options.file.display());
    }
    let rules = match &options.rules {
        Some(path) => RulesConfig::load(path)?,
        None => RulesConfig::default(),
    };
    let config = options.run_config(&rules)?;
    let store = SnapshotStore::open(&options.file)
        .with_context(|| format!("cannot open {}", options.file.display()))?;

    let mut driver = MigrationDriver::from_rules(&store, &rules, config)?.with_hook(pause);
    let report = driver.run()?;

    if let Some(path) = &options.save_renames {
        save_renames(path, &driver.rewriter().rules(true, false))?;
    }
    Ok(report)
}

/// Show a fatal error and wait for the operator before the run aborts
fn pause(error: &MigrationError) {
    let mut stderr = std::io::stderr().lock();
    let _ = writeln!(stderr, "fatal error: {error:?}");
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        let _ = writeln!(stderr, "  caused by: {cause}");
        source = cause.source();
    }
    let _ = write!(stderr, "press Enter to abort the open transaction ");
    let _ = stderr.flush();
    let mut line = String::new();
    let _ = std::io::stdin().lock().read_line(&mut line);
}

fn print_report(report: &MigrationReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    let mode = if report.dry_run { " (dry run)" } else { "" };
    println!("Migration summary{mode}");
    println!("  Records scanned:     {}", report.scanned);
    println!("  Records rewritten:   {}", report.rewritten);
    println!("  Records skipped:     {}", report.skipped);
    println!("  Serialize failures:  {}", report.serialize_failures);
    println!("  Missing keys:        {}", report.missing_keys);
    println!(
        "  Transactions:        {} committed, {} aborted",
        report.committed, report.aborted
    );
    if report.format_upgraded {
        println!("  Storage format upgraded");
    }
    if !report.implicit_rules.is_empty() {
        println!("Implicit rules:");
        for (from, to) in &report.implicit_rules {
            println!("  {from} -> {to}");
        }
    }
    if !report.warnings.is_empty() {
        println!("Warnings:");
        for warning in &report.warnings {
            println!("  {warning}");
        }
    }
    Ok(())
}
