mod channel;
mod client;
mod config;
mod controller;
mod database;
mod engine;
mod er;
mod error;
mod factory;
mod group;
mod operation;
mod report;
mod worker;

use crate::config::{DEFAULT_PROPERTIES_FILE, Properties};
use crate::controller::{Controller, ResourceListing, walk_resources};
use crate::database::get_db;
use crate::engine::{Engine, RunMode};
use crate::factory::FactoryRegistry;
use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use thousands::Separable;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about = "Runs groups of store operations concurrently and reports throughput", long_about = None)]
struct Cli {
    /// Execute the configured groups; without it only the summary is shown
    #[arg(long)]
    run: bool,

    /// List the resources touched by every operation
    #[arg(long)]
    list: bool,

    /// Drive writes and reads through pooled database sessions
    #[arg(long, conflicts_with = "delete")]
    db: bool,

    /// With --run, destroy every configured resource instead of running
    #[arg(long)]
    delete: bool,

    /// Properties file
    #[arg(long, default_value = DEFAULT_PROPERTIES_FILE)]
    prop: PathBuf,

    #[arg(long, value_enum, default_value = "mem")]
    store: DatabaseType,

    /// Store location for redb/sled; a temporary one is used when omitted
    #[arg(long)]
    path: Option<PathBuf>,

    /// Debug logging unless RUST_LOG is set
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
// Update database::get_db when adding new variation
pub enum DatabaseType {
    Mem,
    Redb,
    Sled,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            error!("{err:#}");
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Returns false when any group failed.
fn run(cli: Cli) -> Result<bool> {
    let props = Properties::load(&cli.prop)?;
    let mode = if cli.db { RunMode::Database } else { RunMode::Stream };
    let engine = Engine::from_properties(props, FactoryRegistry::with_builtins(), mode)?;
    let db = get_db(cli.store, cli.path.as_deref())?;

    print_summary(&cli, &engine, db.name());

    if !cli.run {
        if cli.list || cli.delete {
            print_listings(&walk_resources(&engine, db.as_ref(), false)?);
        }
        println!();
        println!("To run the test, specify the option '--run'.");
        return Ok(true);
    }

    if cli.delete {
        print_listings(&walk_resources(&engine, db.as_ref(), true)?);
        return Ok(true);
    }
    if cli.list {
        print_listings(&walk_resources(&engine, db.as_ref(), false)?);
    }

    let backend = engine.open_backend(db.clone());
    let outcomes = Controller::new(&engine, &backend, db.name()).run_all();
    backend.close();

    let failed: Vec<_> = outcomes.iter().filter(|o| o.result.is_err()).collect();
    println!();
    if failed.is_empty() {
        println!("GroupTest complete");
        return Ok(true);
    }
    for outcome in failed {
        if let Err(err) = &outcome.result {
            eprintln!("Group {} failed: {err:#}", outcome.group);
        }
    }
    Ok(false)
}

fn print_summary(cli: &Cli, engine: &Engine, product: &str) {
    let s = &engine.settings;
    println!();
    println!("Group Test{}", if cli.db { " (Database)" } else { "" });
    println!("                 Product: {product}");
    println!("         Properties File: {}", cli.prop.display());
    println!("             Results Dir: {}", s.results_dir);
    println!("          Test Run Count: {}", s.test_count);
    println!("Test Run Interval (msec): {}", s.test_interval.as_millis());
    if cli.db {
        println!("       Session Pool Size: {}", s.session_pool_size);
    }
    for set in &engine.sets {
        println!();
        println!("Concurrent Group(s): {}", set.names());
        for group in &set.groups {
            println!("  - name: {}", group.name);
            println!("    operations: {}", group.operations_str);
            if !group.er_operations.is_empty() {
                let er: Vec<_> = group.er_operations.iter().map(|o| o.name.as_str()).collect();
                println!("    er: {}", er.join(", "));
            }
            println!("    comment: {}", group.comment);
            println!("    threadCount: {}", group.thread_count);
            println!(
                "    totalInvocationCount: {}",
                group.total_invocation_count.separate_with_commas()
            );
            println!(
                "    actualTotalInvocationCount: {}",
                group.actual_total_invocation_count().separate_with_commas()
            );
        }
    }
}

fn print_listings(listings: &[ResourceListing]) {
    let mut group = "";
    for listing in listings {
        if listing.group != group {
            group = listing.group.as_str();
            println!();
            println!("{group}");
        }
        println!("  - name: {}", listing.operation);
        println!("    data: {}", listing.resource);
        match listing.entries {
            Some(n) => println!("    size: {}", n.separate_with_commas()),
            None => println!("    size: (not found)"),
        }
        if let Some(deleted) = listing.deleted {
            println!("    deleted: {deleted}");
        }
    }
}
