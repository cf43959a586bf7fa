// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dd_proc_telemetry::config::load_config;
use dd_proc_telemetry::procfs::ProcfsFactory;
use dd_proc_telemetry::{Arbiter, ProcessTree};
use log::{error, info};
use simple_logger::SimpleLogger;

#[derive(Parser, Debug)]
#[command(name = "proctree")]
#[command(about = "Samples a process and its children and prints the summed usage as JSON", long_about = None)]
struct Args {
    /// Root process ID
    #[arg(short, long)]
    pid: i32,

    /// Seconds between samples
    #[arg(short, long, default_value_t = 10)]
    interval: u64,

    /// Stop after this many samples
    #[arg(short = 'n', long)]
    count: Option<u64>,

    /// Path to the process telemetry config file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[allow(clippy::print_stdout)]
fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;
    SimpleLogger::new()
        .with_level(config.log_level())
        .init()
        .context("Failed to initialize logger")?;
    info!("Log level set to: {:?}", config.log_level());

    let arbiter = Arc::new(Arbiter::open(
        ProcfsFactory::default(),
        config.arbiter_config(),
    ));
    let tree = ProcessTree::new(args.pid, &arbiter, config.snapshot_config());
    let interval = Duration::from_secs(args.interval);

    let mut samples = 0;
    loop {
        match tree.refresh() {
            Ok(view) => match serde_json::to_string(&view) {
                Ok(json) => println!("{json}"),
                Err(e) => error!("Error serializing aggregate: {e}"),
            },
            // Retried on the next cycle.
            Err(e) => error!("Failed to sample process tree of {}: {e}", args.pid),
        }
        samples += 1;

        if tree.root().is_dead() {
            info!("Process {} exited", args.pid);
            break;
        }
        if args.count.is_some_and(|count| samples >= count) {
            break;
        }

        let forgotten = tree.forget_dead_children().unwrap_or_else(|e| {
            error!("Failed to prune children of {}: {e}", args.pid);
            Vec::new()
        });
        if !forgotten.is_empty() {
            info!("Stopped tracking exited children {forgotten:?}");
        }

        thread::sleep(interval);
    }

    info!("{}", serde_json::to_string(&arbiter.stats())?);
    arbiter.close();
    Ok(())
}
