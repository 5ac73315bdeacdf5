// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: CLI entry point replaying a boot manifest against loopback devhosts.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! CLI entry point for the device coordinator.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use log::{info, LevelFilter};

use devcoord::config::load_manifest;
use devcoord::loopback::replay_manifest;
use devcoord::{
    BootManifest, Coordinator, Loopback, Notification, PowerState, SuspendFlags, TopologySnapshot,
};

/// Device coordinator command-line arguments.
#[derive(Debug, Parser)]
#[command(author = "Lukas Bower", version, about = "Device lifecycle coordinator", long_about = None)]
struct Cli {
    /// Boot manifest describing composites and devices to add.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long)]
    verbose: bool,

    /// Unbind and remove the device at this topological path after boot.
    #[arg(long, value_name = "PATH")]
    remove: Vec<String>,

    /// Run a suspend sweep followed by a resume sweep after boot.
    #[arg(long)]
    suspend: bool,

    /// Print the final topology as JSON.
    #[arg(long)]
    json: bool,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let mut builder =
        env_logger::Builder::from_env(Env::default().default_filter_or(default_level.as_str()));
    builder.format_timestamp_millis();
    let _ = builder.try_init();
}

fn report_notifications(coordinator: &mut Coordinator) {
    for notification in coordinator.drain_notifications() {
        match notification {
            Notification::Added { path } => info!("[devcoordd] added {path}"),
            Notification::Removed { path } => info!("[devcoordd] removed {path}"),
            Notification::SweepFinished(report) => info!(
                "[devcoordd] {} {} completed={} failures={:?} skipped={}",
                report.kind.as_str(),
                report.id,
                report.completed.len(),
                report.failures,
                report.skipped
            ),
        }
    }
}

fn print_topology(snapshot: &TopologySnapshot, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(snapshot)?);
        return Ok(());
    }
    for device in &snapshot.devices {
        println!(
            "{:<40} {:<12} {:<10} {}",
            device.path,
            device.state.as_str(),
            device.kind,
            device.host
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let manifest = match &cli.config {
        Some(path) => load_manifest(path)
            .with_context(|| format!("failed to load manifest {}", path.display()))?,
        None => BootManifest::default(),
    };
    let mut coordinator =
        Coordinator::new(manifest.coordinator.clone()).context("failed to start coordinator")?;
    let mut hosts = Loopback::new();
    hosts.run(&mut coordinator);
    replay_manifest(&mut coordinator, &mut hosts, &manifest).context("manifest replay failed")?;
    report_notifications(&mut coordinator);

    for path in &cli.remove {
        let id = coordinator
            .lookup_path(path)
            .with_context(|| format!("cannot remove {path}"))?;
        coordinator.schedule_remove(id, true)?;
        hosts.run(&mut coordinator);
        report_notifications(&mut coordinator);
    }

    if cli.suspend {
        coordinator.suspend(SuspendFlags::SUSPEND_RAM)?;
        hosts.run(&mut coordinator);
        report_notifications(&mut coordinator);
        coordinator.resume(PowerState::D0)?;
        hosts.run(&mut coordinator);
        report_notifications(&mut coordinator);
    }

    coordinator.reap_dead();
    print_topology(&coordinator.snapshot(), cli.json)
}
