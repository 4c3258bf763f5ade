//! spraid Rebuild Simulator
//!
//! Runs a dual-controller array through a rebuild scenario and prints every
//! milestone the registered consumers received, one JSON object per line.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use futures::future::join_all;
use spraid_core::{ControllerId, DriveId, RaidGroupId, RaidType};
use spraid_rebuild::{
    DualController, EventMask, NotificationEmitter, NotificationError, NotificationEvent,
    NotificationKind, PauseAtCheckpoint, RebuildConfig, RegistrationHandle,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Scenario {
    /// One drive replaced and rebuilt on the primary
    Single,
    /// Primary dies mid-rebuild; the peer finishes it
    Failover,
    /// Both controllers crash mid-rebuild and resume from durable state
    ArrayCrash,
    /// Two positions of a RAID 6 group rebuild side by side
    Parallel,
}

#[derive(Parser)]
#[command(name = "spraid-rebuild")]
#[command(about = "Dual-controller rebuild checkpoint simulator")]
struct Cli {
    /// Scenario to run
    #[arg(value_enum, default_value = "single")]
    scenario: Scenario,

    /// TOML configuration file
    #[arg(short, long, env = "SPRAID_CONFIG")]
    config: Option<PathBuf>,

    /// Sled directory for checkpoints (overrides the config file)
    #[arg(long)]
    persistence_path: Option<PathBuf>,

    /// Pending events kept per consumer (overrides the config file)
    #[arg(long)]
    queue_depth: Option<usize>,

    /// How long a consumer waits for the next milestone (overrides the config file)
    #[arg(long)]
    notify_timeout_ms: Option<u64>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: Level,
}

const RAID_GROUP: RaidGroupId = RaidGroupId(1);
const EXTENT: u64 = 0x10000;

fn drives(width: u64) -> Vec<DriveId> {
    (0..width).map(|i| DriveId(0x1000 + i)).collect()
}

fn replacement(position: usize) -> DriveId {
    DriveId(0x2000 + position as u64)
}

/// Positions whose drive the scenario swaps
fn rebuilt_positions(scenario: Scenario) -> &'static [usize] {
    match scenario {
        Scenario::Parallel => &[1, 2],
        _ => &[2],
    }
}

/// Collect milestones for one drive until its End, or until a wait times out
async fn consume(
    emitter: Arc<NotificationEmitter>,
    handle: RegistrationHandle,
) -> anyhow::Result<Vec<NotificationEvent>> {
    let mut events = Vec::new();
    loop {
        match emitter.wait_default(handle).await {
            Ok(event) => {
                let end = event.kind == NotificationKind::End;
                events.push(event);
                if end {
                    emitter.unregister(handle);
                    return Ok(events);
                }
            }
            Err(NotificationError::Timeout(after)) => {
                warn!(?after, "Consumer timed out before End");
                return Ok(events);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn run_scenario(array: &DualController, scenario: Scenario) -> anyhow::Result<()> {
    match scenario {
        Scenario::Single => {
            array.remove_drive(RAID_GROUP, 2)?;
            array.insert_drive(RAID_GROUP, 2, replacement(2))?;
            let report = array.pump_until_stalled(RAID_GROUP)?;
            info!(chunks = report.chunks, "Rebuild finished");
        }
        Scenario::Failover => {
            array.add_pause_hook(
                ControllerId::A,
                RAID_GROUP,
                Arc::new(PauseAtCheckpoint::from_percent(EXTENT, 50)?),
            )?;
            array.remove_drive(RAID_GROUP, 2)?;
            array.insert_drive(RAID_GROUP, 2, replacement(2))?;
            let report = array.pump_until_stalled(RAID_GROUP)?;
            info!(
                paused = ?report.paused,
                checkpoint = %array.checkpoint(RAID_GROUP, 2)?,
                "Primary held at pause point"
            );

            // The hook lives only on the primary's instance and dies with it
            array.fail_controller(ControllerId::A)?;
            let report = array.pump_until_stalled(RAID_GROUP)?;
            info!(
                chunks = report.chunks,
                owner = %array.owner(RAID_GROUP)?,
                "Peer finished rebuild"
            );
            array.boot_controller(ControllerId::A)?;
        }
        Scenario::ArrayCrash => {
            let hook = array.add_pause_hook(
                ControllerId::A,
                RAID_GROUP,
                Arc::new(PauseAtCheckpoint::from_percent(EXTENT, 30)?),
            )?;
            array.remove_drive(RAID_GROUP, 2)?;
            array.insert_drive(RAID_GROUP, 2, replacement(2))?;
            array.pump_until_stalled(RAID_GROUP)?;
            array.remove_pause_hook(ControllerId::A, RAID_GROUP, hook)?;

            array.crash_all();
            let records = array.boot_all()?;
            info!(?records, checkpoint = %array.checkpoint(RAID_GROUP, 2)?, "Array recovered");
            let report = array.pump_until_stalled(RAID_GROUP)?;
            info!(chunks = report.chunks, "Rebuild resumed and finished");
        }
        Scenario::Parallel => {
            for &position in rebuilt_positions(scenario) {
                array.remove_drive(RAID_GROUP, position)?;
            }
            for &position in rebuilt_positions(scenario) {
                array.insert_drive(RAID_GROUP, position, replacement(position))?;
            }
            let report = array.pump_until_stalled(RAID_GROUP)?;
            info!(
                completed = ?report.completed,
                chunks = report.chunks,
                "Parallel rebuild finished"
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --log-level when set
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &cli.config {
        Some(path) => RebuildConfig::from_file(path)?,
        None => RebuildConfig::default(),
    }
    .with_env_overrides()?;
    if let Some(path) = cli.persistence_path {
        config.persistence_path = Some(path);
    }
    if let Some(depth) = cli.queue_depth {
        config.notification_queue_depth = depth;
    }
    if let Some(ms) = cli.notify_timeout_ms {
        config.notification_timeout_ms = ms;
    }
    config.validate()?;

    spraid_rebuild::metrics::init_metrics();

    let (raid_type, width) = match cli.scenario {
        Scenario::Parallel => (RaidType::Raid6, 6),
        _ => (RaidType::Raid5, 5),
    };
    let array = Arc::new(DualController::new(config).context("Failed to open array")?);
    array.create_raid_group(RAID_GROUP, raid_type, EXTENT, &drives(width))?;

    info!(scenario = ?cli.scenario, ?raid_type, width, "Starting scenario");

    let mut consumers = Vec::new();
    for &position in rebuilt_positions(cli.scenario) {
        let handle = array
            .emitter()
            .register(replacement(position), EventMask::ALL)?;
        consumers.push(consume(array.emitter().clone(), handle));
    }
    let consumers = tokio::spawn(join_all(consumers));

    let runner = array.clone();
    let scenario = cli.scenario;
    tokio::task::spawn_blocking(move || run_scenario(&runner, scenario)).await??;

    let stats = array.backend().stats()?;
    info!(
        records = stats.record_count,
        writes = stats.writes,
        stale = stats.stale_rejections,
        bytes_on_disk = stats.bytes_on_disk,
        "Checkpoint storage"
    );

    let mut events: Vec<NotificationEvent> = Vec::new();
    for result in consumers.await? {
        match result {
            Ok(received) => events.extend(received),
            Err(e) => warn!(error = %e, "Consumer failed"),
        }
    }

    for event in &events {
        println!("{}", serde_json::to_string(event)?);
    }
    info!(events = events.len(), "Scenario complete");
    Ok(())
}
