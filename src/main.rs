//! Buoy controller binary.
//!
//! Three modes:
//! - `run`: paired-channel acquisition with solar tracking alongside, the
//!   normal deployment mode.
//! - `acquire`: acquisition only, for bench work on the radiometers.
//! - `track`: tracking only, runs until Ctrl+C.
//!
//! The binary wires the simulated gateway devices to the library; swapping
//! in real hardware means providing other implementations of the gateway
//! traits at the marked construction points.
//!
//! # Usage
//!
//! ```bash
//! rrs-buoy run --repetitions 6
//! rrs-buoy --config config/harbor.toml acquire
//! rrs-buoy track
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use rrs_buoy::acquisition::{
    AcquisitionDriver, AcquisitionReport, Channel, ChannelPoller, CycleError, PollProfile,
};
use rrs_buoy::config::Settings;
use rrs_buoy::gateway::sim::{SimBus, SimGps, SimImu, SimStepper};
use rrs_buoy::gateway::{AttitudeSource, PositionSource, RegisterBus, StepperDrive};
use rrs_buoy::records::{self, CsvSink};
use rrs_buoy::shutdown::{self, ShutdownController};
use rrs_buoy::tracking::{
    NoaaSolarPosition, TrackingController, TrackingError, TrackingHardware, TrackingReport,
};
use rrs_buoy::telemetry;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::{JoinError, JoinHandle};

// Desk-test position of the simulated receiver (Kiel fjord).
const SIM_LATITUDE: f64 = 54.3233;
const SIM_LONGITUDE: f64 = 10.1228;
const SIM_ALTITUDE_M: f64 = 12.0;
const SIM_SWAY_AMPLITUDE_DEG: f64 = 15.0;

#[derive(Parser)]
#[command(name = "rrs-buoy")]
#[command(about = "Radiometric buoy controller", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config/default.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire spectra with solar tracking alongside (deployment mode)
    Run {
        /// Override the configured number of repetitions
        #[arg(long)]
        repetitions: Option<u32>,

        /// Leave the head where it is; acquisition only
        #[arg(long)]
        no_rotation: bool,
    },

    /// Acquire spectra only (bench mode)
    Acquire {
        /// Override the configured number of repetitions
        #[arg(long)]
        repetitions: Option<u32>,
    },

    /// Track the sun until Ctrl+C, no acquisition
    Track,
}

#[tokio::main]
async fn main() -> Result<()> {
    println!("🚀 rrs-buoy - Radiometric Buoy Controller");
    println!();

    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("could not load configuration from {}", cli.config.display()))?;
    settings.validate().map_err(anyhow::Error::msg)?;
    telemetry::init_from_settings(&settings).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Run {
            repetitions,
            no_rotation,
        } => run_station(settings, repetitions, !no_rotation).await,
        Commands::Acquire { repetitions } => run_station(settings, repetitions, false).await,
        Commands::Track => run_tracking_only(settings).await,
    }
}

/// Acquisition run, optionally with the tracking loop alongside.
async fn run_station(
    mut settings: Settings,
    repetitions: Option<u32>,
    with_rotation: bool,
) -> Result<()> {
    if let Some(repetitions) = repetitions {
        settings.acquisition.repetitions = repetitions;
    }

    let stamp = Local::now();
    let (controller, _token) = shutdown::channel();

    println!("🔧 Connecting simulated instruments...");
    let bus: Arc<dyn RegisterBus> = Arc::new(SimBus::new());
    let driver = build_acquisition(&settings, &bus, &stamp, &controller).await?;

    let tracking = if with_rotation {
        Some(spawn_tracking(&settings, &stamp, &controller)?)
    } else {
        None
    };

    println!(
        "▶️  Starting acquisition: {} repetitions on slaves {} and {}",
        settings.acquisition.repetitions,
        settings.acquisition.downwelling_slave,
        settings.acquisition.upwelling_slave
    );
    println!();

    let mut acquisition = tokio::spawn(driver.run());
    let outcome = tokio::select! {
        joined = &mut acquisition => finish_acquisition(joined),
        _ = tokio::signal::ctrl_c() => {
            println!();
            println!("🛑 Ctrl+C received, shutting down gracefully...");
            controller.shutdown();
            finish_acquisition((&mut acquisition).await)
        }
    };

    // The tracking task owns the energized stepper; stop and join it before
    // an acquisition error is allowed to tear the runtime down.
    let report = settle_station(outcome, &controller, tracking).await?;

    println!(
        "✅ Acquisition finished: downwelling {} completed / {} dropped, upwelling {} completed / {} dropped",
        report.downwelling_completed,
        report.downwelling_dropped,
        report.upwelling_completed,
        report.upwelling_dropped
    );
    println!("👋 Done");
    Ok(())
}

/// Tracking session with no acquisition; runs until Ctrl+C.
async fn run_tracking_only(settings: Settings) -> Result<()> {
    let stamp = Local::now();
    let (controller, _token) = shutdown::channel();

    println!("🔧 Connecting simulated instruments...");
    let handle = spawn_tracking(&settings, &stamp, &controller)?;

    println!("▶️  Tracking the sun. Press Ctrl+C to stop.");
    println!();

    if let Err(error) = tokio::signal::ctrl_c().await {
        eprintln!("   Warning: Ctrl+C handler failed: {error}");
    } else {
        println!();
        println!("🛑 Ctrl+C received, shutting down gracefully...");
    }
    controller.shutdown();

    let report = finish_tracking(handle.await)?;
    print_tracking_report(&report);
    println!("👋 Done");
    Ok(())
}

/// Assemble the paired-channel driver with CSV sinks at the stamped paths.
async fn build_acquisition(
    settings: &Settings,
    bus: &Arc<dyn RegisterBus>,
    stamp: &DateTime<Local>,
    controller: &ShutdownController,
) -> Result<AcquisitionDriver> {
    let downwelling = build_poller(
        Channel::Downwelling,
        settings.acquisition.downwelling_slave,
        settings,
        bus,
        stamp,
    )
    .await?;
    let upwelling = build_poller(
        Channel::Upwelling,
        settings.acquisition.upwelling_slave,
        settings,
        bus,
        stamp,
    )
    .await?;
    Ok(AcquisitionDriver::new(
        downwelling,
        upwelling,
        settings.acquisition.repetitions,
        controller.token(),
    ))
}

async fn build_poller(
    channel: Channel,
    slave: u8,
    settings: &Settings,
    bus: &Arc<dyn RegisterBus>,
    stamp: &DateTime<Local>,
) -> Result<ChannelPoller> {
    let path = records::raw_spectrum_path(
        &settings.storage.output_dir,
        channel.file_prefix(),
        &settings.storage.station,
        stamp,
    );
    println!("   {} spectra: {}", channel, path.display());
    let sink = CsvSink::create(path)?;
    Ok(ChannelPoller::new(
        channel,
        slave,
        PollProfile::from(&settings.acquisition),
        Arc::clone(bus),
        Box::new(sink),
    )
    .await)
}

/// Assemble and spawn the tracking session on simulated devices.
fn spawn_tracking(
    settings: &Settings,
    stamp: &DateTime<Local>,
    controller: &ShutdownController,
) -> Result<JoinHandle<Result<TrackingReport, TrackingError>>> {
    let storage = &settings.storage;
    let position_path = records::position_path(&storage.output_dir, &storage.station, stamp);
    let orientation_path = records::orientation_path(&storage.output_dir, &storage.station, stamp);
    println!("   position log: {}", position_path.display());
    println!("   orientation log: {}", orientation_path.display());

    let hardware = TrackingHardware {
        position: Arc::new(SimGps::new(SIM_LATITUDE, SIM_LONGITUDE, SIM_ALTITUDE_M))
            as Arc<dyn PositionSource>,
        attitude: Arc::new(SimImu::new(SIM_SWAY_AMPLITUDE_DEG)) as Arc<dyn AttitudeSource>,
        stepper: Arc::new(SimStepper::new()) as Arc<dyn StepperDrive>,
    };

    let session = TrackingController::new(
        hardware,
        Arc::new(NoaaSolarPosition),
        settings.tracking.clone(),
        settings.stepper.clone(),
        Box::new(CsvSink::create(position_path)?),
        Box::new(CsvSink::create(orientation_path)?),
        controller.token(),
    );
    Ok(tokio::spawn(session.run()))
}

/// Stop the tracking session, then hand back the acquisition outcome.
async fn settle_station(
    outcome: Result<AcquisitionReport>,
    controller: &ShutdownController,
    tracking: Option<JoinHandle<Result<TrackingReport, TrackingError>>>,
) -> Result<AcquisitionReport> {
    controller.shutdown();
    if let Some(handle) = tracking {
        match finish_tracking(handle.await) {
            Ok(tracking_report) => print_tracking_report(&tracking_report),
            Err(error) if outcome.is_ok() => return Err(error),
            Err(error) => {
                eprintln!("   Warning: tracking shutdown encountered errors: {error:#}");
            }
        }
    }
    outcome
}

fn finish_acquisition(
    joined: Result<Result<AcquisitionReport, CycleError>, JoinError>,
) -> Result<AcquisitionReport> {
    Ok(joined??)
}

fn finish_tracking(
    joined: Result<Result<TrackingReport, TrackingError>, JoinError>,
) -> Result<TrackingReport> {
    Ok(joined??)
}

fn print_tracking_report(report: &TrackingReport) {
    println!(
        "✅ Tracking finished: {} fixes, {} attitude samples, {} corrections",
        report.position_updates, report.attitude_samples, report.corrections
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test(start_paused = true)]
    async fn acquisition_failure_still_joins_the_tracking_session() {
        let (controller, mut token) = shutdown::channel();
        let tracked = Arc::new(AtomicBool::new(false));
        let tracking = tokio::spawn({
            let tracked = Arc::clone(&tracked);
            async move {
                token.cancelled().await;
                tracked.store(true, Ordering::SeqCst);
                Ok::<_, TrackingError>(TrackingReport::default())
            }
        });

        let failure: Result<AcquisitionReport> = Err(anyhow::anyhow!("bus connection lost"));
        let result = settle_station(failure, &controller, Some(tracking)).await;

        assert!(result.is_err());
        assert!(tracked.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn tracking_failure_surfaces_after_a_clean_run() {
        let (controller, _token) = shutdown::channel();
        let tracking = tokio::spawn(async {
            Err::<TrackingReport, TrackingError>(TrackingError::Task(
                "attitude stream task aborted".into(),
            ))
        });

        let result =
            settle_station(Ok(AcquisitionReport::default()), &controller, Some(tracking)).await;

        assert!(result.is_err());
    }
}
