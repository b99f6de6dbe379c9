//! The tracking loop.
//!
//! Startup holds off on the motor until the receiver produces a first fix
//! and the ephemeris accepts it, then energizes the stepper and starts the
//! two streams. From there two tasks run until shutdown:
//!
//! * The position task consumes fixes, recomputes the solar target, and
//!   publishes it over a watch channel. Fixes arrive on the order of once a
//!   minute, so this task is mostly asleep.
//! * The attitude task consumes orientation samples, compares the head
//!   against the latest published target, and commands a stepper correction
//!   whenever the error leaves the deadband.
//!
//! Each task appends to its own log and flushes it before returning, writing
//! the last known fix and orientation once more so the files always end with
//! the state the buoy was left in. Teardown then decelerates the motor and
//! de-energizes it, in that order.

use super::geometry::{self, StepConversion};
use super::solar::SolarEphemeris;
use super::TrackingError;
use crate::config::{StepperSettings, TrackingSettings};
use crate::gateway::{AttitudeSource, PositionFix, PositionSource, StepMode, StepperDrive};
use crate::records::{OrientationRecord, PositionRecord, RecordSink};
use crate::shutdown::ShutdownToken;
use chrono::{Local, Utc};
use nalgebra::UnitQuaternion;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Handles to the three tracking devices.
#[derive(Clone)]
pub struct TrackingHardware {
    /// Satellite positioning receiver.
    pub position: Arc<dyn PositionSource>,
    /// Inertial orientation sensor.
    pub attitude: Arc<dyn AttitudeSource>,
    /// Stepper on the head's slew ring.
    pub stepper: Arc<dyn StepperDrive>,
}

/// Counters from a finished tracking session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackingReport {
    /// Position fixes consumed.
    pub position_updates: u64,
    /// Attitude samples consumed.
    pub attitude_samples: u64,
    /// Stepper corrections commanded.
    pub corrections: u64,
}

/// Keeps the head pointed relative to the sun until shutdown.
pub struct TrackingController {
    hardware: TrackingHardware,
    ephemeris: Arc<dyn SolarEphemeris>,
    tracking: TrackingSettings,
    stepper: StepperSettings,
    position_sink: Box<dyn RecordSink<PositionRecord>>,
    orientation_sink: Box<dyn RecordSink<OrientationRecord>>,
    shutdown: ShutdownToken,
}

impl TrackingController {
    /// Assemble a controller. Nothing is driven until [`run`](Self::run).
    pub fn new(
        hardware: TrackingHardware,
        ephemeris: Arc<dyn SolarEphemeris>,
        tracking: TrackingSettings,
        stepper: StepperSettings,
        position_sink: Box<dyn RecordSink<PositionRecord>>,
        orientation_sink: Box<dyn RecordSink<OrientationRecord>>,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            hardware,
            ephemeris,
            tracking,
            stepper,
            position_sink,
            orientation_sink,
            shutdown,
        }
    }

    /// Run the tracking session to completion.
    pub async fn run(mut self) -> Result<TrackingReport, TrackingError> {
        info!("waiting for a first position fix");
        let Some(first_fix) = self.wait_for_first_fix().await? else {
            info!("shutdown before a first fix; the motor was never touched");
            return Ok(TrackingReport::default());
        };
        info!(
            latitude = first_fix.latitude,
            longitude = first_fix.longitude,
            "first fix acquired"
        );

        let initial_azimuth = self.ephemeris.solar_azimuth(Utc::now(), &first_fix)?;
        let initial_bearing = geometry::normalize_bearing(initial_azimuth);
        let (target_tx, target_rx) = watch::channel(geometry::solar_target(initial_bearing));
        info!(
            azimuth = initial_azimuth,
            bearing = initial_bearing,
            "initial solar target set"
        );

        self.configure_stepper().await?;

        // The motor is energized from here on; every exit runs the stop
        // sequence.
        if let Err(error) = self.enable_streams().await {
            if let Err(stop_error) =
                stop_stepper(self.hardware.stepper.as_ref(), &self.stepper).await
            {
                warn!(%stop_error, "stop sequence failed during unwind");
            }
            return Err(error);
        }

        let position_task = {
            let mut fixes = self.hardware.position.subscribe();
            let ephemeris = Arc::clone(&self.ephemeris);
            let mut sink = self.position_sink;
            let mut token = self.shutdown.clone();
            let mut last_fix = first_fix;
            tokio::spawn(async move {
                let mut updates: u64 = 0;
                loop {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        received = fixes.recv() => match received {
                            Ok(raw) => {
                                let fix = raw.decode();
                                last_fix = fix;
                                updates += 1;
                                match ephemeris.solar_azimuth(Utc::now(), &fix) {
                                    Ok(azimuth) => {
                                        let bearing = geometry::normalize_bearing(azimuth);
                                        let _ = target_tx.send(geometry::solar_target(bearing));
                                        debug!(azimuth, bearing, "solar target updated");
                                    }
                                    Err(error) => warn!(%error, "fix rejected by the ephemeris"),
                                }
                                sink.append(&position_record(&fix)).await?;
                            }
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                warn!(missed, "position stream lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
                sink.append(&position_record(&last_fix)).await?;
                sink.flush().await?;
                Ok::<_, TrackingError>((sink, updates))
            })
        };

        let attitude_task = {
            let mut samples_rx = self.hardware.attitude.subscribe();
            let stepper = Arc::clone(&self.hardware.stepper);
            let mut sink = self.orientation_sink;
            let mut token = self.shutdown.clone();
            let mount_offset = geometry::yaw_rotation(self.tracking.mount_offset_deg);
            let conversion = StepConversion::from(&self.stepper);
            let threshold = self.tracking.correction_threshold_deg;
            tokio::spawn(async move {
                let mut samples: u64 = 0;
                let mut corrections: u64 = 0;
                let mut last_head = None;
                loop {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        received = samples_rx.recv() => match received {
                            Ok(raw) => {
                                samples += 1;
                                let head = geometry::head_orientation(raw, &mount_offset);
                                last_head = Some(head);
                                let target = *target_rx.borrow();
                                let error_deg = geometry::heading_error(&head, &target);
                                if let Some(steps) =
                                    geometry::correction_steps(error_deg, threshold, &conversion)
                                {
                                    stepper.drive_steps(steps).await?;
                                    corrections += 1;
                                    info!(error_deg, steps, "heading corrected");
                                }
                                sink.append(&orientation_record(&head)).await?;
                            }
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                warn!(missed, "attitude stream lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
                if let Some(head) = last_head {
                    sink.append(&orientation_record(&head)).await?;
                }
                sink.flush().await?;
                Ok::<_, TrackingError>((sink, samples, corrections))
            })
        };

        let (position_joined, attitude_joined) = tokio::join!(position_task, attitude_task);

        if let Err(error) = self.hardware.position.set_fix_period(0).await {
            warn!(%error, "could not stop the fix stream");
        }
        if let Err(error) = self.hardware.attitude.set_sample_period(0).await {
            warn!(%error, "could not stop the attitude stream");
        }

        // Safe the motor even when one of the tasks came back with an error.
        let stop_result = stop_stepper(self.hardware.stepper.as_ref(), &self.stepper).await;

        let (_position_sink, position_updates) =
            position_joined.map_err(|e| TrackingError::Task(e.to_string()))??;
        let (_orientation_sink, attitude_samples, corrections) =
            attitude_joined.map_err(|e| TrackingError::Task(e.to_string()))??;
        stop_result?;

        info!(
            position_updates,
            attitude_samples, corrections, "tracking session finished"
        );
        Ok(TrackingReport {
            position_updates,
            attitude_samples,
            corrections,
        })
    }

    /// Poll for a usable fix. `None` means shutdown arrived first.
    async fn wait_for_first_fix(&mut self) -> Result<Option<PositionFix>, TrackingError> {
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(None);
            }
            if let Some(raw) = self.hardware.position.current_fix().await? {
                return Ok(Some(raw.decode()));
            }
            debug!("no fix yet");
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(None),
                _ = sleep(Duration::from_millis(self.tracking.fix_wait_ms)) => {}
            }
        }
    }

    async fn configure_stepper(&self) -> Result<(), TrackingError> {
        let drive = &self.hardware.stepper;
        drive.set_motor_current(self.stepper.motor_current_ma).await?;
        drive.set_step_mode(StepMode::Full, false).await?;
        drive.set_max_velocity(self.stepper.max_velocity).await?;
        drive
            .set_speed_ramping(self.stepper.acceleration, self.stepper.deceleration)
            .await?;
        drive.enable().await?;
        info!(
            current_ma = self.stepper.motor_current_ma,
            max_velocity = self.stepper.max_velocity,
            "stepper configured and energized"
        );
        Ok(())
    }

    async fn enable_streams(&self) -> Result<(), TrackingError> {
        self.hardware
            .position
            .set_fix_period(self.tracking.fix_period_ms)
            .await?;
        self.hardware
            .attitude
            .set_sample_period(self.tracking.attitude_period_ms)
            .await?;
        Ok(())
    }
}

/// Decelerate to a standstill, wait out the ramp, then de-energize.
async fn stop_stepper(
    drive: &dyn StepperDrive,
    settings: &StepperSettings,
) -> Result<(), TrackingError> {
    if let Err(error) = drive.stop().await {
        warn!(%error, "stop command failed");
    }
    if let Err(error) = drive
        .set_speed_ramping(settings.acceleration, settings.stop_deceleration)
        .await
    {
        warn!(%error, "could not raise the stopping deceleration");
    }
    sleep(settings.settle_time()).await;
    drive.disable().await?;
    info!("stepper stopped and de-energized");
    Ok(())
}

fn position_record(fix: &PositionFix) -> PositionRecord {
    PositionRecord {
        date_time: Local::now(),
        latitude: fix.latitude,
        longitude: fix.longitude,
        altitude: fix.altitude,
    }
}

fn orientation_record(head: &UnitQuaternion<f64>) -> OrientationRecord {
    let q = head.quaternion();
    OrientationRecord {
        date_time: Local::now(),
        x: q.i,
        y: q.j,
        z: q.k,
        w: q.w,
    }
}
