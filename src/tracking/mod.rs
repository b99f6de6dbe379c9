//! Solar-relative orientation control.
//!
//! The head must keep a fixed yaw relative to the sun so neither radiometer
//! stares at glint or the buoy's own shadow. The controller fuses three
//! inputs: position fixes (slow), attitude samples (fast), and the solar
//! ephemeris, and trims the head with a stepper on a slew ring whenever the
//! heading error leaves the deadband.

pub mod controller;
pub mod geometry;
pub mod solar;

pub use controller::{TrackingController, TrackingHardware, TrackingReport};
pub use solar::{EphemerisError, NoaaSolarPosition, SolarEphemeris};

use crate::gateway::GatewayError;
use crate::records::SinkError;
use thiserror::Error;

/// A fault that ends the tracking loop.
#[derive(Debug, Error)]
pub enum TrackingError {
    /// The bridging daemon refused or lost a request.
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    /// A log file could not be written.
    #[error(transparent)]
    Sink(#[from] SinkError),
    /// The startup fix cannot be used at all.
    #[error(transparent)]
    Ephemeris(#[from] EphemerisError),
    /// A stream task aborted instead of returning.
    #[error("tracking task failed: {0}")]
    Task(String),
}
