//! # rrs-buoy
//!
//! Control library for an unattended above-water radiometry buoy. The buoy
//! carries two hyperspectral radiometers on a shared register bus, one
//! looking at the sky and one at the water, plus a sensor head on a slew
//! ring that must keep a fixed yaw relative to the sun. This crate provides
//! everything the controller binary needs: the device gateway contracts,
//! the acquisition state machine, the solar tracking loop, and the CSV
//! record pipeline their data flows into.
//!
//! ## Crate Structure
//!
//! - **`acquisition`**: The dual-channel measurement engine. A poller per
//!   radiometer runs trigger/read cycles over the bus; a driver keeps the
//!   two channels in lockstep across repetitions.
//! - **`config`**: Layered runtime settings (defaults, TOML file, `RRS_BUOY_`
//!   environment overrides). See [`config::Settings`].
//! - **`gateway`**: Capability traits for the bridging daemon that owns the
//!   physical links: register bus, positioning receiver, inertial unit, and
//!   stepper drive. The `sim` submodule provides desk-test implementations.
//! - **`records`**: Record types, CSV sinks, and the file naming scheme for
//!   raw spectra, position, and orientation logs.
//! - **`registers`**: The radiometer register map, the fixed read plan, and
//!   payload decoding.
//! - **`shutdown`**: Cooperative cancellation shared by every long-running
//!   task.
//! - **`telemetry`**: Structured logging setup on `tracing`.
//! - **`tracking`**: Solar ephemeris, pointing geometry, and the orientation
//!   control loop.

pub mod acquisition;
pub mod config;
pub mod gateway;
pub mod records;
pub mod registers;
pub mod shutdown;
pub mod telemetry;
pub mod tracking;

pub use config::Settings;
