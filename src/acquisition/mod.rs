//! Dual-channel spectrum acquisition.
//!
//! One radiometer looks up (downwelling irradiance), one looks down
//! (upwelling radiance). Each is polled by its own [`ChannelPoller`] over a
//! shared register bus; the [`AcquisitionDriver`] runs the two pollers in
//! lockstep, one paired cycle per repetition, so the instruments integrate
//! over the same stretch of sky and water.
//!
//! ## Failure policy
//!
//! Faults local to one cycle (exhausted retries, a malformed payload) drop
//! that cycle and the run continues. Faults that mean no future cycle can
//! succeed (gateway gone, event stream closed, sink unwritable) abort the
//! run as [`CycleError`].

mod driver;
mod poller;

pub use driver::{AcquisitionDriver, AcquisitionReport};
pub use poller::{ChannelPoller, CycleOutcome, PollProfile};

use crate::gateway::GatewayError;
use crate::records::SinkError;
use crate::registers::DecodeError;
use std::fmt;
use thiserror::Error;

/// The two radiometer channels on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Sky-facing irradiance sensor.
    Downwelling,
    /// Water-facing radiance sensor.
    Upwelling,
}

impl Channel {
    /// Prefix for raw spectrum file names.
    pub fn file_prefix(self) -> &'static str {
        match self {
            Channel::Downwelling => "Es",
            Channel::Upwelling => "Lw",
        }
    }

    /// Lowercase name for logs.
    pub fn name(self) -> &'static str {
        match self {
            Channel::Downwelling => "downwelling",
            Channel::Upwelling => "upwelling",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a single cycle was abandoned. The run keeps going.
#[derive(Debug, Error, PartialEq)]
pub enum DropReason {
    /// A register kept faulting until the retry budget ran out.
    #[error("register {address} still faulting after {attempts} attempts")]
    RetriesExhausted {
        /// Register the poller gave up on.
        address: u16,
        /// Requests spent on it.
        attempts: u32,
    },
    /// The device answered, but the payload does not decode.
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// A fault no retry can clear. The run stops.
#[derive(Debug, Error)]
pub enum CycleError {
    /// The bridging daemon refused or lost a request.
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    /// The output file could not be written.
    #[error(transparent)]
    Sink(#[from] SinkError),
    /// The bus event stream ended while a cycle was in flight.
    #[error("bus event stream closed")]
    EventStreamClosed,
    /// A channel task aborted instead of returning.
    #[error("channel task failed: {0}")]
    ChannelTask(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_identities() {
        assert_eq!(Channel::Downwelling.file_prefix(), "Es");
        assert_eq!(Channel::Upwelling.file_prefix(), "Lw");
        assert_eq!(Channel::Downwelling.to_string(), "downwelling");
        assert_eq!(Channel::Upwelling.to_string(), "upwelling");
    }

    #[test]
    fn drop_reason_messages() {
        let reason = DropReason::RetriesExhausted {
            address: 2006,
            attempts: 8,
        };
        assert_eq!(
            reason.to_string(),
            "register 2006 still faulting after 8 attempts"
        );
    }
}
