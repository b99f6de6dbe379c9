//! Hardware gateway contract.
//!
//! Every device on the buoy hangs off a LAN-attached bridging daemon: the
//! register bus master the two heads share, the satellite positioning
//! receiver, the inertial unit, and the stepper drive. The daemon multiplexes
//! requests to the physical endpoints and pushes responses and periodic
//! notifications back asynchronously.
//!
//! The traits here are that contract, one capability per device kind:
//!
//! - [`RegisterBus`]: request/response access to bus-addressed heads
//! - [`PositionSource`]: fix polling plus a periodic fix stream
//! - [`AttitudeSource`]: a periodic orientation-sample stream
//! - [`StepperDrive`]: motion commands for the tracking motor
//!
//! Controllers only see these traits. The in-tree [`sim`] implementations
//! stand in for the daemon in tests and demo runs; a hardware-backed client
//! lives outside this crate.

pub mod sim;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

/// Identifier correlating a bus request with its response event.
///
/// Issued by the gateway per request, wrapping. Equality against the
/// expected identifier is the only operation pollers perform on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestId(pub u8);

/// Outcome code attached to every bus response.
///
/// Zero is success. Positive codes are device exceptions (`6` is the head's
/// "busy, measurement in progress"). Negative codes are transport timeouts
/// reported by the gateway itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionCode(pub i8);

impl ExceptionCode {
    /// Request completed cleanly.
    pub const OK: ExceptionCode = ExceptionCode(0);
    /// The head is still busy with the running measurement.
    pub const DEVICE_BUSY: ExceptionCode = ExceptionCode(6);
    /// The gateway gave up waiting for the device.
    pub const TIMEOUT: ExceptionCode = ExceptionCode(-1);

    /// Whether the request completed cleanly.
    pub fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// Whether the head reported measurement-in-progress.
    pub fn is_busy(self) -> bool {
        self == Self::DEVICE_BUSY
    }

    /// Whether the gateway reported a transport timeout.
    pub fn is_timeout(self) -> bool {
        self.0 < 0
    }
}

/// Asynchronous deliveries from the register bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// Acknowledgment of a single-register write.
    WriteAck {
        /// Identifier of the acknowledged request.
        request_id: RequestId,
        /// Outcome reported by the device.
        exception: ExceptionCode,
    },
    /// Payload of a holding-register read.
    ReadResponse {
        /// Identifier of the answered request.
        request_id: RequestId,
        /// Outcome reported by the device.
        exception: ExceptionCode,
        /// The register words; empty when `exception` is not ok.
        words: Vec<u16>,
    },
}

/// Failures talking to the gateway itself, as opposed to faults a device
/// reports through [`ExceptionCode`]. These end the run.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The connection to the bridging daemon dropped.
    #[error("gateway connection lost: {0}")]
    Disconnected(String),
    /// The daemon refused the request outright.
    #[error("request rejected by gateway: {0}")]
    Rejected(String),
}

/// Master-side access to one shared register bus.
///
/// Requests return immediately with the [`RequestId`] the eventual response
/// will carry; responses arrive on the per-slave event stream. Within one
/// slave the gateway answers strictly in request order.
#[async_trait]
pub trait RegisterBus: Send + Sync {
    /// Write one holding register. The ack arrives as [`BusEvent::WriteAck`].
    async fn write_single_register(
        &self,
        slave: u8,
        register: u16,
        value: u16,
    ) -> Result<RequestId, GatewayError>;

    /// Read `count` holding registers starting at `register`. The payload
    /// arrives as [`BusEvent::ReadResponse`].
    async fn read_holding_registers(
        &self,
        slave: u8,
        register: u16,
        count: u16,
    ) -> Result<RequestId, GatewayError>;

    /// Event stream for responses addressed to `slave`. Replaces any earlier
    /// subscription for the same slave; each channel poller holds exactly one.
    async fn subscribe(&self, slave: u8) -> mpsc::Receiver<BusEvent>;
}

/// Raw fix as the positioning hardware delivers it: millionths of a degree
/// with hemisphere letters, altitude in centimeters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFix {
    /// Latitude magnitude in 1e-6 degrees.
    pub latitude_udeg: u32,
    /// Hemisphere letter, `'N'` or `'S'`.
    pub ns: char,
    /// Longitude magnitude in 1e-6 degrees.
    pub longitude_udeg: u32,
    /// Hemisphere letter, `'E'` or `'W'`.
    pub ew: char,
    /// Altitude above sea level in centimeters.
    pub altitude_cm: i32,
}

/// A fix in geodetic degrees and meters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionFix {
    /// Degrees north, negative south.
    pub latitude: f64,
    /// Degrees east, negative west.
    pub longitude: f64,
    /// Meters above sea level.
    pub altitude: f64,
}

impl RawFix {
    /// Decode into signed degrees and meters. South and west magnitudes come
    /// out negative; any other hemisphere letter is read as north/east.
    pub fn decode(&self) -> PositionFix {
        let latitude = f64::from(self.latitude_udeg) / 1e6;
        let longitude = f64::from(self.longitude_udeg) / 1e6;
        PositionFix {
            latitude: if self.ns == 'S' { -latitude } else { latitude },
            longitude: if self.ew == 'W' { -longitude } else { longitude },
            altitude: f64::from(self.altitude_cm) / 100.0,
        }
    }
}

/// The satellite positioning receiver.
#[async_trait]
pub trait PositionSource: Send + Sync {
    /// Latest fix, or `None` while the receiver has no satellite lock.
    async fn current_fix(&self) -> Result<Option<RawFix>, GatewayError>;

    /// Set the periodic fix delivery interval in milliseconds; 0 disables
    /// the stream.
    async fn set_fix_period(&self, period_ms: u32) -> Result<(), GatewayError>;

    /// Stream of periodic fixes.
    fn subscribe(&self) -> broadcast::Receiver<RawFix>;
}

/// Raw orientation quaternion in the inertial unit's quantization units
/// (int16 components, 16383 per unit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawQuaternion {
    /// Scalar component.
    pub w: i16,
    /// Vector x component.
    pub x: i16,
    /// Vector y component.
    pub y: i16,
    /// Vector z component.
    pub z: i16,
}

/// The inertial orientation sensor.
#[async_trait]
pub trait AttitudeSource: Send + Sync {
    /// Set the periodic sample interval in milliseconds; 0 disables the
    /// stream.
    async fn set_sample_period(&self, period_ms: u32) -> Result<(), GatewayError>;

    /// Stream of periodic orientation samples.
    fn subscribe(&self) -> broadcast::Receiver<RawQuaternion>;
}

/// Physical step resolution of the drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    /// Full steps.
    Full,
    /// Half steps.
    Half,
    /// Quarter steps.
    Quarter,
    /// Eighth steps.
    Eighth,
    /// Sixteenth steps.
    Sixteenth,
}

/// The tracking motor.
///
/// # Contract
/// - Profile setters ([`set_motor_current`](Self::set_motor_current),
///   [`set_step_mode`](Self::set_step_mode),
///   [`set_max_velocity`](Self::set_max_velocity),
///   [`set_speed_ramping`](Self::set_speed_ramping)) are applied before
///   [`enable`](Self::enable) energizes the coils.
/// - [`drive_steps`](Self::drive_steps) starts a relative move and returns
///   without waiting for completion.
/// - [`stop`](Self::stop) decelerates using the current ramping profile;
///   [`disable`](Self::disable) de-energizes immediately, so callers stop
///   first and wait out the deceleration.
#[async_trait]
pub trait StepperDrive: Send + Sync {
    /// Set the motor phase current in milliamps.
    async fn set_motor_current(&self, milliamps: u16) -> Result<(), GatewayError>;

    /// Set the step resolution; `interpolate` enables the drive's microstep
    /// interpolation.
    async fn set_step_mode(&self, mode: StepMode, interpolate: bool) -> Result<(), GatewayError>;

    /// Set the peak velocity in steps per second.
    async fn set_max_velocity(&self, steps_per_s: u16) -> Result<(), GatewayError>;

    /// Set acceleration and deceleration in steps per second squared.
    async fn set_speed_ramping(
        &self,
        acceleration: u16,
        deceleration: u16,
    ) -> Result<(), GatewayError>;

    /// Energize the coils.
    async fn enable(&self) -> Result<(), GatewayError>;

    /// De-energize the coils.
    async fn disable(&self) -> Result<(), GatewayError>;

    /// Start a relative move of `steps` (sign is direction).
    async fn drive_steps(&self, steps: i32) -> Result<(), GatewayError>;

    /// Decelerate to standstill using the current ramping profile.
    async fn stop(&self) -> Result<(), GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_fix_decodes_hemispheres_and_units() {
        let fix = RawFix {
            latitude_udeg: 54_323_300,
            ns: 'N',
            longitude_udeg: 10_122_800,
            ew: 'E',
            altitude_cm: 134,
        };
        let decoded = fix.decode();
        assert!((decoded.latitude - 54.3233).abs() < 1e-9);
        assert!((decoded.longitude - 10.1228).abs() < 1e-9);
        assert!((decoded.altitude - 1.34).abs() < 1e-9);

        let southern = RawFix {
            ns: 'S',
            ew: 'W',
            ..fix
        };
        let decoded = southern.decode();
        assert!(decoded.latitude < 0.0);
        assert!(decoded.longitude < 0.0);
    }

    #[test]
    fn exception_codes_classify() {
        assert!(ExceptionCode::OK.is_ok());
        assert!(!ExceptionCode::OK.is_busy());
        assert!(ExceptionCode::DEVICE_BUSY.is_busy());
        assert!(!ExceptionCode::DEVICE_BUSY.is_ok());
        assert!(ExceptionCode::TIMEOUT.is_timeout());
        assert!(ExceptionCode(-3).is_timeout());
        assert!(!ExceptionCode(2).is_timeout());
    }
}
