//! Layered runtime configuration.
//!
//! Settings merge in order: built-in defaults, then the TOML file, then
//! `RRS_BUOY_*` environment variables (`RRS_BUOY_ACQUISITION_REPETITIONS=6`
//! overrides `[acquisition] repetitions`). Every field has a default, so an
//! absent file still yields a runnable configuration.

use crate::registers::{TRIGGER_REGISTER, TRIGGER_VALUE};
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "RRS_BUOY_";

/// Complete runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application identity and logging.
    pub application: ApplicationSettings,
    /// Radiometer polling.
    pub acquisition: AcquisitionSettings,
    /// Solar tracking loop.
    pub tracking: TrackingSettings,
    /// Slew ring drivetrain.
    pub stepper: StepperSettings,
    /// Output files.
    pub storage: StorageSettings,
}

/// Application identity and logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationSettings {
    /// Name reported in logs.
    #[serde(default = "default_application_name")]
    pub name: String,
    /// Log level: trace, debug, info, warn, or error.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Radiometer polling parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionSettings {
    /// Bus address of the sky-facing sensor.
    #[serde(default = "default_downwelling_slave")]
    pub downwelling_slave: u8,
    /// Bus address of the water-facing sensor.
    #[serde(default = "default_upwelling_slave")]
    pub upwelling_slave: u8,
    /// Register written to start a measurement.
    #[serde(default = "default_trigger_register")]
    pub trigger_register: u16,
    /// Value written to start a measurement.
    #[serde(default = "default_trigger_value")]
    pub trigger_value: u16,
    /// Paired cycles in one run.
    #[serde(default = "default_repetitions")]
    pub repetitions: u32,
    /// Wait on a reply before counting the attempt as lost.
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
    /// Pause between a failed attempt and its repeat.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Requests spent on one register before the cycle is dropped.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Sensor warm-up before the first read of a run.
    #[serde(default = "default_warmup_ms")]
    pub warmup_ms: u64,
}

/// Solar tracking loop parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingSettings {
    /// Position fix delivery period.
    #[serde(default = "default_fix_period_ms")]
    pub fix_period_ms: u32,
    /// Attitude sample delivery period.
    #[serde(default = "default_attitude_period_ms")]
    pub attitude_period_ms: u32,
    /// Poll interval while waiting for the first fix.
    #[serde(default = "default_fix_wait_ms")]
    pub fix_wait_ms: u64,
    /// Heading error beyond which a correction is commanded, degrees.
    #[serde(default = "default_correction_threshold_deg")]
    pub correction_threshold_deg: f64,
    /// Fixed yaw between the inertial unit and the head, degrees.
    #[serde(default = "default_mount_offset_deg")]
    pub mount_offset_deg: f64,
}

/// Slew ring drivetrain parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepperSettings {
    /// Phase current, milliamps.
    #[serde(default = "default_motor_current_ma")]
    pub motor_current_ma: u16,
    /// Peak velocity, steps per second.
    #[serde(default = "default_max_velocity")]
    pub max_velocity: u16,
    /// Acceleration while tracking, steps per second squared.
    #[serde(default = "default_acceleration")]
    pub acceleration: u16,
    /// Deceleration while tracking, steps per second squared.
    #[serde(default = "default_deceleration")]
    pub deceleration: u16,
    /// Deceleration used when stopping for shutdown.
    #[serde(default = "default_stop_deceleration")]
    pub stop_deceleration: u16,
    /// Motor step angle at full step, degrees.
    #[serde(default = "default_step_angle_deg")]
    pub step_angle_deg: f64,
    /// Gearbox reduction on the motor shaft.
    #[serde(default = "default_gearbox_ratio")]
    pub gearbox_ratio: f64,
    /// Teeth on the slew ring.
    #[serde(default = "default_ring_teeth")]
    pub ring_teeth: f64,
    /// Teeth on the drive pinion.
    #[serde(default = "default_pinion_teeth")]
    pub pinion_teeth: f64,
}

impl StepperSettings {
    /// Worst-case deceleration time from peak velocity when stopping.
    pub fn settle_time(&self) -> Duration {
        Duration::from_secs_f64(f64::from(self.max_velocity) / f64::from(self.stop_deceleration))
    }
}

/// Output file parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Directory all output files land in.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Station name embedded in file names.
    #[serde(default = "default_station")]
    pub station: String,
}

// ===== Defaults =====

fn default_application_name() -> String {
    "rrs-buoy".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_downwelling_slave() -> u8 {
    2
}

fn default_upwelling_slave() -> u8 {
    1
}

fn default_trigger_register() -> u16 {
    TRIGGER_REGISTER
}

fn default_trigger_value() -> u16 {
    TRIGGER_VALUE
}

fn default_repetitions() -> u32 {
    24
}

fn default_reply_timeout_ms() -> u64 {
    12_000
}

fn default_retry_backoff_ms() -> u64 {
    256
}

fn default_max_attempts() -> u32 {
    8
}

fn default_warmup_ms() -> u64 {
    4_096
}

fn default_fix_period_ms() -> u32 {
    60_000
}

fn default_attitude_period_ms() -> u32 {
    400
}

fn default_fix_wait_ms() -> u64 {
    1_000
}

fn default_correction_threshold_deg() -> f64 {
    5.0
}

fn default_mount_offset_deg() -> f64 {
    -109.0
}

fn default_motor_current_ma() -> u16 {
    1580
}

fn default_max_velocity() -> u16 {
    2000
}

fn default_acceleration() -> u16 {
    500
}

fn default_deceleration() -> u16 {
    2000
}

fn default_stop_deceleration() -> u16 {
    5000
}

fn default_step_angle_deg() -> f64 {
    1.8
}

fn default_gearbox_ratio() -> f64 {
    50.0
}

fn default_ring_teeth() -> f64 {
    128.0
}

fn default_pinion_teeth() -> f64 {
    48.0
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_station() -> String {
    "buoy".to_string()
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: default_application_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            downwelling_slave: default_downwelling_slave(),
            upwelling_slave: default_upwelling_slave(),
            trigger_register: default_trigger_register(),
            trigger_value: default_trigger_value(),
            repetitions: default_repetitions(),
            reply_timeout_ms: default_reply_timeout_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_attempts: default_max_attempts(),
            warmup_ms: default_warmup_ms(),
        }
    }
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            fix_period_ms: default_fix_period_ms(),
            attitude_period_ms: default_attitude_period_ms(),
            fix_wait_ms: default_fix_wait_ms(),
            correction_threshold_deg: default_correction_threshold_deg(),
            mount_offset_deg: default_mount_offset_deg(),
        }
    }
}

impl Default for StepperSettings {
    fn default() -> Self {
        Self {
            motor_current_ma: default_motor_current_ma(),
            max_velocity: default_max_velocity(),
            acceleration: default_acceleration(),
            deceleration: default_deceleration(),
            stop_deceleration: default_stop_deceleration(),
            step_angle_deg: default_step_angle_deg(),
            gearbox_ratio: default_gearbox_ratio(),
            ring_teeth: default_ring_teeth(),
            pinion_teeth: default_pinion_teeth(),
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            station: default_station(),
        }
    }
}

impl Settings {
    /// Load from the default file location plus environment overrides.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from("config/default.toml")
    }

    /// Load from a specific TOML file plus environment overrides. A missing
    /// file is not an error; defaults fill in.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("_"))
            .extract()
    }

    /// Reject configurations that cannot run.
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(format!(
                "invalid log level '{}', expected one of {:?}",
                self.application.log_level, valid_levels
            ));
        }
        if self.acquisition.downwelling_slave == self.acquisition.upwelling_slave {
            return Err(format!(
                "both channels share slave address {}",
                self.acquisition.downwelling_slave
            ));
        }
        if self.acquisition.repetitions == 0 {
            return Err("repetitions must be at least 1".to_string());
        }
        if self.acquisition.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if self.acquisition.reply_timeout_ms == 0 {
            return Err("reply_timeout_ms must be nonzero".to_string());
        }
        if self.tracking.fix_period_ms == 0 || self.tracking.attitude_period_ms == 0 {
            return Err("tracking stream periods must be nonzero".to_string());
        }
        if self.tracking.correction_threshold_deg <= 0.0 {
            return Err("correction_threshold_deg must be positive".to_string());
        }
        if self.stepper.stop_deceleration == 0 {
            return Err("stop_deceleration must be nonzero".to_string());
        }
        if self.stepper.step_angle_deg <= 0.0
            || self.stepper.gearbox_ratio <= 0.0
            || self.stepper.pinion_teeth <= 0.0
        {
            return Err("drivetrain ratios must be positive".to_string());
        }
        if self.storage.station.is_empty() {
            return Err("station must not be empty".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.acquisition.downwelling_slave, 2);
        assert_eq!(settings.acquisition.upwelling_slave, 1);
        assert_eq!(settings.acquisition.repetitions, 24);
        assert_eq!(settings.tracking.fix_period_ms, 60_000);
        assert_eq!(settings.tracking.attitude_period_ms, 400);
        assert_eq!(settings.stepper.motor_current_ma, 1580);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let settings =
            Settings::load_from("/definitely/not/a/real/config.toml").expect("defaults apply");
        assert_eq!(settings.application.name, "rrs-buoy");
        assert_eq!(settings.acquisition.trigger_value, 1024);
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "[acquisition]\nrepetitions = 6\n\n[storage]\nstation = \"kiel-fjord\"\n"
        )
        .expect("write config");
        let settings = Settings::load_from(file.path()).expect("config should parse");
        assert_eq!(settings.acquisition.repetitions, 6);
        assert_eq!(settings.storage.station, "kiel-fjord");
        // Untouched sections keep their defaults.
        assert_eq!(settings.acquisition.max_attempts, 8);
    }

    #[test]
    fn invalid_log_level_is_rejected() {
        let mut settings = Settings::default();
        settings.application.log_level = "verbose".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn shared_slave_address_is_rejected() {
        let mut settings = Settings::default();
        settings.acquisition.upwelling_slave = settings.acquisition.downwelling_slave;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn settle_time_follows_the_stop_ramp() {
        let settings = StepperSettings::default();
        assert_eq!(settings.settle_time(), Duration::from_millis(400));
    }
}
