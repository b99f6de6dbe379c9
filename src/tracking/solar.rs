//! Solar position.
//!
//! The controller only needs the sun's azimuth at the buoy, so the seam is a
//! single-method trait. [`NoaaSolarPosition`] implements it with the NOAA
//! low-accuracy algorithm (Meeus-derived, good to well under a degree), which
//! is plenty for pointing a sensor head whose deadband is several degrees.

use crate::gateway::PositionFix;
use chrono::{DateTime, Timelike, Utc};
use thiserror::Error;

/// A fix that cannot describe a point on Earth.
#[derive(Debug, Error, PartialEq)]
pub enum EphemerisError {
    /// Latitude outside [-90, 90] degrees.
    #[error("latitude {0} out of range")]
    LatitudeOutOfRange(f64),
    /// Longitude outside [-180, 180] degrees.
    #[error("longitude {0} out of range")]
    LongitudeOutOfRange(f64),
}

/// Where the sun is, seen from a fix.
pub trait SolarEphemeris: Send + Sync {
    /// Solar azimuth in degrees clockwise from true north, in [0, 360).
    fn solar_azimuth(&self, at: DateTime<Utc>, fix: &PositionFix)
        -> Result<f64, EphemerisError>;
}

/// NOAA solar position calculator.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoaaSolarPosition;

fn julian_day(at: DateTime<Utc>) -> f64 {
    let unix = at.timestamp() as f64 + f64::from(at.timestamp_subsec_micros()) / 1e6;
    unix / 86_400.0 + 2_440_587.5
}

impl SolarEphemeris for NoaaSolarPosition {
    fn solar_azimuth(
        &self,
        at: DateTime<Utc>,
        fix: &PositionFix,
    ) -> Result<f64, EphemerisError> {
        if !(-90.0..=90.0).contains(&fix.latitude) {
            return Err(EphemerisError::LatitudeOutOfRange(fix.latitude));
        }
        if !(-180.0..=180.0).contains(&fix.longitude) {
            return Err(EphemerisError::LongitudeOutOfRange(fix.longitude));
        }

        let jc = (julian_day(at) - 2_451_545.0) / 36_525.0;

        let mean_long = (280.46646 + jc * (36000.76983 + 0.0003032 * jc)).rem_euclid(360.0);
        let mean_anom = 357.52911 + jc * (35999.05029 - 0.0001537 * jc);
        let eccentricity = 0.016708634 - jc * (0.000042037 + 0.0000001267 * jc);

        let anom_rad = mean_anom.to_radians();
        let eq_of_center = anom_rad.sin() * (1.914602 - jc * (0.004817 + 0.000014 * jc))
            + (2.0 * anom_rad).sin() * (0.019993 - 0.000101 * jc)
            + (3.0 * anom_rad).sin() * 0.000289;

        let omega_rad = (125.04 - 1934.136 * jc).to_radians();
        let apparent_long = mean_long + eq_of_center - 0.00569 - 0.00478 * omega_rad.sin();

        let mean_obliq =
            23.0 + (26.0 + (21.448 - jc * (46.815 + jc * (0.00059 - jc * 0.001813))) / 60.0) / 60.0;
        let obliq_corr = (mean_obliq + 0.00256 * omega_rad.cos()).to_radians();

        let declination = (obliq_corr.sin() * apparent_long.to_radians().sin()).asin();

        let var_y = (obliq_corr / 2.0).tan().powi(2);
        let long_rad = mean_long.to_radians();
        let eq_time_min = 4.0
            * (var_y * (2.0 * long_rad).sin() - 2.0 * eccentricity * anom_rad.sin()
                + 4.0 * eccentricity * var_y * anom_rad.sin() * (2.0 * long_rad).cos()
                - 0.5 * var_y * var_y * (4.0 * long_rad).sin()
                - 1.25 * eccentricity * eccentricity * (2.0 * anom_rad).sin())
            .to_degrees();

        let minutes = f64::from(at.hour()) * 60.0
            + f64::from(at.minute())
            + f64::from(at.second()) / 60.0;
        let true_solar_min = (minutes + eq_time_min + 4.0 * fix.longitude).rem_euclid(1440.0);
        let hour_angle = true_solar_min / 4.0 - 180.0;

        let lat_rad = fix.latitude.to_radians();
        let ha_rad = hour_angle.to_radians();
        let cos_zenith =
            lat_rad.sin() * declination.sin() + lat_rad.cos() * declination.cos() * ha_rad.cos();
        let zenith = cos_zenith.clamp(-1.0, 1.0).acos();

        let azimuth_arg = ((lat_rad.sin() * zenith.cos() - declination.sin())
            / (lat_rad.cos() * zenith.sin()))
        .clamp(-1.0, 1.0);
        let azimuth = if hour_angle > 0.0 {
            (azimuth_arg.acos().to_degrees() + 180.0).rem_euclid(360.0)
        } else {
            (540.0 - azimuth_arg.acos().to_degrees()).rem_euclid(360.0)
        };
        Ok(azimuth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fix(latitude: f64, longitude: f64) -> PositionFix {
        PositionFix {
            latitude,
            longitude,
            altitude: 0.0,
        }
    }

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn equinox_noon_sun_bears_south_at_greenwich() {
        let sun = NoaaSolarPosition;
        // True solar noon at Greenwich on the 2024 March equinox falls a few
        // minutes after 12:00 UTC.
        let azimuth = sun
            .solar_azimuth(at(2024, 3, 20, 12, 7), &fix(51.4779, 0.0))
            .unwrap();
        assert!((175.0..185.0).contains(&azimuth), "azimuth {azimuth}");
    }

    #[test]
    fn morning_sun_east_afternoon_west() {
        let sun = NoaaSolarPosition;
        let kiel = fix(54.3233, 10.1228);
        let morning = sun.solar_azimuth(at(2024, 6, 21, 6, 0), &kiel).unwrap();
        let afternoon = sun.solar_azimuth(at(2024, 6, 21, 16, 0), &kiel).unwrap();
        assert!((45.0..135.0).contains(&morning), "morning {morning}");
        assert!((225.0..315.0).contains(&afternoon), "afternoon {afternoon}");
    }

    #[test]
    fn azimuth_increases_through_the_day() {
        let sun = NoaaSolarPosition;
        let greenwich = fix(51.4779, 0.0);
        let samples: Vec<f64> = [8, 10, 12, 14]
            .into_iter()
            .map(|h| {
                sun.solar_azimuth(at(2024, 6, 21, h, 0), &greenwich)
                    .unwrap()
            })
            .collect();
        for pair in samples.windows(2) {
            assert!(pair[0] < pair[1], "samples not increasing: {samples:?}");
        }
    }

    #[test]
    fn southern_winter_noon_bears_north() {
        let sun = NoaaSolarPosition;
        let cape_town = fix(-33.9249, 18.4241);
        let azimuth = sun
            .solar_azimuth(at(2024, 6, 21, 10, 47), &cape_town)
            .unwrap();
        let from_north = azimuth.min(360.0 - azimuth);
        assert!(from_north < 8.0, "azimuth {azimuth}");
    }

    #[test]
    fn impossible_fix_is_rejected() {
        let sun = NoaaSolarPosition;
        assert_eq!(
            sun.solar_azimuth(at(2024, 1, 1, 12, 0), &fix(91.0, 0.0)),
            Err(EphemerisError::LatitudeOutOfRange(91.0))
        );
        assert_eq!(
            sun.solar_azimuth(at(2024, 1, 1, 12, 0), &fix(0.0, -200.0)),
            Err(EphemerisError::LongitudeOutOfRange(-200.0))
        );
    }
}
