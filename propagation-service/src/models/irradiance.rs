use time::OffsetDateTime;

use super::{require_finite, ModelError, STC_IRRADIANCE};

/// Slopes closer to vertical than this make the GHI back-calculation blow up.
const MAX_SLOPE_DEG: f64 = 85.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Irradiance {
    pub ghi: f64,
    pub dni: f64,
    pub dhi: f64,
}

pub trait IrradianceEstimator: Send + Sync {
    /// Irradiance at a meter's location implied by its instantaneous output.
    fn estimate(
        &self,
        power_kw: f64,
        installed_capacity_kw: f64,
        slope_deg: f64,
        lat: f64,
        lon: f64,
        ts: OffsetDateTime,
    ) -> Result<Irradiance, ModelError>;
}

/// Scales the meter's output ratio to STC irradiance and splits it into beam
/// and diffuse parts with a fixed diffuse fraction.
#[derive(Debug, Clone)]
pub struct FixedSplitIrradianceEstimator {
    diffuse_fraction: f64,
}

impl FixedSplitIrradianceEstimator {
    pub fn new(diffuse_fraction: f64) -> Self {
        Self {
            diffuse_fraction: diffuse_fraction.clamp(0.0, 1.0),
        }
    }

    pub fn ghi(power_kw: f64, installed_capacity_kw: f64, slope_deg: f64) -> Result<f64, ModelError> {
        let power_kw = require_finite("power_kw", power_kw)?.abs();
        let capacity = require_finite("installed_capacity_kw", installed_capacity_kw)?;
        if capacity <= 0.0 {
            return Err(ModelError::InvalidInput {
                name: "installed_capacity_kw",
                value: capacity,
            });
        }
        let slope = require_finite("slope_deg", slope_deg)?;
        if slope.abs() > MAX_SLOPE_DEG {
            return Err(ModelError::InvalidInput {
                name: "slope_deg",
                value: slope,
            });
        }

        Ok(power_kw / capacity * STC_IRRADIANCE / slope.to_radians().cos())
    }
}

impl Default for FixedSplitIrradianceEstimator {
    fn default() -> Self {
        Self::new(0.3)
    }
}

impl IrradianceEstimator for FixedSplitIrradianceEstimator {
    fn estimate(
        &self,
        power_kw: f64,
        installed_capacity_kw: f64,
        slope_deg: f64,
        _lat: f64,
        _lon: f64,
        _ts: OffsetDateTime,
    ) -> Result<Irradiance, ModelError> {
        let ghi = Self::ghi(power_kw, installed_capacity_kw, slope_deg)?;
        let dhi = ghi * self.diffuse_fraction;
        Ok(Irradiance {
            ghi,
            dni: ghi - dhi,
            dhi,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use time::macros::datetime;

    const TS: OffsetDateTime = datetime!(2022-08-01 12:00:00 UTC);

    #[test]
    fn half_capacity_on_flat_roof_is_half_stc() {
        let ghi = FixedSplitIrradianceEstimator::ghi(5.0, 10.0, 0.0).unwrap();
        assert_relative_eq!(ghi, 500.0, epsilon = 1e-9);
    }

    #[test]
    fn tilt_raises_ghi_by_inverse_cosine() {
        let ghi = FixedSplitIrradianceEstimator::ghi(5.0, 10.0, 60.0).unwrap();
        assert_relative_eq!(ghi, 1000.0, epsilon = 1e-9);
    }

    #[test]
    fn sign_of_meter_power_is_ignored() {
        let est = FixedSplitIrradianceEstimator::default();
        let pos = est.estimate(4.0, 10.0, 30.0, 47.0, 8.0, TS).unwrap();
        let neg = est.estimate(-4.0, 10.0, 30.0, 47.0, 8.0, TS).unwrap();
        assert_eq!(pos, neg);
        assert!(neg.ghi > 0.0);
    }

    #[test]
    fn split_preserves_global_irradiance() {
        let est = FixedSplitIrradianceEstimator::new(0.25);
        let irr = est.estimate(8.0, 10.0, 0.0, 47.0, 8.0, TS).unwrap();
        assert_relative_eq!(irr.ghi, 800.0, epsilon = 1e-9);
        assert_relative_eq!(irr.dhi, 200.0, epsilon = 1e-9);
        assert_relative_eq!(irr.dni + irr.dhi, irr.ghi, epsilon = 1e-9);
    }

    #[test]
    fn zero_capacity_and_vertical_slope_are_rejected() {
        assert!(FixedSplitIrradianceEstimator::ghi(1.0, 0.0, 10.0).is_err());
        assert!(FixedSplitIrradianceEstimator::ghi(1.0, 10.0, 90.0).is_err());
        assert!(FixedSplitIrradianceEstimator::ghi(f64::NAN, 10.0, 10.0).is_err());
    }
}
