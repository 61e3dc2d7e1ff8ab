use pv_client::domain::Plant;
use time::OffsetDateTime;

use super::{require_finite, Irradiance, ModelError, STC_IRRADIANCE};

/// Largest share of output lost by a steep, north-facing array.
const MAX_ORIENTATION_LOSS: f64 = 0.2;

pub trait PowerSimulator: Send + Sync {
    /// AC output in kW. Implementations need not clamp to capacity.
    #[allow(clippy::too_many_arguments)]
    fn simulate(
        &self,
        installed_capacity_kw: f64,
        slope_deg: f64,
        orientation_deg: f64,
        lat: f64,
        lon: f64,
        irradiance: Irradiance,
        ts: OffsetDateTime,
    ) -> Result<f64, ModelError>;
}

/// Plane-of-array irradiance (beam + isotropic diffuse) times capacity and a
/// fixed performance ratio.
///
/// `orientation_deg` is measured from south (0 = south, ±180 = north).
#[derive(Debug, Clone)]
pub struct PerformanceRatioSimulator {
    performance_ratio: f64,
}

impl PerformanceRatioSimulator {
    pub fn new(performance_ratio: f64) -> Self {
        Self { performance_ratio }
    }
}

impl Default for PerformanceRatioSimulator {
    fn default() -> Self {
        Self::new(0.85)
    }
}

impl PowerSimulator for PerformanceRatioSimulator {
    fn simulate(
        &self,
        installed_capacity_kw: f64,
        slope_deg: f64,
        orientation_deg: f64,
        _lat: f64,
        _lon: f64,
        irradiance: Irradiance,
        _ts: OffsetDateTime,
    ) -> Result<f64, ModelError> {
        let capacity = require_finite("installed_capacity_kw", installed_capacity_kw)?;
        let tilt = require_finite("slope_deg", slope_deg)?.to_radians();
        let azimuth = require_finite("orientation_deg", orientation_deg)?.to_radians();
        let dni = require_finite("dni", irradiance.dni)?;
        let dhi = require_finite("dhi", irradiance.dhi)?;

        let poa = dni * tilt.cos() + dhi * (1.0 + tilt.cos()) / 2.0;
        let orientation_loss = MAX_ORIENTATION_LOSS * tilt.sin().abs() * (1.0 - azimuth.cos()) / 2.0;

        Ok(capacity * poa / STC_IRRADIANCE * self.performance_ratio * (1.0 - orientation_loss))
    }
}

/// Simulate one plant and clamp the result to `[0, installed_capacity_kw]`.
///
/// Stateless: everything the computation needs is passed in, so it can be
/// dispatched to any worker thread.
pub fn simulate_plant(
    simulator: &dyn PowerSimulator,
    plant: &Plant,
    irradiance: Irradiance,
    ts: OffsetDateTime,
) -> Result<f64, ModelError> {
    let raw = simulator.simulate(
        plant.installed_capacity_kw,
        plant.slope_deg,
        plant.orientation_deg,
        plant.lat,
        plant.lon,
        irradiance,
        ts,
    )?;

    if !raw.is_finite() {
        return Err(ModelError::NonFiniteOutput(raw));
    }

    Ok(raw.clamp(0.0, plant.installed_capacity_kw.max(0.0)))
}
