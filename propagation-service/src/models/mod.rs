//! Numerical collaborators of the propagation engine.
//!
//! Both contracts are deterministic pure functions of their inputs. The
//! bundled implementations are deliberately simple reference models; swap in a
//! full decomposition / module-chain model by implementing the traits.

pub mod irradiance;
pub mod simulator;

pub use irradiance::{FixedSplitIrradianceEstimator, Irradiance, IrradianceEstimator};
pub use simulator::{simulate_plant, PerformanceRatioSimulator, PowerSimulator};

/// Irradiance at standard test conditions, W/m².
pub const STC_IRRADIANCE: f64 = 1000.0;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("invalid input {name}={value}")]
    InvalidInput { name: &'static str, value: f64 },
    #[error("non-finite model output: {0}")]
    NonFiniteOutput(f64),
}

pub(crate) fn require_finite(name: &'static str, value: f64) -> Result<f64, ModelError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ModelError::InvalidInput { name, value })
    }
}
