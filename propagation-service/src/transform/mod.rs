use crate::pipeline::{Envelope, MeasurementEvent, PropagationError, Transform};
use time::macros::datetime;

/// Pure validation of a `MeasurementEvent`.
///
/// Rules:
/// - power must be finite. Negative readings are accepted; the sign is a
///   telemetry artifact and is dropped downstream.
/// - ts must be within a broad sanity window [2000-01-01, 2100-01-01].
pub fn validate_measurement(
    env: Envelope<MeasurementEvent>,
) -> Result<Envelope<MeasurementEvent>, PropagationError> {
    let m = &env.payload;

    if !m.power_kw.is_finite() {
        return Err(PropagationError::Transform(format!(
            "power_kw must be finite (meter {})",
            m.meter_id
        )));
    }

    let min_ts = datetime!(2000-01-01 00:00:00 UTC);
    let max_ts = datetime!(2100-01-01 00:00:00 UTC);

    if m.ts < min_ts || m.ts > max_ts {
        return Err(PropagationError::Transform("timestamp out of allowed range".to_string()));
    }

    Ok(env)
}

#[derive(Clone, Default)]
pub struct MeasurementValidation;

#[async_trait::async_trait]
impl Transform<MeasurementEvent, MeasurementEvent> for MeasurementValidation {
    async fn apply(
        &self,
        input: Envelope<MeasurementEvent>,
    ) -> Result<Envelope<MeasurementEvent>, PropagationError> {
        match validate_measurement(input) {
            Ok(env) => Ok(env),
            Err(e) => {
                metrics::counter!("validation_measurement_rejected_total").increment(1);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn event(ts: time::OffsetDateTime, power_kw: f64) -> Envelope<MeasurementEvent> {
        Envelope::now(MeasurementEvent {
            ts,
            meter_id: 7,
            power_kw,
        })
    }

    #[test]
    fn measurement_validation_accepts_valid_record() {
        let res = validate_measurement(event(datetime!(2022-08-01 12:00:00 UTC), 3.5));
        assert!(res.is_ok());
    }

    #[test]
    fn measurement_validation_accepts_negative_power() {
        let res = validate_measurement(event(datetime!(2022-08-01 12:00:00 UTC), -3.5));
        assert!(res.is_ok());
    }

    #[test]
    fn measurement_validation_rejects_nan_power() {
        let res = validate_measurement(event(datetime!(2022-08-01 12:00:00 UTC), f64::NAN));
        assert!(matches!(res, Err(PropagationError::Transform(_))));
    }

    #[test]
    fn measurement_validation_rejects_out_of_range_ts() {
        let res = validate_measurement(event(datetime!(1800-01-01 00:00:00 UTC), 1.0));
        assert!(matches!(res, Err(PropagationError::Transform(_))));
    }
}
