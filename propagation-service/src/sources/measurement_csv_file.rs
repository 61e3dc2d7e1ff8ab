use std::{fs::File, path::PathBuf, time::SystemTime};

use csv::StringRecord;
use pv_client::domain::MeterId;
use time::OffsetDateTime;

use crate::pipeline::{Envelope, EventStream, MeasurementEvent, PropagationError, Source};

/// CSV replay source for recorded meter readings.
///
/// Expected header columns (by name):
/// - ts (RFC3339 timestamp)
/// - meter_id
/// - power_kw
///
/// Rows are emitted in file order.
pub struct MeasurementCsvFileSource {
    path: PathBuf,
}

impl MeasurementCsvFileSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

fn record_to_measurement(
    record: &StringRecord,
    headers: &StringRecord,
) -> Result<MeasurementEvent, PropagationError> {
    let get = |name: &str| -> Result<&str, PropagationError> {
        headers
            .iter()
            .position(|h| h == name)
            .and_then(|idx| record.get(idx))
            .map(str::trim)
            .ok_or_else(|| PropagationError::Source(format!("missing column '{name}' in CSV record")))
    };

    let ts_str = get("ts")?;
    let ts = OffsetDateTime::parse(ts_str, &time::format_description::well_known::Rfc3339)
        .map_err(|e| PropagationError::Source(format!("invalid ts '{ts_str}': {e}")))?;

    let meter_str = get("meter_id")?;
    let meter_id: MeterId = meter_str
        .parse()
        .map_err(|e| PropagationError::Source(format!("invalid meter_id '{meter_str}': {e}")))?;

    let power_str = get("power_kw")?;
    let power_kw: f64 = power_str
        .parse()
        .map_err(|e| PropagationError::Source(format!("invalid power_kw '{power_str}': {e}")))?;

    Ok(MeasurementEvent {
        ts,
        meter_id,
        power_kw,
    })
}

#[async_trait::async_trait]
impl Source<MeasurementEvent> for MeasurementCsvFileSource {
    async fn stream(&self) -> EventStream<MeasurementEvent> {
        let path = self.path.clone();
        let s = async_stream::stream! {
            let file = match File::open(&path) {
                Ok(f) => f,
                Err(e) => {
                    yield Err(PropagationError::Source(format!("failed to open CSV file: {e}")));
                    return;
                }
            };
            let mut rdr = csv::Reader::from_reader(file);
            let headers = match rdr.headers() {
                Ok(h) => h.clone(),
                Err(e) => {
                    yield Err(PropagationError::Source(format!("failed to read CSV headers: {e}")));
                    return;
                }
            };

            // A malformed row is reported and skipped; replay continues.
            for result in rdr.records() {
                let parsed = result
                    .map_err(|e| PropagationError::Source(format!("failed to read CSV record: {e}")))
                    .and_then(|record| record_to_measurement(&record, &headers));

                match parsed {
                    Ok(event) => yield Ok(Envelope {
                        payload: event,
                        received_at: SystemTime::now(),
                    }),
                    Err(e) => {
                        metrics::counter!("measurement_csv_parse_errors_total").increment(1);
                        yield Err(e);
                    }
                }
            }
        };

        Box::pin(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::io::Write;
    use time::macros::datetime;

    #[tokio::test]
    async fn replays_rows_in_file_order_and_reports_bad_rows() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "ts,meter_id,power_kw").unwrap();
        writeln!(file, "2022-08-01T12:00:00Z,1,5.0").unwrap();
        writeln!(file, "2022-08-01T12:00:10Z,oops,5.0").unwrap();
        writeln!(file, "2022-08-01T12:00:20Z,2,-1.25").unwrap();
        file.flush().unwrap();

        let source = MeasurementCsvFileSource::new(file.path());
        let items: Vec<_> = source.stream().await.collect().await;

        assert_eq!(items.len(), 3);
        let first = items[0].as_ref().unwrap();
        assert_eq!(first.payload.ts, datetime!(2022-08-01 12:00:00 UTC));
        assert_eq!(first.payload.meter_id, 1);
        assert!(matches!(items[1], Err(PropagationError::Source(_))));
        let third = items[2].as_ref().unwrap();
        assert_eq!(third.payload.meter_id, 2);
        assert_eq!(third.payload.power_kw, -1.25);
    }

    #[tokio::test]
    async fn missing_file_yields_single_source_error() {
        let source = MeasurementCsvFileSource::new("/nonexistent/measurements.csv");
        let items: Vec<_> = source.stream().await.collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(PropagationError::Source(_))));
    }
}
