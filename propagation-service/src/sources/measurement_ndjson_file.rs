use std::{path::PathBuf, time::SystemTime};

use async_stream::stream;
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, BufReader},
};

use crate::pipeline::{Envelope, EventStream, MeasurementEvent, PropagationError, Source};

/// NDJSON replay source.
///
/// Each line is a JSON object with the same shape as the HTTP push payload
/// (`ts`, `meter_id`, `power_kw`).
pub struct MeasurementNdjsonFileSource {
    path: PathBuf,
}

impl MeasurementNdjsonFileSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl Source<MeasurementEvent> for MeasurementNdjsonFileSource {
    async fn stream(&self) -> EventStream<MeasurementEvent> {
        let path = self.path.clone();
        let s = stream! {
            let file = match File::open(&path).await {
                Ok(f) => f,
                Err(e) => {
                    yield Err(PropagationError::Source(format!("failed to open ndjson file: {e}")));
                    return;
                }
            };
            let mut lines = BufReader::new(file).lines();

            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(PropagationError::Source(format!("failed to read ndjson line: {e}")));
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }

                match serde_json::from_str::<MeasurementEvent>(&line) {
                    Ok(event) => yield Ok(Envelope {
                        payload: event,
                        received_at: SystemTime::now(),
                    }),
                    Err(e) => {
                        metrics::counter!("measurement_ndjson_parse_errors_total").increment(1);
                        yield Err(PropagationError::Source(format!("failed to parse ndjson line: {e}")));
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

    #[tokio::test]
    async fn parses_lines_and_skips_blank_ones() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"ts":"2022-08-01T12:00:00Z","meter_id":3,"power_kw":2.5}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"ts":"2022-08-01T12:00:05Z","meter_id":4,"power_kw":-0.5}}"#).unwrap();
        writeln!(file, "not json").unwrap();
        file.flush().unwrap();

        let source = MeasurementNdjsonFileSource::new(file.path());
        let items: Vec<_> = source.stream().await.collect().await;

        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_ref().unwrap().payload.meter_id, 3);
        assert_eq!(items[1].as_ref().unwrap().payload.power_kw, -0.5);
        assert!(items[2].is_err());
    }
}
