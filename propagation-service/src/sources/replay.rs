use futures::stream;

use crate::pipeline::{Envelope, EventStream, MeasurementEvent, PropagationError, Source};

/// Replays a fixed list of events in order.
#[derive(Debug, Clone, Default)]
pub struct ReplaySource {
    events: Vec<MeasurementEvent>,
}

impl ReplaySource {
    pub fn new(events: Vec<MeasurementEvent>) -> Self {
        Self { events }
    }
}

#[async_trait::async_trait]
impl Source<MeasurementEvent> for ReplaySource {
    async fn stream(&self) -> EventStream<MeasurementEvent> {
        let items: Vec<Result<Envelope<MeasurementEvent>, PropagationError>> = self.events.iter().cloned().map(|e| Ok(Envelope::now(e))).collect();
        Box::pin(stream::iter(items))
    }
}
