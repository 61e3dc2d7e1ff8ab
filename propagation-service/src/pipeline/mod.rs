use std::{pin::Pin, time::SystemTime};

use futures::Stream;
use pv_client::domain::{MeterId, PlantId};
use time::OffsetDateTime;

#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub payload: T,
    pub received_at: SystemTime,
}

impl<T> Envelope<T> {
    pub fn now(payload: T) -> Self {
        Self {
            payload,
            received_at: SystemTime::now(),
        }
    }
}

/// One instantaneous reading from a reference meter.
///
/// `power_kw` is signed as delivered by telemetry; only its magnitude is used.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct MeasurementEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub meter_id: MeterId,
    pub power_kw: f64,
}

#[derive(thiserror::Error, Debug)]
pub enum PropagationError {
    /// Nothing to propagate from or to; the process cannot proceed.
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("unknown meter {0}")]
    UnknownMeter(MeterId),
    #[error("arity mismatch: {left} {left_name} vs {right} {right_name}")]
    ArityMismatch {
        left_name: &'static str,
        left: usize,
        right_name: &'static str,
        right: usize,
    },
    #[error("model computation failed for plant {plant_id:?}: {reason}")]
    ModelComputation {
        plant_id: Option<PlantId>,
        reason: String,
    },
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("source error: {0}")]
    Source(String),
    #[error("transform error: {0}")]
    Transform(String),
}

impl PropagationError {
    pub fn model(plant_id: Option<PlantId>, reason: impl Into<String>) -> Self {
        Self::ModelComputation {
            plant_id,
            reason: reason.into(),
        }
    }
}

impl From<pv_client::Error> for PropagationError {
    fn from(e: pv_client::Error) -> Self {
        match e {
            pv_client::Error::ArityMismatch {
                left_name,
                left,
                right_name,
                right,
            } => Self::ArityMismatch {
                left_name,
                left,
                right_name,
                right,
            },
            pv_client::Error::Database(e) => Self::Persistence(e.to_string()),
        }
    }
}

pub type EventStream<T> = Pin<Box<dyn Stream<Item = Result<Envelope<T>, PropagationError>> + Send>>;

#[async_trait::async_trait]
pub trait Source<T>: Send + Sync {
    async fn stream(&self) -> EventStream<T>;
}

#[async_trait::async_trait]
pub trait Transform<I, O>: Send + Sync {
    async fn apply(&self, input: Envelope<I>) -> Result<Envelope<O>, PropagationError>;
}
