pub mod api;
pub mod assignment;
pub mod config;
pub mod directory;
pub mod engine;
pub mod geodesy;
pub mod ingest;
pub mod metrics_server;
pub mod models;
pub mod observability;
pub mod pipeline;
pub mod sinks;
pub mod sources;
pub mod store;
pub mod transform;

pub use pipeline::{Envelope, MeasurementEvent, PropagationError};
