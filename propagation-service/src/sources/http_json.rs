use std::{net::SocketAddr, sync::Arc};

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::pipeline::{Envelope, EventStream, MeasurementEvent, PropagationError, Source};

#[derive(Clone)]
struct SharedSender {
    tx: mpsc::Sender<Envelope<MeasurementEvent>>,
}

/// Push endpoint for live meter readings: `POST /ingest/measurements` with a
/// JSON array of `{ts, meter_id, power_kw}`.
#[derive(Clone)]
pub struct HttpJsonSource {
    receiver: Arc<tokio::sync::Mutex<Option<mpsc::Receiver<Envelope<MeasurementEvent>>>>>,
}

impl HttpJsonSource {
    pub async fn new(bind_addr: &str, channel_capacity: usize) -> Result<Self, PropagationError> {
        let addr: SocketAddr = bind_addr
            .parse()
            .map_err(|e| PropagationError::Source(format!("invalid bind addr: {e}")))?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| PropagationError::Source(format!("failed to bind HTTP ingest listener: {e}")))?;

        let (router, source) = Self::router(channel_capacity);

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router.into_make_service()).await {
                tracing::error!(error = %e, "HTTP ingest server error");
            }
        });

        Ok(source)
    }

    /// Ingest routes and the source they feed, without binding a socket.
    pub fn router(channel_capacity: usize) -> (Router, Self) {
        let (tx, rx) = mpsc::channel(channel_capacity.max(1));

        let router = Router::new()
            .route("/ingest/measurements", post(ingest_measurements))
            .with_state(SharedSender { tx });

        let source = Self {
            receiver: Arc::new(tokio::sync::Mutex::new(Some(rx))),
        };
        (router, source)
    }
}

#[async_trait::async_trait]
impl Source<MeasurementEvent> for HttpJsonSource {
    async fn stream(&self) -> EventStream<MeasurementEvent> {
        let mut guard = self.receiver.lock().await;
        let stream: EventStream<MeasurementEvent> = match guard.take() {
            Some(rx) => Box::pin(ReceiverStream::new(rx).map(Ok::<_, PropagationError>)),
            None => Box::pin(futures::stream::once(async {
                Err(PropagationError::Source(
                    "HttpJsonSource stream already taken; only one consumer supported".to_string(),
                ))
            })),
        };
        stream
    }
}

async fn ingest_measurements(
    State(sender): State<SharedSender>,
    Json(payload): Json<Vec<MeasurementEvent>>,
) -> Result<StatusCode, StatusCode> {
    metrics::counter!("http_ingest_requests_total").increment(1);

    for event in payload {
        if sender.tx.send(Envelope::now(event)).await.is_err() {
            // Channel closed; the service is shutting down.
            metrics::counter!("http_ingest_failed_total").increment(1);
            return Err(StatusCode::SERVICE_UNAVAILABLE);
        }
    }

    Ok(StatusCode::ACCEPTED)
}
