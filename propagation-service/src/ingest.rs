//! Background producer feeding measurement events to the engine.
//!
//! The producer runs on its own task and pushes into a bounded FIFO channel.
//! What happens when the channel is full is set by [`OverflowPolicy`]:
//! `BlockProducer` applies back-pressure, `DropOldest` evicts the oldest
//! queued event so the queue always holds the newest `capacity` events.

use std::{collections::VecDeque, sync::Arc};

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, Notify},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::OverflowPolicy,
    pipeline::{Envelope, MeasurementEvent, PropagationError, Source, Transform},
};

pub type MeasurementTransform = Arc<dyn Transform<MeasurementEvent, MeasurementEvent> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub produced: u64,
    pub dropped: u64,
    pub rejected: u64,
    pub source_errors: u64,
    pub cancelled: bool,
}

#[derive(Default)]
struct RingState {
    events: VecDeque<Envelope<MeasurementEvent>>,
    producer_gone: bool,
    consumer_gone: bool,
}

/// Fixed-capacity queue shared by one producer and one consumer.
struct Ring {
    capacity: usize,
    state: Mutex<RingState>,
    ready: Notify,
}

enum Push {
    Queued,
    Evicted,
    Closed,
}

impl Ring {
    fn push(&self, env: Envelope<MeasurementEvent>) -> Push {
        let outcome = {
            let mut state = self.state.lock();
            if state.consumer_gone {
                return Push::Closed;
            }
            let evicted = state.events.len() >= self.capacity;
            if evicted {
                state.events.pop_front();
            }
            state.events.push_back(env);
            if evicted {
                Push::Evicted
            } else {
                Push::Queued
            }
        };
        self.ready.notify_one();
        outcome
    }
}

struct RingSender(Arc<Ring>);

impl Drop for RingSender {
    fn drop(&mut self) {
        self.0.state.lock().producer_gone = true;
        self.0.ready.notify_one();
    }
}

/// Consumer half of the drop-oldest queue.
pub struct RingReceiver(Arc<Ring>);

impl RingReceiver {
    async fn recv(&self) -> Option<Envelope<MeasurementEvent>> {
        loop {
            // Registered before the check; `notify_one` also leaves a permit
            // when nobody is waiting, so a push is never missed.
            let ready = self.0.ready.notified();
            {
                let mut state = self.0.state.lock();
                if let Some(env) = state.events.pop_front() {
                    return Some(env);
                }
                if state.producer_gone {
                    return None;
                }
            }
            ready.await;
        }
    }
}

impl Drop for RingReceiver {
    fn drop(&mut self) {
        let mut state = self.0.state.lock();
        state.consumer_gone = true;
        state.events.clear();
    }
}

enum EventSender {
    Bounded(mpsc::Sender<Envelope<MeasurementEvent>>),
    DropOldest(RingSender),
}

/// Consumer end of the ingest channel.
pub enum EventReceiver {
    Bounded(mpsc::Receiver<Envelope<MeasurementEvent>>),
    DropOldest(RingReceiver),
}

impl EventReceiver {
    /// Next event in FIFO order, or `None` once the producer is gone and the
    /// queue is drained. Cancel-safe.
    pub async fn recv(&mut self) -> Option<Envelope<MeasurementEvent>> {
        match self {
            Self::Bounded(rx) => rx.recv().await,
            Self::DropOldest(rx) => rx.recv().await,
        }
    }
}

fn channel(capacity: usize, overflow: OverflowPolicy) -> (EventSender, EventReceiver) {
    let capacity = capacity.max(1);
    match overflow {
        OverflowPolicy::BlockProducer => {
            let (tx, rx) = mpsc::channel(capacity);
            (EventSender::Bounded(tx), EventReceiver::Bounded(rx))
        }
        OverflowPolicy::DropOldest => {
            let ring = Arc::new(Ring {
                capacity,
                state: Mutex::new(RingState::default()),
                ready: Notify::new(),
            });
            (
                EventSender::DropOldest(RingSender(Arc::clone(&ring))),
                EventReceiver::DropOldest(RingReceiver(ring)),
            )
        }
    }
}

pub struct IngestSource<S> {
    source: S,
    transforms: Vec<MeasurementTransform>,
    capacity: usize,
    overflow: OverflowPolicy,
}

/// Running producer. Dropping the handle does not stop the task; call `stop`.
pub struct IngestHandle {
    cancel: CancellationToken,
    join: JoinHandle<IngestStats>,
}

impl IngestHandle {
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub async fn join(self) -> Result<IngestStats, PropagationError> {
        self.join
            .await
            .map_err(|e| PropagationError::Source(format!("ingest task failed: {e}")))
    }
}

impl<S> IngestSource<S>
where
    S: Source<MeasurementEvent> + 'static,
{
    pub fn new(source: S, capacity: usize, overflow: OverflowPolicy) -> Self {
        Self {
            source,
            transforms: Vec::new(),
            capacity,
            overflow,
        }
    }

    pub fn with_transform(mut self, transform: MeasurementTransform) -> Self {
        self.transforms.push(transform);
        self
    }

    /// Start producing on a dedicated task.
    ///
    /// `cancel` is checked once per produced item and while waiting for
    /// channel space, so a stopped producer never blocks.
    pub fn spawn(self, cancel: CancellationToken) -> (EventReceiver, IngestHandle) {
        let (tx, rx) = channel(self.capacity, self.overflow);
        let token = cancel.clone();
        let join = tokio::spawn(async move { self.produce(tx, token).await });
        (rx, IngestHandle { cancel, join })
    }

    async fn produce(self, tx: EventSender, cancel: CancellationToken) -> IngestStats {
        let mut stats = IngestStats::default();
        let mut stream = self.source.stream().await;

        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    stats.cancelled = true;
                    break;
                }
                item = stream.next() => item,
            };

            let env = match item {
                Some(Ok(env)) => env,
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "skipping unreadable measurement");
                    stats.source_errors += 1;
                    continue;
                }
                None => break,
            };

            let env = match apply_transforms(&self.transforms, env).await {
                Ok(env) => env,
                Err(e) => {
                    tracing::warn!(error = %e, "measurement rejected by validation");
                    stats.rejected += 1;
                    continue;
                }
            };

            let delivered = match &tx {
                EventSender::Bounded(tx) => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        stats.cancelled = true;
                        break;
                    }
                    res = tx.send(env) => res.is_ok(),
                },
                EventSender::DropOldest(ring) => match ring.0.push(env) {
                    Push::Queued => true,
                    Push::Evicted => {
                        stats.dropped += 1;
                        metrics::counter!("ingest_events_dropped_total").increment(1);
                        tracing::debug!("ingest queue full, oldest event dropped");
                        true
                    }
                    Push::Closed => false,
                },
            };

            if !delivered {
                tracing::info!("event consumer is gone, stopping ingest");
                break;
            }
            stats.produced += 1;
            metrics::counter!("ingest_events_total").increment(1);
        }

        tracing::info!(
            produced = stats.produced,
            dropped = stats.dropped,
            rejected = stats.rejected,
            source_errors = stats.source_errors,
            cancelled = stats.cancelled,
            "ingest producer finished"
        );
        stats
    }
}

async fn apply_transforms(
    transforms: &[MeasurementTransform],
    mut env: Envelope<MeasurementEvent>,
) -> Result<Envelope<MeasurementEvent>, PropagationError> {
    for t in transforms {
        env = t.apply(env).await?;
    }
    Ok(env)
}
