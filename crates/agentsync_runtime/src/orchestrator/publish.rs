use std::sync::Arc;
use std::time::Instant;

use agentsync_protocol::{Event, ProtocolError, StreamValidator};
use arc_swap::ArcSwap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use super::{now_unix_millis, Inner};
use crate::events::RunEnvelope;
use crate::metrics::RuntimeMetrics;
use crate::sink::EventListener;

pub(crate) type ListenerList = ArcSwap<Vec<Arc<dyn EventListener>>>;

/// Emits one run's events in order to its three audiences: the run's own
/// subscriber stream, the live broadcast, and the registered listeners.
/// Every outgoing event passes the run-scoped stream validator first.
pub(super) struct Publisher {
    thread_id: String,
    run_id: String,
    agent: String,
    seq: u64,
    validator: StreamValidator,
    subscriber: Option<mpsc::Sender<RunEnvelope>>,
}

impl Publisher {
    pub(super) fn new(
        thread_id: &str,
        run_id: &str,
        agent: &str,
        subscriber: mpsc::Sender<RunEnvelope>,
    ) -> Self {
        Self {
            thread_id: thread_id.to_owned(),
            run_id: run_id.to_owned(),
            agent: agent.to_owned(),
            seq: 0,
            validator: StreamValidator::run(),
            subscriber: Some(subscriber),
        }
    }

    pub(super) fn is_terminated(&self) -> bool {
        self.validator.is_terminated()
    }

    /// Waits for room on the run subscriber stream. If the run is cancelled
    /// while the stream is full, the subscriber is detached.
    pub(super) async fn emit(
        &mut self,
        inner: &Inner,
        cancel: &CancellationToken,
        event: Event,
    ) -> Result<(), ProtocolError> {
        self.validator.observe(&event)?;
        self.seq += 1;
        let envelope = RunEnvelope {
            seq: self.seq,
            ts_millis: now_unix_millis(),
            thread_id: self.thread_id.clone(),
            run_id: self.run_id.clone(),
            agent: self.agent.clone(),
            event,
        };
        inner.metrics.record_event();

        // Err only means nobody is subscribed live.
        let _ = inner.live_tx.send(envelope.clone());
        route_listeners(inner, &envelope);

        if let Some(tx) = self.subscriber.as_ref() {
            let delivered = tokio::select! {
                biased;
                sent = tx.send(envelope) => sent.is_ok(),
                _ = cancel.cancelled() => false,
            };
            if !delivered {
                tracing::debug!(
                    run_id = %self.run_id,
                    seq = self.seq,
                    "run subscriber detached; continuing without it"
                );
                self.subscriber = None;
            }
        }
        Ok(())
    }
}

fn route_listeners(inner: &Inner, envelope: &RunEnvelope) {
    if inner.listeners.load().is_empty() {
        return;
    }
    match inner.listener_tx.try_send(envelope.clone()) {
        Ok(()) => inner.metrics.inc_listener_queue_depth(),
        Err(TrySendError::Full(_)) => {
            inner.metrics.record_listener_drop();
            tracing::warn!(
                run_id = %envelope.run_id,
                seq = envelope.seq,
                "listener queue full; dropping envelope"
            );
        }
        Err(TrySendError::Closed(_)) => {
            inner.metrics.record_listener_drop();
            tracing::warn!(
                run_id = %envelope.run_id,
                seq = envelope.seq,
                "listener queue closed; dropping envelope"
            );
        }
    }
}

/// Single worker feeding every registered listener in registration order.
/// Ends when the orchestrator is dropped and the queue drains.
pub(super) async fn listener_loop(
    listeners: Arc<ListenerList>,
    metrics: Arc<RuntimeMetrics>,
    mut rx: mpsc::Receiver<RunEnvelope>,
) {
    while let Some(envelope) = rx.recv().await {
        metrics.dec_listener_queue_depth();
        let current = listeners.load_full();
        for listener in current.iter() {
            let started = Instant::now();
            let result = listener.on_event(&envelope).await;
            let elapsed_micros = started.elapsed().as_micros() as u64;
            metrics.record_listener_write(elapsed_micros, result.is_err());
            if let Err(err) = result {
                tracing::warn!(
                    run_id = %envelope.run_id,
                    seq = envelope.seq,
                    error = %err,
                    "event listener failed"
                );
            }
        }
    }
}
