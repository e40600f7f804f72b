use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use agentsync_protocol::Event;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;

use crate::errors::SinkError;
use crate::events::RunEnvelope;
use crate::remote::INTERRUPT_EVENT;

pub type ListenerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>>;

/// Explicit subscriber registered on the orchestrator.
/// Listener failures are logged and never affect the run.
pub trait EventListener: Send + Sync + 'static {
    fn on_event<'a>(&'a self, envelope: &'a RunEnvelope) -> ListenerFuture<'a>;
}

/// Run transcript: one JSON line per envelope, optionally limited to one
/// thread. Lines are buffered and flushed when a run ends or pauses, so a
/// reader tailing the file sees whole runs up to their last checkpoint.
#[derive(Debug)]
pub struct JsonlFileSink {
    file: Arc<Mutex<BufWriter<File>>>,
    thread_id: Option<String>,
}

impl JsonlFileSink {
    /// Open or create the file in append mode.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .await
            .map_err(|err| SinkError::Io(err.to_string()))?;
        Ok(Self {
            file: Arc::new(Mutex::new(BufWriter::new(file))),
            thread_id: None,
        })
    }

    /// Record only runs of `thread_id`.
    pub fn for_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    fn records(&self, envelope: &RunEnvelope) -> bool {
        self.thread_id
            .as_deref()
            .map_or(true, |thread_id| thread_id == envelope.thread_id)
    }
}

fn ends_or_pauses_run(envelope: &RunEnvelope) -> bool {
    envelope.is_terminal()
        || matches!(&envelope.event, Event::Custom { name, .. } if name == INTERRUPT_EVENT)
}

impl EventListener for JsonlFileSink {
    /// Allocation: one JSON byte vector. Complexity: O(n), n = serialized bytes.
    fn on_event<'a>(&'a self, envelope: &'a RunEnvelope) -> ListenerFuture<'a> {
        Box::pin(async move {
            if !self.records(envelope) {
                return Ok(());
            }
            let mut bytes = serde_json::to_vec(envelope)
                .map_err(|err| SinkError::Serialize(err.to_string()))?;
            bytes.push(b'\n');

            let mut file = self.file.lock().await;
            file.write_all(&bytes)
                .await
                .map_err(|err| SinkError::Io(err.to_string()))?;
            if ends_or_pauses_run(envelope) {
                file.flush()
                    .await
                    .map_err(|err| SinkError::Io(err.to_string()))?;
            }
            Ok(())
        })
    }
}
