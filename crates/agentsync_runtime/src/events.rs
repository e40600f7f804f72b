use agentsync_protocol::Event;
use serde::{Deserialize, Serialize};

/// One emitted event with its run coordinates.
/// `seq` starts at 1 and increases by one per event within a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEnvelope {
    pub seq: u64,
    pub ts_millis: i64,
    pub thread_id: String,
    pub run_id: String,
    pub agent: String,
    pub event: Event,
}

impl RunEnvelope {
    pub fn is_terminal(&self) -> bool {
        self.event.is_terminal()
    }
}
