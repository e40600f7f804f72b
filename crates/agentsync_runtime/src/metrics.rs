use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeMetricsSnapshot {
    pub uptime_millis: u64,
    pub runs_started: u64,
    pub runs_finished: u64,
    pub runs_errored: u64,
    pub runs_interrupted: u64,
    pub active_runs: u64,
    pub events_emitted: u64,
    pub pending_tool_calls: u64,
    pub pending_resumes: u64,
    pub state_deltas_rejected: u64,
    pub listener_queue_depth: u64,
    pub listener_dropped: u64,
    pub listener_write_count: u64,
    pub listener_error_count: u64,
    pub listener_latency_avg_micros: f64,
    pub listener_latency_max_micros: u64,
}

/// Orchestrator counters. Lock-free atomics; every update is O(1).
#[derive(Debug)]
pub(crate) struct RuntimeMetrics {
    start_unix_millis: i64,
    runs_started: AtomicU64,
    runs_finished: AtomicU64,
    runs_errored: AtomicU64,
    runs_interrupted: AtomicU64,
    active_runs: AtomicU64,
    events_emitted: AtomicU64,
    pending_tool_calls: AtomicU64,
    pending_resumes: AtomicU64,
    state_deltas_rejected: AtomicU64,
    listener_queue_depth: AtomicU64,
    listener_dropped: AtomicU64,
    listener_write_count: AtomicU64,
    listener_error_count: AtomicU64,
    listener_latency_total_micros: AtomicU64,
    listener_latency_max_micros: AtomicU64,
}

impl RuntimeMetrics {
    pub(crate) fn new(start_unix_millis: i64) -> Self {
        Self {
            start_unix_millis,
            runs_started: AtomicU64::new(0),
            runs_finished: AtomicU64::new(0),
            runs_errored: AtomicU64::new(0),
            runs_interrupted: AtomicU64::new(0),
            active_runs: AtomicU64::new(0),
            events_emitted: AtomicU64::new(0),
            pending_tool_calls: AtomicU64::new(0),
            pending_resumes: AtomicU64::new(0),
            state_deltas_rejected: AtomicU64::new(0),
            listener_queue_depth: AtomicU64::new(0),
            listener_dropped: AtomicU64::new(0),
            listener_write_count: AtomicU64::new(0),
            listener_error_count: AtomicU64::new(0),
            listener_latency_total_micros: AtomicU64::new(0),
            listener_latency_max_micros: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_run_started(&self) {
        self.runs_started.fetch_add(1, Ordering::Relaxed);
        self.active_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_run_finished(&self) {
        self.runs_finished.fetch_add(1, Ordering::Relaxed);
        saturating_dec(&self.active_runs);
    }

    pub(crate) fn record_run_errored(&self) {
        self.runs_errored.fetch_add(1, Ordering::Relaxed);
        saturating_dec(&self.active_runs);
    }

    pub(crate) fn record_run_interrupted(&self) {
        self.runs_interrupted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_event(&self) {
        self.events_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_pending_tool_call(&self) {
        self.pending_tool_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_pending_tool_call(&self) {
        saturating_dec(&self.pending_tool_calls);
    }

    pub(crate) fn inc_pending_resume(&self) {
        self.pending_resumes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_pending_resume(&self) {
        saturating_dec(&self.pending_resumes);
    }

    pub(crate) fn record_state_delta_rejected(&self) {
        self.state_deltas_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_listener_queue_depth(&self) {
        self.listener_queue_depth.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_listener_queue_depth(&self) {
        saturating_dec(&self.listener_queue_depth);
    }

    pub(crate) fn record_listener_drop(&self) {
        self.listener_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_listener_write(&self, latency_micros: u64, is_error: bool) {
        self.listener_write_count.fetch_add(1, Ordering::Relaxed);
        if is_error {
            self.listener_error_count.fetch_add(1, Ordering::Relaxed);
        }
        self.listener_latency_total_micros
            .fetch_add(latency_micros, Ordering::Relaxed);
        max_update(&self.listener_latency_max_micros, latency_micros);
    }

    pub(crate) fn snapshot(&self, now_unix_millis: i64) -> RuntimeMetricsSnapshot {
        let uptime_millis = if now_unix_millis <= self.start_unix_millis {
            0
        } else {
            (now_unix_millis - self.start_unix_millis) as u64
        };
        let listener_write_count = self.listener_write_count.load(Ordering::Relaxed);
        let total_micros = self.listener_latency_total_micros.load(Ordering::Relaxed);
        let listener_latency_avg_micros = if listener_write_count == 0 {
            0.0
        } else {
            (total_micros as f64) / (listener_write_count as f64)
        };

        RuntimeMetricsSnapshot {
            uptime_millis,
            runs_started: self.runs_started.load(Ordering::Relaxed),
            runs_finished: self.runs_finished.load(Ordering::Relaxed),
            runs_errored: self.runs_errored.load(Ordering::Relaxed),
            runs_interrupted: self.runs_interrupted.load(Ordering::Relaxed),
            active_runs: self.active_runs.load(Ordering::Relaxed),
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            pending_tool_calls: self.pending_tool_calls.load(Ordering::Relaxed),
            pending_resumes: self.pending_resumes.load(Ordering::Relaxed),
            state_deltas_rejected: self.state_deltas_rejected.load(Ordering::Relaxed),
            listener_queue_depth: self.listener_queue_depth.load(Ordering::Relaxed),
            listener_dropped: self.listener_dropped.load(Ordering::Relaxed),
            listener_write_count,
            listener_error_count: self.listener_error_count.load(Ordering::Relaxed),
            listener_latency_avg_micros,
            listener_latency_max_micros: self.listener_latency_max_micros.load(Ordering::Relaxed),
        }
    }
}

fn saturating_dec(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |value| {
        Some(value.saturating_sub(1))
    });
}

fn max_update(target: &AtomicU64, candidate: u64) {
    let mut current = target.load(Ordering::Relaxed);
    while candidate > current {
        match target.compare_exchange_weak(current, candidate, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_runs_track_start_and_terminal() {
        let metrics = RuntimeMetrics::new(1_000);
        metrics.record_run_started();
        metrics.record_run_started();
        metrics.record_run_finished();
        metrics.record_run_errored();
        metrics.record_run_errored();

        let snapshot = metrics.snapshot(3_000);
        assert_eq!(snapshot.uptime_millis, 2_000);
        assert_eq!(snapshot.runs_started, 2);
        assert_eq!(snapshot.runs_errored, 2);
        assert_eq!(snapshot.active_runs, 0, "decrement saturates at zero");
    }

    #[test]
    fn listener_latency_tracks_average_and_max() {
        let metrics = RuntimeMetrics::new(0);
        metrics.record_listener_write(100, false);
        metrics.record_listener_write(300, true);
        let snapshot = metrics.snapshot(0);
        assert_eq!(snapshot.listener_write_count, 2);
        assert_eq!(snapshot.listener_error_count, 1);
        assert_eq!(snapshot.listener_latency_max_micros, 300);
        assert!((snapshot.listener_latency_avg_micros - 200.0).abs() < f64::EPSILON);
    }
}
