// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Throttled progress fan-out.
//
// Per-page events arrive far faster than any listener needs them, so
// non-forced events are rate-limited per run. Lifecycle events (stage starts,
// terminal states) are published forced and always go through.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use blattwerk_core::types::{RunId, RunProgressEvent};

type Listener = Box<dyn Fn(&RunProgressEvent) + Send + Sync>;

struct BrokerState {
    listeners: Vec<Listener>,
    last_emit: HashMap<RunId, Instant>,
}

/// Fan-out point for run progress. Cheaply cloneable; all clones share the
/// same listeners and throttle state.
#[derive(Clone)]
pub struct ProgressBroker {
    state: Arc<Mutex<BrokerState>>,
    min_interval: Duration,
}

impl ProgressBroker {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                listeners: Vec::new(),
                last_emit: HashMap::new(),
            })),
            min_interval,
        }
    }

    pub fn subscribe(&self, listener: impl Fn(&RunProgressEvent) + Send + Sync + 'static) {
        let mut state = self.state.lock().expect("progress lock poisoned");
        state.listeners.push(Box::new(listener));
    }

    /// Publish an event. Non-forced events within `min_interval` of the
    /// previous emission for the same run are dropped. Returns whether the
    /// event was delivered.
    pub fn publish(&self, event: &RunProgressEvent, forced: bool) -> bool {
        let mut state = self.state.lock().expect("progress lock poisoned");
        let now = Instant::now();
        if !forced {
            if let Some(last) = state.last_emit.get(&event.run_id) {
                if now.duration_since(*last) < self.min_interval {
                    return false;
                }
            }
        }
        state.last_emit.insert(event.run_id, now);
        for listener in &state.listeners {
            listener(event);
        }
        debug!(run_id = %event.run_id, stage = ?event.stage, processed = event.processed, "progress");
        true
    }

    /// Drop throttle state for a finished run.
    pub fn clear(&self, run_id: RunId) {
        let mut state = self.state.lock().expect("progress lock poisoned");
        state.last_emit.remove(&run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use blattwerk_core::types::RunStage;
    use chrono::Utc;

    fn event(run_id: RunId, processed: usize) -> RunProgressEvent {
        RunProgressEvent {
            run_id,
            project_id: "test".into(),
            stage: RunStage::Normalize,
            processed,
            total: 10,
            timestamp: Utc::now(),
            throughput: None,
            current_page: None,
            recent_pages: Vec::new(),
        }
    }

    #[test]
    fn back_to_back_events_are_throttled() {
        let broker = ProgressBroker::new(Duration::from_millis(120));
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);
        broker.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let run_id = RunId::new();
        assert!(broker.publish(&event(run_id, 1), false));
        assert!(!broker.publish(&event(run_id, 2), false));
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn forced_events_always_pass() {
        let broker = ProgressBroker::new(Duration::from_millis(120));
        let run_id = RunId::new();
        assert!(broker.publish(&event(run_id, 1), false));
        assert!(broker.publish(&event(run_id, 2), true));
        assert!(broker.publish(&event(run_id, 3), true));
    }

    #[test]
    fn runs_are_throttled_independently() {
        let broker = ProgressBroker::new(Duration::from_millis(120));
        let a = RunId::new();
        let b = RunId::new();
        assert!(broker.publish(&event(a, 1), false));
        assert!(broker.publish(&event(b, 1), false));
        assert!(!broker.publish(&event(a, 2), false));
    }

    #[test]
    fn clear_resets_the_throttle_window() {
        let broker = ProgressBroker::new(Duration::from_secs(3600));
        let run_id = RunId::new();
        assert!(broker.publish(&event(run_id, 1), false));
        assert!(!broker.publish(&event(run_id, 2), false));
        broker.clear(run_id);
        assert!(broker.publish(&event(run_id, 3), false));
    }
}
