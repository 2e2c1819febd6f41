//! State shared between the controller and its workers.
//!
//! Counters, flags and the status sink sit behind one mutex. The lock is only
//! held for the duration of a single update, never across `receive`.

use crate::status::{StatusMessage, StatusSink};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub passed_packets: u64,
    pub dropped_packets: u64,
}

impl Counters {
    pub fn total(&self) -> u64 {
        self.passed_packets + self.dropped_packets
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreState {
    pub running: bool,
    pub bypass_mode: bool,
    pub fault: bool,
    pub stopping: bool,
    pub fault_reason: Option<String>,
    pub counters: Counters,
}

/// Lock-guarded [`CoreState`] plus the shell's output surface.
pub struct SharedState {
    state: Mutex<CoreState>,
    sink: Arc<dyn StatusSink>,
}

impl SharedState {
    pub fn new(sink: Arc<dyn StatusSink>) -> Self {
        Self {
            state: Mutex::new(CoreState::default()),
            sink,
        }
    }

    /// A panicking worker must not wedge the controller, so poisoning is
    /// ignored.
    fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> CoreState {
        self.lock().clone()
    }

    pub fn counters(&self) -> Counters {
        self.lock().counters
    }

    /// Runs `update` under the lock.
    pub fn update<R>(&self, update: impl FnOnce(&mut CoreState) -> R) -> R {
        let mut state = self.lock();
        update(&mut state)
    }

    /// Displays `message` under the lock, after applying `update`.
    pub fn update_and_display<R>(
        &self,
        update: impl FnOnce(&mut CoreState) -> R,
        message: &StatusMessage,
    ) -> R {
        let mut state = self.lock();
        let result = update(&mut state);
        self.sink.display(message);
        result
    }

    pub fn display(&self, message: &StatusMessage) {
        let _state = self.lock();
        self.sink.display(message);
    }

    pub fn record_passed(&self) {
        self.lock().counters.passed_packets += 1;
    }

    pub fn record_dropped(&self) {
        self.lock().counters.dropped_packets += 1;
    }

    pub fn reset_counters(&self) {
        self.lock().counters = Counters::default();
    }

    pub fn bypass_mode(&self) -> bool {
        self.lock().bypass_mode
    }

    pub fn stop_requested(&self) -> bool {
        self.lock().stopping
    }

    pub fn fault_pending(&self) -> bool {
        self.lock().fault
    }

    /// Records a fault. The first reason wins until acknowledged.
    pub fn raise_fault(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut state = self.lock();
        state.fault = true;
        if state.fault_reason.is_none() {
            state.fault_reason = Some(reason.clone());
        }
        self.sink.display(&StatusMessage::fault(format!("Fault: {reason}")));
    }

    pub fn clear_fault(&self) -> Option<String> {
        let mut state = self.lock();
        state.fault = false;
        state.fault_reason.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::RecordingSink;
    use std::thread;

    #[test]
    fn test_counters_under_contention() {
        let shared = Arc::new(SharedState::new(Arc::new(RecordingSink::new())));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let shared = shared.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        if i % 2 == 0 {
                            shared.record_passed();
                        } else {
                            shared.record_dropped();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let counters = shared.counters();
        assert_eq!(counters.passed_packets, 4000);
        assert_eq!(counters.dropped_packets, 4000);
        assert_eq!(counters.total(), 8000);

        shared.reset_counters();
        assert_eq!(shared.counters(), Counters::default());
    }

    #[test]
    fn test_first_fault_reason_kept() {
        let sink = Arc::new(RecordingSink::new());
        let shared = SharedState::new(sink.clone());

        shared.raise_fault("receive failed");
        shared.raise_fault("second failure");
        assert!(shared.fault_pending());
        assert_eq!(shared.snapshot().fault_reason.as_deref(), Some("receive failed"));
        assert!(sink.contains("second failure"));

        assert_eq!(shared.clear_fault().as_deref(), Some("receive failed"));
        assert!(!shared.fault_pending());
    }
}
