//! Worker pool that drains the interceptor.
//!
//! Each worker owns a cancel token and a join handle. A worker blocks only in
//! `receive`; normalization and scoring run synchronously on the worker
//! thread. Stopping is cooperative: cancel every token, close the interceptor
//! to release blocked receivers, then join with a deadline.

use crate::config::{FaultPolicy, Settings};
use crate::error::{ControlError, InterceptorError};
use crate::interceptor::{Direction, Packet, PacketInterceptor};
use crate::normalizer::{NormalizedText, Normalizer};
use crate::scoring::{ScoringEngine, Verdict};
use crate::state::SharedState;
use crate::status::StatusMessage;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Consecutive receive failures after which a worker gives up.
pub const MAX_CONSECUTIVE_FAULTS: u32 = 8;

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Longest normalized text echoed to the shell for a dropped message.
const MAX_REPORTED_TEXT: usize = 120;

/// Immutable tables for one filtering session.
pub struct FilterSession {
    generation: u64,
    normalizer: Normalizer,
    scoring: ScoringEngine,
    fault_policy: FaultPolicy,
}

impl FilterSession {
    pub fn new(
        generation: u64,
        normalizer: Normalizer,
        scoring: ScoringEngine,
        fault_policy: FaultPolicy,
    ) -> Self {
        Self {
            generation,
            normalizer,
            scoring,
            fault_policy,
        }
    }

    pub fn from_settings(settings: Settings, generation: u64) -> Self {
        let normalizer = Normalizer::new(
            settings.normalizer,
            settings.confusables,
            settings.deobfuscator,
        );
        Self::new(
            generation,
            normalizer,
            ScoringEngine::new(settings.rules),
            settings.fault_policy,
        )
    }

    /// Payloads without text are clean.
    pub fn classify(&self, payload: &[u8], direction: Direction) -> (Option<NormalizedText>, Verdict) {
        match self.normalizer.normalize(payload, direction) {
            Some(normalized) => {
                let verdict = self.scoring.evaluate(&normalized.text);
                (Some(normalized), verdict)
            }
            None => (None, Verdict::clean()),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn fault_policy(&self) -> FaultPolicy {
        self.fault_policy
    }

    pub fn rule_count(&self) -> usize {
        self.scoring.rules().len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    Stopping,
    Stopped,
}

impl WorkerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => WorkerState::Running,
            1 => WorkerState::Stopping,
            _ => WorkerState::Stopped,
        }
    }
}

/// Per-worker cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Saw the stop flag or its cancel token.
    Stopped,
    /// Woken by the interceptor closing.
    Shutdown,
    /// Gave up after repeated receive failures.
    Faulted,
}

/// Outcome of joining the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopReport {
    pub joined: usize,
    pub faulted: usize,
    pub panicked: usize,
    /// Workers still running at the deadline, detached and left behind.
    pub abandoned: Vec<String>,
}

struct Worker {
    name: String,
    token: CancelToken,
    state: Arc<AtomicU8>,
    handle: JoinHandle<WorkerExit>,
}

#[derive(Default)]
pub struct MonitorPool {
    workers: Vec<Worker>,
}

impl MonitorPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn_worker(
        &mut self,
        interceptor: Arc<dyn PacketInterceptor>,
        session: Arc<FilterSession>,
        shared: Arc<SharedState>,
    ) -> Result<(), ControlError> {
        let name = format!("rmt-worker-{}", self.workers.len());
        let token = CancelToken::new();
        let state = Arc::new(AtomicU8::new(WorkerState::Running as u8));

        let context = WorkerContext {
            name: name.clone(),
            token: token.clone(),
            state: state.clone(),
            interceptor,
            session,
            shared,
        };

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || context.run())
            .map_err(|e| ControlError::Spawn(e.to_string()))?;

        log::debug!("Spawned {name}");
        self.workers.push(Worker {
            name,
            token,
            state,
            handle,
        });
        Ok(())
    }

    pub fn states(&self) -> Vec<WorkerState> {
        self.workers
            .iter()
            .map(|w| WorkerState::from_u8(w.state.load(Ordering::SeqCst)))
            .collect()
    }

    /// Marks every running worker `Stopping` until its thread exits.
    pub fn cancel(&self) {
        for worker in &self.workers {
            worker.token.cancel();
            let _ = worker.state.compare_exchange(
                WorkerState::Running as u8,
                WorkerState::Stopping as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
    }

    /// Waits until `timeout` for every worker. Workers still running at the
    /// deadline are detached; their threads leak until `receive` returns.
    pub fn join(self, timeout: Duration) -> StopReport {
        let deadline = Instant::now() + timeout;
        let mut report = StopReport::default();

        for worker in self.workers {
            while !worker.handle.is_finished() && Instant::now() < deadline {
                thread::sleep(JOIN_POLL_INTERVAL);
            }

            if !worker.handle.is_finished() {
                log::error!(
                    "{} did not stop within {:?}; abandoning its thread",
                    worker.name,
                    timeout
                );
                report.abandoned.push(worker.name);
                continue;
            }

            match worker.handle.join() {
                Ok(WorkerExit::Faulted) => {
                    report.joined += 1;
                    report.faulted += 1;
                }
                Ok(_) => report.joined += 1,
                Err(_) => {
                    log::error!("{} panicked", worker.name);
                    report.panicked += 1;
                }
            }
        }

        report
    }
}

struct WorkerContext {
    name: String,
    token: CancelToken,
    state: Arc<AtomicU8>,
    interceptor: Arc<dyn PacketInterceptor>,
    session: Arc<FilterSession>,
    shared: Arc<SharedState>,
}

impl WorkerContext {
    fn run(self) -> WorkerExit {
        log::debug!("{} started (session {})", self.name, self.session.generation());
        let mut consecutive_faults = 0u32;

        let exit = loop {
            if self.token.is_cancelled() || self.shared.stop_requested() {
                break WorkerExit::Stopped;
            }

            match self.interceptor.receive() {
                // Cancelled while blocked: the controller may already run a
                // newer session on the same shared state.
                Ok(packet) if self.token.is_cancelled() => {
                    self.release_uncounted(packet);
                    break WorkerExit::Stopped;
                }
                Ok(packet) => {
                    consecutive_faults = 0;
                    self.handle_packet(packet);
                }
                Err(InterceptorError::Shutdown) => break WorkerExit::Shutdown,
                Err(e) => {
                    consecutive_faults += 1;
                    log::warn!(
                        "{}: receive failed ({consecutive_faults}/{MAX_CONSECUTIVE_FAULTS}): {e}",
                        self.name
                    );
                    if consecutive_faults >= MAX_CONSECUTIVE_FAULTS {
                        self.shared.raise_fault(format!(
                            "{} stopped after {consecutive_faults} consecutive receive failures: {e}",
                            self.name
                        ));
                        break WorkerExit::Faulted;
                    }
                }
            }
        };

        log::debug!("{} exiting: {exit:?}", self.name);
        self.state.store(WorkerState::Stopped as u8, Ordering::SeqCst);
        exit
    }

    fn handle_packet(&self, packet: Packet) {
        let (bypass, fault) = self.shared.update(|state| (state.bypass_mode, state.fault));

        if bypass {
            self.pass(packet);
            return;
        }

        if fault {
            match self.session.fault_policy() {
                FaultPolicy::Open => self.pass(packet),
                FaultPolicy::Closed => {
                    self.interceptor.discard(packet);
                    self.shared.record_dropped();
                }
            }
            return;
        }

        let (normalized, verdict) = self.session.classify(&packet.payload, packet.direction);
        if !verdict.is_spam() {
            self.pass(packet);
            return;
        }

        let text = normalized.map(|n| n.text).unwrap_or_default();
        log::debug!(
            "{}: dropping {} packet, score {} from {:?}",
            self.name,
            packet.direction,
            verdict.score,
            verdict.matched_rules
        );
        let message = StatusMessage::dropped(format!(
            "Dropped {} message (score {}): {}",
            packet.direction,
            verdict.score,
            truncate_text(&text, MAX_REPORTED_TEXT)
        ));
        self.interceptor.discard(packet);
        self.shared
            .update_and_display(|state| state.counters.dropped_packets += 1, &message);
    }

    /// Returns a packet received after cancellation without touching counters.
    fn release_uncounted(&self, packet: Packet) {
        if let Err(e) = self.interceptor.reinject(packet) {
            log::debug!("{}: late packet not reinjected: {e}", self.name);
        }
    }

    /// A refused reinjection counts as a drop.
    fn pass(&self, packet: Packet) {
        match self.interceptor.reinject(packet) {
            Ok(()) => self.shared.record_passed(),
            Err(e) => {
                log::warn!("{}: {e}", self.name);
                self.shared.record_dropped();
            }
        }
    }
}

fn truncate_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut truncated: String = text.chars().take(max_chars.saturating_sub(3)).collect();
        truncated.push_str("...");
        truncated
    }
}
