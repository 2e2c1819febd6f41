//! Filtering lifecycle: configure, start, stop, reload and bypass.
//!
//! The controller is driven from a single shell thread. It is the only owner
//! of the interceptor handle: the handle is opened before any worker is
//! spawned and released only after every worker has been joined or abandoned.

use crate::config::{ConfigLoader, Settings};
use crate::error::ControlError;
use crate::interceptor::{InterceptorBackend, PacketInterceptor};
use crate::monitor::{FilterSession, MonitorPool, StopReport, WorkerState};
use crate::state::{CoreState, Counters, SharedState};
use crate::status::{StatusMessage, StatusSink};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Starting,
    Running,
    Stopping,
}

struct ActiveSession {
    interceptor: Arc<dyn PacketInterceptor>,
    pool: MonitorPool,
    session: Arc<FilterSession>,
    stop_timeout: Duration,
}

pub struct CoreController {
    loader: Box<dyn ConfigLoader>,
    backend: Arc<dyn InterceptorBackend>,
    shared: Arc<SharedState>,
    phase: Phase,
    active: Option<ActiveSession>,
    generation: u64,
}

impl CoreController {
    pub fn new(
        loader: Box<dyn ConfigLoader>,
        backend: Arc<dyn InterceptorBackend>,
        sink: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            loader,
            backend,
            shared: Arc::new(SharedState::new(sink)),
            phase: Phase::Idle,
            active: None,
            generation: 0,
        }
    }

    /// Loads configuration, builds the session tables, opens the interceptor
    /// and spawns the workers. A running session is stopped first.
    ///
    /// A configuration fault while a session is running leaves that session
    /// untouched. Any other setup fault raises the fault flag, which must be
    /// acknowledged before the next start.
    pub fn configure_and_start(&mut self) -> Result<(), ControlError> {
        if let Some(reason) = self.pending_fault() {
            self.shared.display(&StatusMessage::warning(format!(
                "Cannot start while a fault is pending: {reason}"
            )));
            return Err(ControlError::FaultPending(reason));
        }

        let settings = match self.load_settings() {
            Ok(settings) => settings,
            Err(e) if self.active.is_some() => {
                self.shared.display(&StatusMessage::fault(format!(
                    "Configuration rejected, keeping the running session: {e}"
                )));
                return Err(e);
            }
            Err(e) => {
                self.shared.raise_fault(e.to_string());
                return Err(e);
            }
        };

        if self.active.is_some() {
            self.stop();
        }

        self.phase = Phase::Starting;
        match self.start_session(settings) {
            Ok(()) => {
                self.phase = Phase::Running;
                Ok(())
            }
            Err(e) => {
                self.shared.raise_fault(e.to_string());
                self.phase = Phase::Idle;
                Err(e)
            }
        }
    }

    pub fn reload(&mut self) -> Result<(), ControlError> {
        self.shared
            .display(&StatusMessage::info("Reloading configuration..."));
        self.configure_and_start()
    }

    /// Stops every worker and closes the interceptor. Returns `None` when
    /// nothing was running.
    pub fn stop(&mut self) -> Option<StopReport> {
        let active = self.active.take()?;
        self.phase = Phase::Stopping;

        self.shared.update_and_display(
            |state| state.stopping = true,
            &StatusMessage::info("Stopping filter..."),
        );

        active.pool.cancel();
        if let Err(e) = active.interceptor.close() {
            log::warn!("Closing interceptor failed: {e}");
        }
        let report = active.pool.join(active.stop_timeout);
        log::debug!(
            "Session {} stopped: {} joined, {} abandoned",
            active.session.generation(),
            report.joined,
            report.abandoned.len()
        );
        drop(active.interceptor);
        drop(active.session);

        let counters = self.shared.update(|state| {
            state.running = false;
            state.stopping = false;
            state.counters
        });

        if !report.abandoned.is_empty() {
            self.shared.display(&StatusMessage::warning(format!(
                "{} worker(s) did not stop in time and were abandoned: {}",
                report.abandoned.len(),
                report.abandoned.join(", ")
            )));
        }
        self.shared.display(&StatusMessage::info(format!(
            "Filtering stopped. Passed: {} | Dropped: {}",
            counters.passed_packets, counters.dropped_packets
        )));

        self.phase = Phase::Idle;
        Some(report)
    }

    /// Flips bypass mode and returns the new value. Workers pick it up from
    /// their next packet.
    pub fn toggle_bypass(&mut self) -> bool {
        let enabled = self.shared.update(|state| {
            state.bypass_mode = !state.bypass_mode;
            state.bypass_mode
        });
        let message = if enabled {
            StatusMessage::warning("Bypass enabled: all traffic passes unfiltered")
        } else {
            StatusMessage::success("Bypass disabled: filtering resumed")
        };
        self.shared.display(&message);
        enabled
    }

    /// Clears a pending fault. Returns the reason that was cleared.
    pub fn acknowledge_fault(&mut self) -> Option<String> {
        let reason = self.shared.clear_fault()?;
        self.shared
            .display(&StatusMessage::info(format!("Fault acknowledged: {reason}")));
        Some(reason)
    }

    pub fn report_counters(&self) -> Counters {
        let counters = self.shared.counters();
        self.shared.display(&StatusMessage::info(format!(
            "Passed: {} | Dropped: {}",
            counters.passed_packets, counters.dropped_packets
        )));
        counters
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> CoreState {
        self.shared.snapshot()
    }

    pub fn counters(&self) -> Counters {
        self.shared.counters()
    }

    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.active
            .as_ref()
            .map(|active| active.pool.states())
            .unwrap_or_default()
    }

    /// Generation of the running session's tables, if any.
    pub fn session_generation(&self) -> Option<u64> {
        self.active.as_ref().map(|active| active.session.generation())
    }

    fn pending_fault(&self) -> Option<String> {
        let state = self.shared.snapshot();
        if state.fault {
            Some(state.fault_reason.unwrap_or_else(|| "unknown fault".to_string()))
        } else {
            None
        }
    }

    fn load_settings(&self) -> Result<Settings, ControlError> {
        let config = self.loader.load()?;
        Ok(Settings::from_source(&config)?)
    }

    fn start_session(&mut self, settings: Settings) -> Result<(), ControlError> {
        let workers = settings.workers;
        let stop_timeout = settings.stop_timeout;
        let filter = settings.filter.clone();

        self.generation += 1;
        let session = Arc::new(FilterSession::from_settings(settings, self.generation));

        self.shared.update(|state| {
            state.counters = Counters::default();
            state.stopping = false;
        });

        let interceptor = self.backend.open(&filter)?;

        let mut pool = MonitorPool::new();
        for _ in 0..workers {
            if let Err(e) = pool.spawn_worker(interceptor.clone(), session.clone(), self.shared.clone()) {
                log::error!("Worker spawn failed, tearing down partial pool: {e}");
                self.shared.update(|state| state.stopping = true);
                pool.cancel();
                if let Err(close_err) = interceptor.close() {
                    log::warn!("Closing interceptor failed: {close_err}");
                }
                pool.join(stop_timeout);
                self.shared.update(|state| state.stopping = false);
                return Err(e);
            }
        }

        let rule_count = session.rule_count();
        self.shared.update_and_display(
            |state| state.running = true,
            &StatusMessage::success(format!(
                "Filtering started: {workers} workers, {rule_count} rules, filter '{}'",
                interceptor.filter()
            )),
        );

        self.active = Some(ActiveSession {
            interceptor,
            pool,
            session,
            stop_timeout,
        });
        Ok(())
    }
}

impl Drop for CoreController {
    fn drop(&mut self) {
        self.stop();
    }
}
