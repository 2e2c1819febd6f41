//! Packet diversion boundary.
//!
//! The OS-specific diversion driver sits behind [`PacketInterceptor`]. All
//! workers share one handle and block in [`PacketInterceptor::receive`];
//! closing the handle must wake every one of them with
//! [`InterceptorError::Shutdown`].
//!
//! [`QueueInterceptor`] is the in-process backend used for capture replay and
//! tests.

use crate::error::InterceptorError;
use anyhow::{bail, Context};
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => write!(f, "inbound"),
            Direction::Outbound => write!(f, "outbound"),
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "in" | "inbound" => Ok(Direction::Inbound),
            "out" | "outbound" => Ok(Direction::Outbound),
            other => Err(format!("unknown direction '{other}'")),
        }
    }
}

/// Opaque handle the interceptor needs to reinject a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketToken(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub payload: Vec<u8>,
    pub direction: Direction,
    pub token: PacketToken,
}

pub trait PacketInterceptor: Send + Sync {
    /// Blocks until a packet arrives or the handle is closed.
    fn receive(&self) -> Result<Packet, InterceptorError>;

    /// Returns the packet to the network stack unchanged.
    fn reinject(&self, packet: Packet) -> Result<(), InterceptorError>;

    /// Consumes the packet without reinjecting it.
    fn discard(&self, packet: Packet);

    /// Wakes every pending `receive` with `Shutdown`. Idempotent.
    fn close(&self) -> Result<(), InterceptorError>;

    fn filter(&self) -> &str;
}

/// Opens interceptor handles for a filter expression.
pub trait InterceptorBackend: Send + Sync {
    fn open(&self, filter: &str) -> Result<Arc<dyn PacketInterceptor>, InterceptorError>;
}

enum Pending {
    Packet(Packet),
    Fault(String),
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Pending>,
    closed: bool,
    reinjected: Vec<Packet>,
    discarded: Vec<Packet>,
}

/// In-process interceptor backed by a condvar-guarded queue.
pub struct QueueInterceptor {
    filter: String,
    state: Mutex<QueueState>,
    ready: Condvar,
    next_token: AtomicU64,
    refuse_reinjection: AtomicBool,
}

impl QueueInterceptor {
    pub fn new(filter: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
            state: Mutex::new(QueueState::default()),
            ready: Condvar::new(),
            next_token: AtomicU64::new(1),
            refuse_reinjection: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queues a diverted packet and returns its token.
    pub fn push(&self, direction: Direction, payload: impl Into<Vec<u8>>) -> PacketToken {
        let token = PacketToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.lock().pending.push_back(Pending::Packet(Packet {
            payload: payload.into(),
            direction,
            token,
        }));
        self.ready.notify_one();
        token
    }

    /// Queues a transient receive failure.
    pub fn push_fault(&self, reason: impl Into<String>) {
        self.lock().pending.push_back(Pending::Fault(reason.into()));
        self.ready.notify_one();
    }

    /// Makes every later `reinject` fail, as when the OS refuses the packet.
    pub fn refuse_reinjection(&self, refuse: bool) {
        self.refuse_reinjection.store(refuse, Ordering::SeqCst);
    }

    pub fn reinjected(&self) -> Vec<Packet> {
        self.lock().reinjected.clone()
    }

    pub fn discarded(&self) -> Vec<Packet> {
        self.lock().discarded.clone()
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

impl PacketInterceptor for QueueInterceptor {
    fn receive(&self) -> Result<Packet, InterceptorError> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(InterceptorError::Shutdown);
            }
            if let Some(next) = state.pending.pop_front() {
                return match next {
                    Pending::Packet(packet) => Ok(packet),
                    Pending::Fault(reason) => Err(InterceptorError::Transient(reason)),
                };
            }
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn reinject(&self, packet: Packet) -> Result<(), InterceptorError> {
        if self.refuse_reinjection.load(Ordering::SeqCst) {
            return Err(InterceptorError::Reinject(format!(
                "packet {:?} refused",
                packet.token
            )));
        }
        let mut state = self.lock();
        if state.closed {
            return Err(InterceptorError::Reinject("handle is closed".to_string()));
        }
        state.reinjected.push(packet);
        Ok(())
    }

    fn discard(&self, packet: Packet) {
        self.lock().discarded.push(packet);
    }

    fn close(&self) -> Result<(), InterceptorError> {
        self.lock().closed = true;
        self.ready.notify_all();
        Ok(())
    }

    fn filter(&self) -> &str {
        &self.filter
    }
}

/// Backend handing out [`QueueInterceptor`]s.
///
/// Packets given to [`QueueBackend::with_packets`] are loaded into the first
/// handle opened. The most recently opened handle stays reachable through
/// [`QueueBackend::current`].
#[derive(Default)]
pub struct QueueBackend {
    preload: Mutex<Vec<(Direction, Vec<u8>)>>,
    current: Mutex<Option<Arc<QueueInterceptor>>>,
    open_failure: Mutex<Option<String>>,
    opened: AtomicU64,
}

impl QueueBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_packets(packets: Vec<(Direction, Vec<u8>)>) -> Self {
        Self {
            preload: Mutex::new(packets),
            ..Self::default()
        }
    }

    /// Makes every later `open` fail with `reason`; `None` clears it.
    pub fn fail_open(&self, reason: Option<String>) {
        *self
            .open_failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = reason;
    }

    pub fn current(&self) -> Option<Arc<QueueInterceptor>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn open_count(&self) -> u64 {
        self.opened.load(Ordering::SeqCst)
    }

    /// Queues packets on the open handle. Fails with `Shutdown` when no
    /// handle is open.
    pub fn feed(&self, packets: Vec<(Direction, Vec<u8>)>) -> Result<usize, InterceptorError> {
        let handle = self
            .current()
            .filter(|handle| !handle.is_closed())
            .ok_or(InterceptorError::Shutdown)?;
        let count = packets.len();
        for (direction, payload) in packets {
            handle.push(direction, payload);
        }
        Ok(count)
    }
}

impl InterceptorBackend for QueueBackend {
    fn open(&self, filter: &str) -> Result<Arc<dyn PacketInterceptor>, InterceptorError> {
        if let Some(reason) = self
            .open_failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
        {
            return Err(InterceptorError::Open {
                filter: filter.to_string(),
                reason,
            });
        }

        let handle = Arc::new(QueueInterceptor::new(filter));
        let preload = std::mem::take(
            &mut *self
                .preload
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for (direction, payload) in preload {
            handle.push(direction, payload);
        }

        *self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle.clone());
        self.opened.fetch_add(1, Ordering::SeqCst);
        log::debug!("Opened queue interceptor with filter '{filter}'");
        Ok(handle)
    }
}

/// Parses a capture file: one `<in|out> <base64 payload>` per line, `#`
/// comments.
pub fn parse_capture(content: &str) -> anyhow::Result<Vec<(Direction, Vec<u8>)>> {
    let mut packets = Vec::new();

    for (line_no, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((direction, encoded)) = line.split_once(char::is_whitespace) else {
            bail!("capture line {}: expected '<in|out> <base64>'", line_no + 1);
        };
        let direction: Direction = direction
            .parse()
            .map_err(|e: String| anyhow::anyhow!("capture line {}: {e}", line_no + 1))?;
        let payload = general_purpose::STANDARD
            .decode(encoded.trim())
            .with_context(|| format!("capture line {}: invalid base64 payload", line_no + 1))?;

        packets.push((direction, payload));
    }

    Ok(packets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_each_packet_delivered_once() {
        let queue = Arc::new(QueueInterceptor::new("true"));
        for i in 0..100u8 {
            queue.push(Direction::Inbound, vec![i]);
        }
        queue.push_fault("stop marker");

        let mut workers = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            workers.push(thread::spawn(move || {
                let mut seen = Vec::new();
                while let Ok(packet) = queue.receive() {
                    seen.push(packet.payload[0]);
                }
                seen
            }));
        }

        // Only one worker consumes the fault marker; release the rest.
        thread::sleep(Duration::from_millis(50));
        queue.close().unwrap();

        let mut all: Vec<u8> = workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..100u8).collect::<Vec<_>>());
    }

    #[test]
    fn test_close_unblocks_receivers() {
        let queue = Arc::new(QueueInterceptor::new("true"));
        let receivers: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                thread::spawn(move || queue.receive())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        queue.close().unwrap();

        for receiver in receivers {
            assert_eq!(receiver.join().unwrap(), Err(InterceptorError::Shutdown));
        }
        assert!(queue.is_closed());
        assert!(queue.close().is_ok());
    }

    #[test]
    fn test_transient_fault_is_distinguishable() {
        let queue = QueueInterceptor::new("true");
        queue.push_fault("driver hiccup");
        let err = queue.receive().unwrap_err();
        assert!(!err.is_shutdown());
        assert_eq!(err, InterceptorError::Transient("driver hiccup".to_string()));
    }

    #[test]
    fn test_reinject_and_discard_recorded() {
        let queue = QueueInterceptor::new("true");
        queue.push(Direction::Outbound, b"hello".to_vec());
        queue.push(Direction::Inbound, b"spam".to_vec());

        let first = queue.receive().unwrap();
        let second = queue.receive().unwrap();
        queue.reinject(first.clone()).unwrap();
        queue.discard(second.clone());

        assert_eq!(queue.reinjected(), vec![first]);
        assert_eq!(queue.discarded(), vec![second]);

        queue.refuse_reinjection(true);
        queue.push(Direction::Inbound, b"x".to_vec());
        let third = queue.receive().unwrap();
        assert!(matches!(queue.reinject(third), Err(InterceptorError::Reinject(_))));
    }

    #[test]
    fn test_backend_preloads_first_handle_only() {
        let backend = QueueBackend::with_packets(vec![(Direction::Inbound, b"a".to_vec())]);
        backend.open("true").unwrap();
        assert_eq!(backend.current().unwrap().pending_len(), 1);

        backend.open("true").unwrap();
        assert_eq!(backend.current().unwrap().pending_len(), 0);
        assert_eq!(backend.open_count(), 2);
    }

    #[test]
    fn test_feed_targets_open_handle() {
        let backend = QueueBackend::new();
        let packets = vec![(Direction::Inbound, b"a".to_vec()), (Direction::Outbound, b"b".to_vec())];
        assert_eq!(backend.feed(packets.clone()), Err(InterceptorError::Shutdown));

        let handle = backend.open("inbound").unwrap();
        assert_eq!(handle.filter(), "inbound");
        assert_eq!(backend.feed(packets.clone()), Ok(2));
        assert_eq!(backend.current().unwrap().pending_len(), 2);

        handle.close().unwrap();
        assert_eq!(backend.feed(packets), Err(InterceptorError::Shutdown));
    }

    #[test]
    fn test_backend_open_failure() {
        let backend = QueueBackend::new();
        backend.fail_open(Some("driver not installed".to_string()));
        let err = backend.open("tcp").err().unwrap();
        assert!(matches!(err, InterceptorError::Open { .. }));
        assert_eq!(backend.open_count(), 0);
    }

    #[test]
    fn test_parse_capture() {
        let capture = "# captured chat\n\
                       in  Z29sZA==\n\
                       \n\
                       out aGk=\n";
        let packets = parse_capture(capture).unwrap();
        assert_eq!(
            packets,
            vec![
                (Direction::Inbound, b"gold".to_vec()),
                (Direction::Outbound, b"hi".to_vec()),
            ]
        );

        assert!(parse_capture("sideways Z29sZA==").is_err());
        assert!(parse_capture("in not-base64!").is_err());
        assert!(parse_capture("in").is_err());
    }
}
