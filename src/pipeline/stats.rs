use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Lock-free inbound message counter.
///
/// `snapshot()` atomically reads and resets the counter, making it suitable
/// for periodic throughput reporting without contention.
pub struct ThroughputStats {
    received: AtomicU64,
}

impl ThroughputStats {
    pub fn new() -> Self {
        Self {
            received: AtomicU64::new(0),
        }
    }

    /// Count one inbound message.
    pub fn record(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// Atomically read and reset the counter.
    pub fn snapshot(&self) -> u64 {
        self.received.swap(0, Ordering::Relaxed)
    }

    /// Reset without reading, used on disconnect.
    pub fn reset(&self) {
        self.received.store(0, Ordering::Relaxed);
    }
}

impl Default for ThroughputStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared ping/pong and connection state, mutated by the transport and read
/// by the status publisher. Timestamps are unix milliseconds; zero means
/// "never".
pub struct LivenessState {
    connected: AtomicBool,
    last_ping_ms: AtomicU64,
    last_pong_ms: AtomicU64,
    rtt_ms: AtomicU64,
}

impl LivenessState {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            last_ping_ms: AtomicU64::new(0),
            last_pong_ms: AtomicU64::new(0),
            rtt_ms: AtomicU64::new(0),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// True while a probe is in flight. A new probe may only be sent when
    /// the previous one was answered, or none was ever sent.
    pub fn probe_outstanding(&self) -> bool {
        let ping = self.last_ping_ms.load(Ordering::Relaxed);
        ping != 0 && self.last_pong_ms.load(Ordering::Relaxed) < ping
    }

    /// Record a probe send time.
    pub fn mark_ping(&self, now_ms: u64) {
        self.last_ping_ms.store(now_ms, Ordering::Relaxed);
    }

    /// Record a probe reply and return the round-trip time.
    pub fn mark_pong(&self, now_ms: u64) -> u64 {
        self.last_pong_ms.store(now_ms, Ordering::Relaxed);
        let rtt = now_ms.saturating_sub(self.last_ping_ms.load(Ordering::Relaxed));
        self.rtt_ms.store(rtt, Ordering::Relaxed);
        rtt
    }

    pub fn rtt_ms(&self) -> u64 {
        self.rtt_ms.load(Ordering::Relaxed)
    }

    /// Zero all metrics and mark disconnected.
    pub fn reset(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.last_ping_ms.store(0, Ordering::Relaxed);
        self.last_pong_ms.store(0, Ordering::Relaxed);
        self.rtt_ms.store(0, Ordering::Relaxed);
    }
}

impl Default for LivenessState {
    fn default() -> Self {
        Self::new()
    }
}

/// Current wall-clock time in unix milliseconds.
pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
