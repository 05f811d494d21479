//! Monotonic clocks (spec §3 "Network clock state", §4.6).
//!
//! [`LocalClock`] is the server's plain monotonic microsecond clock used to
//! stamp `time_captured`/`time_encoded` and to answer `PingRequest`.
//! [`NetworkClock`] is the client's ping-driven estimator that keeps a
//! client-visible clock approximately aligned with the server's.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;

use crate::frame::Micros;

/// A plain steady-clock-anchored microsecond counter. Reads are lock-free.
#[derive(Debug)]
pub struct LocalClock {
    origin: Instant,
}

impl LocalClock {
    pub fn new() -> Self {
        LocalClock { origin: Instant::now() }
    }

    pub fn time(&self) -> Micros {
        self.origin.elapsed().as_micros() as Micros
    }
}

impl Default for LocalClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Backward-drift threshold that forces a hard epoch jump rather than a
/// gradual slew (spec §4.6).
pub const PANIC_THRESHOLD_US: i64 = 5_000_000;
/// Smallest offset worth correcting at all (spec §4.6).
pub const MINIMUM_THRESHOLD_US: i64 = 1_000;
/// Pending pings older than this are dropped silently (spec §4.5, §5).
const PING_GC_AGE: Duration = Duration::from_secs(30);
/// Steady-state ping cadence once the cold-start warm-up has 3 in flight.
const PING_INTERVAL: Duration = Duration::from_secs(5);
/// Number of pings the cold-start phase tries to keep in flight at once.
const WARMUP_IN_FLIGHT: usize = 3;

struct ClockState {
    pending: HashMap<u32, Instant>,
    last_ping: Option<Instant>,
}

/// Client-side latency/offset estimator.
///
/// `time()` is lock-free — it reads only atomics — while `generate_ping`
/// and `adjust` take a mutex over the small pending-ping bookkeeping (spec
/// §5 "NetworkClock state is mutex-protected; time() is lock-free").
pub struct NetworkClock {
    origin: Instant,
    /// `time() = elapsed(origin) - shift`. Adjustments change `shift`.
    shift_us: AtomicI64,
    /// Highest value ever returned by `time()`. Reads clamp to this floor so
    /// that no adjustment — forward or backward — can make `time()` regress
    /// for a serial reader (spec §8 property 3). Once real elapsed time
    /// catches back up past the floor, reads track it again normally.
    floor_us: AtomicI64,
    latency_us: AtomicI64,
    state: Mutex<ClockState>,
}

impl NetworkClock {
    pub fn new() -> Self {
        NetworkClock {
            origin: Instant::now(),
            shift_us: AtomicI64::new(0),
            floor_us: AtomicI64::new(0),
            latency_us: AtomicI64::new(1),
            state: Mutex::new(ClockState { pending: HashMap::new(), last_ping: None }),
        }
    }

    /// Client-visible monotonic microsecond clock.
    pub fn time(&self) -> Micros {
        let raw = self.origin.elapsed().as_micros() as i64 - self.shift_us.load(Ordering::Acquire);
        let prev_floor = self.floor_us.fetch_max(raw, Ordering::AcqRel);
        raw.max(prev_floor)
    }

    /// EWMA estimate of half-round-trip latency, in microseconds.
    pub fn latency(&self) -> i64 {
        self.latency_us.load(Ordering::Acquire)
    }

    /// Jitter is reserved for future use; the spec leaves it permanently 0.
    pub fn jitter(&self) -> i64 {
        0
    }

    /// Returns a fresh non-zero ping id, or 0 if steady-state pacing says to
    /// wait: once `WARMUP_IN_FLIGHT` pings are outstanding, further pings are
    /// gated to one per [`PING_INTERVAL`].
    pub fn generate_ping(&self) -> u32 {
        let mut st = self.state.lock();
        let now = Instant::now();
        st.pending.retain(|_, sent| now.duration_since(*sent) < PING_GC_AGE);

        let warming_up = st.pending.len() < WARMUP_IN_FLIGHT;
        if !warming_up {
            if let Some(last) = st.last_ping {
                if now.duration_since(last) < PING_INTERVAL {
                    return 0;
                }
            }
        }

        let id = loop {
            let candidate: u32 = rand::thread_rng().gen();
            if candidate != 0 {
                break candidate;
            }
        };
        st.pending.insert(id, now);
        st.last_ping = Some(now);
        id
    }

    /// Feeds back a `PingResponse`. Unknown ids (already GC'd, or never
    /// sent) are ignored silently.
    pub fn adjust(&self, id: u32, remote_micros: Micros) {
        let sent_time = {
            let mut st = self.state.lock();
            match st.pending.remove(&id) {
                Some(t) => t,
                None => return,
            }
        };

        let rtt_us = Instant::now().duration_since(sent_time).as_micros() as i64;
        let prev_latency = self.latency_us.load(Ordering::Acquire);
        let new_latency = (prev_latency + (rtt_us - prev_latency) / 2).max(1);
        self.latency_us.store(new_latency, Ordering::Release);

        let local_micros = self.time();
        let diff = remote_micros - local_micros;
        let abs_diff = diff.abs();

        if abs_diff >= PANIC_THRESHOLD_US {
            self.shift_us.fetch_sub(diff, Ordering::AcqRel);
        } else if abs_diff >= MINIMUM_THRESHOLD_US {
            self.shift_us.fetch_sub(diff / 2, Ordering::AcqRel);
        }
    }
}

impl Default for NetworkClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_clock_advances() {
        let c = LocalClock::new();
        let t0 = c.time();
        std::thread::sleep(Duration::from_millis(5));
        assert!(c.time() > t0);
    }

    #[test]
    fn generate_ping_never_returns_zero_id() {
        let c = NetworkClock::new();
        for _ in 0..3 {
            assert_ne!(c.generate_ping(), 0);
        }
    }

    #[test]
    fn warmup_gate_then_steady_state_gate() {
        let c = NetworkClock::new();
        assert_ne!(c.generate_ping(), 0);
        assert_ne!(c.generate_ping(), 0);
        assert_ne!(c.generate_ping(), 0);
        // 3 now in flight: steady-state gate kicks in immediately.
        assert_eq!(c.generate_ping(), 0);
    }

    #[test]
    fn adjust_ignores_unknown_id() {
        let c = NetworkClock::new();
        let before = c.time();
        c.adjust(0xdead_beef, before + 10_000_000);
        // No pending entry for that id: no jump.
        assert!((c.time() - before).abs() < 50_000);
    }

    #[test]
    fn adjust_converges_toward_ahead_remote() {
        let c = NetworkClock::new();
        let delta_us = 50_000; // remote is 50ms ahead, well above MINIMUM
        for _ in 0..6 {
            let id = c.generate_ping();
            let local_now = c.time();
            c.adjust(id, local_now + delta_us);
        }
        // Should have converged close to the remote offset.
        let id = c.generate_ping();
        let local_now = c.time();
        let remote = local_now + delta_us;
        c.adjust(id, remote);
        let diff = (remote - c.time()).abs();
        assert!(diff < MINIMUM_THRESHOLD_US, "diff={diff}");
    }

    #[test]
    fn time_is_monotonic_under_adjustment() {
        let c = NetworkClock::new();
        let mut last = c.time();
        for i in 0..20 {
            let id = c.generate_ping();
            // Simulate a remote that sometimes jumps backward hard.
            let remote = if i % 4 == 0 { last - 10_000_000 } else { last + 1_000 };
            c.adjust(id, remote);
            let now = c.time();
            assert!(now >= last, "time went backward: {now} < {last}");
            last = now;
        }
    }
}
