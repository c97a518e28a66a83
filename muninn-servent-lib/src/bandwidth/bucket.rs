//! Windowed token-bucket byte scheduler.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::{BandwidthScheduler, Direction};
use crate::lock;

const REFILL_WINDOW: Duration = Duration::from_millis(1000);

/// A per-direction byte budget refilled once per window.
///
/// The bucket tracks whether the previous window ran dry; `saturated` reports
/// true while either the current or the last completed window hit zero, which
/// is the signal the status builder uses to shrink reply headers.
pub struct TokenBucket {
    inbound: Side,
    outbound: Side,
}

struct Side {
    capacity: usize,
    state: Mutex<SideState>,
}

struct SideState {
    window_started: Instant,
    remaining: usize,
    drained: bool,
    last_drained: bool,
}

impl Side {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(SideState {
                window_started: Instant::now(),
                remaining: capacity,
                drained: false,
                last_drained: false,
            }),
        }
    }

    fn roll(&self, st: &mut SideState) {
        let now = Instant::now();
        if now.duration_since(st.window_started) >= REFILL_WINDOW {
            st.last_drained = st.drained || st.remaining == 0;
            st.remaining = self.capacity;
            st.drained = false;
            st.window_started = now;
        }
    }
}

impl TokenBucket {
    /// Budgets are bytes per second and must be non-zero; use
    /// [`Unmetered`](super::Unmetered) for an unthrottled link.
    pub fn new(inbound_per_sec: usize, outbound_per_sec: usize) -> Self {
        debug_assert!(inbound_per_sec > 0 && outbound_per_sec > 0);
        Self {
            inbound: Side::new(inbound_per_sec.max(1)),
            outbound: Side::new(outbound_per_sec.max(1)),
        }
    }

    fn side(&self, dir: Direction) -> &Side {
        match dir {
            Direction::Inbound => &self.inbound,
            Direction::Outbound => &self.outbound,
        }
    }
}

impl BandwidthScheduler for TokenBucket {
    fn claim(&self, dir: Direction, want: usize) -> usize {
        let side = self.side(dir);
        let mut st = lock(&side.state);
        side.roll(&mut st);
        let granted = want.min(st.remaining);
        st.remaining -= granted;
        if st.remaining == 0 {
            st.drained = true;
        }
        granted
    }

    fn give_back(&self, dir: Direction, unused: usize) {
        let side = self.side(dir);
        let mut st = lock(&side.state);
        st.remaining = (st.remaining + unused).min(side.capacity);
        if st.remaining > 0 {
            st.drained = false;
        }
    }

    fn saturated(&self, dir: Direction) -> bool {
        let side = self.side(dir);
        let mut st = lock(&side.state);
        side.roll(&mut st);
        st.drained || st.last_drained
    }

    fn refill_wait(&self, dir: Direction) -> Duration {
        let side = self.side(dir);
        let st = lock(&side.state);
        REFILL_WINDOW.saturating_sub(st.window_started.elapsed())
    }
}
