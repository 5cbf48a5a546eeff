//! Sliding-window transfer counters.
//!
//! The choking engine ranks peers by recent throughput, not lifetime
//! totals. A [`PeriodicCounter`] keeps per-unit totals in a small ring and
//! reports the sum of *completed* units only; the unit currently
//! accumulating is excluded until the window advances past it.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

/// A window shape: `total_units` units of `unit_millis` each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    pub unit_millis: u64,
    pub total_units: usize,
}

impl Period {
    pub const fn new(unit_millis: u64, total_units: usize) -> Self {
        Self {
            unit_millis,
            total_units,
        }
    }

    /// Length of the whole window in milliseconds.
    pub fn span_millis(&self) -> u64 {
        self.unit_millis * self.total_units as u64
    }
}

/// Ring of `total_units + 1` per-unit totals with a running sum.
///
/// The extra slot is the unit currently being filled; `total()` covers the
/// completed units behind it. `advance(n)` completes the current unit and
/// evicts the oldest `n` totals from the sum.
#[derive(Debug, Clone)]
pub struct PeriodicCounter {
    period: Period,
    ring: Vec<u64>,
    cur: usize,
    completed: u64,
}

impl PeriodicCounter {
    pub fn new(period: Period) -> Self {
        Self {
            period,
            ring: vec![0; period.total_units + 1],
            cur: 0,
            completed: 0,
        }
    }

    /// Adds `value` to the unit currently accumulating.
    pub fn add(&mut self, value: u64) {
        self.ring[self.cur] += value;
    }

    /// Advances the window by `units`, evicting the oldest totals.
    pub fn advance(&mut self, units: usize) {
        // Beyond a full ring every slot has been evicted anyway.
        let steps = units.min(self.ring.len());
        for _ in 0..steps {
            self.completed += self.ring[self.cur];
            self.cur = (self.cur + 1) % self.ring.len();
            self.completed -= self.ring[self.cur];
            self.ring[self.cur] = 0;
        }
    }

    /// Sum over the completed units of the window.
    pub fn total(&self) -> u64 {
        self.completed
    }

    /// Value accumulated in the unit still in progress.
    pub fn current_unit(&self) -> u64 {
        self.ring[self.cur]
    }

    pub fn period(&self) -> Period {
        self.period
    }
}

/// A [`PeriodicCounter`] tied to the monotonic clock.
///
/// The inner window is lazily advanced to "now" before every read or
/// write, so callers never tick it explicitly.
#[derive(Debug, Clone)]
pub struct TemporalCounter {
    counter: PeriodicCounter,
    last_advance: Instant,
}

impl TemporalCounter {
    pub fn new(period: Period) -> Self {
        Self {
            counter: PeriodicCounter::new(period),
            last_advance: Instant::now(),
        }
    }

    pub fn add(&mut self, value: u64) {
        self.sync();
        self.counter.add(value);
    }

    pub fn total(&mut self) -> u64 {
        self.sync();
        self.counter.total()
    }

    /// Completed units plus the unit in progress: the full trailing
    /// window, for callers ranking by very recent activity.
    pub fn total_with_partial(&mut self) -> u64 {
        self.sync();
        self.counter.total() + self.counter.current_unit()
    }

    /// Average rate over the window, in units of `value` per second.
    pub fn rate_per_sec(&mut self) -> f64 {
        let total = self.total();
        let span = self.counter.period().span_millis();
        if span == 0 {
            return 0.0;
        }
        total as f64 * 1000.0 / span as f64
    }

    fn sync(&mut self) {
        let unit = self.counter.period().unit_millis;
        let elapsed = self.last_advance.elapsed().as_millis() as u64;
        let units = (elapsed / unit) as usize;
        if units > 0 {
            self.counter.advance(units);
            self.last_advance += Duration::from_millis(units as u64 * unit);
        }
    }
}

/// A running grand total fanned out into zero or more sliding windows,
/// optionally propagating every addition into a parent counter.
///
/// Parents form a tree: the back-reference is set once after construction
/// and children never own their parent, so no cycle can form.
pub struct StatisticCounter {
    inner: Mutex<StatInner>,
    parent: OnceLock<Arc<StatisticCounter>>,
}

struct StatInner {
    grand_total: u64,
    windows: Vec<TemporalCounter>,
}

impl StatisticCounter {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StatInner {
                grand_total: 0,
                windows: Vec::new(),
            }),
            parent: OnceLock::new(),
        }
    }

    pub fn with_windows(periods: &[Period]) -> Self {
        let counter = Self::new();
        for &p in periods {
            counter.register_window(p);
        }
        counter
    }

    /// Registers an additional sliding window fed by future additions.
    pub fn register_window(&self, period: Period) {
        let mut inner = self.inner.lock().unwrap();
        inner.windows.push(TemporalCounter::new(period));
    }

    /// Sets the parent counter. May only be called once.
    pub fn set_parent(&self, parent: Arc<StatisticCounter>) {
        if self.parent.set(parent).is_err() {
            panic!("statistic counter parent already set");
        }
    }

    /// Adds `value` to the grand total, every window, and the parent chain.
    pub fn add(&self, value: u64) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.grand_total += value;
            for w in inner.windows.iter_mut() {
                w.add(value);
            }
        }
        if let Some(parent) = self.parent.get() {
            parent.add(value);
        }
    }

    pub fn grand_total(&self) -> u64 {
        self.inner.lock().unwrap().grand_total
    }

    /// Total of the first registered window matching `period`.
    pub fn window_total(&self, period: Period) -> Option<u64> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .windows
            .iter_mut()
            .find(|w| w.counter.period() == period)
            .map(|w| w.total())
    }
}

impl Default for StatisticCounter {
    fn default() -> Self {
        Self::new()
    }
}
