//! Sliding-window throughput accounting per worker and in aggregate.
//!
//! Time comes from an injectable [`Clock`], and the window only moves when
//! `move_horizon` or `add_measure` is called. The manager drives
//! `move_horizon` from its one-second tick; tests drive a [`ManualClock`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::worker::WorkerId;

/// Monotonic time source.
pub trait Clock: Send + Sync {
    /// Time elapsed since the clock's origin.
    fn elapsed(&self) -> Duration;
}

/// Wall clock backed by `Instant`.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn elapsed(&self) -> Duration {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Receives the aggregate rate (bytes/s) each time the window moves.
pub type SpeedCallback = Box<dyn Fn(f64) + Send + Sync>;

/// Weight of the newest aggregate sample in the target rate.
const TARGET_ADAPT: f64 = 0.01;
/// A worker below `fair_share / STARVING_FACTOR` is starving.
const STARVING_FACTOR: f64 = 5.0;

struct Counter {
    buckets: VecDeque<f64>,
    started: f64,
    last_measure: f64,
}

pub struct SpeedCalculator {
    horizon: usize,
    clock: Arc<dyn Clock>,
    /// Absolute second of the newest bucket.
    head: i64,
    aggregate: VecDeque<f64>,
    counters: HashMap<WorkerId, Counter>,
    target_rate: f64,
    on_speed: Option<SpeedCallback>,
}

impl SpeedCalculator {
    pub fn new(horizon: usize, clock: Arc<dyn Clock>) -> Self {
        let horizon = horizon.max(1);
        let head = clock.elapsed().as_secs() as i64;
        Self {
            horizon,
            clock,
            head,
            aggregate: VecDeque::from(vec![0.0; horizon]),
            counters: HashMap::new(),
            target_rate: 0.0,
            on_speed: None,
        }
    }

    pub fn with_callback(mut self, on_speed: SpeedCallback) -> Self {
        self.on_speed = Some(on_speed);
        self
    }

    pub fn init_counter(&mut self, id: WorkerId) {
        let now = self.now_secs();
        self.shift_to(now.floor() as i64);
        self.counters.insert(
            id,
            Counter {
                buckets: VecDeque::from(vec![0.0; self.horizon]),
                started: now,
                last_measure: now,
            },
        );
    }

    pub fn stop_counter(&mut self, id: WorkerId) {
        self.counters.remove(&id);
    }

    /// Record `bytes` received by worker `id` since its previous measurement.
    ///
    /// The bytes are spread over the seconds between the two measurements, in
    /// the worker's series and the aggregate. Returns true when the worker is
    /// starving: its trailing rate is below a fifth of its fair share of the
    /// slowly adapting target rate.
    pub fn add_measure(&mut self, id: WorkerId, bytes: u64) -> bool {
        let now = self.now_secs();
        self.shift_to(now.floor() as i64);
        if !self.counters.contains_key(&id) {
            self.init_counter(id);
        }

        let horizon = self.horizon;
        let oldest = self.head - horizon as i64 + 1;
        let Some(counter) = self.counters.get_mut(&id) else {
            return false;
        };
        let from = counter.last_measure;
        counter.last_measure = now;

        for (second, portion) in spread(bytes as f64, from, now) {
            if second < oldest || second > self.head {
                continue;
            }
            let idx = (second - oldest) as usize;
            counter.buckets[idx] += portion;
            self.aggregate[idx] += portion;
        }

        let worker_rate = counter.buckets.iter().sum::<f64>() / horizon as f64;
        let young = now - counter.started < horizon as f64;
        let aggregate_rate = self.aggregate_rate();
        self.target_rate = self.target_rate * (1.0 - TARGET_ADAPT) + aggregate_rate * TARGET_ADAPT;

        if young {
            return false;
        }
        let fair_share = self.target_rate / self.counters.len().max(1) as f64;
        worker_rate < fair_share / STARVING_FACTOR
    }

    /// Shift the window to the current second and emit the aggregate rate.
    pub fn move_horizon(&mut self) -> f64 {
        let now = self.now_secs();
        self.shift_to(now.floor() as i64);
        let rate = self.aggregate_rate();
        if let Some(cb) = &self.on_speed {
            cb(rate);
        }
        rate
    }

    /// Aggregate bytes per second over the window.
    pub fn aggregate_rate(&self) -> f64 {
        self.aggregate.iter().sum::<f64>() / self.horizon as f64
    }

    /// Bytes per second of one worker over the window.
    pub fn worker_rate(&self, id: WorkerId) -> Option<f64> {
        self.counters
            .get(&id)
            .map(|c| c.buckets.iter().sum::<f64>() / self.horizon as f64)
    }

    pub fn target_rate(&self) -> f64 {
        self.target_rate
    }

    fn now_secs(&self) -> f64 {
        self.clock.elapsed().as_secs_f64()
    }

    fn shift_to(&mut self, second: i64) {
        if second <= self.head {
            return;
        }
        let steps = (second - self.head) as usize;
        self.head = second;
        if steps >= self.horizon {
            self.aggregate.iter_mut().for_each(|b| *b = 0.0);
            for c in self.counters.values_mut() {
                c.buckets.iter_mut().for_each(|b| *b = 0.0);
            }
            return;
        }
        for _ in 0..steps {
            self.aggregate.pop_front();
            self.aggregate.push_back(0.0);
            for c in self.counters.values_mut() {
                c.buckets.pop_front();
                c.buckets.push_back(0.0);
            }
        }
    }
}

/// Split `bytes` received over `[from, to)` into per-second portions.
fn spread(bytes: f64, from: f64, to: f64) -> Vec<(i64, f64)> {
    let span = to - from;
    if span <= f64::EPSILON {
        return vec![(to.floor() as i64, bytes)];
    }
    let first = from.floor() as i64;
    let last = to.floor() as i64;
    let mut out = Vec::with_capacity((last - first + 1) as usize);
    for second in first..=last {
        let start = from.max(second as f64);
        let end = to.min(second as f64 + 1.0);
        if end > start {
            out.push((second, bytes * (end - start) / span));
        }
    }
    out
}
