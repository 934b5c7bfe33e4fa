//! Adaptive request timeout from observed round trip times.
//!
//! Keeps the last [SAMPLES] round trip times in a ring buffer and every
//! [RECALC_INTERVAL] samples publishes a sorted snapshot with two quantiles:
//! a high one (ceiling) and a low one (baseline). The stall timeout is
//! derived from both so that neither a few slow outliers nor a run of very
//! fast responses drags it too far.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tracing::trace;

/// Number of retained samples.
pub const SAMPLES: usize = 256;
/// Thresholds are recomputed once per this many samples.
pub const RECALC_INTERVAL: usize = 16;

/// Default upper bound for the stall timeout.
pub const DEFAULT_MAX_TIMEOUT: Duration = Duration::from_secs(10);
/// Default margin added to the baseline.
pub const DEFAULT_MIN_MARGIN: Duration = Duration::from_millis(100);

const CEILING_QUANTILE: (usize, usize) = (9, 10);
const BASELINE_QUANTILE: (usize, usize) = (1, 10);

#[derive(Debug, Clone)]
/// Estimator configurations
pub struct Config {
    /// Longest timeout ever returned, also the seed value for all samples.
    ///
    /// Defaults to [DEFAULT_MAX_TIMEOUT]
    pub max_timeout: Duration,
    /// Added to the baseline so uniform low latency does not collapse the
    /// timeout towards zero.
    ///
    /// Defaults to [DEFAULT_MIN_MARGIN]
    pub min_margin: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_timeout: DEFAULT_MAX_TIMEOUT,
            min_margin: DEFAULT_MIN_MARGIN,
        }
    }
}

/// Immutable view of the samples at the last recalculation.
#[derive(Debug)]
struct Snapshot {
    sorted: Box<[Duration]>,
    ceiling: Duration,
    baseline: Duration,
}

impl Snapshot {
    fn new(mut samples: Vec<Duration>) -> Self {
        samples.sort_unstable();

        let quantile = |(num, den): (usize, usize)| samples[samples.len() * num / den];
        let ceiling = quantile(CEILING_QUANTILE);
        let baseline = quantile(BASELINE_QUANTILE);

        Self {
            sorted: samples.into_boxed_slice(),
            ceiling,
            baseline,
        }
    }
}

/// Round trip time tracker shared by everything that sends requests.
///
/// Any thread may report samples; readers always see the thresholds of one
/// complete recalculation.
#[derive(Debug)]
pub struct RttEstimator {
    config: Config,
    /// Samples in microseconds.
    samples: Box<[AtomicU64]>,
    cursor: AtomicUsize,
    snapshot: ArcSwap<Snapshot>,
}

impl RttEstimator {
    pub fn new(config: Config) -> Self {
        let seed = micros(config.max_timeout);

        Self {
            samples: (0..SAMPLES).map(|_| AtomicU64::new(seed)).collect(),
            cursor: AtomicUsize::new(0),
            snapshot: ArcSwap::from_pointee(Snapshot::new(vec![config.max_timeout; SAMPLES])),
            config,
        }
    }

    // === Getters ===

    /// High quantile of the last snapshot.
    pub fn ceiling(&self) -> Duration {
        self.snapshot.load().ceiling
    }

    /// Low quantile of the last snapshot.
    pub fn baseline(&self) -> Duration {
        self.snapshot.load().baseline
    }

    /// Samples reported since creation or the last [Self::reset].
    pub fn sample_count(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }

    // === Public Methods ===

    /// Records a completed request's round trip time.
    pub fn update(&self, rtt: Duration) {
        let n = self.cursor.fetch_add(1, Ordering::SeqCst);
        self.samples[n % SAMPLES].store(micros(rtt), Ordering::SeqCst);

        if (n + 1) % RECALC_INTERVAL == 0 {
            self.recalculate();
        }
    }

    /// How long to wait for a response before considering the request stalled.
    ///
    /// `min(max(baseline + margin, ceiling), max_timeout)`. Without enough
    /// samples this is `max_timeout`.
    pub fn stall_timeout(&self) -> Duration {
        let snapshot = self.snapshot.load();

        (snapshot.baseline + self.config.min_margin)
            .max(snapshot.ceiling)
            .min(self.config.max_timeout)
    }

    /// Fraction of recent requests that completed within `elapsed`.
    ///
    /// An empirical CDF over the last snapshot.
    pub fn completion_probability(&self, elapsed: Duration) -> f64 {
        let snapshot = self.snapshot.load();
        let completed = snapshot.sorted.partition_point(|rtt| *rtt <= elapsed);

        completed as f64 / snapshot.sorted.len() as f64
    }

    /// Estimated chance that a request in flight for `elapsed` is still
    /// going to be answered in the time recent requests took.
    pub fn flight_probability(&self, elapsed: Duration) -> f64 {
        1.0 - self.completion_probability(elapsed)
    }

    /// Forgets all samples, going back to the seeded state.
    ///
    /// A recalculation that overlaps the reset is discarded instead of
    /// replacing the seeded thresholds. A sample reported while the reset
    /// runs may be kept or dropped.
    pub fn reset(&self) {
        let seed = micros(self.config.max_timeout);
        for sample in self.samples.iter() {
            sample.store(seed, Ordering::SeqCst);
        }
        self.cursor.store(0, Ordering::SeqCst);
        self.snapshot
            .store(Arc::new(Snapshot::new(vec![self.config.max_timeout; SAMPLES])));
    }

    // === Private Methods ===

    fn recalculate(&self) {
        let (current, snapshot) = self.prepare();
        self.publish(&current, snapshot);
    }

    /// Reads the samples into a new snapshot, along with the snapshot it is
    /// meant to replace.
    fn prepare(&self) -> (Arc<Snapshot>, Snapshot) {
        // Loaded before the samples, so a reset in between changes it.
        let current = self.snapshot.load_full();
        let samples = self
            .samples
            .iter()
            .map(|sample| Duration::from_micros(sample.load(Ordering::SeqCst)))
            .collect();

        (current, Snapshot::new(samples))
    }

    /// Stores `snapshot` unless something else was published since
    /// `current` was read.
    fn publish(&self, current: &Arc<Snapshot>, snapshot: Snapshot) {
        let (ceiling, baseline) = (snapshot.ceiling, snapshot.baseline);
        let previous = self.snapshot.compare_and_swap(current, Arc::new(snapshot));

        if Arc::ptr_eq(&previous, current) {
            trace!(context = "rtt", ?ceiling, ?baseline, "Recalculated RTT thresholds");
        } else {
            trace!(context = "rtt", "Dropped a stale RTT recalculation");
        }
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}
