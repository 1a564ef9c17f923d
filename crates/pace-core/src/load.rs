//! Exponentially decayed job throughput, in the style of Unix load averages.

use std::fmt;
use std::time::Duration;

/// How often the averages are recomputed by default.
pub const DEFAULT_LOAD_INTERVAL: Duration = Duration::from_secs(5);

/// Averaging windows: 1, 5 and 15 minutes.
pub const LOAD_WINDOWS: [Duration; 3] = [
    Duration::from_secs(60),
    Duration::from_secs(5 * 60),
    Duration::from_secs(15 * 60),
];

/// Snapshot of the decayed averages, one per window in [`LOAD_WINDOWS`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LoadAverages(pub [f64; 3]);

impl LoadAverages {
    pub fn one(&self) -> f64 {
        self.0[0]
    }

    pub fn five(&self) -> f64 {
        self.0[1]
    }

    pub fn fifteen(&self) -> f64 {
        self.0[2]
    }
}

impl fmt::Display for LoadAverages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} {:.2} {:.2}", self.0[0], self.0[1], self.0[2])
    }
}

/// Counts processed jobs and folds them into decayed averages on demand.
///
/// `tick` is called once per successful job; `recompute` is driven by a
/// periodic timer. Averages are in jobs per interval.
#[derive(Debug, Clone)]
pub struct LoadTracker {
    interval: Duration,
    pending: u64,
    total: u64,
    averages: LoadAverages,
}

impl LoadTracker {
    pub fn new(interval: Duration) -> Self {
        LoadTracker {
            interval,
            pending: 0,
            total: 0,
            averages: LoadAverages::default(),
        }
    }

    pub fn tick(&mut self) {
        self.pending += 1;
        self.total += 1;
    }

    /// Recompute assuming exactly one interval has elapsed.
    pub fn recompute(&mut self) -> LoadAverages {
        self.recompute_after(self.interval)
    }

    /// Fold the ticks seen since the last recompute into every window and
    /// reset the pending count.
    pub fn recompute_after(&mut self, elapsed: Duration) -> LoadAverages {
        let ticks = self.pending as f64;

        for (average, window) in self.averages.0.iter_mut().zip(LOAD_WINDOWS) {
            let decay = decay_factor(elapsed, window);
            *average = *average * decay + ticks * (1.0 - decay);
        }

        self.pending = 0;
        self.averages
    }

    pub fn averages(&self) -> LoadAverages {
        self.averages
    }

    /// Ticks since the last recompute.
    pub fn pending(&self) -> u64 {
        self.pending
    }

    /// Ticks since the tracker was created.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Default for LoadTracker {
    fn default() -> Self {
        Self::new(DEFAULT_LOAD_INTERVAL)
    }
}

fn decay_factor(elapsed: Duration, window: Duration) -> f64 {
    (-elapsed.as_secs_f64() / window.as_secs_f64()).exp()
}
