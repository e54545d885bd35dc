//! Energy-counter deltas to average power.
//!
//! The counter only ever moves forward until it wraps at its rollover bound.
//! A drop between two reads is therefore always treated as a single wrap,
//! never as a reset. Power for a tick is derived from exactly two readings:
//! the previous successful one and the current one.

use std::time::Instant;

/// Microjoules per joule.
const UJ_PER_J: f64 = 1_000_000.0;

/// Difference between two counter readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterDelta {
    pub microjoules: u64,
    /// True if the counter wrapped between the two readings.
    pub wrapped: bool,
}

/// Compute `curr - prev`, correcting for a single wrap at `max_uj`.
pub fn counter_delta(prev: u64, curr: u64, max_uj: u64) -> CounterDelta {
    if curr >= prev {
        CounterDelta {
            microjoules: curr - prev,
            wrapped: false,
        }
    } else {
        CounterDelta {
            microjoules: max_uj.saturating_sub(prev).saturating_add(curr),
            wrapped: true,
        }
    }
}

/// Average power in watts over `elapsed_secs`.
///
/// Returns `None` when the elapsed time is zero, negative, or not finite.
pub fn average_power_watts(delta_uj: u64, elapsed_secs: f64) -> Option<f64> {
    if !elapsed_secs.is_finite() || elapsed_secs <= 0.0 {
        return None;
    }
    Some(delta_uj as f64 / elapsed_secs / UJ_PER_J)
}

/// Previous successful counter reading.
#[derive(Debug, Clone, Copy)]
struct Baseline {
    counter_uj: u64,
    at: Instant,
}

/// Stateful converter carried by the run controller across ticks.
#[derive(Debug)]
pub struct EnergyConverter {
    max_uj: u64,
    prev: Option<Baseline>,
    wraparounds: u64,
}

impl EnergyConverter {
    pub fn new(max_uj: u64) -> Self {
        Self {
            max_uj,
            prev: None,
            wraparounds: 0,
        }
    }

    /// Feed a new reading taken at `at`; returns the derived power, if any.
    ///
    /// The first reading only establishes the baseline. The baseline moves
    /// to every reading passed in, including ones whose power could not be
    /// derived because of a clock anomaly.
    pub fn update(&mut self, counter_uj: u64, at: Instant) -> Option<f64> {
        let prev = self.prev.replace(Baseline { counter_uj, at })?;

        let delta = counter_delta(prev.counter_uj, counter_uj, self.max_uj);
        if delta.wrapped {
            self.wraparounds += 1;
            log::debug!(
                "energy counter wrapped: {} -> {} (bound {}), delta {} uJ",
                prev.counter_uj,
                counter_uj,
                self.max_uj,
                delta.microjoules
            );
        }

        let elapsed = match at.checked_duration_since(prev.at) {
            Some(d) => d.as_secs_f64(),
            None => -prev.at.duration_since(at).as_secs_f64(),
        };
        average_power_watts(delta.microjoules, elapsed)
    }

    /// True once a baseline reading exists.
    pub fn has_baseline(&self) -> bool {
        self.prev.is_some()
    }

    /// Number of wraparounds observed so far.
    pub fn wraparounds(&self) -> u64 {
        self.wraparounds
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
