/// Scoring and health model for exit nodes
///
/// Latency is a moving average over the last few pong round-trips.
/// Reliability is a multiplicative reputation factor. The score is always
/// derived from the two on demand and never stored.

use relaymesh_common::config::scoring;
use serde::Serialize;
use std::collections::VecDeque;

/// Latency axis of the score, in `[0, 1]`
pub fn latency_score(latency_ms: f64) -> f64 {
    let raw = 1.0 - (latency_ms - scoring::LATENCY_BASELINE_MS) / scoring::LATENCY_SPAN_MS;
    raw.clamp(0.0, 1.0)
}

/// `100 * (0.6 * latencyScore + 0.4 * reliability)`
pub fn compute_score(latency_ms: f64, reliability: f64) -> f64 {
    100.0
        * (scoring::LATENCY_WEIGHT * latency_score(latency_ms)
            + scoring::RELIABILITY_WEIGHT * reliability)
}

/// Per-node health state
#[derive(Debug, Clone)]
pub struct HealthMetrics {
    samples: VecDeque<f64>,
    window: usize,
    latency_ms: Option<f64>,
    reliability: f64,
    /// Reserved, not used by scoring
    availability: f64,
}

impl Default for HealthMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthMetrics {
    pub fn new() -> Self {
        Self::with_window(scoring::LATENCY_WINDOW)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(window.max(1)),
            window: window.max(1),
            latency_ms: None,
            reliability: scoring::INITIAL_RELIABILITY,
            availability: 1.0,
        }
    }

    /// Add a round-trip sample and recompute the moving average
    pub fn record_latency(&mut self, rtt_ms: f64) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(rtt_ms.max(0.0));

        let sum: f64 = self.samples.iter().sum();
        self.latency_ms = Some(sum / self.samples.len() as f64);
    }

    /// Averaged latency, `None` before the first pong
    pub fn latency_ms(&self) -> Option<f64> {
        self.latency_ms
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// True until the latency window has filled once
    pub fn needs_warmup(&self) -> bool {
        self.samples.len() < self.window
    }

    pub fn is_measured(&self) -> bool {
        self.latency_ms.is_some()
    }

    pub fn reliability(&self) -> f64 {
        self.reliability
    }

    pub fn availability(&self) -> f64 {
        self.availability
    }

    /// Successful connect: grow reliability up to the cap
    pub fn reward(&mut self) -> f64 {
        self.reliability = (self.reliability * scoring::REWARD_FACTOR).min(scoring::MAX_RELIABILITY);
        self.reliability
    }

    /// Connect timeout or failure: decay reliability down to the floor
    pub fn penalize(&mut self) -> f64 {
        self.reliability = (self.reliability * scoring::PENALTY_FACTOR).max(scoring::MIN_RELIABILITY);
        self.reliability
    }

    /// Current score. An unmeasured node scores on reliability alone.
    pub fn score(&self) -> f64 {
        match self.latency_ms {
            Some(latency) => compute_score(latency, self.reliability),
            None => 100.0 * scoring::RELIABILITY_WEIGHT * self.reliability,
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            latency_ms: self.latency_ms,
            reliability: self.reliability,
            score: self.score(),
            samples: self.samples.len(),
        }
    }
}

/// Point-in-time copy of a node's health, for selection and stats
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HealthSnapshot {
    pub latency_ms: Option<f64>,
    pub reliability: f64,
    pub score: f64,
    pub samples: usize,
}
