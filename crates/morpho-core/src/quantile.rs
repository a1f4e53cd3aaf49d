//! Pluggable quantile estimators for baselines and adaptive thresholds.
//!
//! - [`ExactWindow`]: keeps the last `window` samples and sorts on demand.
//!   Exact, O(window) memory.
//! - [`P2Quantile`]: Jain & Chlamtac's P² streaming estimator. Five markers,
//!   O(1) memory, approximates the quantile over the whole stream.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Streaming estimate of a single fixed quantile.
pub trait QuantileEstimator: Send + Sync {
    fn observe(&mut self, x: f64);
    /// Current estimate, `None` until at least one sample was observed.
    fn value(&self) -> Option<f64>;
    fn count(&self) -> usize;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorKind {
    #[default]
    Exact,
    P2,
}

impl EstimatorKind {
    pub fn build(self, q: f64, window: usize) -> Box<dyn QuantileEstimator> {
        match self {
            EstimatorKind::Exact => Box::new(ExactWindow::new(q, window)),
            EstimatorKind::P2 => Box::new(P2Quantile::new(q)),
        }
    }
}

/// Nearest-rank quantile of a slice. Returns `None` for an empty slice.
pub fn nearest_rank(samples: &[f64], q: f64) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);
    let rank = (q.clamp(0.0, 1.0) * sorted.len() as f64).ceil() as usize;
    Some(sorted[rank.saturating_sub(1).min(sorted.len() - 1)])
}

pub struct ExactWindow {
    q: f64,
    window: usize,
    samples: VecDeque<f64>,
    seen: usize,
}

impl ExactWindow {
    pub fn new(q: f64, window: usize) -> Self {
        Self {
            q,
            window: window.max(1),
            samples: VecDeque::with_capacity(window.max(1)),
            seen: 0,
        }
    }
}

impl QuantileEstimator for ExactWindow {
    fn observe(&mut self, x: f64) {
        if !x.is_finite() {
            return;
        }
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(x);
        self.seen += 1;
    }

    fn value(&self) -> Option<f64> {
        let (a, b) = self.samples.as_slices();
        let mut all = Vec::with_capacity(a.len() + b.len());
        all.extend_from_slice(a);
        all.extend_from_slice(b);
        nearest_rank(&all, self.q)
    }

    fn count(&self) -> usize {
        self.seen
    }
}

pub struct P2Quantile {
    p: f64,
    /// Marker heights.
    heights: [f64; 5],
    /// Actual marker positions (1-based).
    positions: [f64; 5],
    /// Desired marker positions.
    desired: [f64; 5],
    increments: [f64; 5],
    warmup: Vec<f64>,
    count: usize,
}

impl P2Quantile {
    pub fn new(p: f64) -> Self {
        let p = p.clamp(0.0, 1.0);
        Self {
            p,
            heights: [0.0; 5],
            positions: [1.0, 2.0, 3.0, 4.0, 5.0],
            desired: [1.0, 1.0 + 2.0 * p, 1.0 + 4.0 * p, 3.0 + 2.0 * p, 5.0],
            increments: [0.0, p / 2.0, p, (1.0 + p) / 2.0, 1.0],
            warmup: Vec::with_capacity(5),
            count: 0,
        }
    }

    fn parabolic(&self, i: usize, d: f64) -> f64 {
        let (q, n) = (&self.heights, &self.positions);
        q[i] + d / (n[i + 1] - n[i - 1])
            * ((n[i] - n[i - 1] + d) * (q[i + 1] - q[i]) / (n[i + 1] - n[i])
                + (n[i + 1] - n[i] - d) * (q[i] - q[i - 1]) / (n[i] - n[i - 1]))
    }

    fn linear(&self, i: usize, d: f64) -> f64 {
        let j = if d > 0.0 { i + 1 } else { i - 1 };
        let (q, n) = (&self.heights, &self.positions);
        q[i] + d * (q[j] - q[i]) / (n[j] - n[i])
    }
}

impl QuantileEstimator for P2Quantile {
    fn observe(&mut self, x: f64) {
        if !x.is_finite() {
            return;
        }
        self.count += 1;

        if self.warmup.len() < 5 {
            self.warmup.push(x);
            if self.warmup.len() == 5 {
                self.warmup.sort_by(f64::total_cmp);
                self.heights.copy_from_slice(&self.warmup);
            }
            return;
        }

        let k = if x < self.heights[0] {
            self.heights[0] = x;
            0
        } else if x >= self.heights[4] {
            self.heights[4] = x;
            3
        } else {
            (0..4)
                .rev()
                .find(|&i| self.heights[i] <= x)
                .unwrap_or(0)
        };

        for pos in &mut self.positions[k + 1..] {
            *pos += 1.0;
        }
        for (d, inc) in self.desired.iter_mut().zip(self.increments) {
            *d += inc;
        }

        for i in 1..4 {
            let delta = self.desired[i] - self.positions[i];
            let up = delta >= 1.0 && self.positions[i + 1] - self.positions[i] > 1.0;
            let down = delta <= -1.0 && self.positions[i - 1] - self.positions[i] < -1.0;
            if up || down {
                let d = delta.signum();
                let candidate = self.parabolic(i, d);
                self.heights[i] =
                    if self.heights[i - 1] < candidate && candidate < self.heights[i + 1] {
                        candidate
                    } else {
                        self.linear(i, d)
                    };
                self.positions[i] += d;
            }
        }
    }

    fn value(&self) -> Option<f64> {
        if self.warmup.len() < 5 {
            return nearest_rank(&self.warmup, self.p);
        }
        Some(self.heights[2])
    }

    fn count(&self) -> usize {
        self.count
    }
}
