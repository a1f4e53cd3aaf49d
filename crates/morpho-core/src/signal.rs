use serde::{Deserialize, Serialize};

use crate::constants::{ERROR_MAX, LATENCY_MAX, SPARE_MAX};
use crate::topology::Topology;

/// The three stress signals sensed per node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    Error,
    Latency,
    Spare,
}

impl Signal {
    pub const ALL: [Signal; 3] = [Signal::Error, Signal::Latency, Signal::Spare];

    /// Position in per-node `[f64; 3]` arrays.
    pub fn index(self) -> usize {
        match self {
            Signal::Error => 0,
            Signal::Latency => 1,
            Signal::Spare => 2,
        }
    }

    /// Declared clamp range upper bound; the lower bound is always 0.
    pub fn upper(self) -> f64 {
        match self {
            Signal::Error => ERROR_MAX,
            Signal::Latency => LATENCY_MAX,
            Signal::Spare => SPARE_MAX,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Signal::Error => "error",
            Signal::Latency => "latency",
            Signal::Spare => "spare",
        }
    }

    /// Clamp into the declared range. Non-finite input maps to `None`.
    pub fn clamp(self, value: f64) -> Option<f64> {
        value.is_finite().then(|| value.clamp(0.0, self.upper()))
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Normalized signals for every node of a topology at one tick.
///
/// Indexed by node arena index. `stale[i]` marks nodes whose values were
/// substituted (last-known-good or zero) because telemetry was missing or
/// malformed.
#[derive(Clone, Debug, PartialEq)]
pub struct SignalFrame {
    pub values: Vec<[f64; 3]>,
    pub stale: Vec<bool>,
}

impl SignalFrame {
    pub fn new(len: usize) -> Self {
        Self {
            values: vec![[0.0; 3]; len],
            stale: vec![false; len],
        }
    }

    /// Every node reports the same `[error, latency, spare]` triple.
    pub fn uniform(len: usize, values: [f64; 3]) -> Self {
        Self {
            values: vec![values; len],
            stale: vec![false; len],
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, node: usize, signal: Signal) -> f64 {
        self.values[node][signal.index()]
    }

    /// Set a value, clamped into the signal's range. Non-finite values are ignored.
    pub fn set(&mut self, node: usize, signal: Signal, value: f64) {
        if let Some(v) = signal.clamp(value) {
            self.values[node][signal.index()] = v;
        }
    }

    /// Set a node's value by id. Unknown ids are ignored.
    pub fn set_by_id(&mut self, topology: &Topology, id: &str, signal: Signal, value: f64) {
        if let Some(idx) = topology.index_of(id) {
            self.set(idx, signal, value);
        }
    }

    /// Node ids flagged stale, in arena order.
    pub fn stale_ids(&self, topology: &Topology) -> Vec<crate::topology::NodeId> {
        self.stale
            .iter()
            .enumerate()
            .filter(|(_, s)| **s)
            .filter_map(|(i, _)| topology.node(i).map(|n| n.id.clone()))
            .collect()
    }
}
