//! Telemetry ingress for the scheduler: JSONL replay files and a seeded
//! synthetic source.
//!
//! A replay line is either a JSON array of telemetry records (one tick) or a
//! single topology change object, which is applied before the next tick.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::ValueEnum;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use morpho_core::{NodeId, TelemetryRecord, Topology, TopologyChange};

/// What the feed produced for the scheduler.
#[derive(Debug)]
pub enum Step {
    Batch(Vec<TelemetryRecord>),
    Change(TopologyChange),
    End,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ReplayLine {
    Batch(Vec<TelemetryRecord>),
    Change(TopologyChange),
}

pub struct Replay {
    steps: std::vec::IntoIter<Step>,
}

impl Replay {
    /// Parse a whole replay file. Unreadable lines become empty batches so
    /// the tick still happens with stale substitution.
    pub fn parse(text: &str) -> Self {
        let mut steps = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match serde_json::from_str::<ReplayLine>(line) {
                Ok(ReplayLine::Batch(batch)) => steps.push(Step::Batch(batch)),
                Ok(ReplayLine::Change(change)) => steps.push(Step::Change(change)),
                Err(e) => {
                    tracing::warn!(line = lineno + 1, error = %e, "malformed replay line, tick runs stale");
                    steps.push(Step::Batch(Vec::new()));
                }
            }
        }
        Self {
            steps: steps.into_iter(),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read replay file {}", path.display()))?;
        Ok(Self::parse(&text))
    }

    fn next(&mut self) -> Step {
        self.steps.next().unwrap_or(Step::End)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Scenario {
    /// Healthy background noise only.
    Calm,
    /// Target error rate jumps to 3% while its capacity runs low.
    ErrorSpike,
    /// Target latency climbs just past its SLO.
    LatencySurge,
}

#[derive(Clone, Debug)]
pub struct SyntheticOptions {
    pub scenario: Scenario,
    pub target: Option<NodeId>,
    /// First tick of the fault.
    pub onset: u64,
    pub seed: u64,
    /// Probability that a node's sample is missing in a tick.
    pub dropout: f64,
    /// Simulated fetch latency per batch.
    pub fetch_delay: Option<Duration>,
}

impl Default for SyntheticOptions {
    fn default() -> Self {
        Self {
            scenario: Scenario::Calm,
            target: None,
            onset: 3,
            seed: 42,
            dropout: 0.0,
            fetch_delay: None,
        }
    }
}

pub struct Synthetic {
    nodes: Vec<NodeId>,
    target: Option<NodeId>,
    opts: SyntheticOptions,
    rng: SmallRng,
    tick: u64,
}

const TOTAL_REQUESTS: f64 = 1_000.0;
const CAPACITY: f64 = 10.0;

impl Synthetic {
    pub fn new(topology: &Topology, opts: SyntheticOptions) -> Self {
        let nodes: Vec<NodeId> = topology.nodes().iter().map(|n| n.id.clone()).collect();
        let target = opts
            .target
            .clone()
            .or_else(|| nodes.get(nodes.len() / 2).cloned());
        Self {
            rng: SmallRng::seed_from_u64(opts.seed),
            nodes,
            target,
            opts,
            tick: 0,
        }
    }

    pub fn target(&self) -> Option<&NodeId> {
        self.target.as_ref()
    }

    fn sample(&mut self, node: &NodeId, faulted: bool) -> TelemetryRecord {
        let rng = &mut self.rng;
        // Healthy: ~0 errors, ~20 ms, half the capacity in use.
        let mut errors = if rng.random_bool(0.05) { 1.0 } else { 0.0 };
        let mut latency = 20.0 + rng.random_range(-4.0..4.0);
        let mut used = CAPACITY * (0.5 + rng.random_range(-0.05..0.05));

        if faulted {
            match self.opts.scenario {
                Scenario::Calm => {}
                Scenario::ErrorSpike => {
                    errors = 30.0;
                    used = CAPACITY * 0.92;
                }
                Scenario::LatencySurge => {
                    latency = 110.0 + rng.random_range(-2.0..2.0);
                    used = CAPACITY * 0.8;
                }
            }
        }

        TelemetryRecord {
            node_id: node.clone(),
            link_id: None,
            error_count: Some(errors),
            total_count: Some(TOTAL_REQUESTS),
            latency_ms: Some(latency),
            capacity_used: Some(used),
            capacity_total: Some(CAPACITY),
        }
    }

    fn batch(&mut self) -> Vec<TelemetryRecord> {
        self.tick += 1;
        let fault_on = self.tick >= self.opts.onset;
        let nodes = self.nodes.clone();
        let mut batch = Vec::with_capacity(nodes.len());
        for node in &nodes {
            if self.opts.dropout > 0.0 && self.rng.random_bool(self.opts.dropout.min(1.0)) {
                continue;
            }
            let faulted = fault_on && self.target.as_ref() == Some(node);
            batch.push(self.sample(node, faulted));
        }
        batch
    }
}

pub enum Feed {
    Replay(Replay),
    Synthetic(Synthetic),
}

impl Feed {
    pub async fn next(&mut self) -> Step {
        match self {
            Feed::Replay(replay) => replay.next(),
            Feed::Synthetic(synthetic) => {
                if let Some(delay) = synthetic.opts.fetch_delay {
                    tokio::time::sleep(delay).await;
                }
                Step::Batch(synthetic.batch())
            }
        }
    }
}

/// Ring of `n` nodes `n0 … n{n-1}` with links `l{i}: n{i} → n{i+1}`.
pub fn ring(n: usize) -> Result<Topology> {
    let mut topo = Topology::new();
    for i in 0..n {
        topo.add_node(format!("n{i}").into())?;
    }
    // Two nodes get a single link; the ring would close on itself.
    let links = match n {
        0 | 1 => 0,
        2 => 1,
        _ => n,
    };
    for i in 0..links {
        let from = NodeId::from(format!("n{i}"));
        let to = NodeId::from(format!("n{}", (i + 1) % n));
        topo.add_link(format!("l{i}").into(), &from, &to, 1.0)?;
    }
    Ok(topo)
}
