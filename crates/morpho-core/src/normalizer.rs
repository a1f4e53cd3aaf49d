//! Telemetry → bounded stress signals.
//!
//! Baselines are kept per (node, link) and frozen between recalculations so
//! a signal stays comparable across the `recalc_every` ticks it is used.
//! Until the first recalculation the error baseline is 0 and the latency SLO
//! is `default_slo_ms`.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::NormalizerConfig;
use crate::quantile::QuantileEstimator;
use crate::signal::{Signal, SignalFrame};
use crate::topology::{LinkId, NodeId, Topology};

/// One raw telemetry sample. Every measurement is optional so a partial or
/// malformed record never poisons the rest of the batch.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub node_id: NodeId,
    #[serde(default)]
    pub link_id: Option<LinkId>,
    #[serde(default)]
    pub error_count: Option<f64>,
    #[serde(default)]
    pub total_count: Option<f64>,
    #[serde(default)]
    pub latency_ms: Option<f64>,
    #[serde(default)]
    pub capacity_used: Option<f64>,
    #[serde(default)]
    pub capacity_total: Option<f64>,
}

impl TelemetryRecord {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Self::default()
        }
    }

    fn error_rate(&self) -> Option<f64> {
        let errors = valid(self.error_count)?;
        let total = valid(self.total_count).filter(|t| *t > 0.0)?;
        (errors <= total).then_some(errors / total)
    }

    fn latency(&self) -> Option<f64> {
        valid(self.latency_ms)
    }

    /// `(spare fraction, capacity_total)`.
    fn spare(&self) -> Option<(f64, f64)> {
        let used = valid(self.capacity_used)?;
        let total = valid(self.capacity_total).filter(|t| *t > 0.0)?;
        Some(((1.0 - used / total).clamp(0.0, 1.0), total))
    }
}

fn valid(v: Option<f64>) -> Option<f64> {
    v.filter(|x| x.is_finite() && *x >= 0.0)
}

type BaselineKey = (NodeId, Option<LinkId>);

struct Baseline {
    error_p95: Box<dyn QuantileEstimator>,
    latency_p50: Box<dyn QuantileEstimator>,
    ewma: Option<f64>,
    // Frozen at the last recalculation.
    error_baseline: f64,
    error_scale: Option<f64>,
    slo_ms: Option<f64>,
    max_capacity: f64,
}

impl Baseline {
    fn new(cfg: &NormalizerConfig) -> Self {
        Self {
            error_p95: cfg.estimator.build(0.95, cfg.window),
            latency_p50: cfg.estimator.build(0.50, cfg.window),
            ewma: None,
            error_baseline: 0.0,
            error_scale: None,
            slo_ms: None,
            max_capacity: 0.0,
        }
    }

    fn recalc(&mut self, cfg: &NormalizerConfig) {
        self.error_baseline = self.ewma.unwrap_or(0.0);
        self.error_scale = self.error_p95.value();
        self.slo_ms = self
            .latency_p50
            .value()
            .map(|p50| p50 * cfg.slo_headroom)
            .filter(|slo| *slo > 0.0);
    }
}

pub struct Normalizer {
    cfg: NormalizerConfig,
    baselines: HashMap<BaselineKey, Baseline>,
    last_good: HashMap<NodeId, [Option<f64>; 3]>,
    ticks: u64,
}

impl Normalizer {
    pub fn new(cfg: NormalizerConfig) -> Self {
        Self {
            cfg,
            baselines: HashMap::new(),
            last_good: HashMap::new(),
            ticks: 0,
        }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Forget baselines and last-known-good values of nodes and links that
    /// `topology` no longer has. A node re-added later starts from scratch.
    pub fn set_topology(&mut self, topology: &Topology) {
        let before = self.baselines.len();
        self.baselines.retain(|(node, link), _| match topology.index_of(node.as_str()) {
            Some(idx) => link.as_ref().is_none_or(|l| is_outgoing(topology, idx, l)),
            None => false,
        });
        self.last_good
            .retain(|node, _| topology.index_of(node.as_str()).is_some());
        debug!(
            dropped = before - self.baselines.len(),
            kept = self.baselines.len(),
            "normalizer state pruned"
        );
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.baselines.len()
    }

    /// Normalize one tick's batch against `topology`.
    ///
    /// Every node of the topology gets a finite, in-range value per signal.
    /// Signals without a valid sample fall back to last-known-good (or 0)
    /// and the node is flagged stale. Records for unknown nodes are dropped.
    pub fn normalize(&mut self, topology: &Topology, batch: &[TelemetryRecord]) -> SignalFrame {
        self.ticks += 1;
        let mut frame = SignalFrame::new(topology.len());
        // Per node: max E, max L, and the capacity-weighted spare terms.
        let mut error: Vec<Option<f64>> = vec![None; topology.len()];
        let mut latency: Vec<Option<f64>> = vec![None; topology.len()];
        let mut spare_terms: Vec<Vec<(f64, f64)>> = vec![Vec::new(); topology.len()];
        let mut malformed: HashSet<usize> = HashSet::new();

        for record in batch {
            let Some(idx) = topology.index_of(record.node_id.as_str()) else {
                debug!(node = %record.node_id, "telemetry for unknown node dropped");
                continue;
            };
            if let Some(link) = &record.link_id
                && !is_outgoing(topology, idx, link)
            {
                debug!(node = %record.node_id, %link, "telemetry for foreign link dropped");
                continue;
            }
            let key = (record.node_id.clone(), record.link_id.clone());
            let baseline = self
                .baselines
                .entry(key)
                .or_insert_with(|| Baseline::new(&self.cfg));

            match record.error_rate() {
                Some(rate) => {
                    baseline.error_p95.observe(rate);
                    baseline.ewma = Some(match baseline.ewma {
                        Some(prev) => prev + self.cfg.ewma_alpha * (rate - prev),
                        None => rate,
                    });
                    let scale = baseline
                        .error_scale
                        .unwrap_or(0.0)
                        .max(self.cfg.error_scale_floor);
                    let e = (rate - baseline.error_baseline) / scale;
                    merge_max(&mut error[idx], Signal::Error.clamp(e));
                }
                None => {
                    malformed.insert(idx);
                }
            }

            match record.latency() {
                Some(ms) => {
                    baseline.latency_p50.observe(ms);
                    let slo = baseline.slo_ms.unwrap_or(self.cfg.default_slo_ms);
                    merge_max(&mut latency[idx], Signal::Latency.clamp(ms / slo));
                }
                None => {
                    malformed.insert(idx);
                }
            }

            match record.spare() {
                Some((s, total)) => {
                    baseline.max_capacity = baseline.max_capacity.max(total);
                    let weight = total / baseline.max_capacity;
                    spare_terms[idx].push((s, weight));
                }
                None => {
                    malformed.insert(idx);
                }
            }
        }

        for (idx, node) in topology.nodes().iter().enumerate() {
            let spare = weighted_mean(&spare_terms[idx]);
            let fresh = [error[idx], latency[idx], spare];
            let last = self.last_good.entry(node.id.clone()).or_insert([None; 3]);
            let mut stale = malformed.contains(&idx);
            for signal in Signal::ALL {
                let i = signal.index();
                let value = match fresh[i] {
                    Some(v) => {
                        last[i] = Some(v);
                        v
                    }
                    None => {
                        stale = true;
                        last[i].unwrap_or(0.0)
                    }
                };
                frame.set(idx, signal, value);
            }
            frame.stale[idx] = stale;
        }

        if self.ticks % self.cfg.recalc_every == 0 {
            for baseline in self.baselines.values_mut() {
                baseline.recalc(&self.cfg);
            }
            debug!(tick = self.ticks, keys = self.baselines.len(), "baselines recalculated");
        }
        frame
    }
}

fn is_outgoing(topology: &Topology, node: usize, link: &LinkId) -> bool {
    topology
        .link_by_id(link.as_str())
        .is_some_and(|l| l.from == node)
}

fn merge_max(slot: &mut Option<f64>, value: Option<f64>) {
    if let Some(v) = value {
        *slot = Some(slot.map_or(v, |cur| cur.max(v)));
    }
}

fn weighted_mean(terms: &[(f64, f64)]) -> Option<f64> {
    let total: f64 = terms.iter().map(|(_, w)| w).sum();
    (total > 0.0).then(|| terms.iter().map(|(s, w)| s * w).sum::<f64>() / total)
}
