//! Hysteretic band classification of field values.
//!
//! Error and latency are rising bands. Spare is a falling band: low spare is
//! the stress condition, so its `Hot` reads as "Low" and `VeryHot` as "very
//! low". Both orientations share one state machine by comparing a signed
//! stress value against signed thresholds.
//!
//! "Exceeds" is strict. A value sitting exactly on a threshold neither counts
//! toward activation nor toward clearing, which is what keeps boundary
//! oscillation from flapping.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::DetectorConfig;
use crate::field::FieldSnapshot;
use crate::quantile::QuantileEstimator;
use crate::signal::Signal;
use crate::time::Tick;
use crate::topology::{NodeId, Topology};

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Band {
    #[default]
    Normal,
    Hot,
    VeryHot,
}

/// One band change, emitted as a detection event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub tick: Tick,
    pub node: NodeId,
    pub signal: Signal,
    pub from: Band,
    pub to: Band,
    pub value: f64,
    /// Effective hot threshold at the time of the transition.
    pub threshold: f64,
}

/// Bands and effective thresholds for every (node, signal) after a tick.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetectionState {
    bands: Vec<[Band; 3]>,
    /// `(hot, very_hot)` per node and signal.
    thresholds: Vec<[(f64, f64); 3]>,
}

impl DetectionState {
    pub fn len(&self) -> usize {
        self.bands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bands.is_empty()
    }

    pub fn band(&self, node: usize, signal: Signal) -> Band {
        self.bands
            .get(node)
            .map_or(Band::Normal, |b| b[signal.index()])
    }

    pub fn at_least(&self, node: usize, signal: Signal, band: Band) -> bool {
        self.band(node, signal) >= band
    }

    pub fn hot_threshold(&self, node: usize, signal: Signal) -> Option<f64> {
        self.thresholds.get(node).map(|t| t[signal.index()].0)
    }

    pub fn very_hot_threshold(&self, node: usize, signal: Signal) -> Option<f64> {
        self.thresholds.get(node).map(|t| t[signal.index()].1)
    }

    /// Build a state directly, for callers that classify elsewhere.
    pub fn from_bands(bands: Vec<[Band; 3]>, cfg: &DetectorConfig) -> Self {
        let base = Signal::ALL.map(|s| (cfg.band(s).hot, cfg.band(s).very_hot));
        let thresholds = vec![base; bands.len()];
        Self { bands, thresholds }
    }
}

struct Cell {
    band: Band,
    over_hot: u32,
    over_very_hot: u32,
    under_hot: u32,
    under_very_hot: u32,
    hot: f64,
    very_hot: f64,
    estimator: Option<Box<dyn QuantileEstimator>>,
}

impl Cell {
    fn new(cfg: &DetectorConfig, signal: Signal) -> Self {
        let band = cfg.band(signal);
        let adaptive = cfg.adaptive.enabled && signal != Signal::Spare;
        Self {
            band: Band::Normal,
            over_hot: 0,
            over_very_hot: 0,
            under_hot: 0,
            under_very_hot: 0,
            hot: band.hot,
            very_hot: band.very_hot,
            estimator: adaptive.then(|| {
                cfg.adaptive
                    .estimator
                    .build(cfg.adaptive.percentile, cfg.adaptive.window)
            }),
        }
    }

    fn reset_counters(&mut self) {
        self.over_hot = 0;
        self.over_very_hot = 0;
        self.under_hot = 0;
        self.under_very_hot = 0;
    }

    /// Feed one value, returning the new band if it changed.
    fn update(&mut self, cfg: &DetectorConfig, signal: Signal, value: f64) -> Option<Band> {
        if let Some(est) = self.estimator.as_mut() {
            est.observe(value);
        }

        let delta = cfg.band(signal).hysteresis;
        // Falling bands compare negated values against negated thresholds.
        let sign = if signal == Signal::Spare { -1.0 } else { 1.0 };
        let (x, hot, very_hot) = (sign * value, sign * self.hot, sign * self.very_hot);

        bump(&mut self.over_hot, x > hot);
        bump(&mut self.over_very_hot, x > very_hot);
        bump(&mut self.under_hot, x < hot - delta);
        bump(&mut self.under_very_hot, x < very_hot - delta);

        let next = match self.band {
            Band::Normal if self.over_very_hot >= cfg.very_hot_ticks => Band::VeryHot,
            Band::Normal if self.over_hot >= cfg.hot_ticks => Band::Hot,
            Band::Hot if self.over_very_hot >= cfg.very_hot_ticks => Band::VeryHot,
            Band::Hot if self.under_hot >= cfg.clear_ticks => Band::Normal,
            Band::VeryHot if self.under_hot >= cfg.clear_ticks => Band::Normal,
            Band::VeryHot if self.under_very_hot >= cfg.clear_ticks => Band::Hot,
            current => current,
        };
        if next == self.band {
            return None;
        }
        self.band = next;
        self.reset_counters();
        Some(next)
    }

    fn recalc(&mut self, cfg: &DetectorConfig, signal: Signal) {
        let Some(q) = self.estimator.as_ref().and_then(|e| e.value()) else {
            return;
        };
        let base = cfg.band(signal);
        let hot = q.clamp(base.hot, base.hot * cfg.adaptive.max_ratio);
        self.hot = hot;
        self.very_hot = base.very_hot * hot / base.hot;
    }
}

fn bump(counter: &mut u32, hit: bool) {
    *counter = if hit { counter.saturating_add(1) } else { 0 };
}

pub struct Detector {
    cfg: DetectorConfig,
    cells: Vec<[Cell; 3]>,
    ticks: u64,
    state: DetectionState,
}

impl Detector {
    pub fn new(cfg: DetectorConfig, nodes: usize) -> Self {
        let cells = (0..nodes).map(|_| Self::fresh_cells(&cfg)).collect();
        let mut detector = Self {
            cfg,
            cells,
            ticks: 0,
            state: DetectionState::default(),
        };
        detector.refresh_state();
        detector
    }

    fn fresh_cells(cfg: &DetectorConfig) -> [Cell; 3] {
        Signal::ALL.map(|s| Cell::new(cfg, s))
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.cfg
    }

    pub fn state(&self) -> &DetectionState {
        &self.state
    }

    /// Classify one snapshot. Returns the band changes of this tick.
    pub fn update(
        &mut self,
        tick: Tick,
        topology: &Topology,
        snapshot: &FieldSnapshot,
    ) -> Vec<Transition> {
        self.ticks += 1;
        let mut transitions = Vec::new();

        for (i, node) in topology.nodes().iter().enumerate() {
            let Some(cells) = self.cells.get_mut(i) else {
                continue;
            };
            for signal in Signal::ALL {
                let cell = &mut cells[signal.index()];
                let value = snapshot.get(i, signal);
                let from = cell.band;
                if let Some(to) = cell.update(&self.cfg, signal, value) {
                    transitions.push(Transition {
                        tick,
                        node: node.id.clone(),
                        signal,
                        from,
                        to,
                        value,
                        threshold: cell.hot,
                    });
                }
            }
        }

        if self.cfg.adaptive.enabled && self.ticks % self.cfg.adaptive.recalc_every == 0 {
            for cells in &mut self.cells {
                for signal in Signal::ALL {
                    cells[signal.index()].recalc(&self.cfg, signal);
                }
            }
            debug!(tick, "adaptive thresholds recalculated");
        }

        self.refresh_state();
        transitions
    }

    /// Re-index cells for a new topology version, matching nodes by id.
    pub fn set_topology(&mut self, old: &Topology, new: &Topology) {
        let cells = std::mem::take(&mut self.cells);
        let cfg = &self.cfg;
        self.cells = new.carry_over(old, cells, || Self::fresh_cells(cfg));
        self.refresh_state();
    }

    fn refresh_state(&mut self) {
        self.state = DetectionState {
            bands: self
                .cells
                .iter()
                .map(|c| [c[0].band, c[1].band, c[2].band])
                .collect(),
            thresholds: self
                .cells
                .iter()
                .map(|c| c.each_ref().map(|cell| (cell.hot, cell.very_hot)))
                .collect(),
        };
    }
}
