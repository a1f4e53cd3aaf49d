//! Reaction-diffusion field dynamics.
//!
//! One step per tick, in order, for each signal `s`:
//!
//! ```text
//! inject   φ ← φ + α_s · x            α_s = gain_s · (e^{λ_s Δt} − 1)
//! diffuse  φ ← φ − D_s · L̃ · φ        L̃ = I − D^{−½} A D^{−½}
//! couple   φ ← φ + Σ_r C[s][r] · φ_r(t)   (previous snapshot)
//! decay    φ ← φ · e^{−λ_s Δt}
//! ```
//!
//! `D_s = diffusion_fraction_s · 0.25 / deg_max`, so every eigenvalue of
//! `I − D_s L̃` lies in `[1 − 2 D_s, 1]` and the diffusion step never
//! amplifies. On a regular graph a steady uniform signal `x` settles at
//! `gain_s · x`.
//!
//! Snapshots are immutable and shared through `Arc`; the engine only ever
//! produces new ones.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{ConfigError, FieldConfig};
use crate::constants::DIFFUSION_CAP_NUMERATOR;
use crate::signal::{Signal, SignalFrame};
use crate::time::Tick;
use crate::topology::Topology;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FieldSnapshot {
    version: Tick,
    values: Vec<[f64; 3]>,
}

impl FieldSnapshot {
    pub fn zeros(len: usize) -> Self {
        Self {
            version: 0,
            values: vec![[0.0; 3]; len],
        }
    }

    pub fn from_values(version: Tick, values: Vec<[f64; 3]>) -> Self {
        Self { version, values }
    }

    /// The tick that produced this snapshot.
    pub fn version(&self) -> Tick {
        self.version
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, node: usize, signal: Signal) -> f64 {
        self.values
            .get(node)
            .map_or(0.0, |v| v[signal.index()])
    }

    pub fn node(&self, node: usize) -> Option<[f64; 3]> {
        self.values.get(node).copied()
    }

    pub fn values(&self) -> &[[f64; 3]] {
        &self.values
    }

    /// Euclidean norm of one signal's field.
    pub fn norm(&self, signal: Signal) -> f64 {
        self.values
            .iter()
            .map(|v| v[signal.index()].powi(2))
            .sum::<f64>()
            .sqrt()
    }
}

/// Sparse `I − D_s L̃` for the three signals over one topology version.
#[derive(Clone, Debug)]
pub struct DiffusionOperator {
    /// `adj[i]` = `[(j, 1/√(d_i d_j))]`.
    adj: Vec<Vec<(usize, f64)>>,
    coefficients: [f64; 3],
    deg_max: usize,
    topology_version: u64,
}

impl DiffusionOperator {
    /// Build the operator and re-check the per-signal diffusion bound
    /// `(1 − β_s)(1 − 2 D_s) > −1` for this topology.
    pub fn build(
        topology: &Topology,
        cfg: &FieldConfig,
        tick_seconds: f64,
    ) -> Result<Self, ConfigError> {
        let deg_max = topology.deg_max();
        let cap = if deg_max == 0 {
            0.0
        } else {
            DIFFUSION_CAP_NUMERATOR / deg_max as f64
        };

        let mut coefficients = [0.0; 3];
        for signal in Signal::ALL {
            let dyn_s = cfg.dynamics(signal);
            let d = dyn_s.diffusion_fraction * cap;
            let retain = (-dyn_s.lambda() * tick_seconds).exp();
            if !(d >= 0.0 && d <= cap && retain * (1.0 - 2.0 * d) > -1.0) {
                return Err(ConfigError::Stability(format!(
                    "{signal} diffusion coefficient {d} outside stable range for deg_max {deg_max}"
                )));
            }
            coefficients[signal.index()] = d;
        }

        let adj = topology
            .nodes()
            .iter()
            .map(|node| {
                let di = node.degree() as f64;
                node.neighbors
                    .iter()
                    .filter_map(|&j| {
                        let dj = topology.node(j)?.degree() as f64;
                        Some((j, 1.0 / (di * dj).sqrt()))
                    })
                    .collect()
            })
            .collect();

        debug!(
            deg_max,
            version = topology.version(),
            d_error = coefficients[0],
            d_latency = coefficients[1],
            d_spare = coefficients[2],
            "diffusion operator rebuilt"
        );
        Ok(Self {
            adj,
            coefficients,
            deg_max,
            topology_version: topology.version(),
        })
    }

    pub fn coefficient(&self, signal: Signal) -> f64 {
        self.coefficients[signal.index()]
    }

    pub fn deg_max(&self) -> usize {
        self.deg_max
    }

    pub fn topology_version(&self) -> u64 {
        self.topology_version
    }

    pub fn len(&self) -> usize {
        self.adj.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adj.is_empty()
    }

    /// `(L̃ x)_i = x_i − Σ_j x_j / √(d_i d_j)`. Isolated nodes have a zero row.
    pub fn laplacian(&self, x: &[f64]) -> Vec<f64> {
        self.adj
            .iter()
            .enumerate()
            .map(|(i, row)| {
                if row.is_empty() {
                    return 0.0;
                }
                x[i] - row.iter().map(|&(j, w)| w * x[j]).sum::<f64>()
            })
            .collect()
    }

    /// `x − D_s · L̃ x`.
    pub fn diffuse(&self, x: &[f64], signal: Signal) -> Vec<f64> {
        let d = self.coefficient(signal);
        self.laplacian(x)
            .into_iter()
            .zip(x)
            .map(|(lx, xi)| xi - d * lx)
            .collect()
    }
}

pub struct FieldEngine {
    cfg: FieldConfig,
    tick_seconds: f64,
    topology: Arc<Topology>,
    operator: DiffusionOperator,
    current: Arc<FieldSnapshot>,
    /// Nodes that have received at least one observation.
    seen: Vec<bool>,
    injection: [f64; 3],
    decay: [f64; 3],
}

impl FieldEngine {
    pub fn new(
        cfg: FieldConfig,
        tick_seconds: f64,
        topology: Arc<Topology>,
    ) -> Result<Self, ConfigError> {
        cfg.validate(tick_seconds)?;
        let operator = DiffusionOperator::build(&topology, &cfg, tick_seconds)?;
        let mut injection = [0.0; 3];
        let mut decay = [0.0; 3];
        for signal in Signal::ALL {
            let d = cfg.dynamics(signal);
            let lt = d.lambda() * tick_seconds;
            injection[signal.index()] = d.gain * lt.exp_m1();
            decay[signal.index()] = (-lt).exp();
        }
        let n = topology.len();
        Ok(Self {
            cfg,
            tick_seconds,
            topology,
            operator,
            current: Arc::new(FieldSnapshot::zeros(n)),
            seen: vec![false; n],
            injection,
            decay,
        })
    }

    pub fn snapshot(&self) -> Arc<FieldSnapshot> {
        Arc::clone(&self.current)
    }

    pub fn operator(&self) -> &DiffusionOperator {
        &self.operator
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    /// Per-signal injection gain α_s.
    pub fn injection_gain(&self, signal: Signal) -> f64 {
        self.injection[signal.index()]
    }

    /// Swap in a new topology version. The operator is rebuilt first; on a
    /// stability error the engine keeps the old topology untouched.
    pub fn set_topology(&mut self, topology: Arc<Topology>) -> Result<(), ConfigError> {
        let operator = DiffusionOperator::build(&topology, &self.cfg, self.tick_seconds)?;
        let values = topology.carry_over(&self.topology, self.current.values.clone(), || [0.0; 3]);
        self.seen = topology.carry_over(&self.topology, std::mem::take(&mut self.seen), || false);
        self.current = Arc::new(FieldSnapshot::from_values(self.current.version, values));
        self.operator = operator;
        self.topology = topology;
        Ok(())
    }

    /// Advance one tick. `frame` must be indexed by the engine's topology.
    pub fn step(&mut self, tick: Tick, frame: &SignalFrame) -> Arc<FieldSnapshot> {
        let n = self.topology.len();
        let prev = &self.current.values;

        // Previous state with first-observation warm start.
        let mut base: Vec<[f64; 3]> = Vec::with_capacity(n);
        for i in 0..n {
            let observed = frame.values.get(i).copied();
            let seeded = match (self.seen.get(i).copied().unwrap_or(false), observed) {
                (false, Some(x)) => Signal::ALL.map(|s| self.cfg.dynamics(s).gain * x[s.index()]),
                _ => prev.get(i).copied().unwrap_or([0.0; 3]),
            };
            base.push(seeded);
        }

        let mut next = base.clone();
        for signal in Signal::ALL {
            let s = signal.index();
            let injected: Vec<f64> = (0..n)
                .map(|i| {
                    let x = frame.values.get(i).map_or(0.0, |v| v[s]);
                    base[i][s] + self.injection[s] * x
                })
                .collect();
            let diffused = self.operator.diffuse(&injected, signal);
            for (i, value) in diffused.into_iter().enumerate() {
                let coupled: f64 = value
                    + Signal::ALL
                        .iter()
                        .map(|r| self.cfg.coupling[s][r.index()] * base[i][r.index()])
                        .sum::<f64>();
                let decayed = coupled * self.decay[s];
                next[i][s] = match signal.clamp(decayed) {
                    Some(v) => v,
                    None => {
                        warn!(node = i, %signal, "non-finite field value, keeping previous");
                        base[i][s]
                    }
                };
            }
        }

        for (i, seen) in self.seen.iter_mut().enumerate() {
            if frame.values.get(i).is_some() {
                *seen = true;
            }
        }
        self.current = Arc::new(FieldSnapshot::from_values(tick, next));
        self.snapshot()
    }
}
