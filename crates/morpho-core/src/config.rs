//! Deployment-tunable configuration.
//!
//! Every threshold, gain, coefficient and rate limit lives here. The
//! diffusion coefficient itself is *not* configurable: each signal carries a
//! `diffusion_fraction` of the topology-derived cap `0.25 / deg_max`, and the
//! cap is recomputed whenever the topology changes (see `field.rs`).
//!
//! [`ControlConfig::validate`] runs at load time and rejects anything that
//! would break the stability argument rather than clamping it later.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::{DEFAULT_RECALC_TICKS, POST_SNAPSHOT_DELAY, REINTEGRATION_STEPS};
use crate::quantile::EstimatorKind;
use crate::signal::Signal;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: String, reason: String },
    #[error("stability violation: {0}")]
    Stability(String),
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.into(),
        reason: reason.into(),
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Simulated seconds per tick.
    pub tick_seconds: f64,
    /// Bound on the proposal queue between agents and the governor.
    pub intent_queue_capacity: usize,
    pub normalizer: NormalizerConfig,
    pub field: FieldConfig,
    pub detector: DetectorConfig,
    pub weaver: WeaverConfig,
    pub builder: BuilderConfig,
    pub scavenger: ScavengerConfig,
    pub governor: GovernorConfig,
    pub gateway: GatewayConfig,
    pub audit: AuditConfig,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            tick_seconds: 1.0,
            intent_queue_capacity: 64,
            normalizer: NormalizerConfig::default(),
            field: FieldConfig::default(),
            detector: DetectorConfig::default(),
            weaver: WeaverConfig::default(),
            builder: BuilderConfig::default(),
            scavenger: ScavengerConfig::default(),
            governor: GovernorConfig::default(),
            gateway: GatewayConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

// --- Normalizer ---

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    /// Ticks between baseline recalculations.
    pub recalc_every: u64,
    /// Rolling window length (samples) for baselines.
    pub window: usize,
    /// EWMA smoothing factor for the error baseline.
    pub ewma_alpha: f64,
    /// Lower bound on the p95 divisor of the error signal.
    pub error_scale_floor: f64,
    /// SLO used before the first latency baseline exists.
    pub default_slo_ms: f64,
    /// SLO = p50 · headroom.
    pub slo_headroom: f64,
    pub estimator: EstimatorKind,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            recalc_every: DEFAULT_RECALC_TICKS,
            window: DEFAULT_RECALC_TICKS as usize,
            ewma_alpha: 0.05,
            error_scale_floor: 0.5,
            default_slo_ms: 200.0,
            slo_headroom: 4.0,
            estimator: EstimatorKind::Exact,
        }
    }
}

// --- Field dynamics ---

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignalDynamics {
    /// Decay time constant in seconds (λ = 1/τ).
    pub time_constant: f64,
    /// Steady-state field per unit of signal.
    pub gain: f64,
    /// Share of the stability cap `0.25 / deg_max` used as D, in (0, 1].
    pub diffusion_fraction: f64,
}

impl SignalDynamics {
    pub fn lambda(&self) -> f64 {
        1.0 / self.time_constant
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldConfig {
    pub error: SignalDynamics,
    pub latency: SignalDynamics,
    pub spare: SignalDynamics,
    /// `coupling[target][source]`, rows/cols ordered error, latency, spare.
    /// Applied with a one-tick lag.
    pub coupling: [[f64; 3]; 3],
    /// Largest allowed |coupling| entry.
    pub coupling_limit: f64,
}

impl FieldConfig {
    pub fn dynamics(&self, signal: Signal) -> &SignalDynamics {
        match signal {
            Signal::Error => &self.error,
            Signal::Latency => &self.latency,
            Signal::Spare => &self.spare,
        }
    }
}

impl Default for FieldConfig {
    fn default() -> Self {
        Self {
            error: SignalDynamics {
                time_constant: 1.0,
                gain: 1.0,
                diffusion_fraction: 0.3,
            },
            latency: SignalDynamics {
                time_constant: 5.0,
                gain: 1.0,
                diffusion_fraction: 0.2,
            },
            spare: SignalDynamics {
                time_constant: 20.0,
                gain: 1.0,
                diffusion_fraction: 0.1,
            },
            coupling: [
                [0.0, 0.0, 0.0],
                // error raises latency
                [0.05, 0.0, 0.0],
                // error depresses spare
                [-0.05, 0.0, 0.0],
            ],
            coupling_limit: 0.1,
        }
    }
}

// --- Detector ---

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BandConfig {
    pub hot: f64,
    pub very_hot: f64,
    /// Deactivation band δ below `hot` (above it for falling bands).
    pub hysteresis: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    pub enabled: bool,
    pub percentile: f64,
    /// Adapted threshold never exceeds `hot · max_ratio`.
    pub max_ratio: f64,
    pub recalc_every: u64,
    pub window: usize,
    pub estimator: EstimatorKind,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            percentile: 0.95,
            max_ratio: 2.0,
            recalc_every: DEFAULT_RECALC_TICKS,
            window: DEFAULT_RECALC_TICKS as usize,
            estimator: EstimatorKind::Exact,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub error: BandConfig,
    pub latency: BandConfig,
    /// Falling band: `hot` is the low-spare threshold, `very_hot` very low.
    pub spare: BandConfig,
    pub hot_ticks: u32,
    pub very_hot_ticks: u32,
    pub clear_ticks: u32,
    pub adaptive: AdaptiveConfig,
}

impl DetectorConfig {
    pub fn band(&self, signal: Signal) -> &BandConfig {
        match signal {
            Signal::Error => &self.error,
            Signal::Latency => &self.latency,
            Signal::Spare => &self.spare,
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            error: BandConfig {
                hot: 0.01,
                very_hot: 0.02,
                hysteresis: 0.005,
            },
            latency: BandConfig {
                hot: 0.50,
                very_hot: 1.0,
                hysteresis: 0.05,
            },
            spare: BandConfig {
                hot: 0.10,
                very_hot: 0.05,
                hysteresis: 0.02,
            },
            hot_ticks: 3,
            very_hot_ticks: 2,
            clear_ticks: 3,
            adaptive: AdaptiveConfig::default(),
        }
    }
}

// --- Agents ---

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeaverConfig {
    /// Alternative path must have at least this much more spare.
    pub min_spare_advantage: f64,
    /// Total flow weight moved per rebalance, within [0.10, 0.20].
    pub shift_fraction: f64,
    /// Largest per-tick increment.
    pub step: f64,
    pub revert_clear_ticks: u32,
    pub cooldown_ticks: u64,
}

impl Default for WeaverConfig {
    fn default() -> Self {
        Self {
            min_spare_advantage: 0.1,
            shift_fraction: 0.15,
            step: 0.05,
            revert_clear_ticks: 5,
            cooldown_ticks: 10,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuorumConfig {
    /// Topological fraction at or above which the vote passes outright.
    pub approve_fraction: f64,
    /// Lower (inclusive) edge of the tie-break band.
    pub tie_low: f64,
    /// Hot-neighbor count that carries the tie-break band on its own.
    pub min_count: usize,
    /// Weighted signal vote needed inside the tie-break band (inclusive).
    pub vote_threshold: f64,
    /// Weights for (error, latency, spare) in the signal vote.
    pub weights: [f64; 3],
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            approve_fraction: 0.70,
            tie_low: 0.50,
            min_count: 2,
            vote_threshold: 0.67,
            weights: [0.5, 0.3, 0.2],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Spare field at or above this counts as "Spare=High".
    pub spare_high: f64,
    pub quorum: QuorumConfig,
    pub lease_seconds: f64,
    /// Fraction of nodes that may hold a capacity lease at once.
    pub max_concurrent_fraction: f64,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            spare_high: 0.30,
            quorum: QuorumConfig::default(),
            lease_seconds: 60.0,
            max_concurrent_fraction: 0.2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScavengerConfig {
    pub initial_backoff_seconds: f64,
    pub max_backoff_seconds: f64,
    pub probe_count: u32,
    pub reintegration_steps: Vec<f64>,
    pub reintegration_dwell_seconds: f64,
}

impl Default for ScavengerConfig {
    fn default() -> Self {
        Self {
            initial_backoff_seconds: 30.0,
            max_backoff_seconds: 300.0,
            probe_count: 3,
            reintegration_steps: REINTEGRATION_STEPS.to_vec(),
            reintegration_dwell_seconds: 5.0,
        }
    }
}

// --- Governor ---

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Actions allowed per window (bucket capacity).
    pub capacity: u32,
    /// Window length in seconds; a token returns one window after use.
    pub window_seconds: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentLimits {
    pub bucket: BucketConfig,
    /// Minimum spacing between admitted actions on the same target.
    pub target_interval_seconds: f64,
    /// Agent-wide pause after its bucket runs dry.
    pub limit_cooldown_seconds: f64,
}

impl Default for AgentLimits {
    fn default() -> Self {
        Self {
            bucket: BucketConfig {
                capacity: 10,
                window_seconds: 60.0,
            },
            target_interval_seconds: 0.0,
            limit_cooldown_seconds: 0.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub global: BucketConfig,
    pub weaver: AgentLimits,
    pub builder: AgentLimits,
    pub scavenger: AgentLimits,
    /// First backoff after an actuation failure; doubles per failure.
    pub failure_backoff_seconds: f64,
    pub failure_backoff_max_seconds: f64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            global: BucketConfig {
                capacity: 20,
                window_seconds: 60.0,
            },
            weaver: AgentLimits::default(),
            builder: AgentLimits {
                bucket: BucketConfig {
                    capacity: 5,
                    window_seconds: 60.0,
                },
                target_interval_seconds: 60.0,
                limit_cooldown_seconds: 30.0,
            },
            scavenger: AgentLimits::default(),
            failure_backoff_seconds: 5.0,
            failure_backoff_max_seconds: 120.0,
        }
    }
}

// --- Gateway / audit ---

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub timeout_ms: u64,
    /// Per-agent HMAC keys. Deployments override these.
    pub weaver_key: String,
    pub builder_key: String,
    pub scavenger_key: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 2_000,
            timeout_ms: 500,
            weaver_key: "weaver-dev-key".to_string(),
            builder_key: "builder-dev-key".to_string(),
            scavenger_key: "scavenger-dev-key".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub post_snapshot_delay: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            post_snapshot_delay: POST_SNAPSHOT_DELAY,
        }
    }
}

// --- Validation ---

fn positive(field: &str, v: f64) -> Result<(), ConfigError> {
    if v.is_finite() && v > 0.0 {
        Ok(())
    } else {
        Err(invalid(field, format!("must be finite and > 0, got {v}")))
    }
}

fn unit(field: &str, v: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&v) {
        Ok(())
    } else {
        Err(invalid(field, format!("must be within [0, 1], got {v}")))
    }
}

/// Spectral radius of a non-negative 3×3 matrix by power iteration.
pub fn spectral_radius(m: &[[f64; 3]; 3]) -> f64 {
    let mut v = [1.0_f64; 3];
    let mut rho = 0.0;
    for _ in 0..500 {
        let mut next = [0.0; 3];
        for (i, row) in m.iter().enumerate() {
            next[i] = row.iter().zip(v).map(|(a, b)| a * b).sum();
        }
        let norm = next.iter().fold(0.0_f64, |acc, x| acc.max(x.abs()));
        if norm == 0.0 {
            return 0.0;
        }
        rho = norm / v.iter().fold(0.0_f64, |acc, x| acc.max(x.abs()));
        v = next.map(|x| x / norm);
    }
    rho
}

impl FieldConfig {
    /// Topology-independent stability checks. The diffusion eigenvalue bound
    /// for a concrete `deg_max` is re-checked by the field engine.
    pub fn validate(&self, tick_seconds: f64) -> Result<(), ConfigError> {
        for signal in Signal::ALL {
            let d = self.dynamics(signal);
            let name = signal.name();
            positive(&format!("field.{name}.time_constant"), d.time_constant)?;
            positive(&format!("field.{name}.gain"), d.gain)?;
            if !(d.diffusion_fraction > 0.0 && d.diffusion_fraction <= 1.0) {
                return Err(ConfigError::Stability(format!(
                    "field.{name}.diffusion_fraction {} must be within (0, 1]; \
                     D may not exceed 0.25/deg_max",
                    d.diffusion_fraction
                )));
            }
        }

        positive("field.coupling_limit", self.coupling_limit)?;
        for (s, row) in self.coupling.iter().enumerate() {
            for (r, c) in row.iter().enumerate() {
                if !c.is_finite() || c.abs() > self.coupling_limit {
                    return Err(ConfigError::Stability(format!(
                        "coupling[{s}][{r}] = {c} exceeds limit {}",
                        self.coupling_limit
                    )));
                }
            }
        }

        let rho = spectral_radius(&self.gain_matrix(tick_seconds));
        if rho >= 1.0 {
            return Err(ConfigError::Stability(format!(
                "coupled decay gain has spectral radius {rho:.4} ≥ 1"
            )));
        }
        Ok(())
    }

    /// Block-norm bound of one field step: decay on the diagonal, decayed
    /// |coupling| off it.
    pub fn gain_matrix(&self, tick_seconds: f64) -> [[f64; 3]; 3] {
        let mut g = [[0.0; 3]; 3];
        for s in Signal::ALL {
            let decay = (-self.dynamics(s).lambda() * tick_seconds).exp();
            for r in Signal::ALL {
                g[s.index()][r.index()] = if s == r {
                    decay
                } else {
                    decay * self.coupling[s.index()][r.index()].abs()
                };
            }
        }
        g
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for signal in [Signal::Error, Signal::Latency] {
            let b = self.band(signal);
            let name = signal.name();
            positive(&format!("detector.{name}.hot"), b.hot)?;
            positive(&format!("detector.{name}.hysteresis"), b.hysteresis)?;
            if b.very_hot <= b.hot {
                return Err(invalid(
                    format!("detector.{name}.very_hot"),
                    "must exceed hot",
                ));
            }
            if b.hysteresis >= b.hot {
                return Err(invalid(
                    format!("detector.{name}.hysteresis"),
                    "must be smaller than hot",
                ));
            }
        }
        let s = &self.spare;
        positive("detector.spare.hysteresis", s.hysteresis)?;
        if !(0.0 < s.very_hot && s.very_hot < s.hot && s.hot + s.hysteresis <= 1.0) {
            return Err(invalid(
                "detector.spare",
                "falling band needs 0 < very_hot < hot and hot + hysteresis ≤ 1",
            ));
        }
        if self.hot_ticks == 0 || self.very_hot_ticks == 0 || self.clear_ticks == 0 {
            return Err(invalid("detector", "tick counts must be ≥ 1"));
        }
        unit("detector.adaptive.percentile", self.adaptive.percentile)?;
        if self.adaptive.max_ratio < 1.0 {
            return Err(invalid("detector.adaptive.max_ratio", "must be ≥ 1"));
        }
        if self.adaptive.recalc_every == 0 || self.adaptive.window == 0 {
            return Err(invalid("detector.adaptive", "cadence and window must be ≥ 1"));
        }
        Ok(())
    }
}

impl ControlConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("tick_seconds", self.tick_seconds)?;
        if self.intent_queue_capacity == 0 {
            return Err(invalid("intent_queue_capacity", "must be ≥ 1"));
        }

        let n = &self.normalizer;
        if n.recalc_every == 0 || n.window == 0 {
            return Err(invalid("normalizer", "cadence and window must be ≥ 1"));
        }
        if !(n.ewma_alpha > 0.0 && n.ewma_alpha <= 1.0) {
            return Err(invalid("normalizer.ewma_alpha", "must be within (0, 1]"));
        }
        positive("normalizer.error_scale_floor", n.error_scale_floor)?;
        positive("normalizer.default_slo_ms", n.default_slo_ms)?;
        positive("normalizer.slo_headroom", n.slo_headroom)?;

        self.field.validate(self.tick_seconds)?;
        self.detector.validate()?;

        let w = &self.weaver;
        if !(0.10..=0.20).contains(&w.shift_fraction) {
            return Err(invalid("weaver.shift_fraction", "must be within [0.10, 0.20]"));
        }
        if !(w.step > 0.0 && w.step <= w.shift_fraction) {
            return Err(invalid("weaver.step", "must be within (0, shift_fraction]"));
        }
        positive("weaver.min_spare_advantage", w.min_spare_advantage)?;
        if w.revert_clear_ticks == 0 {
            return Err(invalid("weaver.revert_clear_ticks", "must be ≥ 1"));
        }

        let b = &self.builder;
        unit("builder.spare_high", b.spare_high)?;
        if b.spare_high <= self.detector.spare.hot {
            return Err(invalid("builder.spare_high", "must exceed the low-spare threshold"));
        }
        positive("builder.lease_seconds", b.lease_seconds)?;
        unit("builder.max_concurrent_fraction", b.max_concurrent_fraction)?;
        let q = &b.quorum;
        unit("builder.quorum.tie_low", q.tie_low)?;
        unit("builder.quorum.approve_fraction", q.approve_fraction)?;
        if q.tie_low > q.approve_fraction {
            return Err(invalid("builder.quorum", "tie_low must not exceed approve_fraction"));
        }
        let weight_sum: f64 = q.weights.iter().sum();
        if q.weights.iter().any(|w| *w < 0.0) || (weight_sum - 1.0).abs() > 1e-6 {
            return Err(invalid("builder.quorum.weights", "must be non-negative and sum to 1"));
        }

        let s = &self.scavenger;
        positive("scavenger.initial_backoff_seconds", s.initial_backoff_seconds)?;
        if s.max_backoff_seconds < s.initial_backoff_seconds {
            return Err(invalid("scavenger.max_backoff_seconds", "must be ≥ initial backoff"));
        }
        if s.probe_count == 0 {
            return Err(invalid("scavenger.probe_count", "must be ≥ 1"));
        }
        let steps = &s.reintegration_steps;
        let increasing = steps.windows(2).all(|w| w[0] < w[1]);
        if steps.is_empty()
            || !increasing
            || steps[0] <= 0.0
            || (steps[steps.len() - 1] - 1.0).abs() > 1e-9
        {
            return Err(invalid(
                "scavenger.reintegration_steps",
                "must increase strictly from > 0 up to 1.0",
            ));
        }

        let g = &self.governor;
        for (name, bucket) in [
            ("global", g.global),
            ("weaver", g.weaver.bucket),
            ("builder", g.builder.bucket),
            ("scavenger", g.scavenger.bucket),
        ] {
            if bucket.capacity == 0 {
                return Err(invalid(format!("governor.{name}.capacity"), "must be ≥ 1"));
            }
            positive(&format!("governor.{name}.window_seconds"), bucket.window_seconds)?;
        }
        positive("governor.failure_backoff_seconds", g.failure_backoff_seconds)?;

        let gw = &self.gateway;
        if gw.max_attempts == 0 {
            return Err(invalid("gateway.max_attempts", "must be ≥ 1"));
        }
        for (name, key) in [
            ("weaver_key", &gw.weaver_key),
            ("builder_key", &gw.builder_key),
            ("scavenger_key", &gw.scavenger_key),
        ] {
            if key.is_empty() {
                return Err(invalid(format!("gateway.{name}"), "must not be empty"));
            }
        }
        Ok(())
    }
}
