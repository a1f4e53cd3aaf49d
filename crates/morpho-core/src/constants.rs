/// Discrete-time stability bound for the diffusion coefficient: D ≤ 0.25 / deg_max.
pub const DIFFUSION_CAP_NUMERATOR: f64 = 0.25;

/// Upper clamp of the normalized error signal.
pub const ERROR_MAX: f64 = 3.0;

/// Upper clamp of the normalized latency signal.
pub const LATENCY_MAX: f64 = 5.0;

/// Upper clamp of the spare-capacity signal (already a fraction).
pub const SPARE_MAX: f64 = 1.0;

/// Numerical epsilon for near-zero comparisons
pub const EPSILON: f64 = 1e-9;

/// Slow cadence (ticks) for baseline and adaptive-threshold recalculation.
pub const DEFAULT_RECALC_TICKS: u64 = 600;

/// Ticks after an intent before its post-action field snapshot is taken.
pub const POST_SNAPSHOT_DELAY: u64 = 5;

/// Reintegration traffic steps after a breaker's probes all pass.
pub const REINTEGRATION_STEPS: [f64; 3] = [0.1, 0.5, 1.0];
