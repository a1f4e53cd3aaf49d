//! Per-link circuit breaker.
//!
//! ```text
//!            trip                 backoff elapsed
//!   Closed ────────▶ Open ─────────────────────────▶ HalfOpen
//!     ▲  │            ▲                                  │
//!     │  │ regress    │ probe failed (attempt += 1)      │ all probes pass
//!     │  └────────────┤◀─────────────────────────────────┤
//!     │   (attempt+1) │                                  ▼
//!     └──── ramp 0.1 → 0.5 → 1.0 (attempt reset) ◀── Closed (ramping)
//! ```
//!
//! The transition function is split in two: [`Breaker::next`] is pure and
//! only proposes a [`Move`]; [`Breaker::apply`] commits it once the actuator
//! has confirmed. Moves that are illegal in the current state are ignored.

use serde::{Deserialize, Serialize};

use crate::config::ScavengerConfig;
use crate::time::{Tick, TickClock};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitState::Closed => "Closed",
            CircuitState::Open => "Open",
            CircuitState::HalfOpen => "HalfOpen",
        };
        f.write_str(s)
    }
}

/// Tick-denominated breaker parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct BreakerPolicy {
    pub initial_backoff: Tick,
    pub max_backoff: Tick,
    pub probe_count: u32,
    pub steps: Vec<f64>,
    pub dwell: Tick,
}

impl BreakerPolicy {
    pub fn from_config(cfg: &ScavengerConfig, clock: &TickClock) -> Self {
        Self {
            initial_backoff: clock.ticks_for(cfg.initial_backoff_seconds),
            max_backoff: clock.ticks_for(cfg.max_backoff_seconds),
            probe_count: cfg.probe_count.max(1),
            steps: cfg.reintegration_steps.clone(),
            dwell: clock.ticks_for(cfg.reintegration_dwell_seconds),
        }
    }

    /// `min(initial · 2^attempt, max)`.
    pub fn backoff(&self, attempt: u32) -> Tick {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self::from_config(&ScavengerConfig::default(), &TickClock::new(1.0))
    }
}

/// Health of a link's target node as seen by the breaker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinkHealth {
    /// Error VeryHot while spare is low.
    pub crisis: bool,
    /// The probe checklist holds this tick.
    pub probe_pass: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Move {
    Trip,
    BeginProbe,
    ProbeFailed,
    Close,
    Advance,
    Regress,
}

impl Move {
    pub fn reason(self) -> &'static str {
        match self {
            Move::Trip => "error very hot with low spare",
            Move::BeginProbe => "backoff elapsed, probing",
            Move::ProbeFailed => "probe failed",
            Move::Close => "probes passed, reintegrating",
            Move::Advance => "reintegration step",
            Move::Regress => "regression during reintegration",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Breaker {
    state: CircuitState,
    entered_at: Tick,
    attempt_count: u32,
    probes_passed: u32,
    probe_failed: bool,
    /// Index into the reintegration steps while ramping back up.
    ramp_step: Option<usize>,
    ramp_since: Tick,
}

impl Breaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn entered_at(&self) -> Tick {
        self.entered_at
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn probes_passed(&self) -> u32 {
        self.probes_passed
    }

    pub fn is_ramping(&self) -> bool {
        self.ramp_step.is_some()
    }

    /// Share of traffic the link should carry in its current state.
    pub fn traffic_fraction(&self, policy: &BreakerPolicy) -> f64 {
        match (self.state, self.ramp_step) {
            (CircuitState::Closed, Some(k)) => policy.steps.get(k).copied().unwrap_or(1.0),
            (CircuitState::Closed, None) => 1.0,
            _ => 0.0,
        }
    }

    /// Record one probe result. Only meaningful while HalfOpen.
    pub fn observe_probe(&mut self, pass: bool) {
        if self.state != CircuitState::HalfOpen {
            return;
        }
        if pass {
            self.probes_passed += 1;
        } else {
            self.probe_failed = true;
        }
    }

    /// The move the breaker wants to make at `now`, if any.
    pub fn next(&self, health: LinkHealth, now: Tick, policy: &BreakerPolicy) -> Option<Move> {
        match self.state {
            CircuitState::Closed => match self.ramp_step {
                None => health.crisis.then_some(Move::Trip),
                Some(_) if !health.probe_pass => Some(Move::Regress),
                Some(_) => (now.saturating_sub(self.ramp_since) >= policy.dwell)
                    .then_some(Move::Advance),
            },
            CircuitState::Open => {
                let waited = now.saturating_sub(self.entered_at);
                (waited >= policy.backoff(self.attempt_count)).then_some(Move::BeginProbe)
            }
            CircuitState::HalfOpen => {
                if self.probe_failed {
                    Some(Move::ProbeFailed)
                } else if self.probes_passed >= policy.probe_count {
                    Some(Move::Close)
                } else {
                    None
                }
            }
        }
    }

    /// The legal move that leads from the current state to `target`, if any.
    /// Used to replay a confirmed actuation onto the breaker.
    pub fn move_to(&self, target: CircuitState) -> Option<Move> {
        match (self.state, self.ramp_step.is_some(), target) {
            (CircuitState::Closed, false, CircuitState::Open) => Some(Move::Trip),
            (CircuitState::Closed, true, CircuitState::Open) => Some(Move::Regress),
            (CircuitState::Closed, true, CircuitState::Closed) => Some(Move::Advance),
            (CircuitState::Open, _, CircuitState::HalfOpen) => Some(Move::BeginProbe),
            (CircuitState::HalfOpen, _, CircuitState::Open) => Some(Move::ProbeFailed),
            (CircuitState::HalfOpen, _, CircuitState::Closed) => Some(Move::Close),
            _ => None,
        }
    }

    /// State and traffic fraction the breaker would have after `mv`.
    pub fn preview(&self, mv: Move, policy: &BreakerPolicy) -> (CircuitState, f64) {
        let mut after = self.clone();
        after.apply(mv, self.entered_at, policy);
        (after.state, after.traffic_fraction(policy))
    }

    /// Commit a move. Returns `false` (and changes nothing) when `mv` is not
    /// legal from the current state.
    pub fn apply(&mut self, mv: Move, now: Tick, policy: &BreakerPolicy) -> bool {
        let last = policy.steps.len().saturating_sub(1);
        match (self.state, self.ramp_step, mv) {
            (CircuitState::Closed, None, Move::Trip) => {
                self.enter(CircuitState::Open, now);
            }
            (CircuitState::Open, _, Move::BeginProbe) => {
                self.enter(CircuitState::HalfOpen, now);
            }
            (CircuitState::HalfOpen, _, Move::ProbeFailed) => {
                self.attempt_count = self.attempt_count.saturating_add(1);
                self.enter(CircuitState::Open, now);
            }
            (CircuitState::HalfOpen, _, Move::Close) => {
                self.enter(CircuitState::Closed, now);
                self.start_ramp(0, last, now);
            }
            (CircuitState::Closed, Some(k), Move::Advance) => {
                self.start_ramp(k + 1, last, now);
            }
            (CircuitState::Closed, Some(_), Move::Regress) => {
                self.attempt_count = self.attempt_count.saturating_add(1);
                self.ramp_step = None;
                self.enter(CircuitState::Open, now);
            }
            _ => return false,
        }
        true
    }

    fn enter(&mut self, state: CircuitState, now: Tick) {
        self.state = state;
        self.entered_at = now;
        self.probes_passed = 0;
        self.probe_failed = false;
    }

    fn start_ramp(&mut self, step: usize, last: usize, now: Tick) {
        if step >= last {
            self.ramp_step = None;
            self.attempt_count = 0;
        } else {
            self.ramp_step = Some(step);
            self.ramp_since = now;
        }
    }
}
