//! Stability governor: admission control shared by every agent.
//!
//! All mutable admission state sits behind one `parking_lot::Mutex`, so the
//! check-and-decrement of the agent and global buckets is a single critical
//! section. Two agents racing for the last global token cannot both win, and
//! a global rejection hands the agent's token back.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::{AgentLimits, BucketConfig, GovernorConfig};
use crate::intent::{Action, AgentKind, Intent, Outcome};
use crate::time::{Tick, TickClock};

/// Token bucket in which every token comes back exactly `window` ticks after
/// it was taken, so no `window` consecutive ticks ever hold more than
/// `capacity` admissions.
#[derive(Clone, Debug, PartialEq)]
pub struct TokenBucket {
    capacity: usize,
    window: Tick,
    /// Ticks at which the outstanding tokens were taken, oldest first.
    taken: VecDeque<Tick>,
}

impl TokenBucket {
    /// Starts full.
    pub fn new(capacity: u32, window_ticks: Tick) -> Self {
        Self {
            capacity: capacity as usize,
            window: window_ticks.max(1),
            taken: VecDeque::new(),
        }
    }

    pub fn from_config(cfg: &BucketConfig, clock: &TickClock) -> Self {
        Self::new(cfg.capacity, clock.ticks_for(cfg.window_seconds))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn window(&self) -> Tick {
        self.window
    }

    /// Tokens left as of the last `try_take`.
    pub fn tokens(&self) -> usize {
        self.capacity.saturating_sub(self.taken.len())
    }

    fn expire(&mut self, now: Tick) {
        while let Some(&at) = self.taken.front() {
            if now.saturating_sub(at) < self.window {
                break;
            }
            self.taken.pop_front();
        }
    }

    pub fn try_take(&mut self, now: Tick) -> bool {
        self.expire(now);
        if self.taken.len() < self.capacity {
            self.taken.push_back(now);
            true
        } else {
            false
        }
    }

    /// Return the most recently taken token.
    pub fn refund(&mut self) {
        self.taken.pop_back();
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rejection", rename_all = "snake_case")]
pub enum Rejection {
    #[error("{agent} is cooling down until tick {until}")]
    AgentCooldown { agent: AgentKind, until: Tick },
    #[error("{agent} backing off {target} after failure until tick {until}")]
    FailureBackoff {
        agent: AgentKind,
        target: String,
        until: Tick,
    },
    #[error("{target} acted on too recently, next slot at tick {until}")]
    TargetSpacing { target: String, until: Tick },
    #[error("capacity lease pool exhausted ({active}/{limit})")]
    LeasePoolExhausted { active: usize, limit: usize },
    #[error("{agent} rate limit reached")]
    AgentBudget { agent: AgentKind },
    #[error("global rate limit reached")]
    GlobalBudget,
    #[error("action already in flight for {target}")]
    InFlight { target: String },
}

#[derive(Clone, Debug)]
struct AgentPolicy {
    target_interval: Option<Tick>,
    limit_cooldown: Tick,
}

impl AgentPolicy {
    fn from_limits(limits: &AgentLimits, clock: &TickClock) -> Self {
        Self {
            target_interval: (limits.target_interval_seconds > 0.0)
                .then(|| clock.ticks_for(limits.target_interval_seconds)),
            limit_cooldown: if limits.limit_cooldown_seconds > 0.0 {
                clock.ticks_for(limits.limit_cooldown_seconds)
            } else {
                0
            },
        }
    }
}

struct AgentState {
    bucket: TokenBucket,
    policy: AgentPolicy,
    cooldown_until: Tick,
    last_by_target: HashMap<String, Tick>,
}

struct FailureState {
    failures: u32,
    until: Tick,
}

struct Lease {
    target: String,
    expires_at: Tick,
}

struct GovernorState {
    global: TokenBucket,
    agents: HashMap<AgentKind, AgentState>,
    failures: HashMap<(AgentKind, String), FailureState>,
    leases: Vec<Lease>,
    lease_limit: usize,
}

pub struct Governor {
    state: Mutex<GovernorState>,
    lease_ticks: Tick,
    lease_fraction: f64,
    failure_backoff: Tick,
    failure_backoff_max: Tick,
}

impl Governor {
    /// `lease_fraction` of `nodes` (rounded up) capacity leases may be held
    /// at once, each for `lease_ticks`.
    pub fn new(
        cfg: &GovernorConfig,
        clock: &TickClock,
        lease_fraction: f64,
        lease_ticks: Tick,
        nodes: usize,
    ) -> Self {
        let agent = |limits: &AgentLimits| AgentState {
            bucket: TokenBucket::from_config(&limits.bucket, clock),
            policy: AgentPolicy::from_limits(limits, clock),
            cooldown_until: 0,
            last_by_target: HashMap::new(),
        };
        let agents = HashMap::from([
            (AgentKind::Weaver, agent(&cfg.weaver)),
            (AgentKind::Builder, agent(&cfg.builder)),
            (AgentKind::Scavenger, agent(&cfg.scavenger)),
        ]);
        Self {
            state: Mutex::new(GovernorState {
                global: TokenBucket::from_config(&cfg.global, clock),
                agents,
                failures: HashMap::new(),
                leases: Vec::new(),
                lease_limit: lease_limit(lease_fraction, nodes),
            }),
            lease_ticks,
            lease_fraction,
            failure_backoff: clock.ticks_for(cfg.failure_backoff_seconds),
            failure_backoff_max: clock.ticks_for(cfg.failure_backoff_max_seconds),
        }
    }

    /// Resize the lease pool after a topology change.
    pub fn set_node_count(&self, nodes: usize) {
        self.state.lock().lease_limit = lease_limit(self.lease_fraction, nodes);
    }

    pub fn lease_limit(&self) -> usize {
        self.state.lock().lease_limit
    }

    pub fn active_leases(&self, now: Tick) -> usize {
        let mut st = self.state.lock();
        st.leases.retain(|l| l.expires_at > now);
        st.leases.len()
    }

    /// Admit or reject `intent` at tick `now`. Admission consumes one agent
    /// token and one global token.
    pub fn admit(&self, intent: &Intent, now: Tick) -> Result<(), Rejection> {
        let agent = intent.agent;
        let target = intent.action.target().to_string();
        let mut guard = self.state.lock();
        let st = &mut *guard;

        let Some(agent_state) = st.agents.get_mut(&agent) else {
            return Err(Rejection::AgentBudget { agent });
        };
        if now < agent_state.cooldown_until {
            return Err(Rejection::AgentCooldown {
                agent,
                until: agent_state.cooldown_until,
            });
        }
        if let Some(f) = st.failures.get(&(agent, target.clone())) {
            if now < f.until {
                return Err(Rejection::FailureBackoff {
                    agent,
                    target,
                    until: f.until,
                });
            }
        }
        if let (Some(interval), Some(last)) = (
            agent_state.policy.target_interval,
            agent_state.last_by_target.get(&target),
        ) {
            let until = last + interval;
            if now < until {
                return Err(Rejection::TargetSpacing { target, until });
            }
        }
        let needs_lease = matches!(intent.action, Action::RequestCapacityToken { .. });
        if needs_lease {
            st.leases.retain(|l| l.expires_at > now);
            if st.leases.len() >= st.lease_limit {
                return Err(Rejection::LeasePoolExhausted {
                    active: st.leases.len(),
                    limit: st.lease_limit,
                });
            }
        }

        if !agent_state.bucket.try_take(now) {
            agent_state.cooldown_until = now + agent_state.policy.limit_cooldown;
            debug!(%agent, until = agent_state.cooldown_until, "agent bucket empty");
            return Err(Rejection::AgentBudget { agent });
        }
        if !st.global.try_take(now) {
            agent_state.bucket.refund();
            return Err(Rejection::GlobalBudget);
        }

        agent_state.last_by_target.insert(target.clone(), now);
        if needs_lease {
            st.leases.push(Lease {
                target,
                expires_at: now + self.lease_ticks,
            });
        }
        Ok(())
    }

    /// Feed back the actuation result. Failures start an exponential backoff
    /// for the (agent, target) pair and release any reserved lease.
    pub fn record_outcome(&self, intent: &Intent, outcome: &Outcome, now: Tick) {
        let key = (intent.agent, intent.action.target().to_string());
        let mut st = self.state.lock();
        if outcome.is_success() {
            st.failures.remove(&key);
            return;
        }

        if matches!(intent.action, Action::RequestCapacityToken { .. }) {
            if let Some(pos) = st.leases.iter().position(|l| l.target == key.1) {
                st.leases.remove(pos);
            }
        }
        let base = self.failure_backoff;
        let max = self.failure_backoff_max;
        let entry = st.failures.entry(key).or_insert(FailureState {
            failures: 0,
            until: 0,
        });
        let factor = 1u64.checked_shl(entry.failures).unwrap_or(u64::MAX);
        entry.failures = entry.failures.saturating_add(1);
        entry.until = now + base.saturating_mul(factor).min(max);
    }
}

fn lease_limit(fraction: f64, nodes: usize) -> usize {
    (fraction * nodes as f64).ceil() as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    fn clock() -> TickClock {
        TickClock::new(1.0)
    }

    fn lease_intent(tick: Tick, node: &str) -> Intent {
        Intent::new(
            tick,
            AgentKind::Builder,
            Action::RequestCapacityToken {
                node_id: node.into(),
                lease_seconds: 60.0,
            },
            vec![node.into()],
            "test",
        )
    }

    fn shift_intent(tick: Tick, link: &str) -> Intent {
        Intent::new(
            tick,
            AgentKind::Weaver,
            Action::ShiftWeight {
                link_id: link.into(),
                to_link: "alt".into(),
                delta: 0.05,
                increment_schedule: vec![],
            },
            vec![],
            "test",
        )
    }

    #[test]
    fn tokens_return_one_window_after_use() {
        let mut b = TokenBucket::new(2, 10);
        assert!(b.try_take(0));
        assert!(b.try_take(3));
        assert!(!b.try_take(3));
        assert!(!b.try_take(9));
        assert!(b.try_take(10));
        assert!(!b.try_take(12));
        assert!(b.try_take(13));
        assert_eq!(b.tokens(), 0);
    }

    #[test]
    fn builder_admits_at_most_five_per_window() {
        let cfg = GovernorConfig::default();
        let g = Governor::new(&cfg, &clock(), 1.0, 60, 1000);
        let mut dense = Vec::new();
        for tick in 0..60 {
            if g.admit(&lease_intent(tick, &format!("a{tick}")), tick).is_ok() {
                dense.push(tick);
            }
        }
        assert_eq!(dense.len(), 5);

        let g = Governor::new(&cfg, &clock(), 1.0, 60, 1000);
        let mut paced = Vec::new();
        for tick in (0..60).step_by(2) {
            if g.admit(&lease_intent(tick, &format!("b{tick}")), tick).is_ok() {
                paced.push(tick);
            }
        }
        assert_eq!(paced, vec![0, 2, 4, 6, 8]);
    }

    #[test]
    fn builder_spacing_per_node() {
        let g = Governor::new(&GovernorConfig::default(), &clock(), 1.0, 60, 10);
        assert!(g.admit(&lease_intent(1, "n1"), 1).is_ok());
        assert!(matches!(
            g.admit(&lease_intent(2, "n1"), 2),
            Err(Rejection::TargetSpacing { until: 61, .. })
        ));
        assert!(g.admit(&lease_intent(2, "n2"), 2).is_ok());
    }

    #[test]
    fn builder_bucket_then_cooldown() {
        let g = Governor::new(&GovernorConfig::default(), &clock(), 1.0, 60, 100);
        for i in 0..5 {
            assert!(g.admit(&lease_intent(1, &format!("n{i}")), 1).is_ok());
        }
        assert_eq!(
            g.admit(&lease_intent(1, "n9"), 1),
            Err(Rejection::AgentBudget {
                agent: AgentKind::Builder
            })
        );
        assert!(matches!(
            g.admit(&lease_intent(20, "n9"), 20),
            Err(Rejection::AgentCooldown { until: 31, .. })
        ));
    }

    #[test]
    fn lease_pool_is_capped() {
        // ceil(0.2 · 6) = 2
        let g = Governor::new(&GovernorConfig::default(), &clock(), 0.2, 60, 6);
        assert_eq!(g.lease_limit(), 2);
        assert!(g.admit(&lease_intent(1, "a"), 1).is_ok());
        assert!(g.admit(&lease_intent(1, "b"), 1).is_ok());
        assert!(matches!(
            g.admit(&lease_intent(1, "c"), 1),
            Err(Rejection::LeasePoolExhausted { active: 2, limit: 2 })
        ));
        // Leases expire.
        assert_eq!(g.active_leases(61), 0);
        assert!(g.admit(&lease_intent(61, "c"), 61).is_ok());
    }

    #[test]
    fn failure_releases_lease_and_backs_off() {
        let g = Governor::new(&GovernorConfig::default(), &clock(), 0.2, 60, 5);
        let first = lease_intent(1, "a");
        g.admit(&first, 1).unwrap();
        g.record_outcome(&first, &Outcome::Failure { reason: "x".into() }, 1);
        assert_eq!(g.active_leases(1), 0);

        let w = shift_intent(1, "l1");
        g.admit(&w, 1).unwrap();
        g.record_outcome(&w, &Outcome::Failure { reason: "x".into() }, 1);
        assert!(matches!(
            g.admit(&shift_intent(3, "l1"), 3),
            Err(Rejection::FailureBackoff { until: 6, .. })
        ));
        g.admit(&shift_intent(6, "l1"), 6).unwrap();
        g.record_outcome(&w, &Outcome::Failure { reason: "x".into() }, 6);
        // Doubled.
        assert!(g.admit(&shift_intent(15, "l1"), 15).is_err());
        assert!(g.admit(&shift_intent(16, "l1"), 16).is_ok());
    }

    #[test]
    fn global_rejection_refunds_agent_token() {
        let cfg = GovernorConfig {
            global: BucketConfig {
                capacity: 1,
                window_seconds: 1000.0,
            },
            ..GovernorConfig::default()
        };
        let g = Governor::new(&cfg, &clock(), 1.0, 60, 10);
        g.admit(&shift_intent(1, "l1"), 1).unwrap();
        assert_eq!(
            g.admit(&shift_intent(1, "l2"), 1),
            Err(Rejection::GlobalBudget)
        );
        let st = g.state.lock();
        let weaver = &st.agents[&AgentKind::Weaver];
        assert_eq!(weaver.bucket.tokens(), 9);
    }

    #[test]
    fn racing_agents_cannot_share_last_token() {
        let cfg = GovernorConfig {
            global: BucketConfig {
                capacity: 1,
                window_seconds: 1000.0,
            },
            ..GovernorConfig::default()
        };
        for _ in 0..50 {
            let g = Arc::new(Governor::new(&cfg, &clock(), 1.0, 60, 10));
            let barrier = Arc::new(Barrier::new(2));
            let handles: Vec<_> = ["l1", "n1"]
                .into_iter()
                .map(|target| {
                    let g = Arc::clone(&g);
                    let barrier = Arc::clone(&barrier);
                    std::thread::spawn(move || {
                        let intent = if target == "l1" {
                            shift_intent(1, target)
                        } else {
                            lease_intent(1, target)
                        };
                        barrier.wait();
                        g.admit(&intent, 1).is_ok()
                    })
                })
                .collect();
            let admitted = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|ok| *ok)
                .count();
            assert_eq!(admitted, 1);
        }
    }
}
