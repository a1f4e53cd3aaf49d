//! Weaver: incremental load rebalancing between sibling links.
//!
//! For a link `A = u → v` whose target runs latency-hot while a sibling
//! `B = u → w` has clearly more spare capacity, the Weaver moves a bounded
//! share of flow weight from A to B in small steps. Once latency at `v` has
//! stayed below `θ_hot − δ` for long enough, the shift is unwound the same
//! way and A rests for a cooldown.

use std::collections::HashMap;

use crate::agents::{Agent, Evaluation, TickView};
use crate::circuit::CircuitState;
use crate::config::WeaverConfig;
use crate::constants::EPSILON;
use crate::detector::Band;
use crate::intent::{Action, AgentKind, Intent, Outcome};
use crate::signal::Signal;
use crate::time::Tick;
use crate::topology::{LinkId, Topology};

#[derive(Clone, Debug, PartialEq)]
struct Plan {
    to_link: LinkId,
    target: f64,
    applied: f64,
    reverting: bool,
    clear_ticks: u32,
}

pub struct Weaver {
    cfg: WeaverConfig,
    /// Latency hysteresis δ.
    hysteresis: f64,
    /// Active shifts keyed by the relieved link.
    plans: HashMap<LinkId, Plan>,
    cooldown_until: HashMap<LinkId, Tick>,
}

impl Weaver {
    pub fn new(cfg: WeaverConfig, latency_hysteresis: f64) -> Self {
        Self {
            cfg,
            hysteresis: latency_hysteresis,
            plans: HashMap::new(),
            cooldown_until: HashMap::new(),
        }
    }

    /// Flow weight currently moved off `link`.
    pub fn shifted(&self, link: &str) -> f64 {
        self.plans.get(link).map_or(0.0, |p| p.applied)
    }

    pub fn is_reverting(&self, link: &str) -> bool {
        self.plans.get(link).is_some_and(|p| p.reverting)
    }

    pub fn in_cooldown(&self, link: &str, now: Tick) -> bool {
        self.cooldown_until.get(link).is_some_and(|until| now < *until)
    }

    /// Remaining steps after one of size `delta`, out of `remaining`.
    fn schedule(&self, remaining: f64, delta: f64) -> Vec<f64> {
        let mut left = remaining - delta;
        let mut steps = Vec::new();
        while left > EPSILON {
            let s = self.cfg.step.min(left);
            steps.push(s);
            left -= s;
        }
        steps
    }

    fn shift_intent(
        &self,
        view: &TickView<'_>,
        from: &LinkId,
        to: &LinkId,
        remaining: f64,
        reason: String,
        node: usize,
    ) -> Intent {
        let delta = self.cfg.step.min(remaining);
        let targets = view
            .topology
            .node(node)
            .map(|n| vec![n.id.clone()])
            .unwrap_or_default();
        Intent::new(
            view.tick,
            AgentKind::Weaver,
            Action::ShiftWeight {
                link_id: from.clone(),
                to_link: to.clone(),
                delta,
                increment_schedule: self.schedule(remaining, delta),
            },
            targets,
            reason,
        )
    }

    /// Best sibling of link `a` by spare advantage, if it clears the margin.
    fn alternative(&self, view: &TickView<'_>, a: usize) -> Option<(usize, f64)> {
        let link = view.topology.link(a)?;
        let spare_v = view.fields.get(link.to, Signal::Spare);
        view.topology
            .outgoing(link.from)
            .iter()
            .copied()
            .filter(|&b| b != a)
            .filter_map(|b| {
                let alt = view.topology.link(b)?;
                if alt.to == link.to || view.circuit(b) == CircuitState::Open {
                    return None;
                }
                if self.plans.contains_key(&alt.id) {
                    return None;
                }
                let advantage = view.fields.get(alt.to, Signal::Spare) - spare_v;
                (advantage >= self.cfg.min_spare_advantage - EPSILON).then_some((b, advantage))
            })
            .max_by(|x, y| x.1.total_cmp(&y.1))
    }
}

impl Agent for Weaver {
    fn kind(&self) -> AgentKind {
        AgentKind::Weaver
    }

    fn observe(&mut self, view: &TickView<'_>) {
        for (link_id, plan) in &mut self.plans {
            if plan.reverting {
                continue;
            }
            let Some(link) = view.topology.link_by_id(link_id.as_str()) else {
                continue;
            };
            let value = view.fields.get(link.to, Signal::Latency);
            let clear = view
                .detection
                .hot_threshold(link.to, Signal::Latency)
                .is_some_and(|hot| value < hot - self.hysteresis);
            plan.clear_ticks = if clear { plan.clear_ticks + 1 } else { 0 };
            if plan.clear_ticks >= self.cfg.revert_clear_ticks {
                plan.reverting = true;
            }
        }
    }

    fn evaluate(&self, view: &TickView<'_>) -> Evaluation {
        let mut eval = Evaluation::default();
        for (a, link) in view.topology.links().iter().enumerate() {
            if let Some(plan) = self.plans.get(&link.id) {
                if plan.reverting {
                    if plan.applied > EPSILON {
                        let reason = format!("latency at {} cleared, reverting", link.id);
                        let back = self.shift_intent(
                            view,
                            &plan.to_link,
                            &link.id,
                            plan.applied,
                            reason,
                            link.to,
                        );
                        eval.propose(back);
                    }
                } else if plan.target - plan.applied > EPSILON {
                    let reason = format!("continuing shift off {}", link.id);
                    let step = self.shift_intent(
                        view,
                        &link.id,
                        &plan.to_link,
                        plan.target - plan.applied,
                        reason,
                        link.to,
                    );
                    eval.propose(step);
                }
                continue;
            }

            if self.in_cooldown(link.id.as_str(), view.tick)
                || !view.detection.at_least(link.to, Signal::Latency, Band::Hot)
                // Never relieve a link that is itself absorbing a shift.
                || self.plans.values().any(|p| p.to_link == link.id)
            {
                continue;
            }
            let Some((b, advantage)) = self.alternative(view, a) else {
                continue;
            };
            let Some(alt) = view.topology.link(b) else {
                continue;
            };
            let reason = format!(
                "latency hot behind {}, {} has {:.2} more spare",
                link.id, alt.id, advantage
            );
            let intent = self.shift_intent(
                view,
                &link.id,
                &alt.id,
                self.cfg.shift_fraction,
                reason,
                link.to,
            );
            eval.propose(intent);
        }
        eval
    }

    fn commit(&mut self, intent: &Intent, outcome: &Outcome, tick: Tick) {
        if !outcome.is_success() {
            return;
        }
        let Action::ShiftWeight {
            link_id,
            to_link,
            delta,
            ..
        } = &intent.action
        else {
            return;
        };

        // Revert steps travel B → A and are keyed by A.
        if let Some(plan) = self.plans.get_mut(to_link) {
            if plan.to_link == *link_id {
                if plan.reverting {
                    plan.applied = (plan.applied - delta).max(0.0);
                    if plan.applied <= EPSILON {
                        self.plans.remove(to_link);
                        self.cooldown_until
                            .insert(to_link.clone(), tick + self.cfg.cooldown_ticks);
                    }
                }
                return;
            }
        }

        let target = self.cfg.shift_fraction;
        let plan = self.plans.entry(link_id.clone()).or_insert_with(|| Plan {
            to_link: to_link.clone(),
            target,
            applied: 0.0,
            reverting: false,
            clear_ticks: 0,
        });
        if plan.to_link == *to_link && !plan.reverting {
            plan.applied = (plan.applied + delta).min(plan.target);
        }
    }

    fn on_topology_change(&mut self, topology: &Topology) {
        self.plans.retain(|a, plan| {
            topology.link_index_of(a.as_str()).is_some()
                && topology.link_index_of(plan.to_link.as_str()).is_some()
        });
        self.cooldown_until
            .retain(|a, _| topology.link_index_of(a.as_str()).is_some());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectorConfig;
    use crate::detector::DetectionState;
    use crate::field::FieldSnapshot;
    use crate::topology::{LinkSpec, TopologySpec};

    // u → v (A), u → w (B)
    fn fork() -> Topology {
        Topology::from_spec(&TopologySpec {
            nodes: vec!["u".into(), "v".into(), "w".into()],
            links: vec![
                LinkSpec {
                    id: "A".into(),
                    from: "u".into(),
                    to: "v".into(),
                    capacity: 1.0,
                },
                LinkSpec {
                    id: "B".into(),
                    from: "u".into(),
                    to: "w".into(),
                    capacity: 1.0,
                },
            ],
        })
        .unwrap()
    }

    struct World {
        topo: Topology,
        fields: FieldSnapshot,
        detection: DetectionState,
        circuits: Vec<CircuitState>,
    }

    impl World {
        fn new(latency_v: f64, hot: bool, spare_v: f64, spare_w: f64) -> Self {
            let topo = fork();
            let fields = FieldSnapshot::from_values(
                1,
                vec![[0.0, 0.3, 0.3], [0.0, latency_v, spare_v], [0.0, 0.1, spare_w]],
            );
            let band = if hot { Band::Hot } else { Band::Normal };
            let bands = vec![[Band::Normal; 3], [Band::Normal, band, Band::Normal], [Band::Normal; 3]];
            let detection = DetectionState::from_bands(bands, &DetectorConfig::default());
            Self {
                topo,
                fields,
                detection,
                circuits: vec![CircuitState::Closed; 2],
            }
        }

        fn view(&self, tick: Tick) -> TickView<'_> {
            TickView {
                tick,
                topology: &self.topo,
                fields: &self.fields,
                detection: &self.detection,
                circuits: &self.circuits,
            }
        }
    }

    fn weaver() -> Weaver {
        Weaver::new(WeaverConfig::default(), 0.05)
    }

    fn delta_of(intent: &Intent) -> (String, String, f64, usize) {
        match &intent.action {
            Action::ShiftWeight {
                link_id,
                to_link,
                delta,
                increment_schedule,
            } => (
                link_id.to_string(),
                to_link.to_string(),
                *delta,
                increment_schedule.len(),
            ),
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn shifts_in_increments_until_target() {
        let world = World::new(0.55, true, 0.2, 0.35);
        let mut w = weaver();
        let mut total = 0.0;
        for tick in 1..=5 {
            let eval = w.evaluate(&world.view(tick));
            if let Some(p) = eval.proposals.first() {
                let (from, to, delta, _) = delta_of(&p.intent);
                assert_eq!((from.as_str(), to.as_str()), ("A", "B"));
                assert!(delta <= 0.05 + 1e-12);
                total += delta;
                w.commit(&p.intent, &Outcome::Success, tick);
            }
        }
        assert!((total - 0.15).abs() < 1e-9);
        assert!((w.shifted("A") - 0.15).abs() < 1e-9);
    }

    #[test]
    fn first_step_carries_remaining_schedule() {
        let world = World::new(0.55, true, 0.2, 0.35);
        let eval = weaver().evaluate(&world.view(1));
        let (_, _, delta, remaining) = delta_of(&eval.proposals[0].intent);
        assert_eq!(delta, 0.05);
        assert_eq!(remaining, 2);
    }

    #[test]
    fn needs_spare_advantage() {
        let world = World::new(0.55, true, 0.2, 0.25);
        assert!(weaver().evaluate(&world.view(1)).proposals.is_empty());
    }

    #[test]
    fn skips_open_alternatives() {
        let mut world = World::new(0.55, true, 0.2, 0.35);
        world.circuits[1] = CircuitState::Open;
        assert!(weaver().evaluate(&world.view(1)).proposals.is_empty());
    }

    #[test]
    fn failed_step_changes_nothing() {
        let world = World::new(0.55, true, 0.2, 0.35);
        let mut w = weaver();
        let eval = w.evaluate(&world.view(1));
        w.commit(
            &eval.proposals[0].intent,
            &Outcome::Failure {
                reason: "x".into(),
            },
            1,
        );
        assert_eq!(w.shifted("A"), 0.0);
    }

    #[test]
    fn reverts_after_clear_ticks_then_cools_down() {
        let hot = World::new(0.55, true, 0.2, 0.35);
        let mut w = weaver();
        for tick in 1..=3 {
            let eval = w.evaluate(&hot.view(tick));
            w.commit(&eval.proposals[0].intent, &Outcome::Success, tick);
        }

        // 0.40 < 0.50 − 0.05
        let calm = World::new(0.40, false, 0.2, 0.35);
        for tick in 4..=7 {
            w.observe(&calm.view(tick));
            assert!(!w.is_reverting("A"));
        }
        w.observe(&calm.view(8));
        assert!(w.is_reverting("A"));

        let mut tick = 8;
        while w.shifted("A") > 0.0 {
            let eval = w.evaluate(&calm.view(tick));
            let (from, to, _, _) = delta_of(&eval.proposals[0].intent);
            assert_eq!((from.as_str(), to.as_str()), ("B", "A"));
            w.commit(&eval.proposals[0].intent, &Outcome::Success, tick);
            tick += 1;
        }
        assert!(w.in_cooldown("A", tick));
        // Hot again, but cooling down.
        assert!(w.evaluate(&hot.view(tick)).proposals.is_empty());
        assert!(!w.in_cooldown("A", tick + 10));
    }
}
