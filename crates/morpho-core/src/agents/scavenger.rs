//! Scavenger: circuit breaking for links into failing nodes.

use std::collections::HashMap;

use crate::agents::{Agent, Evaluation, TickView};
use crate::circuit::{Breaker, BreakerPolicy, CircuitState, LinkHealth};
use crate::config::DetectorConfig;
use crate::detector::Band;
use crate::intent::{Action, AgentKind, Intent, Outcome};
use crate::signal::Signal;
use crate::time::Tick;
use crate::topology::{LinkId, Topology};

pub struct Scavenger {
    policy: BreakerPolicy,
    /// Spare field below this is "low" for the crisis trigger.
    spare_low: f64,
    error_hysteresis: f64,
    breakers: HashMap<LinkId, Breaker>,
}

impl Scavenger {
    pub fn new(policy: BreakerPolicy, detector: &DetectorConfig) -> Self {
        Self {
            policy,
            spare_low: detector.spare.hot,
            error_hysteresis: detector.error.hysteresis,
            breakers: HashMap::new(),
        }
    }

    pub fn policy(&self) -> &BreakerPolicy {
        &self.policy
    }

    pub fn breaker(&self, link: &str) -> Option<&Breaker> {
        self.breakers.get(link)
    }

    pub fn state(&self, link: &str) -> CircuitState {
        self.breakers.get(link).map_or(CircuitState::Closed, Breaker::state)
    }

    /// Circuit state per link index of `topology`.
    pub fn circuit_states(&self, topology: &Topology) -> Vec<CircuitState> {
        topology
            .links()
            .iter()
            .map(|l| self.state(l.id.as_str()))
            .collect()
    }

    /// Crisis and probe checklist for the target node `v` of a link.
    pub fn health(&self, view: &TickView<'_>, v: usize) -> LinkHealth {
        let fields = view.fields;
        let det = view.detection;
        let error = fields.get(v, Signal::Error);
        let latency = fields.get(v, Signal::Latency);

        let crisis = det.band(v, Signal::Error) == Band::VeryHot
            && fields.get(v, Signal::Spare) < self.spare_low;
        let error_ok = det
            .hot_threshold(v, Signal::Error)
            .is_some_and(|hot| error < hot - self.error_hysteresis);
        let latency_ok = det
            .hot_threshold(v, Signal::Latency)
            .is_some_and(|hot| latency < hot);
        let spare_ok = det.band(v, Signal::Spare) != Band::VeryHot;

        LinkHealth {
            crisis,
            probe_pass: error_ok && latency_ok && spare_ok,
        }
    }
}

impl Agent for Scavenger {
    fn kind(&self) -> AgentKind {
        AgentKind::Scavenger
    }

    /// Each tick HalfOpen is one probe.
    fn observe(&mut self, view: &TickView<'_>) {
        for link in view.topology.links() {
            let Some(state) = self.breakers.get(&link.id).map(Breaker::state) else {
                continue;
            };
            if state == CircuitState::HalfOpen {
                let pass = self.health(view, link.to).probe_pass;
                if let Some(b) = self.breakers.get_mut(&link.id) {
                    b.observe_probe(pass);
                }
            }
        }
    }

    fn evaluate(&self, view: &TickView<'_>) -> Evaluation {
        let mut eval = Evaluation::default();
        let closed = Breaker::new();
        for link in view.topology.links() {
            let breaker = self.breakers.get(&link.id).unwrap_or(&closed);
            let health = self.health(view, link.to);
            let Some(mv) = breaker.next(health, view.tick, &self.policy) else {
                continue;
            };
            let (state, traffic_fraction) = breaker.preview(mv, &self.policy);
            let targets = view
                .topology
                .node(link.to)
                .map(|n| vec![n.id.clone()])
                .unwrap_or_default();
            let trigger = format!(
                "{}: {} -> {} (attempt {})",
                link.id,
                breaker.state(),
                state,
                breaker.attempt_count()
            );
            eval.propose(Intent::new(
                view.tick,
                AgentKind::Scavenger,
                Action::SetCircuitState {
                    link_id: link.id.clone(),
                    state,
                    reason: mv.reason().to_string(),
                    traffic_fraction,
                },
                targets,
                trigger,
            ));
        }
        eval
    }

    fn commit(&mut self, intent: &Intent, outcome: &Outcome, tick: Tick) {
        // A failed actuation leaves the breaker where it was.
        if !outcome.is_success() {
            return;
        }
        let Action::SetCircuitState { link_id, state, .. } = &intent.action else {
            return;
        };
        let breaker = self.breakers.entry(link_id.clone()).or_default();
        if let Some(mv) = breaker.move_to(*state) {
            breaker.apply(mv, tick, &self.policy);
        }
    }

    fn on_topology_change(&mut self, topology: &Topology) {
        self.breakers
            .retain(|id, _| topology.link_index_of(id.as_str()).is_some());
    }
}
