//! Builder: capacity requests for error-hot nodes that still have headroom
//! in the neighborhood, gated by quorum.

use std::collections::HashMap;

use crate::agents::quorum;
use crate::agents::{Agent, Evaluation, TickView};
use crate::config::BuilderConfig;
use crate::detector::Band;
use crate::intent::{Action, AgentKind, Intent, Outcome};
use crate::signal::Signal;
use crate::time::Tick;
use crate::topology::{NodeId, Topology};

pub struct Builder {
    cfg: BuilderConfig,
    lease_ticks: Tick,
    /// Confirmed leases and their expiry tick.
    leases: HashMap<NodeId, Tick>,
}

impl Builder {
    pub fn new(cfg: BuilderConfig, lease_ticks: Tick) -> Self {
        Self {
            cfg,
            lease_ticks,
            leases: HashMap::new(),
        }
    }

    pub fn holds_lease(&self, node: &str, now: Tick) -> bool {
        self.leases.get(node).is_some_and(|until| now < *until)
    }
}

impl Agent for Builder {
    fn kind(&self) -> AgentKind {
        AgentKind::Builder
    }

    fn evaluate(&self, view: &TickView<'_>) -> Evaluation {
        let mut eval = Evaluation::default();
        for (i, node) in view.topology.nodes().iter().enumerate() {
            if !view.detection.at_least(i, Signal::Error, Band::Hot)
                || view.fields.get(i, Signal::Spare) < self.cfg.spare_high
                || self.holds_lease(node.id.as_str(), view.tick)
            {
                continue;
            }

            let decision = quorum::evaluate(view, &self.cfg.quorum, self.cfg.spare_high, i);
            let approved = decision.approved;
            let reason = format!(
                "error hot with spare; quorum {} ({}/{} hot neighbors)",
                decision.reason, decision.hot_neighbors, decision.degree
            );
            eval.votes.push(decision.into_record(node.id.clone()));
            if approved {
                eval.propose(Intent::new(
                    view.tick,
                    AgentKind::Builder,
                    Action::RequestCapacityToken {
                        node_id: node.id.clone(),
                        lease_seconds: self.cfg.lease_seconds,
                    },
                    vec![node.id.clone()],
                    reason,
                ));
            }
        }
        eval
    }

    fn commit(&mut self, intent: &Intent, outcome: &Outcome, tick: Tick) {
        if let (Outcome::Success, Action::RequestCapacityToken { node_id, .. }) =
            (outcome, &intent.action)
        {
            self.leases.insert(node_id.clone(), tick + self.lease_ticks);
        }
        self.leases.retain(|_, until| tick < *until);
    }

    fn on_topology_change(&mut self, topology: &Topology) {
        self.leases
            .retain(|node, _| topology.index_of(node.as_str()).is_some());
    }
}
