//! Neighborhood quorum for capacity requests.
//!
//! A single node's reading never suffices: isolated nodes and nodes with no
//! hot neighbor are rejected outright. Otherwise the topological fraction
//! `q = hot_neighbors / degree` decides, with a weighted signal vote breaking
//! ties in `[tie_low, approve_fraction)` when too few neighbors agree.
//! The neighbor count only counts inside that band: below `tie_low` even
//! several hot neighbors are not enough.

use crate::agents::TickView;
use crate::audit::VoteRecord;
use crate::config::QuorumConfig;
use crate::detector::Band;
use crate::signal::Signal;

#[derive(Clone, Debug, PartialEq)]
pub struct QuorumDecision {
    pub approved: bool,
    pub degree: usize,
    pub hot_neighbors: usize,
    pub fraction: f64,
    pub weighted_vote: Option<f64>,
    pub reason: &'static str,
}

impl QuorumDecision {
    pub fn into_record(self, node: crate::topology::NodeId) -> VoteRecord {
        VoteRecord {
            node,
            approved: self.approved,
            degree: self.degree,
            hot_neighbors: self.hot_neighbors,
            fraction: self.fraction,
            weighted_vote: self.weighted_vote,
            reason: self.reason.to_string(),
        }
    }
}

/// Pure quorum rule. `neighborhood` yields the fractions of the node plus its
/// neighbors with (Error Hot, Latency Hot, Spare high); it is only called in
/// the tie-break band.
pub fn decide(
    cfg: &QuorumConfig,
    degree: usize,
    hot_neighbors: usize,
    neighborhood: impl FnOnce() -> [f64; 3],
) -> QuorumDecision {
    let mut decision = QuorumDecision {
        approved: false,
        degree,
        hot_neighbors,
        fraction: 0.0,
        weighted_vote: None,
        reason: "",
    };
    if degree == 0 {
        decision.reason = "isolated node";
        return decision;
    }
    if hot_neighbors == 0 {
        decision.reason = "no hot neighbor";
        return decision;
    }

    let q = hot_neighbors as f64 / degree as f64;
    decision.fraction = q;
    if q >= cfg.approve_fraction {
        decision.approved = true;
        decision.reason = "topological quorum";
    } else if q >= cfg.tie_low {
        if hot_neighbors >= cfg.min_count {
            decision.approved = true;
            decision.reason = "neighbor count";
        } else {
            let [e, l, s] = neighborhood();
            let [we, wl, ws] = cfg.weights;
            let vote = we * e + wl * l + ws * s;
            decision.weighted_vote = Some(vote);
            decision.approved = vote >= cfg.vote_threshold;
            decision.reason = if decision.approved {
                "weighted vote"
            } else {
                "weighted vote below threshold"
            };
        }
    } else {
        decision.reason = "quorum fraction too low";
    }
    decision
}

/// Run the quorum for `node` against the current tick.
pub fn evaluate(view: &TickView<'_>, cfg: &QuorumConfig, spare_high: f64, node: usize) -> QuorumDecision {
    let Some(n) = view.topology.node(node) else {
        return decide(cfg, 0, 0, || [0.0; 3]);
    };
    let hot = |i: usize, s: Signal| view.detection.at_least(i, s, Band::Hot);
    let hot_neighbors = n.neighbors.iter().filter(|&&j| hot(j, Signal::Error)).count();

    decide(cfg, n.degree(), hot_neighbors, || {
        let members: Vec<usize> = std::iter::once(node).chain(n.neighbors.iter().copied()).collect();
        let size = members.len() as f64;
        let share = |pred: &dyn Fn(usize) -> bool| {
            members.iter().filter(|&&i| pred(i)).count() as f64 / size
        };
        [
            share(&|i| hot(i, Signal::Error)),
            share(&|i| hot(i, Signal::Latency)),
            share(&|i| view.fields.get(i, Signal::Spare) >= spare_high),
        ]
    })
}
