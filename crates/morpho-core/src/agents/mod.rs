//! Remediation agents.
//!
//! Agents read an immutable [`TickView`] and propose intents; they never talk
//! to the actuator. State changes happen in two places only: `observe`, for
//! per-tick bookkeeping that does not depend on actuation (hysteresis
//! counters, probe results), and `commit`, once the actuator has reported an
//! outcome for one of the agent's own intents.

pub mod builder;
pub mod quorum;
pub mod scavenger;
pub mod weaver;

pub use builder::Builder;
pub use quorum::{QuorumDecision, decide};
pub use scavenger::Scavenger;
pub use weaver::Weaver;

use crate::audit::VoteRecord;
use crate::circuit::CircuitState;
use crate::detector::DetectionState;
use crate::field::FieldSnapshot;
use crate::intent::{AgentKind, Intent, Outcome};
use crate::time::Tick;
use crate::topology::Topology;

/// Everything an agent may look at during one tick.
#[derive(Clone, Copy)]
pub struct TickView<'a> {
    pub tick: Tick,
    pub topology: &'a Topology,
    pub fields: &'a FieldSnapshot,
    pub detection: &'a DetectionState,
    /// Circuit state per link index.
    pub circuits: &'a [CircuitState],
}

impl TickView<'_> {
    pub fn circuit(&self, link: usize) -> CircuitState {
        self.circuits.get(link).copied().unwrap_or_default()
    }
}

/// One proposed intent. `seq` orders an agent's proposals within a tick.
#[derive(Clone, Debug, PartialEq)]
pub struct Proposal {
    pub seq: usize,
    pub intent: Intent,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Evaluation {
    pub proposals: Vec<Proposal>,
    pub votes: Vec<VoteRecord>,
}

impl Evaluation {
    pub fn propose(&mut self, intent: Intent) {
        let seq = self.proposals.len();
        self.proposals.push(Proposal { seq, intent });
    }
}

pub trait Agent: Send {
    fn kind(&self) -> AgentKind;

    fn observe(&mut self, _view: &TickView<'_>) {}

    fn evaluate(&self, view: &TickView<'_>) -> Evaluation;

    /// Apply the actuator's verdict on one of this agent's intents.
    fn commit(&mut self, intent: &Intent, outcome: &Outcome, tick: Tick);

    /// Drop or re-key state for a new topology version.
    fn on_topology_change(&mut self, _topology: &Topology) {}
}
