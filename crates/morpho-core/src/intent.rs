use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::circuit::CircuitState;
use crate::time::Tick;
use crate::topology::{LinkId, NodeId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Weaver,
    Builder,
    Scavenger,
}

impl AgentKind {
    pub const ALL: [AgentKind; 3] = [AgentKind::Weaver, AgentKind::Builder, AgentKind::Scavenger];

    pub fn name(self) -> &'static str {
        match self {
            AgentKind::Weaver => "weaver",
            AgentKind::Builder => "builder",
            AgentKind::Scavenger => "scavenger",
        }
    }

    /// The only action type this agent's key may authorize.
    pub fn permitted_action(self) -> &'static str {
        match self {
            AgentKind::Weaver => "shift_weight",
            AgentKind::Builder => "request_capacity_token",
            AgentKind::Scavenger => "set_circuit_state",
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Remediation requested from the actuator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action_type", rename_all = "snake_case")]
pub enum Action {
    /// Move `delta` of flow weight from `link_id` onto `to_link`.
    /// `increment_schedule` lists the steps still planned after this one.
    ShiftWeight {
        link_id: LinkId,
        to_link: LinkId,
        delta: f64,
        increment_schedule: Vec<f64>,
    },
    RequestCapacityToken {
        node_id: NodeId,
        lease_seconds: f64,
    },
    SetCircuitState {
        link_id: LinkId,
        state: CircuitState,
        reason: String,
        traffic_fraction: f64,
    },
}

impl Action {
    pub fn action_type(&self) -> &'static str {
        match self {
            Action::ShiftWeight { .. } => "shift_weight",
            Action::RequestCapacityToken { .. } => "request_capacity_token",
            Action::SetCircuitState { .. } => "set_circuit_state",
        }
    }

    /// Entity the action mutates; at most one action per target is in flight.
    pub fn target(&self) -> &str {
        match self {
            Action::ShiftWeight { link_id, .. } => link_id.as_str(),
            Action::RequestCapacityToken { node_id, .. } => node_id.as_str(),
            Action::SetCircuitState { link_id, .. } => link_id.as_str(),
        }
    }
}

/// A signed-off decision of one agent at one tick. Immutable once built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub id: Uuid,
    pub tick: Tick,
    pub agent: AgentKind,
    #[serde(flatten)]
    pub action: Action,
    pub target_nodes: Vec<NodeId>,
    pub trigger_reason: String,
}

impl Intent {
    pub fn new(
        tick: Tick,
        agent: AgentKind,
        action: Action,
        target_nodes: Vec<NodeId>,
        trigger_reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tick,
            agent,
            action,
            target_nodes,
            trigger_reason: trigger_reason.into(),
        }
    }
}

/// What the actuator reported for an intent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure { reason: String },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_serializes_with_type_tag() {
        let intent = Intent::new(
            7,
            AgentKind::Scavenger,
            Action::SetCircuitState {
                link_id: "x".into(),
                state: CircuitState::Open,
                reason: "crisis".into(),
                traffic_fraction: 0.0,
            },
            vec!["b".into()],
            "error very hot, spare low",
        );
        let v = serde_json::to_value(&intent).unwrap();
        assert_eq!(v["action_type"], "set_circuit_state");
        assert_eq!(v["state"], "Open");
        assert_eq!(v["agent"], "scavenger");
        assert_eq!(v["tick"], 7);

        let back: Intent = serde_json::from_value(v).unwrap();
        assert_eq!(back, intent);
    }

    #[test]
    fn targets_and_permissions() {
        let a = Action::RequestCapacityToken {
            node_id: "n1".into(),
            lease_seconds: 60.0,
        };
        assert_eq!(a.target(), "n1");
        assert_eq!(a.action_type(), AgentKind::Builder.permitted_action());
        assert_ne!(a.action_type(), AgentKind::Weaver.permitted_action());
    }
}
