//! Tick pipeline.
//!
//! ```text
//! telemetry ─▶ Normalizer ─▶ FieldEngine ─▶ Detector ─▶ agents (scoped threads)
//!                                                         │ bounded channel
//!                                                         ▼
//!              audit ◀── complete(outcome) ◀── caller ◀── Governor ─▶ Gateway (sign)
//! ```
//!
//! The controller never executes intents itself. [`Controller::tick`] returns
//! the signed intents admitted this tick; the caller dispatches them and
//! reports back through [`Controller::complete`]. Agents only commit state for
//! confirmed outcomes.

use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc;

use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agents::{Agent, Builder, Evaluation, Proposal, Scavenger, TickView, Weaver};
use crate::audit::{AuditEvent, AuditSink, AuditTrail, IntentResult, NodeSnapshot, VoteRecord};
use crate::circuit::BreakerPolicy;
use crate::config::{ConfigError, ControlConfig};
use crate::detector::{DetectionState, Detector, Transition};
use crate::field::{FieldEngine, FieldSnapshot};
use crate::gateway::{Actuator, DispatchReport, Gateway, SignedIntent, dispatch_blocking};
use crate::governor::{Governor, Rejection};
use crate::intent::{AgentKind, Intent, Outcome};
use crate::normalizer::{Normalizer, TelemetryRecord};
use crate::signal::SignalFrame;
use crate::time::{Tick, TickClock};
use crate::topology::{NodeId, Topology, TopologyChange, TopologyError};

#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
}

/// What happened during one tick.
#[derive(Clone, Debug, Default)]
pub struct TickReport {
    pub tick: Tick,
    pub transitions: Vec<Transition>,
    /// Admitted and signed, awaiting dispatch.
    pub admitted: Vec<SignedIntent>,
    pub rejected: Vec<(Intent, Rejection)>,
    pub votes: Vec<VoteRecord>,
    pub stale: Vec<NodeId>,
    /// Filled by [`Controller::run_tick`] only.
    pub dispatched: Vec<DispatchReport>,
}

enum AgentMessage {
    Proposal(Proposal),
    Vote(VoteRecord),
}

pub struct Controller {
    cfg: ControlConfig,
    tick: Tick,
    topology: Arc<Topology>,
    normalizer: Normalizer,
    fields: FieldEngine,
    detector: Detector,
    weaver: Weaver,
    builder: Builder,
    scavenger: Scavenger,
    governor: Governor,
    gateway: Gateway,
    audit: AuditTrail,
    in_flight: HashMap<Uuid, Intent>,
}

impl Controller {
    pub fn new(
        cfg: ControlConfig,
        topology: Arc<Topology>,
        sink: Box<dyn AuditSink>,
    ) -> Result<Self, ControlError> {
        cfg.validate()?;
        let clock = TickClock::new(cfg.tick_seconds);
        let n = topology.len();
        let lease_ticks = clock.ticks_for(cfg.builder.lease_seconds);

        let fields = FieldEngine::new(cfg.field.clone(), cfg.tick_seconds, Arc::clone(&topology))?;
        info!(
            nodes = n,
            links = topology.link_count(),
            deg_max = fields.operator().deg_max(),
            "controller ready"
        );

        Ok(Self {
            tick: 0,
            normalizer: Normalizer::new(cfg.normalizer.clone()),
            detector: Detector::new(cfg.detector.clone(), n),
            weaver: Weaver::new(cfg.weaver.clone(), cfg.detector.latency.hysteresis),
            builder: Builder::new(cfg.builder.clone(), lease_ticks),
            scavenger: Scavenger::new(
                BreakerPolicy::from_config(&cfg.scavenger, &clock),
                &cfg.detector,
            ),
            governor: Governor::new(
                &cfg.governor,
                &clock,
                cfg.builder.max_concurrent_fraction,
                lease_ticks,
                n,
            ),
            gateway: Gateway::from_config(&cfg.gateway),
            audit: AuditTrail::new(sink, clock, cfg.audit.post_snapshot_delay),
            in_flight: HashMap::new(),
            fields,
            topology,
            cfg,
        })
    }

    pub fn config(&self) -> &ControlConfig {
        &self.cfg
    }

    /// Last completed tick (0 before the first).
    pub fn current_tick(&self) -> Tick {
        self.tick
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn fields(&self) -> Arc<FieldSnapshot> {
        self.fields.snapshot()
    }

    pub fn detection(&self) -> &DetectionState {
        self.detector.state()
    }

    pub fn weaver(&self) -> &Weaver {
        &self.weaver
    }

    pub fn builder(&self) -> &Builder {
        &self.builder
    }

    pub fn scavenger(&self) -> &Scavenger {
        &self.scavenger
    }

    pub fn governor(&self) -> &Governor {
        &self.governor
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn run_id(&self) -> Uuid {
        self.audit.run_id()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn pending_audit(&self) -> usize {
        self.audit.pending_len()
    }

    /// Normalize a telemetry batch and run one tick.
    pub fn tick(&mut self, batch: &[TelemetryRecord]) -> TickReport {
        let frame = self.normalizer.normalize(&self.topology, batch);
        self.tick_signals(frame)
    }

    /// Run one tick on already normalized signals.
    pub fn tick_signals(&mut self, frame: SignalFrame) -> TickReport {
        self.tick += 1;
        let tick = self.tick;
        let topology = Arc::clone(&self.topology);
        if frame.len() != topology.len() {
            warn!(
                tick,
                frame = frame.len(),
                nodes = topology.len(),
                "signal frame does not match topology, missing nodes get no injection"
            );
        }
        let stale = frame.stale_ids(&topology);
        let snapshot = self.fields.step(tick, &frame);

        let transitions = self.detector.update(tick, &topology, &snapshot);
        for t in &transitions {
            debug!(tick, node = %t.node, signal = %t.signal, from = ?t.from, to = ?t.to, "band change");
            let pre = NodeSnapshot::collect(&topology, &snapshot, std::slice::from_ref(&t.node));
            self.audit_event(
                tick,
                None,
                AuditEvent::Detection {
                    transition: t.clone(),
                },
                pre,
                &stale,
            );
        }

        let (proposals, votes) = self.evaluate_agents(tick, &topology, &snapshot);
        for vote in &votes {
            let pre = NodeSnapshot::collect(&topology, &snapshot, std::slice::from_ref(&vote.node));
            self.audit_event(
                tick,
                Some(AgentKind::Builder),
                AuditEvent::Vote { vote: vote.clone() },
                pre,
                &stale,
            );
        }

        let mut report = TickReport {
            tick,
            transitions,
            votes,
            stale: stale.clone(),
            ..TickReport::default()
        };

        let mut busy: HashSet<String> = self
            .in_flight
            .values()
            .map(|i| i.action.target().to_string())
            .collect();
        for intent in proposals {
            let pre = NodeSnapshot::collect(&topology, &snapshot, &intent.target_nodes);
            let target = intent.action.target().to_string();
            let admission = if busy.contains(&target) {
                Err(Rejection::InFlight {
                    target: target.clone(),
                })
            } else {
                self.governor.admit(&intent, tick)
            };
            if let Err(rejection) = admission {
                debug!(tick, agent = %intent.agent, %target, %rejection, "intent rejected");
                self.audit_event(
                    tick,
                    Some(intent.agent),
                    AuditEvent::Intent {
                        intent: intent.clone(),
                        signature: None,
                        result: IntentResult::Rejected {
                            rejection: rejection.clone(),
                        },
                    },
                    pre,
                    &stale,
                );
                report.rejected.push((intent, rejection));
                continue;
            }

            match self.gateway.sign(intent.clone()) {
                Ok(signed) => {
                    info!(
                        tick,
                        agent = %intent.agent,
                        action = intent.action.action_type(),
                        %target,
                        reason = %intent.trigger_reason,
                        "intent admitted"
                    );
                    busy.insert(target);
                    self.audit
                        .hold_intent(intent.clone(), signed.signature.clone(), pre, stale.clone());
                    self.in_flight.insert(intent.id, intent);
                    report.admitted.push(signed);
                }
                Err(e) => {
                    error!(tick, agent = %intent.agent, error = %e, "intent could not be signed");
                    let outcome = Outcome::Failure {
                        reason: e.to_string(),
                    };
                    self.governor.record_outcome(&intent, &outcome, tick);
                    self.audit_event(
                        tick,
                        Some(intent.agent),
                        AuditEvent::Intent {
                            intent,
                            signature: None,
                            result: IntentResult::Failed {
                                reason: e.to_string(),
                            },
                        },
                        pre,
                        &stale,
                    );
                }
            }
        }

        self.flush_due(tick, &topology, &snapshot);
        report
    }

    /// Observe and evaluate every agent on its own scoped thread. Proposals
    /// come back through a bounded channel and are ordered by agent, then by
    /// proposal order within the agent. A panicking agent is skipped.
    fn evaluate_agents(
        &mut self,
        tick: Tick,
        topology: &Topology,
        snapshot: &FieldSnapshot,
    ) -> (Vec<Intent>, Vec<VoteRecord>) {
        let circuits = self.scavenger.circuit_states(topology);
        let detection = self.detector.state();
        let view = TickView {
            tick,
            topology,
            fields: snapshot,
            detection,
            circuits: &circuits,
        };
        let agents: [&mut dyn Agent; 3] = [&mut self.weaver, &mut self.builder, &mut self.scavenger];
        let (tx, rx) = mpsc::sync_channel::<(AgentKind, AgentMessage)>(self.cfg.intent_queue_capacity);

        let mut proposals: Vec<(AgentKind, Proposal)> = Vec::new();
        let mut votes = Vec::new();
        std::thread::scope(|scope| {
            for agent in agents {
                let tx = tx.clone();
                scope.spawn(move || {
                    let kind = agent.kind();
                    let result = catch_unwind(AssertUnwindSafe(|| {
                        agent.observe(&view);
                        agent.evaluate(&view)
                    }));
                    let eval: Evaluation = match result {
                        Ok(eval) => eval,
                        Err(_) => {
                            error!(tick, agent = %kind, "agent panicked, skipped this tick");
                            return;
                        }
                    };
                    for vote in eval.votes {
                        if tx.send((kind, AgentMessage::Vote(vote))).is_err() {
                            return;
                        }
                    }
                    for p in eval.proposals {
                        if tx.send((kind, AgentMessage::Proposal(p))).is_err() {
                            return;
                        }
                    }
                });
            }
            drop(tx);
            for (kind, msg) in rx {
                match msg {
                    AgentMessage::Proposal(p) => proposals.push((kind, p)),
                    AgentMessage::Vote(v) => votes.push(v),
                }
            }
        });

        proposals.sort_by_key(|(kind, p)| (*kind, p.seq));
        let intents = proposals.into_iter().map(|(_, p)| p.intent).collect();
        (intents, votes)
    }

    /// Report the actuator's verdict for an admitted intent. Returns `false`
    /// when the id is not in flight.
    pub fn complete(&mut self, intent_id: Uuid, outcome: Outcome) -> bool {
        let Some(intent) = self.in_flight.remove(&intent_id) else {
            warn!(intent = %intent_id, "outcome for unknown intent");
            return false;
        };
        let tick = self.tick;
        match intent.agent {
            AgentKind::Weaver => self.weaver.commit(&intent, &outcome, tick),
            AgentKind::Builder => self.builder.commit(&intent, &outcome, tick),
            AgentKind::Scavenger => self.scavenger.commit(&intent, &outcome, tick),
        }
        self.governor.record_outcome(&intent, &outcome, tick);

        let result = match &outcome {
            Outcome::Success => IntentResult::Succeeded,
            Outcome::Failure { reason } => IntentResult::Failed {
                reason: reason.clone(),
            },
        };
        self.audit.resolve(intent_id, result);

        if let Outcome::Failure { reason } = outcome {
            let message = format!(
                "{} {} on {} failed: {reason}",
                intent.agent,
                intent.action.action_type(),
                intent.action.target()
            );
            self.audit_event(
                tick,
                Some(intent.agent),
                AuditEvent::Alert {
                    severity: "critical".to_string(),
                    message,
                    intent_id: Some(intent_id),
                },
                Vec::new(),
                &[],
            );
        }
        true
    }

    /// Tick, then dispatch every admitted intent synchronously and commit
    /// the outcomes before returning.
    pub fn run_tick(&mut self, batch: &[TelemetryRecord], actuator: &dyn Actuator) -> TickReport {
        let frame = self.normalizer.normalize(&self.topology, batch);
        self.run_signals(frame, actuator)
    }

    pub fn run_signals(&mut self, frame: SignalFrame, actuator: &dyn Actuator) -> TickReport {
        let mut report = self.tick_signals(frame);
        for signed in &report.admitted {
            let dispatch = dispatch_blocking(&self.gateway, actuator, signed);
            self.complete(dispatch.intent_id, dispatch.outcome.clone());
            report.dispatched.push(dispatch);
        }
        report
    }

    /// Apply a topology change between ticks. On error nothing changes.
    pub fn apply_topology(&mut self, change: &TopologyChange) -> Result<(), ControlError> {
        let old = Arc::clone(&self.topology);
        let next = Arc::new(old.apply(change)?);
        self.fields.set_topology(Arc::clone(&next))?;
        self.normalizer.set_topology(&next);
        self.detector.set_topology(&old, &next);
        self.weaver.on_topology_change(&next);
        self.builder.on_topology_change(&next);
        self.scavenger.on_topology_change(&next);
        self.governor.set_node_count(next.len());
        info!(
            version = next.version(),
            nodes = next.len(),
            deg_max = self.fields.operator().deg_max(),
            ?change,
            "topology changed"
        );
        self.topology = next;
        Ok(())
    }

    /// Write every held audit record, resolved or not. Call on shutdown.
    pub fn finish(&mut self) -> usize {
        let topology = Arc::clone(&self.topology);
        let snapshot = self.fields.snapshot();
        match self
            .audit
            .flush_all(|nodes| NodeSnapshot::collect(&topology, &snapshot, nodes))
        {
            Ok(n) => n,
            Err(e) => {
                error!(error = %e, "final audit flush failed");
                0
            }
        }
    }

    fn flush_due(&mut self, tick: Tick, topology: &Topology, snapshot: &FieldSnapshot) {
        if let Err(e) = self
            .audit
            .flush(tick, |nodes| NodeSnapshot::collect(topology, snapshot, nodes))
        {
            warn!(tick, error = %e, "audit flush failed, will retry");
        }
    }

    fn audit_event(
        &mut self,
        tick: Tick,
        agent: Option<AgentKind>,
        event: AuditEvent,
        pre: Vec<NodeSnapshot>,
        stale: &[NodeId],
    ) {
        let kind = event.kind();
        if let Err(e) = self.audit.record(tick, agent, event, pre, stale.to_vec()) {
            warn!(tick, kind, error = %e, "audit write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::gateway::ActuationError;
    use crate::intent::Action;
    use crate::signal::Signal;
    use crate::topology::{LinkSpec, TopologySpec};

    struct Accept;

    impl Actuator for Accept {
        fn execute(&self, _signed: &SignedIntent) -> Result<(), ActuationError> {
            Ok(())
        }
    }

    struct Refuse;

    impl Actuator for Refuse {
        fn execute(&self, _signed: &SignedIntent) -> Result<(), ActuationError> {
            Err(ActuationError::Unavailable("down".into()))
        }
    }

    fn pair() -> Arc<Topology> {
        Arc::new(
            Topology::from_spec(&TopologySpec {
                nodes: vec!["g".into(), "b".into()],
                links: vec![LinkSpec {
                    id: "X".into(),
                    from: "g".into(),
                    to: "b".into(),
                    capacity: 1.0,
                }],
            })
            .unwrap(),
        )
    }

    fn fast_retry() -> ControlConfig {
        let mut cfg = ControlConfig::default();
        cfg.gateway.initial_backoff_ms = 1;
        cfg.gateway.max_backoff_ms = 1;
        cfg
    }

    fn crisis_frame() -> SignalFrame {
        let mut frame = SignalFrame::new(2);
        // Both ends short on spare so diffusion cannot lift b out of the crisis.
        frame.values[0] = [0.0, 0.1, 0.08];
        frame.values[1] = [0.06, 0.1, 0.08];
        frame
    }

    #[test]
    fn calm_ticks_do_nothing() {
        let sink = MemoryAuditSink::new();
        let mut c = Controller::new(ControlConfig::default(), pair(), Box::new(sink.clone())).unwrap();
        for _ in 0..10 {
            let r = c.tick_signals(SignalFrame::uniform(2, [0.0, 0.1, 0.5]));
            assert!(r.admitted.is_empty());
            assert!(r.transitions.is_empty());
        }
        assert_eq!(c.current_tick(), 10);
        assert!(sink.is_empty());
    }

    #[test]
    fn admitted_intents_are_signed_and_verifiable() {
        let mut c = Controller::new(ControlConfig::default(), pair(), Box::new(MemoryAuditSink::new())).unwrap();
        let mut admitted = Vec::new();
        for _ in 0..3 {
            admitted.extend(c.tick_signals(crisis_frame()).admitted);
        }
        assert_eq!(admitted.len(), 1);
        assert!(c.gateway().verify(&admitted[0]).is_ok());
        assert_eq!(c.in_flight(), 1);
    }

    #[test]
    fn in_flight_target_blocks_repeat_proposals() {
        let mut c = Controller::new(ControlConfig::default(), pair(), Box::new(MemoryAuditSink::new())).unwrap();
        c.tick_signals(crisis_frame());
        let r = c.tick_signals(crisis_frame());
        assert_eq!(r.admitted.len(), 1);
        // Outcome not reported yet: the breaker is still Closed and proposes again.
        let r = c.tick_signals(crisis_frame());
        assert!(r.admitted.is_empty());
        assert!(matches!(r.rejected[0].1, Rejection::InFlight { .. }));
    }

    #[test]
    fn failed_actuation_raises_alert_and_keeps_state() {
        let sink = MemoryAuditSink::new();
        let mut c = Controller::new(fast_retry(), pair(), Box::new(sink.clone())).unwrap();
        c.run_signals(crisis_frame(), &Refuse);
        let r = c.run_signals(crisis_frame(), &Refuse);
        assert_eq!(r.dispatched.len(), 1);
        assert_eq!(r.dispatched[0].attempts, 3);
        assert_eq!(c.scavenger().state("X"), crate::CircuitState::Closed);
        assert!(
            sink.records()
                .iter()
                .any(|rec| matches!(&rec.event, AuditEvent::Alert { severity, .. } if severity == "critical"))
        );
    }

    #[test]
    fn intent_audit_record_waits_for_post_snapshot() {
        let sink = MemoryAuditSink::new();
        let mut c = Controller::new(ControlConfig::default(), pair(), Box::new(sink.clone())).unwrap();
        c.run_signals(crisis_frame(), &Accept);
        c.run_signals(crisis_frame(), &Accept);
        let intents = |s: &MemoryAuditSink| {
            s.records()
                .into_iter()
                .filter(|r| matches!(r.event, AuditEvent::Intent { .. }))
                .count()
        };
        assert_eq!(intents(&sink), 0);
        assert_eq!(c.pending_audit(), 1);
        for _ in 0..5 {
            c.run_signals(SignalFrame::uniform(2, [0.0, 0.1, 0.5]), &Accept);
        }
        assert_eq!(c.pending_audit(), 0);
        let record = sink
            .records()
            .into_iter()
            .find(|r| matches!(r.event, AuditEvent::Intent { .. }))
            .unwrap();
        assert_eq!(record.tick, 2);
        assert!(record.post_snapshot.is_some());
        match record.event {
            AuditEvent::Intent { intent, result, .. } => {
                assert_eq!(result, IntentResult::Succeeded);
                assert!(matches!(intent.action, Action::SetCircuitState { .. }));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn topology_change_reindexes_state() {
        let mut c = Controller::new(ControlConfig::default(), pair(), Box::new(MemoryAuditSink::new())).unwrap();
        c.tick_signals(SignalFrame::uniform(2, [0.0, 0.1, 0.5]));
        c.apply_topology(&TopologyChange::AddNode { id: "z".into() }).unwrap();
        assert_eq!(c.topology().len(), 3);
        assert_eq!(c.fields().len(), 3);
        assert_eq!(c.detection().len(), 3);
        let r = c.tick_signals(SignalFrame::uniform(3, [0.0, 0.1, 0.5]));
        assert!(r.admitted.is_empty());

        assert!(
            c.apply_topology(&TopologyChange::RemoveLink { id: "nope".into() })
                .is_err()
        );
        assert_eq!(c.topology().len(), 3);
    }

    #[test]
    fn readded_node_does_not_inherit_old_telemetry() {
        let mut c = Controller::new(ControlConfig::default(), pair(), Box::new(MemoryAuditSink::new())).unwrap();
        let sample = |node: &str, errors: f64| TelemetryRecord {
            error_count: Some(errors),
            total_count: Some(100.0),
            latency_ms: Some(20.0),
            capacity_used: Some(5.0),
            capacity_total: Some(10.0),
            ..TelemetryRecord::new(node)
        };
        c.tick(&[sample("g", 0.0), sample("b", 3.0)]);
        c.apply_topology(&TopologyChange::RemoveNode { id: "b".into() }).unwrap();
        c.apply_topology(&TopologyChange::AddNode { id: "b".into() }).unwrap();

        let r = c.tick(&[sample("g", 0.0)]);
        assert_eq!(r.stale, vec![NodeId::from("b")]);
        let b = c.topology().index_of("b").unwrap();
        assert_eq!(c.fields().get(b, Signal::Error), 0.0);
    }

    #[test]
    fn invalid_config_is_refused() {
        let mut cfg = ControlConfig::default();
        cfg.intent_queue_capacity = 0;
        assert!(matches!(
            Controller::new(cfg, pair(), Box::new(MemoryAuditSink::new())),
            Err(ControlError::Config(_))
        ));
    }
}
