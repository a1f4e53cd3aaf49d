//! Append-only audit trail.
//!
//! Detections, votes, rejections and alerts are appended as they happen.
//! Intent records are held back until `post_snapshot_delay` ticks after the
//! decision and until the actuation result is known; only then is the post
//! snapshot attached and the record written, exactly once.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::detector::Transition;
use crate::field::FieldSnapshot;
use crate::governor::Rejection;
use crate::intent::{AgentKind, Intent};
use crate::time::{Tick, TickClock};
use crate::topology::{NodeId, Topology};

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit sink failed: {0}")]
    Sink(String),
    #[error("audit serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Field values of one node at one tick.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub node: NodeId,
    pub error: f64,
    pub latency: f64,
    pub spare: f64,
}

impl NodeSnapshot {
    /// Snapshot `nodes` out of `fields`. Unknown ids are skipped.
    pub fn collect(topology: &Topology, fields: &FieldSnapshot, nodes: &[NodeId]) -> Vec<Self> {
        nodes
            .iter()
            .filter_map(|id| {
                let idx = topology.index_of(id.as_str())?;
                let [error, latency, spare] = fields.node(idx)?;
                Some(Self {
                    node: id.clone(),
                    error,
                    latency,
                    spare,
                })
            })
            .collect()
    }
}

/// Quorum vote cast by the Builder for one node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub node: NodeId,
    pub approved: bool,
    pub degree: usize,
    pub hot_neighbors: usize,
    pub fraction: f64,
    /// Weighted signal vote, only computed in the tie-break band.
    pub weighted_vote: Option<f64>,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IntentResult {
    Pending,
    Rejected { rejection: Rejection },
    Succeeded,
    Failed { reason: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEvent {
    Detection {
        transition: Transition,
    },
    Vote {
        vote: VoteRecord,
    },
    Intent {
        intent: Intent,
        signature: Option<String>,
        result: IntentResult,
    },
    Alert {
        severity: String,
        message: String,
        intent_id: Option<Uuid>,
    },
}

impl AuditEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AuditEvent::Detection { .. } => "detection",
            AuditEvent::Vote { .. } => "vote",
            AuditEvent::Intent { .. } => "intent",
            AuditEvent::Alert { .. } => "alert",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: u64,
    pub run_id: Uuid,
    pub tick: Tick,
    pub timestamp: String,
    pub agent: Option<AgentKind>,
    pub event: AuditEvent,
    #[serde(default)]
    pub pre_snapshot: Vec<NodeSnapshot>,
    #[serde(default)]
    pub post_snapshot: Option<Vec<NodeSnapshot>>,
    #[serde(default)]
    pub stale_nodes: Vec<NodeId>,
}

/// Destination for finished audit records. Implementations must only ever
/// append.
pub trait AuditSink: Send {
    fn append(&mut self, record: &AuditRecord) -> Result<(), AuditError>;
}

/// In-memory sink. Clones share the same buffer, so a caller can keep a
/// handle after passing one to the controller.
#[derive(Clone, Default)]
pub struct MemoryAuditSink {
    records: Arc<Mutex<Vec<AuditRecord>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl AuditSink for MemoryAuditSink {
    fn append(&mut self, record: &AuditRecord) -> Result<(), AuditError> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

struct PendingIntent {
    record: AuditRecord,
    due: Tick,
}

/// Sequencing and delayed-write bookkeeping in front of an [`AuditSink`].
pub struct AuditTrail {
    sink: Box<dyn AuditSink>,
    run_id: Uuid,
    clock: TickClock,
    next_seq: u64,
    delay: Tick,
    pending: Vec<PendingIntent>,
}

impl AuditTrail {
    pub fn new(sink: Box<dyn AuditSink>, clock: TickClock, delay: Tick) -> Self {
        Self {
            sink,
            run_id: Uuid::new_v4(),
            clock,
            next_seq: 1,
            delay,
            pending: Vec::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn build(
        &self,
        tick: Tick,
        agent: Option<AgentKind>,
        event: AuditEvent,
        pre_snapshot: Vec<NodeSnapshot>,
        stale_nodes: Vec<NodeId>,
    ) -> AuditRecord {
        AuditRecord {
            seq: 0,
            run_id: self.run_id,
            tick,
            timestamp: self.clock.timestamp(tick),
            agent,
            event,
            pre_snapshot,
            post_snapshot: None,
            stale_nodes,
        }
    }

    fn write(&mut self, mut record: AuditRecord) -> Result<(), AuditError> {
        record.seq = self.next_seq;
        self.sink.append(&record)?;
        self.next_seq += 1;
        Ok(())
    }

    /// Append an event immediately.
    pub fn record(
        &mut self,
        tick: Tick,
        agent: Option<AgentKind>,
        event: AuditEvent,
        pre_snapshot: Vec<NodeSnapshot>,
        stale_nodes: Vec<NodeId>,
    ) -> Result<(), AuditError> {
        let record = self.build(tick, agent, event, pre_snapshot, stale_nodes);
        self.write(record)
    }

    /// Hold an admitted intent until its result and post snapshot are known.
    pub fn hold_intent(
        &mut self,
        intent: Intent,
        signature: String,
        pre_snapshot: Vec<NodeSnapshot>,
        stale_nodes: Vec<NodeId>,
    ) {
        let tick = intent.tick;
        let agent = Some(intent.agent);
        let event = AuditEvent::Intent {
            intent,
            signature: Some(signature),
            result: IntentResult::Pending,
        };
        let record = self.build(tick, agent, event, pre_snapshot, stale_nodes);
        self.pending.push(PendingIntent {
            record,
            due: tick + self.delay,
        });
    }

    /// Attach the actuation result to a held intent. Returns `false` for an
    /// unknown or already resolved id.
    pub fn resolve(&mut self, intent_id: Uuid, outcome: IntentResult) -> bool {
        for p in &mut self.pending {
            if let AuditEvent::Intent { intent, result, .. } = &mut p.record.event {
                if intent.id == intent_id && *result == IntentResult::Pending {
                    *result = outcome;
                    return true;
                }
            }
        }
        false
    }

    /// Write every held intent that is due at `now` and resolved. `post`
    /// produces the post snapshot from the intent's target nodes.
    pub fn flush(
        &mut self,
        now: Tick,
        mut post: impl FnMut(&[NodeId]) -> Vec<NodeSnapshot>,
    ) -> Result<usize, AuditError> {
        self.drain(|p| p.due <= now && !is_pending(&p.record), &mut post)
    }

    /// Write everything still held, resolved or not.
    pub fn flush_all(
        &mut self,
        mut post: impl FnMut(&[NodeId]) -> Vec<NodeSnapshot>,
    ) -> Result<usize, AuditError> {
        self.drain(|_| true, &mut post)
    }

    fn drain(
        &mut self,
        ready: impl Fn(&PendingIntent) -> bool,
        post: &mut dyn FnMut(&[NodeId]) -> Vec<NodeSnapshot>,
    ) -> Result<usize, AuditError> {
        let (due, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|p| ready(p));
        self.pending = keep;

        let mut written = 0;
        let mut due = due.into_iter();
        while let Some(mut p) = due.next() {
            if let AuditEvent::Intent { intent, .. } = &p.record.event {
                p.record.post_snapshot = Some(post(&intent.target_nodes));
            }
            if let Err(e) = self.write(p.record.clone()) {
                // Put the failed record and the rest back for a later flush.
                self.pending.push(p);
                self.pending.extend(due);
                return Err(e);
            }
            written += 1;
        }
        Ok(written)
    }
}

fn is_pending(record: &AuditRecord) -> bool {
    matches!(
        record.event,
        AuditEvent::Intent {
            result: IntentResult::Pending,
            ..
        }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::Action;

    fn trail(sink: &MemoryAuditSink) -> AuditTrail {
        AuditTrail::new(Box::new(sink.clone()), TickClock::new(1.0), 5)
    }

    fn intent(tick: Tick) -> Intent {
        Intent::new(
            tick,
            AgentKind::Builder,
            Action::RequestCapacityToken {
                node_id: "n".into(),
                lease_seconds: 60.0,
            },
            vec!["n".into()],
            "error hot",
        )
    }

    fn post(nodes: &[NodeId]) -> Vec<NodeSnapshot> {
        nodes
            .iter()
            .map(|n| NodeSnapshot {
                node: n.clone(),
                error: 0.0,
                latency: 0.0,
                spare: 1.0,
            })
            .collect()
    }

    #[test]
    fn immediate_events_get_sequence_numbers() {
        let sink = MemoryAuditSink::new();
        let mut t = trail(&sink);
        for tick in 1..=3 {
            t.record(
                tick,
                None,
                AuditEvent::Alert {
                    severity: "info".into(),
                    message: "x".into(),
                    intent_id: None,
                },
                vec![],
                vec![],
            )
            .unwrap();
        }
        let seqs: Vec<u64> = sink.records().iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn intent_waits_for_delay_and_result() {
        let sink = MemoryAuditSink::new();
        let mut t = trail(&sink);
        let i = intent(10);
        let id = i.id;
        t.hold_intent(i, "sig".into(), vec![], vec![]);

        // Resolved but not due.
        assert!(t.resolve(id, IntentResult::Succeeded));
        assert_eq!(t.flush(14, post).unwrap(), 0);
        assert_eq!(t.flush(15, post).unwrap(), 1);
        // Exactly once.
        assert_eq!(t.flush(16, post).unwrap(), 0);
        assert!(!t.resolve(id, IntentResult::Succeeded));

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].tick, 10);
        assert_eq!(records[0].post_snapshot.as_ref().unwrap()[0].spare, 1.0);
    }

    #[test]
    fn unresolved_intent_stays_held() {
        let sink = MemoryAuditSink::new();
        let mut t = trail(&sink);
        t.hold_intent(intent(1), "sig".into(), vec![], vec![]);
        assert_eq!(t.flush(100, post).unwrap(), 0);
        assert_eq!(t.pending_len(), 1);
        assert_eq!(t.flush_all(post).unwrap(), 1);
        assert!(sink.records()[0].post_snapshot.is_some());
    }

    #[test]
    fn event_kind_tag() {
        let e = AuditEvent::Alert {
            severity: "critical".into(),
            message: "m".into(),
            intent_id: None,
        };
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["kind"], "alert");
        assert_eq!(e.kind(), "alert");
    }

    struct Broken;

    impl AuditSink for Broken {
        fn append(&mut self, _record: &AuditRecord) -> Result<(), AuditError> {
            Err(AuditError::Sink("disk full".into()))
        }
    }

    #[test]
    fn failed_write_keeps_record_pending() {
        let mut t = AuditTrail::new(Box::new(Broken), TickClock::new(1.0), 0);
        let i = intent(1);
        let id = i.id;
        t.hold_intent(i, "sig".into(), vec![], vec![]);
        t.resolve(id, IntentResult::Failed { reason: "x".into() });
        assert!(t.flush(1, post).is_err());
        assert_eq!(t.pending_len(), 1);
    }
}
