//! Morphogenetic self-healing control loop.
//!
//! Operational telemetry is normalized into three bounded stress signals
//! (error, latency, spare capacity), injected into scalar fields over the
//! topology graph, diffused with the symmetric-normalized Laplacian, coupled
//! across signals and decayed. A hysteretic detector classifies field values
//! into bands, and three agents (Weaver, Builder, Scavenger) propose signed
//! remediation intents that pass a shared stability governor before they
//! reach the actuator.
//!
//! Zero I/O: the crate never talks to infrastructure itself. Dispatch goes
//! through the [`Actuator`] trait and audit records through [`AuditSink`].

pub mod agents;
pub mod audit;
pub mod circuit;
pub mod config;
pub mod constants;
pub mod controller;
pub mod detector;
pub mod field;
pub mod gateway;
pub mod governor;
pub mod intent;
pub mod normalizer;
pub mod quantile;
pub mod signal;
pub mod time;
pub mod topology;

pub use agents::{Agent, Builder, Evaluation, Proposal, Scavenger, TickView, Weaver};
pub use audit::{
    AuditError, AuditEvent, AuditRecord, AuditSink, AuditTrail, IntentResult, MemoryAuditSink,
    NodeSnapshot, VoteRecord,
};
pub use circuit::{Breaker, BreakerPolicy, CircuitState, LinkHealth, Move};
pub use config::{ConfigError, ControlConfig};
pub use controller::{ControlError, Controller, TickReport};
pub use detector::{Band, DetectionState, Detector, Transition};
pub use field::{DiffusionOperator, FieldEngine, FieldSnapshot};
pub use gateway::{
    ActuationError, Actuator, DispatchReport, Gateway, GatewayError, RetryPolicy, SignedIntent,
    Signer, dispatch_blocking,
};
pub use governor::{Governor, Rejection, TokenBucket};
pub use intent::{Action, AgentKind, Intent, Outcome};
pub use normalizer::{Normalizer, TelemetryRecord};
pub use quantile::{EstimatorKind, QuantileEstimator};
pub use signal::{Signal, SignalFrame};
pub use time::{Tick, TickClock, now_iso8601, unix_to_iso8601};
pub use topology::{Link, LinkId, Node, NodeId, Topology, TopologyChange, TopologyError};
