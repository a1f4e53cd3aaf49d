//! Async tick driver.
//!
//! The controller's tick itself is synchronous. Around it the scheduler adds
//! the two suspension points: telemetry fetch under a timeout (a timeout
//! runs the tick on last-known-good values) and actuator dispatch on
//! spawned tasks with per-attempt timeouts and backoff. Dispatch outcomes
//! come back over a channel and are committed at the start of the next tick,
//! so a slow actuator never holds up field computation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use morpho_core::{
    ActuationError, Actuator, Controller, DispatchReport, Gateway, Outcome, SignedIntent,
};

use crate::telemetry::{Feed, Step};

const OUTCOME_QUEUE: usize = 1024;

#[derive(Clone, Debug)]
pub struct SchedulerOptions {
    /// Stop after this many ticks. `None` runs until the feed ends or Ctrl-C.
    pub max_ticks: Option<u64>,
    /// Wall-clock pacing. `None` ticks as fast as the loop allows.
    pub tick_interval: Option<Duration>,
    pub fetch_timeout: Duration,
    pub dispatch_timeout: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_ticks: None,
            tick_interval: None,
            fetch_timeout: Duration::from_millis(500),
            dispatch_timeout: Duration::from_millis(500),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunStats {
    pub ticks: u64,
    pub admitted: u64,
    pub rejected: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub stale_ticks: u64,
    pub fetch_timeouts: u64,
    pub topology_changes: u64,
    pub audit_flushed: usize,
}

impl RunStats {
    fn commit(&mut self, controller: &mut Controller, report: DispatchReport) {
        if report.outcome.is_success() {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        controller.complete(report.intent_id, report.outcome);
    }
}

/// Verify, then execute with retries. Each attempt runs the blocking
/// actuator call on the blocking pool under `timeout`; a timed-out call is
/// abandoned, not cancelled.
pub async fn dispatch(
    gateway: Arc<Gateway>,
    actuator: Arc<dyn Actuator>,
    signed: SignedIntent,
    timeout: Duration,
) -> DispatchReport {
    let intent_id = signed.intent.id;
    if let Err(e) = gateway.verify(&signed) {
        warn!(intent = %intent_id, error = %e, "intent refused at gateway");
        return DispatchReport {
            intent_id,
            attempts: 0,
            outcome: Outcome::Failure {
                reason: e.to_string(),
            },
        };
    }

    let policy = gateway.retry_policy();
    let signed = Arc::new(signed);
    let mut last_error = String::new();
    for attempt in 1..=policy.max_attempts {
        let call = {
            let actuator = Arc::clone(&actuator);
            let signed = Arc::clone(&signed);
            tokio::task::spawn_blocking(move || actuator.execute(&signed))
        };
        let result = match tokio::time::timeout(timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(ActuationError::Unavailable(format!(
                "actuator task failed: {join}"
            ))),
            Err(_) => Err(ActuationError::Timeout(timeout.as_millis() as u64)),
        };
        match result {
            Ok(()) => {
                debug!(intent = %intent_id, attempt, "intent actuated");
                return DispatchReport {
                    intent_id,
                    attempts: attempt,
                    outcome: Outcome::Success,
                };
            }
            Err(e) => {
                warn!(intent = %intent_id, attempt, error = %e, "actuation attempt failed");
                last_error = e.to_string();
                if attempt < policy.max_attempts {
                    tokio::time::sleep(policy.backoff(attempt)).await;
                }
            }
        }
    }

    error!(
        intent = %intent_id,
        agent = %signed.intent.agent,
        action = signed.intent.action.action_type(),
        attempts = policy.max_attempts,
        "CRITICAL: actuation failed after retries"
    );
    DispatchReport {
        intent_id,
        attempts: policy.max_attempts,
        outcome: Outcome::Failure { reason: last_error },
    }
}

enum Fetched {
    Batch(Vec<morpho_core::TelemetryRecord>),
    TimedOut,
    End,
}

/// Pull the next batch, applying any topology changes on the way.
async fn fetch(
    controller: &mut Controller,
    feed: &mut Feed,
    timeout: Duration,
    stats: &mut RunStats,
) -> Fetched {
    loop {
        match tokio::time::timeout(timeout, feed.next()).await {
            Ok(Step::Batch(batch)) => return Fetched::Batch(batch),
            Ok(Step::Change(change)) => match controller.apply_topology(&change) {
                Ok(()) => stats.topology_changes += 1,
                Err(e) => warn!(error = %e, ?change, "topology change refused"),
            },
            Ok(Step::End) => return Fetched::End,
            Err(_) => return Fetched::TimedOut,
        }
    }
}

pub async fn run(
    mut controller: Controller,
    mut feed: Feed,
    gateway: Arc<Gateway>,
    actuator: Arc<dyn Actuator>,
    opts: SchedulerOptions,
) -> Result<(Controller, RunStats)> {
    let (tx, mut rx) = mpsc::channel::<DispatchReport>(OUTCOME_QUEUE);
    let mut tasks = JoinSet::new();
    let mut stats = RunStats::default();

    let mut ticker = opts
        .tick_interval
        .filter(|p| !p.is_zero())
        .map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(run = %controller.run_id(), nodes = controller.topology().len(), "scheduler started");

    loop {
        if opts.max_ticks.is_some_and(|max| stats.ticks >= max) {
            break;
        }
        match ticker.as_mut() {
            Some(interval) => {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = &mut shutdown => {
                        info!("interrupted, draining");
                        break;
                    }
                }
            }
            None => {
                tokio::select! {
                    biased;
                    _ = &mut shutdown => {
                        info!("interrupted, draining");
                        break;
                    }
                    _ = tokio::task::yield_now() => {}
                }
            }
        }

        while let Ok(report) = rx.try_recv() {
            stats.commit(&mut controller, report);
        }
        while let Some(joined) = tasks.try_join_next() {
            if let Err(e) = joined {
                error!(error = %e, "dispatch task panicked");
            }
        }

        let batch = match fetch(&mut controller, &mut feed, opts.fetch_timeout, &mut stats).await {
            Fetched::Batch(batch) => batch,
            Fetched::TimedOut => {
                warn!(timeout_ms = opts.fetch_timeout.as_millis() as u64, "telemetry fetch timed out, using last known values");
                stats.fetch_timeouts += 1;
                Vec::new()
            }
            Fetched::End => {
                info!("telemetry feed exhausted");
                break;
            }
        };

        let report = controller.tick(&batch);
        stats.ticks += 1;
        stats.admitted += report.admitted.len() as u64;
        stats.rejected += report.rejected.len() as u64;
        if !report.stale.is_empty() {
            stats.stale_ticks += 1;
        }

        for signed in report.admitted {
            let gateway = Arc::clone(&gateway);
            let actuator = Arc::clone(&actuator);
            let tx = tx.clone();
            let timeout = opts.dispatch_timeout;
            tasks.spawn(async move {
                let report = dispatch(gateway, actuator, signed, timeout).await;
                if tx.send(report).await.is_err() {
                    warn!("outcome channel closed before report was delivered");
                }
            });
        }
    }

    // Every sender lives in a task or here; once they are gone the channel ends.
    drop(tx);
    while let Some(report) = rx.recv().await {
        stats.commit(&mut controller, report);
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "dispatch task panicked");
        }
    }

    stats.audit_flushed = controller.finish();
    info!(
        ticks = stats.ticks,
        admitted = stats.admitted,
        succeeded = stats.succeeded,
        failed = stats.failed,
        "scheduler stopped"
    );
    Ok((controller, stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{Replay, Scenario, Synthetic, SyntheticOptions, ring};
    use morpho_core::config::GatewayConfig;
    use morpho_core::{ControlConfig, MemoryAuditSink};
    use parking_lot::Mutex;

    struct Recorder {
        fail: bool,
        seen: Mutex<Vec<SignedIntent>>,
    }

    impl Recorder {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                fail,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl Actuator for Recorder {
        fn execute(&self, signed: &SignedIntent) -> Result<(), ActuationError> {
            self.seen.lock().push(signed.clone());
            if self.fail {
                Err(ActuationError::Rejected("no".into()))
            } else {
                Ok(())
            }
        }
    }

    struct Stuck;

    impl Actuator for Stuck {
        fn execute(&self, _signed: &SignedIntent) -> Result<(), ActuationError> {
            std::thread::sleep(Duration::from_millis(200));
            Ok(())
        }
    }

    fn quick_gateway() -> Arc<Gateway> {
        let cfg = GatewayConfig {
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            ..GatewayConfig::default()
        };
        Arc::new(Gateway::from_config(&cfg))
    }

    fn config() -> ControlConfig {
        let mut cfg = ControlConfig::default();
        cfg.gateway.initial_backoff_ms = 1;
        cfg.gateway.max_backoff_ms = 2;
        cfg
    }

    fn spike(sink: &MemoryAuditSink) -> (Controller, Feed) {
        let topo = Arc::new(ring(6).unwrap());
        let feed = Feed::Synthetic(Synthetic::new(
            &topo,
            SyntheticOptions {
                scenario: Scenario::ErrorSpike,
                target: Some("n3".into()),
                onset: 1,
                ..SyntheticOptions::default()
            },
        ));
        let ctl = Controller::new(config(), topo, Box::new(sink.clone())).unwrap();
        (ctl, feed)
    }

    fn opts(ticks: u64) -> SchedulerOptions {
        SchedulerOptions {
            max_ticks: Some(ticks),
            ..SchedulerOptions::default()
        }
    }

    fn sample_intent() -> SignedIntent {
        let intent = morpho_core::Intent::new(
            1,
            morpho_core::AgentKind::Scavenger,
            morpho_core::Action::SetCircuitState {
                link_id: "l2".into(),
                state: morpho_core::CircuitState::Open,
                reason: "crisis".into(),
                traffic_fraction: 0.0,
            },
            vec!["n3".into()],
            "test",
        );
        quick_gateway().sign(intent).unwrap()
    }

    #[tokio::test]
    async fn error_spike_trips_link_into_target() {
        let sink = MemoryAuditSink::new();
        let (ctl, feed) = spike(&sink);
        let actuator = Recorder::new(false);
        let (ctl, stats) = run(ctl, feed, quick_gateway(), actuator.clone(), opts(10))
            .await
            .unwrap();

        assert_eq!(stats.ticks, 10);
        assert!(stats.admitted >= 1);
        assert_eq!(stats.succeeded, stats.admitted);
        // l2: n2 → n3
        assert_eq!(ctl.scavenger().state("l2"), morpho_core::CircuitState::Open);
        assert_eq!(ctl.in_flight(), 0);
        assert_eq!(ctl.pending_audit(), 0);
        assert!(actuator.seen.lock().iter().all(|s| ctl.gateway().verify(s).is_ok()));
    }

    #[tokio::test]
    async fn failed_dispatch_is_retried_then_reported() {
        let sink = MemoryAuditSink::new();
        let (ctl, feed) = spike(&sink);
        let actuator = Recorder::new(true);
        let (ctl, stats) = run(ctl, feed, quick_gateway(), actuator.clone(), opts(4))
            .await
            .unwrap();

        assert!(stats.failed >= 1);
        assert_eq!(stats.succeeded, 0);
        // Every failed intent was attempted max_attempts times.
        assert_eq!(actuator.seen.lock().len() as u64, stats.failed * 3);
        assert_eq!(ctl.scavenger().state("l2"), morpho_core::CircuitState::Closed);
        let alerts = sink
            .records()
            .into_iter()
            .filter(|r| r.event.kind() == "alert")
            .count() as u64;
        assert_eq!(alerts, stats.failed);
    }

    #[tokio::test]
    async fn dispatch_timeout_counts_as_failure() {
        let report = dispatch(
            quick_gateway(),
            Arc::new(Stuck),
            sample_intent(),
            Duration::from_millis(10),
        )
        .await;
        assert_eq!(report.attempts, 3);
        match report.outcome {
            Outcome::Failure { reason } => assert!(reason.contains("timed out"), "{reason}"),
            Outcome::Success => panic!("stuck actuator reported success"),
        }
    }

    #[tokio::test]
    async fn tampered_intent_never_reaches_actuator() {
        let mut signed = sample_intent();
        signed.intent.trigger_reason.push('!');
        let actuator = Recorder::new(false);
        let report = dispatch(quick_gateway(), actuator.clone(), signed, Duration::from_millis(50)).await;
        assert_eq!(report.attempts, 0);
        assert!(!report.outcome.is_success());
        assert!(actuator.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn replay_applies_topology_changes_and_ends() {
        let sink = MemoryAuditSink::new();
        let topo = Arc::new(ring(3).unwrap());
        let ctl = Controller::new(config(), topo, Box::new(sink.clone())).unwrap();
        let feed = Feed::Replay(Replay::parse(
            r#"
[{"node_id": "n0", "error_count": 0, "total_count": 100, "latency_ms": 20, "capacity_used": 5, "capacity_total": 10}]
{"change": "add_node", "id": "n9"}
{"change": "add_link", "id": "l9", "from": "n0", "to": "n9"}
{"change": "remove_node", "id": "missing"}
[]
"#,
        ));
        let (ctl, stats) = run(ctl, feed, quick_gateway(), Recorder::new(false), SchedulerOptions::default())
            .await
            .unwrap();
        assert_eq!(stats.ticks, 2);
        assert_eq!(stats.topology_changes, 2);
        assert_eq!(ctl.topology().len(), 4);
        assert!(stats.stale_ticks >= 1);
    }
}
