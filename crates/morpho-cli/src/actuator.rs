use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use morpho_core::{ActuationError, Actuator, SignedIntent};

/// Stand-in backend: logs every intent it receives and fails a configurable
/// share of calls.
pub struct SimulatedActuator {
    failure_rate: f64,
    latency: Duration,
    rng: Mutex<SmallRng>,
    calls: AtomicU64,
    failures: AtomicU64,
}

impl SimulatedActuator {
    pub fn new(failure_rate: f64, latency: Duration, seed: u64) -> Self {
        Self {
            failure_rate: failure_rate.clamp(0.0, 1.0),
            latency,
            rng: Mutex::new(SmallRng::seed_from_u64(seed)),
            calls: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl Actuator for SimulatedActuator {
    fn execute(&self, signed: &SignedIntent) -> Result<(), ActuationError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        let intent = &signed.intent;
        let fail = self.failure_rate > 0.0 && self.rng.lock().random_bool(self.failure_rate);
        if fail {
            self.failures.fetch_add(1, Ordering::Relaxed);
            return Err(ActuationError::Unavailable("injected failure".to_string()));
        }
        tracing::info!(
            intent = %intent.id,
            agent = %intent.agent,
            action = intent.action.action_type(),
            target = intent.action.target(),
            tick = intent.tick,
            "actuated"
        );
        Ok(())
    }
}
