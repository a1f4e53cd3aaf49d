//! Actuator gateway: signing, verification, role checks and dispatch.
//!
//! The canonical payload of an intent is its JSON encoding. [`Intent`] has no
//! signature field, so the payload never includes the signature; it travels
//! next to the intent in [`SignedIntent`]. Signatures are lowercase hex
//! HMAC-SHA256 under the proposing agent's key.

use std::collections::HashMap;
use std::time::Duration;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::{error, warn};
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::intent::{AgentKind, Intent, Outcome};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no signing key for {0}")]
    MissingKey(AgentKind),
    #[error("intent serialization failed: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("signature is not valid hex")]
    MalformedSignature,
    #[error("signature does not match intent {0}")]
    BadSignature(Uuid),
    #[error("{agent} may not issue {action}")]
    RoleViolation {
        agent: AgentKind,
        action: &'static str,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignedIntent {
    pub intent: Intent,
    pub signature: String,
}

pub struct Signer {
    keys: HashMap<AgentKind, Vec<u8>>,
}

impl Signer {
    pub fn new(keys: HashMap<AgentKind, Vec<u8>>) -> Self {
        Self { keys }
    }

    pub fn from_config(cfg: &GatewayConfig) -> Self {
        Self::new(HashMap::from([
            (AgentKind::Weaver, cfg.weaver_key.as_bytes().to_vec()),
            (AgentKind::Builder, cfg.builder_key.as_bytes().to_vec()),
            (AgentKind::Scavenger, cfg.scavenger_key.as_bytes().to_vec()),
        ]))
    }

    pub fn canonical_payload(intent: &Intent) -> Result<Vec<u8>, GatewayError> {
        Ok(serde_json::to_vec(intent)?)
    }

    fn mac(&self, intent: &Intent) -> Result<HmacSha256, GatewayError> {
        let key = self
            .keys
            .get(&intent.agent)
            .ok_or(GatewayError::MissingKey(intent.agent))?;
        // HMAC accepts keys of any length.
        let mut mac = HmacSha256::new_from_slice(key)
            .map_err(|_| GatewayError::MissingKey(intent.agent))?;
        mac.update(&Self::canonical_payload(intent)?);
        Ok(mac)
    }

    pub fn sign(&self, intent: Intent) -> Result<SignedIntent, GatewayError> {
        let tag = self.mac(&intent)?.finalize().into_bytes();
        Ok(SignedIntent {
            signature: hex::encode(tag),
            intent,
        })
    }

    /// Constant-time signature check.
    pub fn verify(&self, signed: &SignedIntent) -> Result<(), GatewayError> {
        let expected =
            hex::decode(&signed.signature).map_err(|_| GatewayError::MalformedSignature)?;
        self.mac(&signed.intent)?
            .verify_slice(&expected)
            .map_err(|_| GatewayError::BadSignature(signed.intent.id))
    }
}

/// Backend that carries out verified intents.
pub trait Actuator: Send + Sync {
    fn execute(&self, signed: &SignedIntent) -> Result<(), ActuationError>;
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ActuationError {
    #[error("actuator rejected intent: {0}")]
    Rejected(String),
    #[error("actuator unavailable: {0}")]
    Unavailable(String),
    #[error("actuation timed out after {0} ms")]
    Timeout(u64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    pub fn from_config(cfg: &GatewayConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            initial_backoff_ms: cfg.initial_backoff_ms,
            max_backoff_ms: cfg.max_backoff_ms,
        }
    }

    /// Wait before retry number `attempt` (1-based count of failures so far).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        Duration::from_millis(
            self.initial_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&GatewayConfig::default())
    }
}

/// Result of pushing one intent through the gateway.
#[derive(Clone, Debug, PartialEq)]
pub struct DispatchReport {
    pub intent_id: Uuid,
    pub attempts: u32,
    pub outcome: Outcome,
}

/// Signs outgoing intents and guards the actuator boundary.
pub struct Gateway {
    signer: Signer,
    retry: RetryPolicy,
}

impl Gateway {
    pub fn new(signer: Signer, retry: RetryPolicy) -> Self {
        Self { signer, retry }
    }

    pub fn from_config(cfg: &GatewayConfig) -> Self {
        Self::new(Signer::from_config(cfg), RetryPolicy::from_config(cfg))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn sign(&self, intent: Intent) -> Result<SignedIntent, GatewayError> {
        self.signer.sign(intent)
    }

    /// Signature first, then the agent's role.
    pub fn verify(&self, signed: &SignedIntent) -> Result<(), GatewayError> {
        self.signer.verify(signed)?;
        let agent = signed.intent.agent;
        let action = signed.intent.action.action_type();
        if agent.permitted_action() != action {
            return Err(GatewayError::RoleViolation { agent, action });
        }
        Ok(())
    }
}

/// Verify and execute `signed`, retrying with exponential backoff. Blocks the
/// calling thread between attempts; async callers drive their own retries.
pub fn dispatch_blocking(
    gateway: &Gateway,
    actuator: &dyn Actuator,
    signed: &SignedIntent,
) -> DispatchReport {
    let intent_id = signed.intent.id;
    if let Err(e) = gateway.verify(signed) {
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
    let mut last_error = String::new();
    for attempt in 1..=policy.max_attempts {
        match actuator.execute(signed) {
            Ok(()) => {
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
                    std::thread::sleep(policy.backoff(attempt));
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::Action;
    use parking_lot::Mutex;

    fn gateway() -> Gateway {
        Gateway::new(
            Signer::from_config(&GatewayConfig::default()),
            RetryPolicy {
                max_attempts: 3,
                initial_backoff_ms: 0,
                max_backoff_ms: 0,
            },
        )
    }

    fn shift(agent: AgentKind) -> Intent {
        Intent::new(
            4,
            agent,
            Action::ShiftWeight {
                link_id: "a".into(),
                to_link: "b".into(),
                delta: 0.05,
                increment_schedule: vec![0.05, 0.05],
            },
            vec!["v".into()],
            "latency hot",
        )
    }

    struct Flaky {
        failures_left: Mutex<u32>,
        calls: Mutex<u32>,
    }

    impl Flaky {
        fn new(failures: u32) -> Self {
            Self {
                failures_left: Mutex::new(failures),
                calls: Mutex::new(0),
            }
        }
    }

    impl Actuator for Flaky {
        fn execute(&self, _signed: &SignedIntent) -> Result<(), ActuationError> {
            *self.calls.lock() += 1;
            let mut left = self.failures_left.lock();
            if *left > 0 {
                *left -= 1;
                Err(ActuationError::Unavailable("down".into()))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn sign_then_verify() {
        let g = gateway();
        let signed = g.sign(shift(AgentKind::Weaver)).unwrap();
        assert_eq!(signed.signature.len(), 64);
        assert!(signed.signature.chars().all(|c| c.is_ascii_hexdigit()));
        g.verify(&signed).unwrap();
    }

    #[test]
    fn tampered_intent_fails_verification() {
        let g = gateway();
        let mut signed = g.sign(shift(AgentKind::Weaver)).unwrap();
        signed.intent.tick = 5;
        assert!(matches!(g.verify(&signed), Err(GatewayError::BadSignature(_))));

        let mut signed = g.sign(shift(AgentKind::Weaver)).unwrap();
        signed.signature.replace_range(0..2, "zz");
        assert!(matches!(g.verify(&signed), Err(GatewayError::MalformedSignature)));

        let mut signed = g.sign(shift(AgentKind::Weaver)).unwrap();
        signed.signature.pop();
        assert!(matches!(g.verify(&signed), Err(GatewayError::MalformedSignature)));
    }

    #[test]
    fn signature_is_lowercase_hex_of_the_mac() {
        let g = gateway();
        let signed = g.sign(shift(AgentKind::Weaver)).unwrap();
        assert_eq!(signed.signature, signed.signature.to_lowercase());
        let raw = hex::decode(&signed.signature).unwrap();
        assert_eq!(raw.len(), 32);
        assert_eq!(hex::encode(raw), signed.signature);
    }

    #[test]
    fn signature_depends_on_agent_key() {
        let g = gateway();
        let mut intent = shift(AgentKind::Weaver);
        let a = g.sign(intent.clone()).unwrap().signature;
        intent.agent = AgentKind::Builder;
        let b = g.sign(intent).unwrap().signature;
        assert_ne!(a, b);
    }

    #[test]
    fn role_check_rejects_foreign_actions() {
        let g = gateway();
        let signed = g.sign(shift(AgentKind::Builder)).unwrap();
        assert!(matches!(
            g.verify(&signed),
            Err(GatewayError::RoleViolation {
                agent: AgentKind::Builder,
                action: "shift_weight"
            })
        ));
    }

    #[test]
    fn dispatch_retries_then_succeeds() {
        let g = gateway();
        let signed = g.sign(shift(AgentKind::Weaver)).unwrap();
        let act = Flaky::new(2);
        let report = dispatch_blocking(&g, &act, &signed);
        assert_eq!(report.outcome, Outcome::Success);
        assert_eq!(report.attempts, 3);
    }

    #[test]
    fn dispatch_gives_up_after_max_attempts() {
        let g = gateway();
        let signed = g.sign(shift(AgentKind::Weaver)).unwrap();
        let act = Flaky::new(10);
        let report = dispatch_blocking(&g, &act, &signed);
        assert!(!report.outcome.is_success());
        assert_eq!(*act.calls.lock(), 3);
    }

    #[test]
    fn refused_intents_never_reach_the_actuator() {
        let g = gateway();
        let signed = g.sign(shift(AgentKind::Scavenger)).unwrap();
        let act = Flaky::new(0);
        let report = dispatch_blocking(&g, &act, &signed);
        assert_eq!(report.attempts, 0);
        assert_eq!(*act.calls.lock(), 0);
    }

    #[test]
    fn retry_backoff_doubles_and_caps() {
        let p = RetryPolicy::default();
        let waits: Vec<u64> = (1..=6).map(|a| p.backoff(a).as_millis() as u64).collect();
        assert_eq!(waits, vec![100, 200, 400, 800, 1600, 2000]);
    }
}
