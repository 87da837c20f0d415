//! Admission policies.
//!
//! Admission runs before routing and decides whether an arriving request
//! enters the cluster at all. Rejected requests are counted, never queued.

use crate::traits::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Admits every request.
pub struct AlwaysAdmit;

impl AlwaysAdmit {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AlwaysAdmit {
    fn default() -> Self {
        Self::new()
    }
}

impl AdmissionPolicy for AlwaysAdmit {
    fn admit(
        &mut self,
        _request: &RequestInfo,
        _instances: &[InstanceSnapshot],
        _clock: &dyn Clock,
    ) -> AdmissionDecision {
        AdmissionDecision::Admit
    }

    fn name(&self) -> &str {
        "always-admit"
    }
}

/// What one admission draws from the bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TokenCost {
    /// One token per admitted request.
    #[default]
    Request,
    /// One token per input token of the admitted request.
    InputTokens,
}

/// Token-bucket rate limiter driven by simulated time.
///
/// The bucket starts full and refills continuously at `refill_per_sec`,
/// capped at `capacity`.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill_us: u64,
    cost: TokenCost,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self::with_cost(capacity, refill_per_sec, TokenCost::Request)
    }

    pub fn with_cost(capacity: f64, refill_per_sec: f64, cost: TokenCost) -> Self {
        Self {
            capacity,
            refill_per_sec,
            tokens: capacity,
            last_refill_us: 0,
            cost,
        }
    }

    /// Tokens currently available.
    pub fn available(&self) -> f64 {
        self.tokens
    }

    fn refill(&mut self, now_us: u64) {
        if now_us > self.last_refill_us {
            let elapsed = (now_us - self.last_refill_us) as f64;
            self.tokens = (self.tokens + elapsed * self.refill_per_sec / 1e6).min(self.capacity);
            self.last_refill_us = now_us;
        }
    }
}

impl AdmissionPolicy for TokenBucket {
    fn admit(
        &mut self,
        request: &RequestInfo,
        _instances: &[InstanceSnapshot],
        clock: &dyn Clock,
    ) -> AdmissionDecision {
        self.refill(clock.now_us());
        let cost = match self.cost {
            TokenCost::Request => 1.0,
            TokenCost::InputTokens => f64::from(request.input_tokens),
        };
        if self.tokens >= cost {
            self.tokens -= cost;
            AdmissionDecision::Admit
        } else {
            debug!(
                request = request.id,
                available = self.tokens,
                cost,
                "token bucket empty"
            );
            AdmissionDecision::Reject {
                reason: "insufficient tokens",
            }
        }
    }

    fn name(&self) -> &str {
        "token-bucket"
    }
}

/// Rejects everything. Useful as a pathological baseline.
pub struct RejectAll;

impl RejectAll {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RejectAll {
    fn default() -> Self {
        Self::new()
    }
}

impl AdmissionPolicy for RejectAll {
    fn admit(
        &mut self,
        _request: &RequestInfo,
        _instances: &[InstanceSnapshot],
        _clock: &dyn Clock,
    ) -> AdmissionDecision {
        AdmissionDecision::Reject {
            reason: "reject-all",
        }
    }

    fn name(&self) -> &str {
        "reject-all"
    }
}
