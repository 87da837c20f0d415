//! Pluggable policies for servesim.
//!
//! The simulator core selects one policy of each kind by name at
//! construction and then only calls through the traits in [`traits`]:
//!
//! | Kind | Names |
//! |------|-------|
//! | Admission | `always-admit`, `token-bucket`, `reject-all` |
//! | Routing | `round-robin`, `least-loaded`, `least-kv`, `prefix-affinity`, `always-busiest` |
//! | Scheduler | `fcfs`, `sjf`, `priority-fcfs`, `reverse-priority` |
//! | Priority | `constant`, `slo-class`, `slo-based`, `inverted-slo` |

pub mod admission;
pub mod always_busiest;
pub mod least_kv;
pub mod least_loaded;
pub mod prefix_affinity;
pub mod priority;
pub mod round_robin;
pub mod scheduler;
pub mod traits;

pub use admission::{AlwaysAdmit, RejectAll, TokenBucket, TokenCost};
pub use always_busiest::AlwaysBusiest;
pub use least_kv::LeastKv;
pub use least_loaded::LeastLoaded;
pub use prefix_affinity::PrefixAffinity;
pub use priority::{ConstantPriority, InvertedSloPriority, SloBasedPriority, SloClassPriority};
pub use round_robin::RoundRobin;
pub use scheduler::{Fcfs, PriorityFcfs, ReversePriority, Sjf};
pub use traits::*;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("unknown {kind} policy: {name:?} (available: {available})")]
    Unknown {
        kind: &'static str,
        name: String,
        available: String,
    },
}

impl PolicyError {
    fn unknown(kind: &'static str, name: &str, available: &[&str]) -> Self {
        PolicyError::Unknown {
            kind,
            name: name.to_string(),
            available: available.join(", "),
        }
    }
}

/// Token-bucket settings, ignored by the other admission policies.
#[derive(Debug, Clone, Copy)]
pub struct TokenBucketParams {
    pub capacity: f64,
    pub refill_per_sec: f64,
    pub cost: TokenCost,
}

/// Create an admission policy by name. An empty name means `always-admit`.
pub fn admission_by_name(
    name: &str,
    bucket: TokenBucketParams,
) -> Result<Box<dyn AdmissionPolicy>, PolicyError> {
    match name {
        "" | "always-admit" => Ok(Box::new(AlwaysAdmit::new())),
        "token-bucket" => Ok(Box::new(TokenBucket::with_cost(
            bucket.capacity,
            bucket.refill_per_sec,
            bucket.cost,
        ))),
        "reject-all" => Ok(Box::new(RejectAll::new())),
        other => Err(PolicyError::unknown("admission", other, &available_admission())),
    }
}

/// Create a routing policy by name.
pub fn routing_by_name(name: &str) -> Result<Box<dyn RoutingPolicy>, PolicyError> {
    match name {
        "round-robin" => Ok(Box::new(RoundRobin::new())),
        "" | "least-loaded" => Ok(Box::new(LeastLoaded::new())),
        "least-kv" => Ok(Box::new(LeastKv::new())),
        "prefix-affinity" => Ok(Box::new(PrefixAffinity::new())),
        "always-busiest" => Ok(Box::new(AlwaysBusiest::new())),
        other => Err(PolicyError::unknown("routing", other, &available_routing())),
    }
}

/// Create a queue scheduler by name.
pub fn scheduler_by_name(name: &str) -> Result<Box<dyn SchedulerPolicy>, PolicyError> {
    match name {
        "" | "fcfs" => Ok(Box::new(Fcfs)),
        "sjf" => Ok(Box::new(Sjf)),
        "priority-fcfs" => Ok(Box::new(PriorityFcfs)),
        "reverse-priority" => Ok(Box::new(ReversePriority)),
        other => Err(PolicyError::unknown("scheduler", other, &available_schedulers())),
    }
}

/// Create a priority policy by name.
pub fn priority_by_name(name: &str) -> Result<Box<dyn PriorityPolicy>, PolicyError> {
    match name {
        "" | "constant" => Ok(Box::new(ConstantPriority { score: 0.0 })),
        "slo-class" => Ok(Box::new(SloClassPriority)),
        "slo-based" => Ok(Box::new(SloBasedPriority {
            base: 0.0,
            age_weight: 1e-6,
        })),
        "inverted-slo" => Ok(Box::new(InvertedSloPriority {
            base: 0.0,
            age_weight: 1e-6,
        })),
        other => Err(PolicyError::unknown("priority", other, &available_priorities())),
    }
}

pub fn available_admission() -> Vec<&'static str> {
    vec!["always-admit", "token-bucket", "reject-all"]
}

pub fn available_routing() -> Vec<&'static str> {
    vec![
        "round-robin",
        "least-loaded",
        "least-kv",
        "prefix-affinity",
        "always-busiest",
    ]
}

pub fn available_schedulers() -> Vec<&'static str> {
    vec!["fcfs", "sjf", "priority-fcfs", "reverse-priority"]
}

pub fn available_priorities() -> Vec<&'static str> {
    vec!["constant", "slo-class", "slo-based", "inverted-slo"]
}
