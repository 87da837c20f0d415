//! Policy trait definitions.
//!
//! The simulator core only talks to policies through these traits. Each
//! policy receives read-only views ([`RequestInfo`], [`InstanceSnapshot`],
//! [`QueuedRequest`]) and never touches simulation state directly.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Read-only snapshot of one instance, provided to admission and routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    /// Instance index inside the cluster.
    pub id: usize,
    /// Requests in the wait queue.
    pub queue_depth: usize,
    /// Requests in the running batch.
    pub batch_size: usize,
    /// Requests routed here whose queueing delay has not elapsed yet.
    pub pending: usize,
    /// Fraction of KV blocks in use.
    pub kv_utilization: f64,
    pub free_kv_blocks: usize,
    pub total_kv_blocks: usize,
    /// Leading prefix blocks of the request being routed already cached here.
    pub cached_prefix_blocks: usize,
}

impl InstanceSnapshot {
    /// Load used by load-aware routing: waiting + running + in-flight.
    pub fn effective_load(&self) -> usize {
        self.queue_depth + self.batch_size + self.pending
    }
}

/// Virtual simulation clock interface for policies.
pub trait Clock {
    fn now_us(&self) -> u64;
}

/// Information about an arriving request, provided to admission and routing.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    pub id: u64,
    pub arrival_us: u64,
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// SLO class tag; empty means the default class.
    pub slo_class: String,
    /// One hash per full input block, used for prefix-cache lookups.
    pub prefix_hashes: Vec<u64>,
}

/// Decision returned by an admission policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    Admit,
    Reject { reason: &'static str },
}

/// Decision returned by a routing policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingDecision {
    /// Route to the instance with this index.
    Route(usize),
    /// No instance can take the request.
    Reject,
}

/// Gatekeeper consulted once per arriving request.
pub trait AdmissionPolicy: Send {
    fn admit(
        &mut self,
        request: &RequestInfo,
        instances: &[InstanceSnapshot],
        clock: &dyn Clock,
    ) -> AdmissionDecision;

    /// Human-readable name for reports.
    fn name(&self) -> &str;
}

/// Chooses a target instance for each admitted request.
pub trait RoutingPolicy: Send {
    fn route(
        &mut self,
        request: &RequestInfo,
        instances: &[InstanceSnapshot],
        clock: &dyn Clock,
    ) -> RoutingDecision;

    /// Human-readable name for reports.
    fn name(&self) -> &str;

    /// Optional: policy-specific metrics to include in output.
    fn custom_metrics(&self) -> BTreeMap<String, f64> {
        BTreeMap::new()
    }
}

/// Scheduler view of a queued or running request.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedRequest {
    pub id: u64,
    pub arrival_us: u64,
    /// Score from the active [`PriorityPolicy`]; higher runs first.
    pub priority: f64,
    /// Output tokens still to generate.
    pub remaining_work: u32,
}

/// Orders the wait queue each step.
///
/// Implementations must be pure: given the waiting and running sets they
/// return a permutation of `0..waiting.len()` and nothing else.
pub trait SchedulerPolicy: Send {
    fn order(&self, waiting: &[QueuedRequest], running: &[QueuedRequest]) -> Vec<usize>;

    fn name(&self) -> &str;
}

/// Computes a priority score for a request. Higher is more urgent.
pub trait PriorityPolicy: Send {
    fn compute(&self, slo_class: &str, arrival_us: u64, now_us: u64) -> f64;

    fn name(&self) -> &str;
}

/// Index of the instance with the lowest effective load.
///
/// Ties go to the lowest index. Returns `None` when `instances` is empty.
pub fn least_loaded_index(instances: &[InstanceSnapshot]) -> Option<usize> {
    let mut best: Option<&InstanceSnapshot> = None;
    for inst in instances {
        match best {
            Some(b) if inst.effective_load() >= b.effective_load() => {}
            _ => best = Some(inst),
        }
    }
    best.map(|b| b.id)
}
