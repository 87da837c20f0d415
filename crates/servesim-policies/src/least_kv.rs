//! Least KV-utilization routing.
//!
//! Routes requests to the instance whose KV block pool is least full, which
//! spreads memory pressure and reduces preemptions.

use crate::traits::*;

/// Least KV-utilization router.
pub struct LeastKv;

impl LeastKv {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LeastKv {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingPolicy for LeastKv {
    fn route(
        &mut self,
        _request: &RequestInfo,
        instances: &[InstanceSnapshot],
        _clock: &dyn Clock,
    ) -> RoutingDecision {
        // min_by keeps the first of equal elements, so ties go to the lowest index.
        let best = instances.iter().min_by(|a, b| {
            a.kv_utilization
                .total_cmp(&b.kv_utilization)
                .then(a.effective_load().cmp(&b.effective_load()))
        });

        match best {
            Some(inst) => RoutingDecision::Route(inst.id),
            None => RoutingDecision::Reject,
        }
    }

    fn name(&self) -> &str {
        "least-kv"
    }
}
