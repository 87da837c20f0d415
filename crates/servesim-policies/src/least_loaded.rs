//! Least-loaded routing.
//!
//! Routes each request to the instance with the fewest waiting, running and
//! in-flight requests. Ties go to the lowest instance index so the choice
//! never depends on anything but the snapshots.

use crate::traits::*;

/// Least-loaded router.
pub struct LeastLoaded;

impl LeastLoaded {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LeastLoaded {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingPolicy for LeastLoaded {
    fn route(
        &mut self,
        _request: &RequestInfo,
        instances: &[InstanceSnapshot],
        _clock: &dyn Clock,
    ) -> RoutingDecision {
        match least_loaded_index(instances) {
            Some(id) => RoutingDecision::Route(id),
            None => RoutingDecision::Reject,
        }
    }

    fn name(&self) -> &str {
        "least-loaded"
    }
}
