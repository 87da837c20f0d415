//! Pathological router that piles everything onto the busiest instance.
//!
//! Exists to exercise the head-of-line blocking detector: with this router
//! one instance saturates while its siblings sit idle.

use crate::traits::*;

pub struct AlwaysBusiest;

impl AlwaysBusiest {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AlwaysBusiest {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingPolicy for AlwaysBusiest {
    fn route(
        &mut self,
        _request: &RequestInfo,
        instances: &[InstanceSnapshot],
        _clock: &dyn Clock,
    ) -> RoutingDecision {
        let mut best: Option<&InstanceSnapshot> = None;
        for inst in instances {
            match best {
                Some(b) if inst.effective_load() <= b.effective_load() => {}
                _ => best = Some(inst),
            }
        }
        match best {
            Some(inst) => RoutingDecision::Route(inst.id),
            None => RoutingDecision::Reject,
        }
    }

    fn name(&self) -> &str {
        "always-busiest"
    }
}
