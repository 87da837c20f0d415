//! Round-robin routing.
//!
//! Distributes requests across instances in a fixed cycle, ignoring load.

use crate::traits::*;

/// Round-robin router.
///
/// Tracks the last instance index it used and advances past it, wrapping to
/// the first instance.
pub struct RoundRobin {
    last_instance: Option<usize>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            last_instance: None,
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingPolicy for RoundRobin {
    fn route(
        &mut self,
        _request: &RequestInfo,
        instances: &[InstanceSnapshot],
        _clock: &dyn Clock,
    ) -> RoutingDecision {
        let chosen = match self.last_instance {
            Some(last) => instances
                .iter()
                .find(|i| i.id > last)
                .or_else(|| instances.first()),
            None => instances.first(),
        };

        match chosen {
            Some(inst) => {
                self.last_instance = Some(inst.id);
                RoutingDecision::Route(inst.id)
            }
            None => RoutingDecision::Reject,
        }
    }

    fn name(&self) -> &str {
        "round-robin"
    }
}
