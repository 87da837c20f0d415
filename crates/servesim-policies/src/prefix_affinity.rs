//! Prefix-cache-aware routing.
//!
//! Sends a request to the instance that already holds the longest run of its
//! leading prefix blocks, trading that against load. Falls back to
//! least-loaded when no instance has any of the prefix cached.

use crate::traits::*;
use std::collections::BTreeMap;

/// Prefix-affinity router.
///
/// Strategy:
/// 1. Score each instance as `w * cache_fraction + (1 - w) * load_score`.
/// 2. If no instance has a cached prefix block, route to the least loaded.
pub struct PrefixAffinity {
    /// Weight for cache hits vs load (0.0 = pure load, 1.0 = pure cache).
    cache_weight: f64,
    hits: u64,
    misses: u64,
}

impl PrefixAffinity {
    pub fn new() -> Self {
        Self::with_cache_weight(0.8)
    }

    pub fn with_cache_weight(cache_weight: f64) -> Self {
        Self {
            cache_weight: cache_weight.clamp(0.0, 1.0),
            hits: 0,
            misses: 0,
        }
    }

    fn score_instance(&self, inst: &InstanceSnapshot, request_blocks: usize, max_load: usize) -> f64 {
        let cache_score = inst.cached_prefix_blocks as f64 / request_blocks.max(1) as f64;
        let load_score = if max_load == 0 {
            1.0
        } else {
            1.0 - inst.effective_load() as f64 / max_load as f64
        };
        self.cache_weight * cache_score.min(1.0) + (1.0 - self.cache_weight) * load_score
    }
}

impl Default for PrefixAffinity {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingPolicy for PrefixAffinity {
    fn route(
        &mut self,
        request: &RequestInfo,
        instances: &[InstanceSnapshot],
        _clock: &dyn Clock,
    ) -> RoutingDecision {
        if instances.iter().all(|i| i.cached_prefix_blocks == 0) {
            self.misses += 1;
            return match least_loaded_index(instances) {
                Some(id) => RoutingDecision::Route(id),
                None => RoutingDecision::Reject,
            };
        }
        self.hits += 1;

        let max_load = instances
            .iter()
            .map(InstanceSnapshot::effective_load)
            .max()
            .unwrap_or(0);
        let request_blocks = request.prefix_hashes.len();

        // Strict comparison keeps the lowest index on equal scores.
        let mut best: Option<(usize, f64)> = None;
        for inst in instances {
            let score = self.score_instance(inst, request_blocks, max_load);
            match best {
                Some((_, best_score)) if score <= best_score => {}
                _ => best = Some((inst.id, score)),
            }
        }

        match best {
            Some((id, _)) => RoutingDecision::Route(id),
            None => RoutingDecision::Reject,
        }
    }

    fn name(&self) -> &str {
        "prefix-affinity"
    }

    fn custom_metrics(&self) -> BTreeMap<String, f64> {
        let mut metrics = BTreeMap::new();
        let total = self.hits + self.misses;
        if total > 0 {
            metrics.insert(
                "prefix_affinity_hit_rate".to_string(),
                self.hits as f64 / total as f64,
            );
        }
        metrics
    }
}
