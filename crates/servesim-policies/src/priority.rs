//! Priority policies.
//!
//! A priority policy turns a request's SLO class and age into a score that
//! priority-aware schedulers sort on. Scores are recomputed every step.

use crate::traits::*;

/// Every request gets the same score.
pub struct ConstantPriority {
    pub score: f64,
}

impl PriorityPolicy for ConstantPriority {
    fn compute(&self, _slo_class: &str, _arrival_us: u64, _now_us: u64) -> f64 {
        self.score
    }

    fn name(&self) -> &str {
        "constant"
    }
}

/// Static score per SLO class.
///
/// `critical` > `standard` (and the default class) > `sheddable` > `batch`.
/// Unknown classes score like the default class.
pub struct SloClassPriority;

impl SloClassPriority {
    pub fn class_score(slo_class: &str) -> f64 {
        match slo_class {
            "critical" => 3.0,
            "sheddable" => 1.0,
            "batch" => 0.0,
            _ => 2.0,
        }
    }
}

impl PriorityPolicy for SloClassPriority {
    fn compute(&self, slo_class: &str, _arrival_us: u64, _now_us: u64) -> f64 {
        Self::class_score(slo_class)
    }

    fn name(&self) -> &str {
        "slo-class"
    }
}

/// Older requests score higher: `base + age_weight * age_us`.
///
/// With the default weight of 1e-6 a request that has waited one second
/// gains +1.0.
pub struct SloBasedPriority {
    pub base: f64,
    pub age_weight: f64,
}

impl PriorityPolicy for SloBasedPriority {
    fn compute(&self, _slo_class: &str, arrival_us: u64, now_us: u64) -> f64 {
        let age = now_us.saturating_sub(arrival_us) as f64;
        self.base + self.age_weight * age
    }

    fn name(&self) -> &str {
        "slo-based"
    }
}

/// Newer requests score higher. Pathological; starves old requests.
pub struct InvertedSloPriority {
    pub base: f64,
    pub age_weight: f64,
}

impl PriorityPolicy for InvertedSloPriority {
    fn compute(&self, _slo_class: &str, arrival_us: u64, now_us: u64) -> f64 {
        let age = now_us.saturating_sub(arrival_us) as f64;
        self.base - self.age_weight * age
    }

    fn name(&self) -> &str {
        "inverted-slo"
    }
}
