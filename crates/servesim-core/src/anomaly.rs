//! Diagnostic detectors run over a finished cluster run.
//!
//! Neither detector feeds back into the simulation; they only flag
//! suspicious load concentration and ordering.

use std::collections::BTreeMap;

use tracing::warn;

use crate::metrics::RequestRecord;

/// An instance is HOL-blocked when its average queue depth exceeds this
/// multiple of the cluster-wide mean.
pub const HOL_BLOCKING_FACTOR: f64 = 2.0;

/// An earlier request whose E2E exceeds this multiple of a later request's
/// E2E (same SLO class) counts as an inversion.
pub const PRIORITY_INVERSION_FACTOR: f64 = 2.0;

/// Count instances whose average wait-queue depth is more than
/// [`HOL_BLOCKING_FACTOR`] times the mean over all instances.
///
/// Instances that never sampled a queue count as depth 0 and stay in the
/// mean, so traffic piled onto one instance while its siblings idle is
/// flagged.
pub fn detect_hol_blocking<S: AsRef<[usize]>>(per_instance: &[S]) -> usize {
    if per_instance.is_empty() {
        return 0;
    }
    let averages: Vec<f64> = per_instance
        .iter()
        .map(|samples| {
            let samples = samples.as_ref();
            if samples.is_empty() {
                0.0
            } else {
                samples.iter().sum::<usize>() as f64 / samples.len() as f64
            }
        })
        .collect();
    let mean = averages.iter().sum::<f64>() / averages.len() as f64;
    if mean <= 0.0 {
        return 0;
    }
    averages
        .iter()
        .filter(|&&avg| avg > HOL_BLOCKING_FACTOR * mean)
        .count()
}

/// Count priority inversions among completed requests.
///
/// Requests are compared only with the next arrival of the same SLO class
/// (an empty class is the `"default"` group): classes with structurally
/// different workloads would otherwise produce false positives. Always 0
/// under the `constant` priority policy, where no order is promised.
pub fn detect_priority_inversions(records: &[RequestRecord], priority_policy: &str) -> usize {
    if priority_policy == "constant" || priority_policy.is_empty() {
        return 0;
    }

    let mut groups: BTreeMap<&str, Vec<(u64, u64, u64)>> = BTreeMap::new();
    let mut missing = 0usize;
    for record in records {
        let Some(e2e) = record.e2e_us else {
            missing += 1;
            continue;
        };
        let class = if record.slo_class.is_empty() {
            "default"
        } else {
            record.slo_class.as_str()
        };
        groups
            .entry(class)
            .or_default()
            .push((record.arrival_us, record.request_id, e2e));
    }
    if missing > 0 {
        warn!(missing, "priority inversion check: skipping requests with missing E2E");
    }

    let mut inversions = 0;
    for group in groups.values_mut() {
        group.sort_unstable();
        for pair in group.windows(2) {
            let (earlier, later) = (pair[0].2 as f64, pair[1].2 as f64);
            if earlier > PRIORITY_INVERSION_FACTOR * later {
                inversions += 1;
            }
        }
    }
    inversions
}
