//! Metrics collection and aggregation for simulation runs.
//!
//! Every counter is owned by the instance or cluster that updates it and is
//! passed around explicitly; nothing here is global. Aggregation walks
//! instances in index order and records in request-id order so the same run
//! always produces the same numbers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-request record, written when a request finishes or at teardown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request_id: u64,
    pub instance: usize,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub slo_class: String,
    pub arrival_us: u64,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub finished: bool,
    /// Arrival to first output token.
    pub ttft_us: Option<u64>,
    /// Arrival to last output token, including per-token post-processing.
    pub e2e_us: Option<u64>,
    /// Arrival to first admission into the running batch.
    pub scheduling_delay_us: Option<u64>,
    pub preemptions: u32,
    pub itl_samples_us: Vec<u64>,
}

impl RequestRecord {
    /// Average inter-token latency.
    pub fn avg_itl_us(&self) -> f64 {
        if self.itl_samples_us.is_empty() {
            return 0.0;
        }
        self.itl_samples_us.iter().sum::<u64>() as f64 / self.itl_samples_us.len() as f64
    }
}

/// Counters and samples owned by one instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceMetrics {
    pub instance: usize,
    /// Requests routed to this instance.
    pub admitted: u64,
    pub completed: u64,
    pub still_queued: u64,
    pub still_running: u64,
    /// Requests too large for the whole KV cache, dropped at hand-off.
    pub dropped_unservable: u64,
    pub preemptions: u64,
    pub steps: u64,
    pub output_tokens: u64,
    pub busy_us: u64,
    /// Wait-queue depth sampled at the start of every step.
    pub queue_depth_samples: Vec<usize>,
    /// Running-batch size of every step.
    pub running_samples: Vec<usize>,
    pub peak_kv_utilization: f64,
    /// KV utilization integrated over step time (utilization x us).
    kv_utilization_area: f64,
    sampled_us: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    #[serde(skip)]
    pub records: Vec<RequestRecord>,
}

impl InstanceMetrics {
    pub fn new(instance: usize) -> Self {
        Self {
            instance,
            ..Default::default()
        }
    }

    /// Record the samples of one step lasting `duration_us`.
    pub fn sample_step(
        &mut self,
        queue_depth: usize,
        running: usize,
        kv_utilization: f64,
        duration_us: u64,
    ) {
        self.steps += 1;
        self.queue_depth_samples.push(queue_depth);
        self.running_samples.push(running);
        self.kv_utilization_area += kv_utilization * duration_us as f64;
        self.sampled_us += duration_us;
        if kv_utilization > self.peak_kv_utilization {
            self.peak_kv_utilization = kv_utilization;
        }
    }

    /// KV utilization averaged over simulated step time.
    pub fn mean_kv_utilization(&self) -> f64 {
        if self.sampled_us == 0 {
            return 0.0;
        }
        self.kv_utilization_area / self.sampled_us as f64
    }

    pub fn avg_batch_size(&self) -> f64 {
        if self.running_samples.is_empty() {
            return 0.0;
        }
        self.running_samples.iter().sum::<usize>() as f64 / self.running_samples.len() as f64
    }

    pub fn avg_queue_depth(&self) -> f64 {
        if self.queue_depth_samples.is_empty() {
            return 0.0;
        }
        self.queue_depth_samples.iter().sum::<usize>() as f64
            / self.queue_depth_samples.len() as f64
    }

    /// Requests this instance still accounts for: every routed request is
    /// completed, queued, running or dropped.
    pub fn accounted(&self) -> u64 {
        self.completed + self.still_queued + self.still_running + self.dropped_unservable
    }
}

/// Percentile values for a distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Percentiles {
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl Percentiles {
    /// Compute percentiles from a slice of values.
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self {
                p50: 0.0,
                p90: 0.0,
                p95: 0.0,
                p99: 0.0,
                min: 0.0,
                max: 0.0,
                mean: 0.0,
            };
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let n = sorted.len();
        let mean = sorted.iter().sum::<f64>() / n as f64;

        Self {
            p50: percentile_sorted(&sorted, 50.0),
            p90: percentile_sorted(&sorted, 90.0),
            p95: percentile_sorted(&sorted, 95.0),
            p99: percentile_sorted(&sorted, 99.0),
            min: sorted[0],
            max: sorted[n - 1],
            mean,
        }
    }
}

fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = (p / 100.0 * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn us_to_ms(us: u64) -> f64 {
    us as f64 / 1000.0
}

/// Conservation counters of the cluster front door.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterCounters {
    /// Requests that arrived before the horizon.
    pub offered: u64,
    /// Requests whose arrival lies beyond the horizon.
    pub unarrived: u64,
    pub rejected: u64,
    /// Arrived but still in admission/routing when the run ended.
    pub in_pipeline: u64,
}

/// Policy names a run was configured with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLabels {
    pub name: String,
    pub admission: String,
    pub routing: String,
    pub scheduler: String,
    pub priority: String,
}

/// Aggregated metrics for an entire cluster run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMetrics {
    #[serde(flatten)]
    pub labels: RunLabels,
    /// Simulated time at the last processed event.
    pub duration_us: u64,

    // Conservation
    pub offered: u64,
    pub unarrived: u64,
    pub injected: u64,
    pub rejected: u64,
    pub completed: u64,
    pub still_queued: u64,
    pub still_running: u64,
    pub dropped_unservable: u64,
    pub preemptions: u64,
    pub conservation_holds: bool,

    // Latency (ms)
    pub ttft_ms: Percentiles,
    pub e2e_ms: Percentiles,
    pub itl_ms: Percentiles,
    pub scheduling_delay_ms: Percentiles,

    // Throughput
    pub requests_per_sec: f64,
    pub output_tokens_per_sec: f64,

    // Cache
    pub peak_kv_utilization: f64,
    pub mean_kv_utilization: f64,
    pub cache_hit_rate: f64,
    /// Running-batch size averaged over every step of every instance.
    pub mean_batch_size: f64,

    // Fairness
    pub per_instance_completed: Vec<u64>,
    pub jains_fairness_index: f64,
    pub load_cv: f64,

    // Anomalies
    pub hol_blocking_events: usize,
    pub priority_inversions: usize,

    pub custom_metrics: BTreeMap<String, f64>,
}

impl ClusterMetrics {
    /// Fold per-instance metrics (in index order) and cluster counters.
    ///
    /// `records` must already be sorted by request id.
    pub fn aggregate(
        labels: RunLabels,
        counters: ClusterCounters,
        instances: &[InstanceMetrics],
        records: &[RequestRecord],
        duration_us: u64,
    ) -> Self {
        let completed = total(instances, |m| m.completed);
        let still_queued = total(instances, |m| m.still_queued) + counters.in_pipeline;
        let still_running = total(instances, |m| m.still_running);
        let dropped_unservable = total(instances, |m| m.dropped_unservable);
        let output_tokens = total(instances, |m| m.output_tokens);
        let injected = counters.offered.saturating_sub(counters.rejected);
        let conservation_holds = completed + still_queued + still_running + dropped_unservable
            + counters.rejected
            == counters.offered;

        let finished: Vec<&RequestRecord> = records.iter().filter(|r| r.finished).collect();
        let ttft: Vec<f64> = records
            .iter()
            .filter_map(|r| r.ttft_us.map(us_to_ms))
            .collect();
        let e2e: Vec<f64> = finished
            .iter()
            .filter_map(|r| r.e2e_us.map(us_to_ms))
            .collect();
        let itl: Vec<f64> = records
            .iter()
            .flat_map(|r| r.itl_samples_us.iter().copied().map(us_to_ms))
            .collect();
        let scheduling: Vec<f64> = records
            .iter()
            .filter_map(|r| r.scheduling_delay_us.map(us_to_ms))
            .collect();

        let duration_secs = duration_us as f64 / 1e6;
        let per_sec = |v: u64| {
            if duration_secs > 0.0 {
                v as f64 / duration_secs
            } else {
                0.0
            }
        };

        let hits = total(instances, |m| m.cache_hits);
        let lookups = hits + total(instances, |m| m.cache_misses);
        let per_instance_completed: Vec<u64> = instances.iter().map(|m| m.completed).collect();
        let peak_kv_utilization = instances
            .iter()
            .map(|m| m.peak_kv_utilization)
            .fold(0.0, f64::max);
        let mean_kv_utilization = if instances.is_empty() {
            0.0
        } else {
            instances.iter().map(|m| m.mean_kv_utilization()).sum::<f64>() / instances.len() as f64
        };
        let batch_samples: Vec<usize> = instances
            .iter()
            .flat_map(|m| m.running_samples.iter().copied())
            .collect();
        let mean_batch_size = if batch_samples.is_empty() {
            0.0
        } else {
            batch_samples.iter().sum::<usize>() as f64 / batch_samples.len() as f64
        };

        Self {
            labels,
            duration_us,
            offered: counters.offered,
            unarrived: counters.unarrived,
            injected,
            rejected: counters.rejected,
            completed,
            still_queued,
            still_running,
            dropped_unservable,
            preemptions: total(instances, |m| m.preemptions),
            conservation_holds,
            ttft_ms: Percentiles::from_values(&ttft),
            e2e_ms: Percentiles::from_values(&e2e),
            itl_ms: Percentiles::from_values(&itl),
            scheduling_delay_ms: Percentiles::from_values(&scheduling),
            requests_per_sec: per_sec(completed),
            output_tokens_per_sec: per_sec(output_tokens),
            peak_kv_utilization,
            mean_kv_utilization,
            cache_hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            mean_batch_size,
            jains_fairness_index: jains_fairness_index(&per_instance_completed),
            load_cv: coefficient_of_variation(&per_instance_completed),
            per_instance_completed,
            hol_blocking_events: 0,
            priority_inversions: 0,
            custom_metrics: BTreeMap::new(),
        }
    }
}

fn total(instances: &[InstanceMetrics], f: impl Fn(&InstanceMetrics) -> u64) -> u64 {
    instances.iter().map(f).sum()
}

/// Coefficient of variation (std / mean).
pub fn coefficient_of_variation(values: &[u64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<u64>() as f64 / n;
    if mean == 0.0 {
        return 0.0;
    }
    let variance = values
        .iter()
        .map(|&v| (v as f64 - mean).powi(2))
        .sum::<f64>()
        / n;
    variance.sqrt() / mean
}

/// Jain's fairness index: (sum(x_i))^2 / (n * sum(x_i^2)).
pub fn jains_fairness_index(values: &[u64]) -> f64 {
    if values.is_empty() {
        return 1.0;
    }
    let n = values.len() as f64;
    let sum: f64 = values.iter().map(|&v| v as f64).sum();
    let sum_sq: f64 = values.iter().map(|&v| (v as f64).powi(2)).sum();
    if sum_sq == 0.0 {
        return 1.0;
    }
    (sum * sum) / (n * sum_sq)
}

/// Format metrics as a pretty-printed table string.
pub fn format_table(metrics: &ClusterMetrics) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "\n{:=<72}\n",
        format!("  {} Results  ", metrics.labels.name)
    ));
    out.push_str(&format!(
        "  Policies: admission={} routing={} scheduler={} priority={}\n",
        metrics.labels.admission,
        metrics.labels.routing,
        metrics.labels.scheduler,
        metrics.labels.priority,
    ));
    out.push_str(&format!(
        "  Duration: {:.3}s | Offered: {} | Injected: {} | Rejected: {}\n",
        metrics.duration_us as f64 / 1e6,
        metrics.offered,
        metrics.injected,
        metrics.rejected
    ));
    out.push_str(&format!("{:-<72}\n", "  Conservation  "));
    out.push_str(&format!(
        "  Completed: {}  Queued: {}  Running: {}  Dropped: {}  Preemptions: {}  [{}]\n",
        metrics.completed,
        metrics.still_queued,
        metrics.still_running,
        metrics.dropped_unservable,
        metrics.preemptions,
        if metrics.conservation_holds { "ok" } else { "VIOLATED" },
    ));
    out.push_str(&format!("{:-<72}\n", "  Latency  "));
    for (label, p) in [
        ("TTFT (ms)", &metrics.ttft_ms),
        ("E2E (ms)", &metrics.e2e_ms),
        ("ITL (ms)", &metrics.itl_ms),
        ("Sched (ms)", &metrics.scheduling_delay_ms),
    ] {
        out.push_str(&format!(
            "  {:<12} P50={:>9.2}  P90={:>9.2}  P99={:>9.2}\n",
            label, p.p50, p.p90, p.p99
        ));
    }
    out.push_str(&format!("{:-<72}\n", "  Throughput  "));
    out.push_str(&format!(
        "  Requests/sec: {:.1}  Output tokens/sec: {:.0}\n",
        metrics.requests_per_sec, metrics.output_tokens_per_sec,
    ));
    out.push_str(&format!("{:-<72}\n", "  KV cache  "));
    out.push_str(&format!(
        "  Peak: {:.1}%  Mean: {:.1}%  Prefix hit rate: {:.1}%  Mean batch: {:.1}\n",
        metrics.peak_kv_utilization * 100.0,
        metrics.mean_kv_utilization * 100.0,
        metrics.cache_hit_rate * 100.0,
        metrics.mean_batch_size,
    ));
    out.push_str(&format!("{:-<72}\n", "  Fairness & anomalies  "));
    out.push_str(&format!(
        "  Jain's index: {:.4}  Load CV: {:.3}  HOL blocking: {}  Priority inversions: {}\n",
        metrics.jains_fairness_index,
        metrics.load_cv,
        metrics.hol_blocking_events,
        metrics.priority_inversions,
    ));
    out.push_str(&format!("{:=<72}\n", ""));
    out
}

/// Format a comparison table of several runs.
pub fn format_comparison_table(results: &[ClusterMetrics]) -> String {
    if results.is_empty() {
        return String::from("No results to compare.\n");
    }

    let mut out = String::new();
    out.push_str(&format!("\n{:=<100}\n", "  Policy Comparison  "));
    out.push_str(&format!(
        "{:<24} {:>9} {:>9} {:>9} {:>9} {:>8} {:>7} {:>7} {:>8}\n",
        "Run", "TTFT p50", "TTFT p99", "E2E p50", "E2E p99", "Req/s", "Done", "Preempt", "Jain's"
    ));
    out.push_str(&format!("{:-<100}\n", ""));

    for m in results {
        out.push_str(&format!(
            "{:<24} {:>9.2} {:>9.2} {:>9.2} {:>9.2} {:>8.1} {:>7} {:>7} {:>8.4}\n",
            m.labels.name,
            m.ttft_ms.p50,
            m.ttft_ms.p99,
            m.e2e_ms.p50,
            m.e2e_ms.p99,
            m.requests_per_sec,
            m.completed,
            m.preemptions,
            m.jains_fairness_index,
        ));
    }
    out.push_str(&format!("{:=<100}\n", ""));
    out
}
