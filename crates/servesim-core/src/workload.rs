//! Synthetic workload generation.
//!
//! Arrivals are Poisson (exponential inter-arrival gaps, at least 1 µs).
//! Input and output lengths are normal samples rounded and clamped to the
//! configured range. All randomness comes from one `ChaCha8Rng` seeded by
//! the caller, so the same seed always yields the same workload.

use std::path::Path;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::info;

use crate::config::{SimConfig, WorkloadSection};
use crate::request::Request;
use crate::trace::{self, TraceError, TraceRecord};

/// Exponential inter-arrival gap in microseconds for `rate_per_sec`.
fn sample_gap_us(rng: &mut ChaCha8Rng, rate_per_sec: f64) -> u64 {
    // 1 - u lies in (0, 1], so the log is finite.
    let u: f64 = 1.0 - rng.gen::<f64>();
    let gap = -u.ln() / rate_per_sec * 1e6;
    (gap as u64).max(1)
}

/// Standard normal sample (Box–Muller).
fn sample_standard_normal(rng: &mut ChaCha8Rng) -> f64 {
    let u1: f64 = 1.0 - rng.gen::<f64>();
    let u2: f64 = rng.gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// Normal length sample clamped to `[min, max]`.
pub fn sample_length(rng: &mut ChaCha8Rng, mean: f64, std: f64, min: u32, max: u32) -> u32 {
    if min >= max {
        return min;
    }
    let value = sample_standard_normal(rng) * std + mean;
    value.clamp(f64::from(min), f64::from(max)).round() as u32
}

/// Generate trace records for a synthetic workload.
pub fn generate_records(workload: &WorkloadSection, seed: u64) -> Vec<TraceRecord> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut records = Vec::with_capacity(workload.num_requests);
    let mut now_us = 0u64;

    for i in 0..workload.num_requests {
        if i > 0 {
            now_us += sample_gap_us(&mut rng, workload.rate_per_sec);
        }
        let input_tokens = sample_length(
            &mut rng,
            workload.input_tokens_mean,
            workload.input_tokens_std,
            workload.input_tokens_min,
            workload.input_tokens_max,
        );
        let output_tokens = sample_length(
            &mut rng,
            workload.output_tokens_mean,
            workload.output_tokens_std,
            workload.output_tokens_min,
            workload.output_tokens_max,
        );
        let (prefix_group, prefix_blocks) = if workload.prefix_groups > 0 {
            (
                Some(rng.gen_range(0..workload.prefix_groups)),
                Some(workload.prefix_blocks),
            )
        } else {
            (None, None)
        };
        let slo_class = if workload.slo_classes.is_empty() {
            None
        } else {
            Some(workload.slo_classes[i % workload.slo_classes.len()].clone())
        };

        records.push(TraceRecord {
            id: Some(i as u64),
            arrival_us: now_us,
            input_tokens,
            output_tokens,
            slo_class,
            prefix_group,
            prefix_blocks,
        });
    }
    records
}

/// Generate simulator requests for a synthetic workload.
pub fn generate(workload: &WorkloadSection, seed: u64, block_size: u32) -> Vec<Request> {
    generate_records(workload, seed)
        .iter()
        .enumerate()
        .map(|(i, r)| r.to_request(i as u64, block_size))
        .collect()
}

/// Requests for a run: the trace given on the command line, else the
/// configured trace, else a synthetic workload from the configured seed.
pub fn load_requests(
    config: &SimConfig,
    trace_path: Option<&Path>,
) -> Result<Vec<Request>, TraceError> {
    let block_size = config.instance.block_size_tokens;
    match trace_path.or(config.workload.trace_path.as_deref()) {
        Some(path) => trace::load_trace(path, block_size),
        None => {
            let requests = generate(&config.workload, config.simulation.seed, block_size);
            info!(
                requests = requests.len(),
                rate_per_sec = config.workload.rate_per_sec,
                seed = config.simulation.seed,
                "generated synthetic workload"
            );
            Ok(requests)
        }
    }
}
