//! TOML configuration parsing for servesim.
//!
//! One file describes a complete run: the cluster and its policies, the
//! per-instance batch limits and KV cache, the latency coefficients, and the
//! workload (synthetic or a JSONL trace).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use servesim_policies::{TokenBucketParams, TokenCost};
use thiserror::Error;

use crate::batch::BatchLimits;
use crate::instance::InstanceSpec;
use crate::latency::{BlackboxLatencyModel, LatencyError};
use crate::metrics::RunLabels;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
}

/// Top-level simulation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    #[serde(default)]
    pub simulation: SimulationSection,
    pub cluster: ClusterSection,
    #[serde(default)]
    pub instance: InstanceSection,
    #[serde(default)]
    pub latency: LatencySection,
    #[serde(default)]
    pub workload: WorkloadSection,
}

/// General simulation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationSection {
    /// Human-readable name for this run.
    #[serde(default = "default_sim_name")]
    pub name: String,
    /// Seed for workload generation.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Stop before the first event later than this. Unbounded when absent.
    #[serde(default)]
    pub horizon_us: Option<u64>,
}

fn default_sim_name() -> String {
    "simulation".to_string()
}

fn default_seed() -> u64 {
    42
}

impl Default for SimulationSection {
    fn default() -> Self {
        Self {
            name: default_sim_name(),
            seed: default_seed(),
            horizon_us: None,
        }
    }
}

/// Cluster shape and the admission/routing pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSection {
    pub num_instances: usize,
    #[serde(default = "default_admission")]
    pub admission_policy: String,
    #[serde(default = "default_routing")]
    pub routing_policy: String,
    /// Delay between arrival and the admission decision.
    #[serde(default)]
    pub admission_latency_us: u64,
    /// Delay between admission and the routing decision.
    #[serde(default)]
    pub routing_latency_us: u64,
    #[serde(default = "default_bucket_capacity")]
    pub token_bucket_capacity: f64,
    #[serde(default = "default_bucket_refill")]
    pub token_bucket_refill_per_sec: f64,
    /// What one admission costs the bucket.
    #[serde(default)]
    pub token_bucket_cost: TokenCost,
}

fn default_admission() -> String {
    "always-admit".to_string()
}
fn default_routing() -> String {
    "least-loaded".to_string()
}
fn default_bucket_capacity() -> f64 {
    5000.0
}
fn default_bucket_refill() -> f64 {
    10000.0
}

/// Per-instance scheduler, cache and batch limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSection {
    #[serde(default = "default_scheduler")]
    pub scheduler: String,
    #[serde(default = "default_priority")]
    pub priority_policy: String,
    #[serde(default = "default_kv_blocks")]
    pub kv_blocks: usize,
    #[serde(default = "default_block_size")]
    pub block_size_tokens: u32,
    #[serde(default = "default_max_running")]
    pub max_running_requests: usize,
    #[serde(default = "default_max_scheduled_tokens")]
    pub max_scheduled_tokens: u32,
    /// Upper bound on one prefill chunk. 0 disables chunking beyond the
    /// token budget.
    #[serde(default)]
    pub long_prefill_threshold: u32,
}

fn default_scheduler() -> String {
    "fcfs".to_string()
}
fn default_priority() -> String {
    "constant".to_string()
}
fn default_kv_blocks() -> usize {
    10000
}
fn default_block_size() -> u32 {
    16
}
fn default_max_running() -> usize {
    256
}
fn default_max_scheduled_tokens() -> u32 {
    2048
}

impl Default for InstanceSection {
    fn default() -> Self {
        Self {
            scheduler: default_scheduler(),
            priority_policy: default_priority(),
            kv_blocks: default_kv_blocks(),
            block_size_tokens: default_block_size(),
            max_running_requests: default_max_running(),
            max_scheduled_tokens: default_max_scheduled_tokens(),
            long_prefill_threshold: 0,
        }
    }
}

/// Linear latency coefficients, all in microseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencySection {
    /// Step time: `beta[0] + beta[1] * prefill + beta[2] * decode`.
    #[serde(default = "default_beta")]
    pub beta: Vec<f64>,
    /// Queueing `alpha[0] + alpha[1] * input`; `alpha[2]` per output token.
    #[serde(default = "default_alpha")]
    pub alpha: Vec<f64>,
    #[serde(default)]
    pub scheduling_overhead_us: u64,
    #[serde(default)]
    pub preemption_overhead_us: u64,
}

fn default_beta() -> Vec<f64> {
    vec![1000.0, 10.0, 5.0]
}
fn default_alpha() -> Vec<f64> {
    vec![100.0, 1.0, 100.0]
}

impl Default for LatencySection {
    fn default() -> Self {
        Self {
            beta: default_beta(),
            alpha: default_alpha(),
            scheduling_overhead_us: 0,
            preemption_overhead_us: 0,
        }
    }
}

/// Synthetic workload parameters, or a trace to replay instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadSection {
    #[serde(default = "default_rate")]
    pub rate_per_sec: f64,
    #[serde(default = "default_num_requests")]
    pub num_requests: usize,
    #[serde(default = "default_input_mean")]
    pub input_tokens_mean: f64,
    #[serde(default = "default_input_std")]
    pub input_tokens_std: f64,
    #[serde(default = "default_input_min")]
    pub input_tokens_min: u32,
    #[serde(default = "default_input_max")]
    pub input_tokens_max: u32,
    #[serde(default = "default_output_mean")]
    pub output_tokens_mean: f64,
    #[serde(default = "default_output_std")]
    pub output_tokens_std: f64,
    #[serde(default = "default_output_min")]
    pub output_tokens_min: u32,
    #[serde(default = "default_output_max")]
    pub output_tokens_max: u32,
    /// Number of shared-prefix groups. 0 disables prefix sharing.
    #[serde(default)]
    pub prefix_groups: u32,
    /// Blocks of shared prefix per group.
    #[serde(default)]
    pub prefix_blocks: u32,
    /// Cycled over requests in arrival order when non-empty.
    #[serde(default)]
    pub slo_classes: Vec<String>,
    /// JSONL trace replayed instead of generating requests.
    #[serde(default)]
    pub trace_path: Option<PathBuf>,
}

fn default_rate() -> f64 {
    100.0
}
fn default_num_requests() -> usize {
    200
}
fn default_input_mean() -> f64 {
    100.0
}
fn default_input_std() -> f64 {
    20.0
}
fn default_input_min() -> u32 {
    10
}
fn default_input_max() -> u32 {
    200
}
fn default_output_mean() -> f64 {
    50.0
}
fn default_output_std() -> f64 {
    10.0
}
fn default_output_min() -> u32 {
    10
}
fn default_output_max() -> u32 {
    100
}

impl Default for WorkloadSection {
    fn default() -> Self {
        Self {
            rate_per_sec: default_rate(),
            num_requests: default_num_requests(),
            input_tokens_mean: default_input_mean(),
            input_tokens_std: default_input_std(),
            input_tokens_min: default_input_min(),
            input_tokens_max: default_input_max(),
            output_tokens_mean: default_output_mean(),
            output_tokens_std: default_output_std(),
            output_tokens_min: default_output_min(),
            output_tokens_max: default_output_max(),
            prefix_groups: 0,
            prefix_blocks: 0,
            slo_classes: Vec::new(),
            trace_path: None,
        }
    }
}

impl SimConfig {
    /// Load and validate a configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse and validate a configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, ConfigError> {
        let config: SimConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field and report all problems together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        let c = &self.cluster;
        let i = &self.instance;
        let w = &self.workload;

        if c.num_instances == 0 {
            errors.push("cluster.num_instances must be > 0".to_string());
        }
        if let Err(e) =
            servesim_policies::admission_by_name(&c.admission_policy, self.token_bucket())
        {
            errors.push(format!("cluster.admission_policy: {e}"));
        }
        if let Err(e) = servesim_policies::routing_by_name(&c.routing_policy) {
            errors.push(format!("cluster.routing_policy: {e}"));
        }
        if c.admission_policy == "token-bucket" {
            if !(c.token_bucket_capacity.is_finite() && c.token_bucket_capacity > 0.0) {
                errors.push(format!(
                    "cluster.token_bucket_capacity must be > 0, got {}",
                    c.token_bucket_capacity
                ));
            }
            if !(c.token_bucket_refill_per_sec.is_finite() && c.token_bucket_refill_per_sec > 0.0)
            {
                errors.push(format!(
                    "cluster.token_bucket_refill_per_sec must be > 0, got {}",
                    c.token_bucket_refill_per_sec
                ));
            }
        }

        if let Err(e) = servesim_policies::scheduler_by_name(&i.scheduler) {
            errors.push(format!("instance.scheduler: {e}"));
        }
        if let Err(e) = servesim_policies::priority_by_name(&i.priority_policy) {
            errors.push(format!("instance.priority_policy: {e}"));
        }
        if i.kv_blocks == 0 {
            errors.push("instance.kv_blocks must be > 0".to_string());
        }
        if i.block_size_tokens == 0 {
            errors.push("instance.block_size_tokens must be > 0".to_string());
        }
        if (i.kv_blocks as u64).saturating_mul(u64::from(i.block_size_tokens))
            > u64::from(u32::MAX)
        {
            errors.push(format!(
                "instance.kv_blocks * block_size_tokens must not exceed {} tokens",
                u32::MAX
            ));
        }
        if i.max_running_requests == 0 {
            errors.push("instance.max_running_requests must be > 0".to_string());
        }
        if i.max_scheduled_tokens == 0 {
            errors.push("instance.max_scheduled_tokens must be > 0".to_string());
        }

        if let Err(LatencyError::InvalidCoefficients(problems)) = self.latency_model() {
            errors.extend(problems.into_iter().map(|p| format!("latency.{p}")));
        }

        if w.trace_path.is_none() {
            if !(w.rate_per_sec.is_finite() && w.rate_per_sec > 0.0) {
                errors.push(format!(
                    "workload.rate_per_sec must be > 0, got {}",
                    w.rate_per_sec
                ));
            }
            if w.input_tokens_min > w.input_tokens_max {
                errors.push(format!(
                    "workload.input_tokens_min ({}) exceeds input_tokens_max ({})",
                    w.input_tokens_min, w.input_tokens_max
                ));
            }
            if w.output_tokens_min > w.output_tokens_max {
                errors.push(format!(
                    "workload.output_tokens_min ({}) exceeds output_tokens_max ({})",
                    w.output_tokens_min, w.output_tokens_max
                ));
            }
            if w.prefix_groups > 0 && w.prefix_blocks == 0 {
                errors.push(
                    "workload.prefix_blocks must be > 0 when prefix_groups is set".to_string(),
                );
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    pub fn instance_spec(&self) -> InstanceSpec {
        InstanceSpec {
            kv_blocks: self.instance.kv_blocks,
            block_size: self.instance.block_size_tokens,
            limits: BatchLimits {
                max_running: self.instance.max_running_requests,
                max_scheduled_tokens: self.instance.max_scheduled_tokens,
                long_prefill_threshold: self.instance.long_prefill_threshold,
            },
        }
    }

    pub fn latency_model(&self) -> Result<BlackboxLatencyModel, LatencyError> {
        BlackboxLatencyModel::new(
            &self.latency.beta,
            &self.latency.alpha,
            self.latency.scheduling_overhead_us,
            self.latency.preemption_overhead_us,
        )
    }

    pub fn token_bucket(&self) -> TokenBucketParams {
        TokenBucketParams {
            capacity: self.cluster.token_bucket_capacity,
            refill_per_sec: self.cluster.token_bucket_refill_per_sec,
            cost: self.cluster.token_bucket_cost,
        }
    }

    pub fn labels(&self) -> RunLabels {
        RunLabels {
            name: self.simulation.name.clone(),
            admission: self.cluster.admission_policy.clone(),
            routing: self.cluster.routing_policy.clone(),
            scheduler: self.instance.scheduler.clone(),
            priority: self.instance.priority_policy.clone(),
        }
    }
}
