//! servesim: deterministic discrete-event simulator for LLM inference
//! serving.
//!
//! Models a cluster of serving instances, each running continuous batching
//! over a paged KV cache, behind pluggable admission and routing policies
//! from `servesim-policies`. All timing comes from a [`LatencyModel`]; the
//! simulated clock is an integer microsecond counter, so identical inputs
//! always produce identical output.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐     ┌──────────────────────────────┐     ┌──────────┐
//! │ Workload │────▶│ Cluster (EventQueue)         │────▶│ Metrics  │
//! │ / Trace  │     │ admission ─▶ routing         │     │ Anomaly  │
//! └──────────┘     └──────────────┬───────────────┘     └──────────┘
//!                                 │
//!               ┌─────────────────┼─────────────────┐
//!               ▼                 ▼                 ▼
//!        ┌────────────┐    ┌────────────┐    ┌────────────┐
//!        │ Instance 0 │    │ Instance 1 │    │ Instance N │
//!        │ batch form │    │ batch form │    │ batch form │
//!        │ preemption │    │ preemption │    │ preemption │
//!        │ KV blocks  │    │ KV blocks  │    │ KV blocks  │
//!        └────────────┘    └────────────┘    └────────────┘
//! ```

pub mod anomaly;
pub mod batch;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod event;
pub mod instance;
pub mod kv_cache;
pub mod latency;
pub mod metrics;
pub mod preemption;
pub mod request;
pub mod trace;
pub mod workload;

// Re-export key types for convenience.
pub use anomaly::{detect_hol_blocking, detect_priority_inversions};
pub use batch::{BatchFormation, BatchLimits, StepPlan};
pub use clock::SimClock;
pub use cluster::{ClusterSimulator, SimError};
pub use config::{ConfigError, SimConfig};
pub use event::{EventKind, EventQueue, SimEvent};
pub use instance::{InstanceSimulator, InstanceSpec};
pub use kv_cache::KvBlockManager;
pub use latency::{BatchShape, BlackboxLatencyModel, LatencyError, LatencyModel};
pub use metrics::{ClusterMetrics, InstanceMetrics, RequestRecord};
pub use request::{ActiveRequest, Request, RequestState};
pub use trace::{load_trace, write_jsonl, TraceError, TraceRecord};

/// Which policy slot a comparison varies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    Admission,
    Routing,
    Scheduler,
    Priority,
}

impl PolicyKind {
    fn apply(self, config: &mut SimConfig, name: &str) {
        let slot = match self {
            PolicyKind::Admission => &mut config.cluster.admission_policy,
            PolicyKind::Routing => &mut config.cluster.routing_policy,
            PolicyKind::Scheduler => &mut config.instance.scheduler,
            PolicyKind::Priority => &mut config.instance.priority_policy,
        };
        *slot = name.to_string();
    }
}

/// Run a complete simulation with the given config and requests.
pub fn run_simulation(
    config: SimConfig,
    requests: Vec<Request>,
) -> Result<ClusterMetrics, SimError> {
    let mut sim = ClusterSimulator::new(config, requests)?;
    Ok(sim.run())
}

/// Run the same workload once per policy name in one slot.
pub fn compare_policies(
    config: &SimConfig,
    requests: &[Request],
    kind: PolicyKind,
    names: &[&str],
) -> Result<Vec<ClusterMetrics>, SimError> {
    names
        .iter()
        .map(|name| {
            let mut cfg = config.clone();
            kind.apply(&mut cfg, name);
            run_simulation(cfg, requests.to_vec())
        })
        .collect()
}

/// Regenerate the synthetic workload at each arrival rate and run it.
pub fn sweep_rates(config: &SimConfig, rates: &[f64]) -> Result<Vec<ClusterMetrics>, SimError> {
    rates
        .iter()
        .map(|&rate| {
            let mut cfg = config.clone();
            cfg.workload.rate_per_sec = rate;
            cfg.workload.trace_path = None;
            cfg.simulation.name = format!("{}@{}rps", config.simulation.name, rate);
            cfg.validate()?;
            let requests = workload::generate(
                &cfg.workload,
                cfg.simulation.seed,
                cfg.instance.block_size_tokens,
            );
            run_simulation(cfg, requests)
        })
        .collect()
}
