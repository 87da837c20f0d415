//! Multi-instance cluster simulator.
//!
//! Arrivals flow through a fixed pipeline before reaching an instance:
//!
//! ```text
//! Arrival ──admission_latency──▶ Admission ──routing_latency──▶ Routing ──▶ instance
//!                                    │                             │
//!                                    └──────── rejected ◀──────────┘
//! ```
//!
//! Every offered request ends up in exactly one of: rejected, still in the
//! pipeline, queued, running, completed, or dropped as unservable.

use std::sync::Arc;

use servesim_policies::{
    AdmissionDecision, AdmissionPolicy, InstanceSnapshot, PolicyError, RoutingDecision,
    RoutingPolicy,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::anomaly::{detect_hol_blocking, detect_priority_inversions};
use crate::clock::SimClock;
use crate::config::{ConfigError, SimConfig};
use crate::event::{EventQueue, SimEvent};
use crate::instance::InstanceSimulator;
use crate::latency::{LatencyError, LatencyModel};
use crate::metrics::{ClusterCounters, ClusterMetrics, InstanceMetrics, RequestRecord};
use crate::request::Request;

#[derive(Error, Debug)]
pub enum SimError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Latency(#[from] LatencyError),
}

/// N instances behind one admission policy and one routing policy.
pub struct ClusterSimulator {
    config: SimConfig,
    instances: Vec<InstanceSimulator>,
    admission: Box<dyn AdmissionPolicy>,
    routing: Box<dyn RoutingPolicy>,
    events: EventQueue<SimEvent>,
    counters: ClusterCounters,
    events_processed: u64,
}

impl ClusterSimulator {
    /// Build the cluster and schedule every request arriving within the
    /// horizon. Later arrivals are counted as unarrived and never offered.
    pub fn new(config: SimConfig, requests: Vec<Request>) -> Result<Self, SimError> {
        config.validate()?;
        let latency: Arc<dyn LatencyModel> = Arc::new(config.latency_model()?);
        let spec = config.instance_spec();

        let mut instances = Vec::with_capacity(config.cluster.num_instances);
        for id in 0..config.cluster.num_instances {
            instances.push(InstanceSimulator::new(
                id,
                spec,
                servesim_policies::scheduler_by_name(&config.instance.scheduler)?,
                servesim_policies::priority_by_name(&config.instance.priority_policy)?,
                Arc::clone(&latency),
            ));
        }
        let admission = servesim_policies::admission_by_name(
            &config.cluster.admission_policy,
            config.token_bucket(),
        )?;
        let routing = servesim_policies::routing_by_name(&config.cluster.routing_policy)?;

        let mut sim = Self {
            config,
            instances,
            admission,
            routing,
            events: EventQueue::new(),
            counters: ClusterCounters::default(),
            events_processed: 0,
        };
        let horizon = sim.horizon_us();
        for request in requests {
            if horizon.is_some_and(|h| request.arrival_us > h) {
                sim.counters.unarrived += 1;
                continue;
            }
            sim.counters.offered += 1;
            sim.events.schedule(request.arrival_us, SimEvent::Arrival(request));
        }
        Ok(sim)
    }

    pub fn horizon_us(&self) -> Option<u64> {
        self.config.simulation.horizon_us
    }

    pub fn instances(&self) -> &[InstanceSimulator] {
        &self.instances
    }

    pub fn now_us(&self) -> u64 {
        self.events.now()
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed
    }

    /// Admit and route one request immediately at `now_us`, skipping the
    /// pipeline latencies. Returns whether it reached an instance.
    ///
    /// `now_us` may precede `request.arrival_us`; latencies measured from
    /// arrival then clamp at zero.
    ///
    /// # Panics
    ///
    /// Panics if `now_us` is earlier than the simulation clock.
    pub fn offer(&mut self, request: Request, now_us: u64) -> bool {
        self.counters.offered += 1;
        if !self.admit(&request, now_us) {
            self.counters.rejected += 1;
            return false;
        }
        self.hand_off(request, now_us)
    }

    /// Run to the horizon (or until no events remain) and report.
    pub fn run(&mut self) -> ClusterMetrics {
        let horizon = self.horizon_us();
        while let Some(next) = self.events.peek_time() {
            if horizon.is_some_and(|h| next > h) {
                debug!(next_us = next, "horizon reached");
                break;
            }
            let Some((now, event)) = self.events.advance() else {
                break;
            };
            self.dispatch(now, event);
            self.events_processed += 1;
        }

        let metrics = self.aggregated_metrics();
        info!(
            name = %self.config.simulation.name,
            time_us = self.events.now(),
            events = self.events_processed,
            offered = metrics.offered,
            completed = metrics.completed,
            rejected = metrics.rejected,
            preemptions = metrics.preemptions,
            conservation = metrics.conservation_holds,
            "simulation finished"
        );
        if !metrics.conservation_holds {
            warn!(
                offered = metrics.offered,
                completed = metrics.completed,
                queued = metrics.still_queued,
                running = metrics.still_running,
                dropped = metrics.dropped_unservable,
                rejected = metrics.rejected,
                "request conservation violated"
            );
        }
        metrics
    }

    fn dispatch(&mut self, now: u64, event: SimEvent) {
        match event {
            SimEvent::Arrival(request) => {
                debug!(request = request.id, time_us = now, "arrival");
                self.counters.in_pipeline += 1;
                let at = now + self.config.cluster.admission_latency_us;
                self.events.schedule(at, SimEvent::Admission(request));
            }
            SimEvent::Admission(request) => {
                if self.admit(&request, now) {
                    let at = now + self.config.cluster.routing_latency_us;
                    self.events.schedule(at, SimEvent::Routing(request));
                } else {
                    self.counters.in_pipeline -= 1;
                    self.counters.rejected += 1;
                }
            }
            SimEvent::Routing(request) => {
                self.counters.in_pipeline -= 1;
                self.hand_off(request, now);
            }
            SimEvent::Queued { instance, request } => {
                self.instances[instance].on_queued(request, now, &mut self.events);
            }
            SimEvent::StepComplete { instance } => {
                self.instances[instance].on_step_complete(now, &mut self.events);
            }
        }
    }

    fn snapshots(&self, request: &Request) -> Vec<InstanceSnapshot> {
        self.instances.iter().map(|i| i.snapshot(request)).collect()
    }

    fn admit(&mut self, request: &Request, now_us: u64) -> bool {
        let snapshots = self.snapshots(request);
        let clock = SimClock::starting_at_us(now_us);
        match self.admission.admit(&request.info(), &snapshots, &clock) {
            AdmissionDecision::Admit => true,
            AdmissionDecision::Reject { reason } => {
                debug!(
                    request = request.id,
                    time_us = now_us,
                    reason,
                    "rejected at admission"
                );
                false
            }
        }
    }

    /// Route an admitted request. A routing rejection counts as rejected.
    fn hand_off(&mut self, request: Request, now_us: u64) -> bool {
        let snapshots = self.snapshots(&request);
        let clock = SimClock::starting_at_us(now_us);
        match self.routing.route(&request.info(), &snapshots, &clock) {
            RoutingDecision::Route(target) if target < self.instances.len() => {
                debug!(request = request.id, instance = target, time_us = now_us, "routed");
                self.instances[target].route_in(request, now_us, &mut self.events);
                true
            }
            RoutingDecision::Route(target) => {
                warn!(
                    request = request.id,
                    instance = target,
                    instances = self.instances.len(),
                    "routing chose a missing instance, rejecting"
                );
                self.counters.rejected += 1;
                false
            }
            RoutingDecision::Reject => {
                debug!(request = request.id, time_us = now_us, "rejected at routing");
                self.counters.rejected += 1;
                false
            }
        }
    }

    pub fn offered(&self) -> u64 {
        self.counters.offered
    }

    pub fn rejected(&self) -> u64 {
        self.counters.rejected
    }

    /// Requests that passed admission and routing.
    pub fn injected(&self) -> u64 {
        self.counters.offered.saturating_sub(self.counters.rejected)
    }

    /// Every offered request is rejected, in the pipeline, or accounted for
    /// by exactly one instance.
    pub fn conservation_holds(&self) -> bool {
        let in_instances: u64 = self.instances.iter().map(|i| i.accounted()).sum();
        in_instances + self.counters.in_pipeline + self.counters.rejected == self.counters.offered
    }

    /// Per-instance reports in index order.
    pub fn instance_reports(&self) -> Vec<InstanceMetrics> {
        self.instances.iter().map(|i| i.report()).collect()
    }

    /// Request records from every instance, sorted by request id.
    pub fn records(&self) -> Vec<RequestRecord> {
        collect_records(&self.instance_reports())
    }

    /// Cluster-wide metrics as of the current simulated time.
    pub fn aggregated_metrics(&self) -> ClusterMetrics {
        let reports = self.instance_reports();
        let records = collect_records(&reports);
        let mut metrics = ClusterMetrics::aggregate(
            self.config.labels(),
            self.counters,
            &reports,
            &records,
            self.events.now(),
        );
        let depth_samples: Vec<&[usize]> = reports
            .iter()
            .map(|m| m.queue_depth_samples.as_slice())
            .collect();
        metrics.hol_blocking_events = detect_hol_blocking(&depth_samples);
        metrics.priority_inversions =
            detect_priority_inversions(&records, &self.config.instance.priority_policy);
        metrics.custom_metrics = self.routing.custom_metrics();
        metrics
    }
}

fn collect_records(reports: &[InstanceMetrics]) -> Vec<RequestRecord> {
    let mut records: Vec<RequestRecord> = reports
        .iter()
        .flat_map(|m| m.records.iter().cloned())
        .collect();
    records.sort_by_key(|r| r.request_id);
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(toml: &str) -> SimConfig {
        SimConfig::from_str(toml).unwrap()
    }

    fn request(id: u64, arrival_us: u64) -> Request {
        Request {
            id,
            arrival_us,
            input_tokens: 64,
            output_tokens: 8,
            slo_class: String::new(),
            prefix_hashes: Vec::new(),
        }
    }

    const TWO_INSTANCES: &str = r#"
[cluster]
num_instances = 2

[latency]
beta = [1000.0, 1.0, 1.0]
alpha = [0.0, 0.0, 0.0]
"#;

    #[test]
    fn test_offer_routes_to_least_loaded() {
        let mut sim = ClusterSimulator::new(config(TWO_INSTANCES), Vec::new()).unwrap();
        assert!(sim.offer(request(0, 0), 0));
        assert!(sim.offer(request(1, 0), 0));
        assert_eq!(sim.instances()[0].pending(), 1);
        assert_eq!(sim.instances()[1].pending(), 1);
        assert!(sim.conservation_holds());
        assert_eq!(sim.injected(), 2);
    }

    #[test]
    fn test_offer_before_arrival_time_clamps_latencies() {
        let mut sim = ClusterSimulator::new(config(TWO_INSTANCES), Vec::new()).unwrap();
        assert!(sim.offer(request(0, 5_000_000), 0));
        let metrics = sim.run();
        assert_eq!(metrics.completed, 1);
        let records = sim.records();
        assert_eq!(records[0].scheduling_delay_us, Some(0));
        assert_eq!(records[0].ttft_us, Some(0));
        assert_eq!(records[0].e2e_us, Some(0));
        assert!(metrics.conservation_holds);
    }

    #[test]
    fn test_reject_all_counts_rejections() {
        let toml = TWO_INSTANCES.replace(
            "num_instances = 2",
            "num_instances = 2\nadmission_policy = \"reject-all\"",
        );
        let requests = (0..5).map(|i| request(i, i * 10)).collect();
        let mut sim = ClusterSimulator::new(config(&toml), requests).unwrap();
        let metrics = sim.run();
        assert_eq!(metrics.offered, 5);
        assert_eq!(metrics.rejected, 5);
        assert_eq!(metrics.injected, 0);
        assert!(metrics.conservation_holds);
    }

    #[test]
    fn test_run_completes_everything() {
        let requests = (0..20).map(|i| request(i, i * 100)).collect();
        let mut sim = ClusterSimulator::new(config(TWO_INSTANCES), requests).unwrap();
        let metrics = sim.run();
        assert_eq!(metrics.completed, 20);
        assert_eq!(metrics.still_queued + metrics.still_running, 0);
        assert!(metrics.conservation_holds);
        assert_eq!(metrics.per_instance_completed.iter().sum::<u64>(), 20);
        let ids: Vec<u64> = sim.records().iter().map(|r| r.request_id).collect();
        assert_eq!(ids, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_arrivals_past_horizon_are_unarrived() {
        let toml = format!("[simulation]\nhorizon_us = 1000\n{TWO_INSTANCES}");
        let requests = vec![request(0, 0), request(1, 1000), request(2, 1001)];
        let mut sim = ClusterSimulator::new(config(&toml), requests).unwrap();
        let metrics = sim.run();
        assert_eq!(metrics.offered, 2);
        assert_eq!(metrics.unarrived, 1);
        assert!(metrics.conservation_holds);
        assert!(sim.now_us() <= 1000);
    }

    #[test]
    fn test_pipeline_latency_counts_as_queued() {
        let toml = format!(
            "[simulation]\nhorizon_us = 50\n{}",
            TWO_INSTANCES.replace(
                "num_instances = 2",
                "num_instances = 2\nadmission_latency_us = 100"
            )
        );
        let mut sim = ClusterSimulator::new(config(&toml), vec![request(0, 0)]).unwrap();
        let metrics = sim.run();
        assert_eq!(metrics.completed, 0);
        assert_eq!(metrics.still_queued, 1);
        assert!(metrics.conservation_holds);
    }

    #[test]
    fn test_unknown_policy_is_config_error() {
        let toml = TWO_INSTANCES.replace(
            "num_instances = 2",
            "num_instances = 2\nrouting_policy = \"nope\"",
        );
        let mut cfg = config(TWO_INSTANCES);
        cfg.cluster.routing_policy = "nope".to_string();
        assert!(matches!(
            ClusterSimulator::new(cfg, Vec::new()),
            Err(SimError::Config(ConfigError::Validation(_)))
        ));
        assert!(SimConfig::from_str(&toml).is_err());
    }
}
