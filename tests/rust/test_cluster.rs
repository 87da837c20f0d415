/// Cluster-level conservation, liveness and anomaly scenarios.
use servesim_core::config::SimConfig;
use servesim_core::request::Request;
use servesim_core::{workload, ClusterSimulator};

/// Four instances, workload arriving at ten times what they comfortably
/// serve: 200 requests land within the first ~50ms.
fn overload_config(extra_cluster: &str, horizon_us: Option<u64>) -> SimConfig {
    let horizon = horizon_us
        .map(|h| format!("horizon_us = {h}"))
        .unwrap_or_default();
    SimConfig::from_str(&format!(
        r#"
[simulation]
name = "overload"
seed = 7
{horizon}

[cluster]
num_instances = 4
{extra_cluster}

[instance]
kv_blocks = 512
max_running_requests = 16
max_scheduled_tokens = 512

[latency]
beta = [4000.0, 20.0, 100.0]
alpha = [100.0, 1.0, 100.0]

[workload]
rate_per_sec = 4000.0
num_requests = 200
"#
    ))
    .unwrap()
}

fn run(config: SimConfig) -> servesim_core::ClusterMetrics {
    let requests = workload::generate(&config.workload, config.simulation.seed, 16);
    servesim_core::run_simulation(config, requests).unwrap()
}

fn uniform_requests(n: u64, gap_us: u64, input: u32, output: u32) -> Vec<Request> {
    (0..n)
        .map(|id| Request {
            id,
            arrival_us: id * gap_us,
            input_tokens: input,
            output_tokens: output,
            slo_class: String::new(),
            prefix_hashes: Vec::new(),
        })
        .collect()
}

#[test]
fn test_overload_conserves_requests_within_horizon() {
    let metrics = run(overload_config("", Some(500_000)));

    assert_eq!(metrics.offered, 200);
    assert_eq!(metrics.rejected, 0);
    assert_eq!(metrics.injected, 200);
    assert_eq!(metrics.dropped_unservable, 0);
    assert_eq!(
        metrics.completed + metrics.still_queued + metrics.still_running,
        metrics.injected
    );
    assert!(metrics.conservation_holds);
    // Overload leaves work unfinished at the horizon.
    assert!(metrics.completed < 200);
}

#[test]
fn test_conservation_at_every_horizon() {
    for horizon in [0, 1_000, 10_000, 50_000, 200_000, 2_000_000] {
        let metrics = run(overload_config(
            "admission_latency_us = 300\nrouting_latency_us = 200",
            Some(horizon),
        ));
        assert!(metrics.conservation_holds, "horizon {horizon}");
        assert_eq!(
            metrics.completed
                + metrics.still_queued
                + metrics.still_running
                + metrics.rejected,
            metrics.offered,
            "horizon {horizon}"
        );
        assert_eq!(metrics.offered + metrics.unarrived, 200);
    }
}

#[test]
fn test_token_bucket_accounts_for_every_request() {
    let metrics = run(overload_config(
        "admission_policy = \"token-bucket\"\ntoken_bucket_capacity = 5000.0\ntoken_bucket_refill_per_sec = 10000.0",
        Some(500_000),
    ));
    assert_eq!(metrics.injected + metrics.rejected, 200);
    assert!(metrics.conservation_holds);
}

#[test]
fn test_tight_token_bucket_rejects() {
    let metrics = run(overload_config(
        "admission_policy = \"token-bucket\"\ntoken_bucket_capacity = 10.0\ntoken_bucket_refill_per_sec = 100.0",
        None,
    ));
    assert!(metrics.rejected > 100, "rejected only {}", metrics.rejected);
    assert_eq!(metrics.injected + metrics.rejected, 200);
    assert_eq!(metrics.completed, metrics.injected);
    assert!(metrics.conservation_holds);
}

#[test]
fn test_every_scheduler_drains_with_unbounded_horizon() {
    for scheduler in ["fcfs", "sjf", "priority-fcfs"] {
        let mut config = overload_config("", None);
        config.workload.num_requests = 100;
        config.instance.max_running_requests = 8;
        config.instance.scheduler = scheduler.to_string();
        config.instance.priority_policy = "slo-class".to_string();
        config.workload.slo_classes = vec!["critical".into(), "standard".into(), "batch".into()];

        let metrics = run(config);
        assert_eq!(metrics.completed, 100, "{scheduler}");
        assert_eq!(metrics.still_queued, 0, "{scheduler}");
        assert_eq!(metrics.still_running, 0, "{scheduler}");
    }
}

#[test]
fn test_heavy_preemption_still_drains() {
    let mut config = overload_config("", None);
    // Eight blocks hold one 100-token request plus a little.
    config.instance.kv_blocks = 8;
    config.instance.max_running_requests = 4;
    let requests = uniform_requests(30, 100, 60, 40);

    let metrics = servesim_core::run_simulation(config, requests).unwrap();
    assert_eq!(metrics.completed, 30);
    assert!(metrics.preemptions > 0);
    assert!(metrics.conservation_holds);
}

#[test]
fn test_unservable_request_dropped_not_stuck() {
    let mut config = overload_config("", None);
    config.cluster.num_instances = 1;
    config.instance.kv_blocks = 2;
    let mut requests = uniform_requests(3, 1000, 8, 4);
    requests[1].input_tokens = 200;

    let mut sim = ClusterSimulator::new(config, requests).unwrap();
    let metrics = sim.run();
    assert_eq!(metrics.completed, 2);
    assert_eq!(metrics.dropped_unservable, 1);
    assert!(metrics.conservation_holds);
    assert!(sim.conservation_holds());
}

#[test]
fn test_always_busiest_triggers_hol_detector() {
    let metrics = run(overload_config(
        "routing_policy = \"always-busiest\"",
        Some(500_000),
    ));
    assert!(metrics.hol_blocking_events >= 1);
    assert_eq!(metrics.per_instance_completed[1..], [0, 0, 0]);
    assert!(metrics.jains_fairness_index < 0.5);
}

#[test]
fn test_balanced_routing_has_no_hol_blocking() {
    let mut config = overload_config("routing_policy = \"round-robin\"", None);
    config.instance.max_running_requests = 2;
    let requests = uniform_requests(200, 500, 64, 16);
    let metrics = servesim_core::run_simulation(config, requests).unwrap();
    assert_eq!(metrics.hol_blocking_events, 0);
    assert_eq!(metrics.per_instance_completed, vec![50, 50, 50, 50]);
}
