/// Integration tests for pluggable policies inside full simulations.
use servesim_core::config::SimConfig;
use servesim_core::request::Request;
use servesim_core::trace::block_hashes;
use servesim_core::{PolicyKind, SimClock};
use servesim_policies::*;

fn small_config() -> SimConfig {
    SimConfig::from_str(
        r#"
[simulation]
name = "policy-test"

[cluster]
num_instances = 4

[instance]
kv_blocks = 1024
max_running_requests = 16
max_scheduled_tokens = 1024

[latency]
beta = [500.0, 2.0, 20.0]
alpha = [50.0, 0.5, 10.0]
"#,
    )
    .unwrap()
}

fn grouped_requests(n: usize) -> Vec<Request> {
    let classes = ["critical", "standard", "batch"];
    (0..n)
        .map(|i| {
            let id = i as u64;
            Request {
                id,
                arrival_us: id * 500,
                input_tokens: 128,
                output_tokens: [8, 32, 64][i % 3],
                slo_class: classes[i % 3].to_string(),
                prefix_hashes: block_hashes(id, 128, 16, Some(((i % 4) as u32, 6))),
            }
        })
        .collect()
}

fn snapshot(id: usize, queue_depth: usize, batch_size: usize) -> InstanceSnapshot {
    InstanceSnapshot {
        id,
        queue_depth,
        batch_size,
        pending: 0,
        kv_utilization: 0.0,
        free_kv_blocks: 100,
        total_kv_blocks: 100,
        cached_prefix_blocks: 0,
    }
}

#[test]
fn test_every_routing_policy_conserves_and_completes() {
    let config = small_config();
    let requests = grouped_requests(120);
    let names = available_routing();
    let results = servesim_core::compare_policies(&config, &requests, PolicyKind::Routing, &names)
        .unwrap();

    for (name, metrics) in names.iter().zip(&results) {
        assert_eq!(metrics.labels.routing, *name);
        assert!(metrics.conservation_holds, "{name} broke conservation");
        assert_eq!(metrics.completed, 120, "{name} left work behind");
    }
}

#[test]
fn test_every_scheduler_and_priority_pair_completes() {
    for scheduler in available_schedulers() {
        for priority in available_priorities() {
            let mut config = small_config();
            config.instance.scheduler = scheduler.to_string();
            config.instance.priority_policy = priority.to_string();
            let metrics = servesim_core::run_simulation(config, grouped_requests(60)).unwrap();
            assert_eq!(
                metrics.completed, 60,
                "{scheduler}/{priority} did not drain"
            );
            assert!(metrics.conservation_holds);
        }
    }
}

#[test]
fn test_prefix_affinity_beats_round_robin_on_cache_hits() {
    let config = small_config();
    let requests = grouped_requests(200);
    let results = servesim_core::compare_policies(
        &config,
        &requests,
        PolicyKind::Routing,
        &["round-robin", "prefix-affinity"],
    )
    .unwrap();
    assert!(
        results[1].cache_hit_rate >= results[0].cache_hit_rate,
        "prefix-affinity {} < round-robin {}",
        results[1].cache_hit_rate,
        results[0].cache_hit_rate
    );
    assert!(results[1].custom_metrics.contains_key("prefix_affinity_hit_rate"));
}

#[test]
fn test_least_loaded_prefers_lowest_index_on_ties() {
    let mut policy = LeastLoaded::new();
    let clock = SimClock::new();
    let instances = vec![
        snapshot(0, 2, 1),
        snapshot(1, 1, 1),
        snapshot(2, 0, 2),
        snapshot(3, 2, 1),
    ];
    let decision = policy.route(&RequestInfo::default(), &instances, &clock);
    assert_eq!(decision, RoutingDecision::Route(1));
}

#[test]
fn test_token_bucket_refills_with_simulated_time() {
    let mut bucket = TokenBucket::new(2.0, 1000.0);
    let instances = vec![snapshot(0, 0, 0)];
    let info = RequestInfo::default();

    let at = SimClock::starting_at_us(0);
    assert_eq!(bucket.admit(&info, &instances, &at), AdmissionDecision::Admit);
    assert_eq!(bucket.admit(&info, &instances, &at), AdmissionDecision::Admit);
    assert!(matches!(
        bucket.admit(&info, &instances, &at),
        AdmissionDecision::Reject { .. }
    ));

    // 1000 tokens/s refills one token per millisecond.
    let later = SimClock::starting_at_us(1_000);
    assert_eq!(bucket.admit(&info, &instances, &later), AdmissionDecision::Admit);
}

#[test]
fn test_scheduler_orders_are_permutations() {
    let waiting: Vec<QueuedRequest> = (0..6)
        .map(|i| QueuedRequest {
            id: i,
            arrival_us: 10 * (6 - i),
            priority: (i % 3) as f64,
            remaining_work: (i * 7 % 5) as u32,
        })
        .collect();
    for name in available_schedulers() {
        let scheduler = scheduler_by_name(name).unwrap();
        let mut order = scheduler.order(&waiting, &[]);
        order.sort_unstable();
        assert_eq!(order, (0..6).collect::<Vec<_>>(), "{name}");
    }
}

#[test]
fn test_unknown_names_list_alternatives() {
    let err = routing_by_name("random").err().unwrap();
    let message = err.to_string();
    assert!(message.contains("least-loaded"), "{message}");
}
