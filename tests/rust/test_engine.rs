/// Integration tests for the event engine and end-to-end determinism.
use servesim_core::config::SimConfig;
use servesim_core::event::{EventKind, EventQueue, SimEvent};
use servesim_core::latency::{BatchShape, BlackboxLatencyModel, LatencyModel};
use servesim_core::request::Request;

fn base_config() -> SimConfig {
    SimConfig::from_str(
        r#"
[simulation]
name = "engine-test"
seed = 42

[cluster]
num_instances = 4
routing_policy = "least-loaded"

[instance]
scheduler = "fcfs"
kv_blocks = 2048
block_size_tokens = 16
max_running_requests = 32
max_scheduled_tokens = 2048

[latency]
beta = [1000.0, 10.0, 5.0]
alpha = [100.0, 1.0, 100.0]

[workload]
rate_per_sec = 200.0
num_requests = 300
prefix_groups = 4
prefix_blocks = 2
slo_classes = ["critical", "standard", "batch"]
"#,
    )
    .unwrap()
}

fn request(id: u64, arrival_us: u64) -> Request {
    Request {
        id,
        arrival_us,
        input_tokens: 32,
        output_tokens: 4,
        slo_class: String::new(),
        prefix_hashes: Vec::new(),
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Tagged(u8, &'static str);

impl EventKind for Tagged {
    fn priority(&self) -> u8 {
        self.0
    }
}

#[test]
fn test_events_pop_in_time_kind_insertion_order() {
    let mut queue = EventQueue::new();
    queue.schedule(20, Tagged(0, "late"));
    queue.schedule(10, Tagged(4, "step"));
    queue.schedule(10, Tagged(0, "arrival-a"));
    queue.schedule(10, Tagged(2, "routing"));
    queue.schedule(10, Tagged(0, "arrival-b"));

    let order: Vec<&str> = std::iter::from_fn(|| queue.advance())
        .map(|(_, e)| e.1)
        .collect();
    assert_eq!(
        order,
        vec!["arrival-a", "arrival-b", "routing", "step", "late"]
    );
    assert_eq!(queue.now(), 20);
}

#[test]
fn test_pipeline_events_run_before_instance_events() {
    let mut queue = EventQueue::new();
    queue.schedule(5, SimEvent::StepComplete { instance: 0 });
    queue.schedule(
        5,
        SimEvent::Queued {
            instance: 1,
            request: request(1, 0),
        },
    );
    queue.schedule(5, SimEvent::Routing(request(2, 0)));
    queue.schedule(5, SimEvent::Admission(request(3, 0)));
    queue.schedule(5, SimEvent::Arrival(request(4, 5)));

    let priorities: Vec<u8> = std::iter::from_fn(|| queue.advance())
        .map(|(_, e)| e.priority())
        .collect();
    assert_eq!(priorities, vec![0, 1, 2, 3, 4]);
}

#[test]
#[should_panic(expected = "cannot schedule event in the past")]
fn test_scheduling_in_the_past_panics() {
    let mut queue = EventQueue::new();
    queue.schedule(100, Tagged(0, "a"));
    queue.advance();
    queue.schedule(99, Tagged(0, "b"));
}

#[test]
fn test_identical_runs_are_byte_identical() {
    let config = base_config();
    let requests = servesim_core::workload::generate(&config.workload, 42, 16);

    let first = servesim_core::run_simulation(config.clone(), requests.clone()).unwrap();
    let second = servesim_core::run_simulation(config, requests).unwrap();

    let a = serde_json::to_string(&first).unwrap();
    let b = serde_json::to_string(&second).unwrap();
    assert_eq!(a, b);
    assert!(first.conservation_holds);
}

#[test]
fn test_seed_drives_the_workload() {
    let config = base_config();
    let a = servesim_core::workload::generate(&config.workload, 1, 16);
    let b = servesim_core::workload::generate(&config.workload, 2, 16);
    assert_ne!(a, b);
}

#[test]
fn test_full_simulation_produces_latencies() {
    let config = base_config();
    let requests = servesim_core::workload::generate(&config.workload, 42, 16);
    let metrics = servesim_core::run_simulation(config, requests).unwrap();

    assert_eq!(metrics.completed, 300);
    assert!(metrics.ttft_ms.p50 > 0.0);
    assert!(metrics.e2e_ms.p50 >= metrics.ttft_ms.p50);
    assert!(metrics.itl_ms.p50 > 0.0);
    assert!(metrics.requests_per_sec > 0.0);
    assert!(metrics.output_tokens_per_sec > 0.0);
    assert!(metrics.jains_fairness_index > 0.0);
    assert!(metrics.peak_kv_utilization > 0.0);
    assert!(metrics.cache_hit_rate > 0.0);
}

#[test]
fn test_step_time_monotone_in_tokens() {
    let model = BlackboxLatencyModel::new(&[1000.0, 10.0, 5.0], &[100.0, 1.0, 100.0], 0, 0)
        .unwrap();
    let mut last = 0;
    for prefill in (0..4096).step_by(256) {
        let shape = BatchShape {
            requests: 8,
            prefill_tokens: prefill,
            decode_tokens: 8,
        };
        let t = model.step_time(&shape);
        assert!(t >= last, "step time decreased at {} prefill tokens", prefill);
        last = t;
    }
}

#[test]
fn test_degenerate_latency_rejected_before_run() {
    let mut config = base_config();
    config.latency.beta = vec![f64::NAN, 1.0, -1.0];
    let err = servesim_core::run_simulation(config, Vec::new()).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("beta[0]"), "{message}");
    assert!(message.contains("beta[2]"), "{message}");
}
