/// Integration tests for KV block management and preemption under pressure.
use servesim_core::kv_cache::KvBlockManager;
use servesim_core::latency::BlackboxLatencyModel;
use servesim_core::preemption::{InstanceQueues, PreemptionController};
use servesim_core::request::{ActiveRequest, Request, RequestState};
use servesim_core::trace::block_hashes;

fn request(id: u64, input: u32, output: u32, group: Option<u32>) -> Request {
    Request {
        id,
        arrival_us: id,
        input_tokens: input,
        output_tokens: output,
        slo_class: String::new(),
        prefix_hashes: block_hashes(id, input, 16, group.map(|g| (g, 4))),
    }
}

fn latency() -> BlackboxLatencyModel {
    BlackboxLatencyModel::new(&[1000.0, 1.0, 1.0], &[0.0, 0.0, 0.0], 0, 50).unwrap()
}

#[test]
fn test_cache_lifecycle_with_shared_prefixes() {
    let mut kv = KvBlockManager::new(1000, 16);

    // Ten requests over three prefix groups, 8 full blocks each.
    let requests: Vec<Request> = (0..10)
        .map(|i| request(i, 128, 16, Some((i % 3) as u32)))
        .collect();
    for r in &requests {
        let cached = kv.cached_prefix_len(&r.prefix_hashes);
        let from = cached as u32 * 16;
        assert!(kv.allocate(r, from, r.input_tokens, &r.prefix_hashes));
    }
    // The first request of each group computes its prefix; the other seven
    // reuse 4 blocks each.
    let stats = kv.stats();
    assert_eq!(stats.hits, 7 * 4);
    assert_eq!(kv.used_blocks(), 3 * 8 + 7 * 4);

    for r in &requests {
        kv.release(r.id);
    }
    assert_eq!(kv.used_blocks(), 0);
    // Released prefixes stay discoverable until their blocks are reused.
    let probe = request(99, 128, 16, Some(0));
    assert_eq!(kv.cached_prefix_len(&probe.prefix_hashes), 4);
}

#[test]
fn test_allocate_never_partially_mutates() {
    let mut kv = KvBlockManager::new(4, 16);
    let big = request(1, 80, 1, None);
    let before = kv.stats();
    assert!(!kv.allocate(&big, 0, 80, &[]));
    let after = kv.stats();
    assert_eq!(before.free_blocks, after.free_blocks);
    assert_eq!(kv.allocated_tokens(1), 0);
    assert!(kv.blocks_of(1).is_empty());
}

#[test]
fn test_extreme_preemption_gives_up_without_fault() {
    // Two blocks of 16 tokens; the request wants ~13 blocks.
    let mut kv = KvBlockManager::new(2, 16);
    let model = latency();
    let mut queues = InstanceQueues::default();
    let candidate = ActiveRequest::new(request(1, 200, 10, None));

    let mut ctl = PreemptionController::new(&mut kv, &model, 0);
    assert!(!ctl.admit_waiting(&mut queues, &candidate, 0, 200, &[]));
    assert!(ctl.log.evicted.is_empty());
    assert_eq!(kv.free_blocks(), 2);
}

#[test]
fn test_growth_evicts_lowest_priority_and_requeues_front() {
    let mut kv = KvBlockManager::new(4, 16);
    let model = latency();
    let mut queues = InstanceQueues::default();

    for (id, priority) in [(1, 2.0), (2, 0.5), (3, 1.0)] {
        let mut active = ActiveRequest::new(request(id, 16, 4, None));
        assert!(kv.allocate(&active.request, 0, 16, &[]));
        active.progress = 16;
        active.priority = priority;
        active.state = RequestState::Running;
        queues.running.push(active);
    }
    queues.waiting.push_back(ActiveRequest::new(request(9, 16, 4, None)));

    // Request 1 needs a second block and the pool has one left: fine.
    let mut ctl = PreemptionController::new(&mut kv, &model, 0);
    assert!(ctl.grow_running(&mut queues, 0, 16));
    queues.running[0].progress = 32;
    // Request 1 grows again: pool empty, so the lowest priority (2) goes.
    assert!(ctl.grow_running(&mut queues, 0, 16));
    assert_eq!(ctl.log.evicted, vec![2]);
    assert_eq!(ctl.log.overhead_us, 50);

    let front = queues.waiting.front().unwrap();
    assert_eq!(front.id(), 2);
    assert_eq!(front.progress, 0);
    assert_eq!(front.preemptions, 1);
    assert_eq!(front.state, RequestState::Queued);
    assert_eq!(queues.running.len(), 2);
}
