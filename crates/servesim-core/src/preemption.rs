//! Preemption controller.
//!
//! When the KV cache cannot cover a request's next tokens, running requests
//! are evicted one at a time until the allocation fits or nobody is left to
//! evict. Every iteration removes one request from the running batch, so a
//! call performs at most `running.len()` evictions and always terminates.

use std::collections::VecDeque;

use tracing::warn;

use crate::kv_cache::KvBlockManager;
use crate::latency::LatencyModel;
use crate::request::{ActiveRequest, RequestState};

/// A running request and a waiting queue, owned by one instance.
#[derive(Debug, Clone, Default)]
pub struct InstanceQueues {
    /// Requests waiting for admission, front = next candidate.
    pub waiting: VecDeque<ActiveRequest>,
    /// The running batch in admission order.
    pub running: Vec<ActiveRequest>,
}

impl InstanceQueues {
    pub fn is_idle(&self) -> bool {
        self.waiting.is_empty() && self.running.is_empty()
    }
}

/// Side effects of the evictions performed while forming one step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionLog {
    /// Evicted request IDs, in eviction order.
    pub evicted: Vec<u64>,
    /// Preemption overhead accumulated from the latency model.
    pub overhead_us: u64,
    /// Tokens already scheduled this step to requests that were evicted.
    pub refunded_tokens: u32,
}

/// Lowest-priority request in `running[from..]`, latest position on ties.
///
/// With `below`, only requests with priority strictly under it qualify.
fn pick_victim(running: &[ActiveRequest], from: usize, below: Option<f64>) -> Option<usize> {
    let mut victim: Option<usize> = None;
    for (idx, req) in running.iter().enumerate().skip(from) {
        if below.is_some_and(|p| req.priority >= p) {
            continue;
        }
        match victim {
            Some(v) if req.priority > running[v].priority => {}
            _ => victim = Some(idx),
        }
    }
    victim
}

/// Evicts running requests of one instance to make KV room during one step.
pub struct PreemptionController<'a> {
    pub kv: &'a mut KvBlockManager,
    pub latency: &'a dyn LatencyModel,
    pub now_us: u64,
    pub log: EvictionLog,
}

impl<'a> PreemptionController<'a> {
    pub fn new(kv: &'a mut KvBlockManager, latency: &'a dyn LatencyModel, now_us: u64) -> Self {
        Self {
            kv,
            latency,
            now_us,
            log: EvictionLog::default(),
        }
    }

    /// Grow `running[index]` by `tokens`, evicting from `running[index..]`.
    ///
    /// Returns `false` when the requester itself was evicted or nothing is
    /// left to evict.
    pub fn grow_running(&mut self, queues: &mut InstanceQueues, index: usize, tokens: u32) -> bool {
        loop {
            let Some(requester) = queues.running.get(index) else {
                return false;
            };
            let from = requester.progress;
            if self.kv.allocate(&requester.request, from, from + tokens, &[]) {
                return true;
            }
            let requester_id = requester.id();
            let Some(victim) = pick_victim(&queues.running, index, None) else {
                self.give_up(requester_id, tokens);
                return false;
            };
            if self.evict(queues, victim) == requester_id {
                return false;
            }
        }
    }

    /// Allocate `[from, to)` for a waiting candidate held outside the queues.
    ///
    /// Only running requests with strictly lower priority than the candidate
    /// are evicted, so two equal-priority requests can never keep evicting
    /// each other. An empty running batch gives up immediately.
    pub fn admit_waiting(
        &mut self,
        queues: &mut InstanceQueues,
        candidate: &ActiveRequest,
        from: u32,
        to: u32,
        shared_hashes: &[u64],
    ) -> bool {
        loop {
            if self.kv.allocate(&candidate.request, from, to, shared_hashes) {
                return true;
            }
            if queues.running.is_empty() {
                self.give_up(candidate.id(), to - from);
                return false;
            }
            let Some(victim) = pick_victim(&queues.running, 0, Some(candidate.priority)) else {
                return false;
            };
            self.evict(queues, victim);
        }
    }

    /// Move `running[idx]` back to the front of the wait queue.
    ///
    /// The victim goes `Running -> Preempted -> Queued`; a later admission
    /// resumes it because its preemption count is non-zero.
    ///
    /// Its blocks are released and its progress restarts from zero. Prefix
    /// blocks it leaves behind stay cached and can be reused on re-admission.
    fn evict(&mut self, queues: &mut InstanceQueues, idx: usize) -> u64 {
        let mut victim = queues.running.remove(idx);
        let id = victim.id();
        warn!(
            time_us = self.now_us,
            request = id,
            progress = victim.progress,
            "preemption: evicting running request to make room"
        );
        self.kv.release(id);
        victim.state = RequestState::Preempted;
        self.log.refunded_tokens += victim.scheduled_tokens;
        self.log.overhead_us += self.latency.preemption_processing_time();
        self.log.evicted.push(id);
        victim.scheduled_tokens = 0;
        victim.progress = 0;
        victim.preemptions += 1;
        victim.requeue();
        queues.waiting.push_front(victim);
        id
    }

    fn give_up(&self, request: u64, tokens: u32) {
        warn!(
            time_us = self.now_us,
            request,
            needed_tokens = tokens,
            free_blocks = self.kv.free_blocks(),
            "preemption: KV cache too small, no running request to evict"
        );
    }
}
