//! Batch formation for one simulated step.
//!
//! Each step runs two phases over an instance's queues:
//!
//! 1. **Grow the running batch.** Requests still in prefill get the next
//!    chunk of prompt tokens, decoding requests get one token. Growth that
//!    does not fit in the KV cache goes through the preemption controller.
//! 2. **Admit from the wait queue.** In scheduler order, while there is
//!    concurrency and token budget left and no preemption happened this
//!    step. Leading prefix blocks already cached are reused.

use serde::{Deserialize, Serialize};
use servesim_policies::{QueuedRequest, SchedulerPolicy};
use tracing::debug;

use crate::kv_cache::KvBlockManager;
use crate::latency::{BatchShape, LatencyModel};
use crate::preemption::{InstanceQueues, PreemptionController};
use crate::request::{ActiveRequest, RequestState, ScheduleKind};

/// Per-step budgets of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchLimits {
    /// Maximum requests in the running batch.
    pub max_running: usize,
    /// Maximum tokens computed in one step across the batch.
    pub max_scheduled_tokens: u32,
    /// Largest prefill chunk per request per step; 0 disables chunking.
    pub long_prefill_threshold: u32,
}

/// A request admitted into the running batch this step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scheduled {
    pub request_id: u64,
    pub kind: ScheduleKind,
    /// Prompt tokens served from cached prefix blocks.
    pub cached_tokens: u32,
}

/// Everything one step of batch formation decided.
#[derive(Debug, Clone, Default)]
pub struct StepPlan {
    pub shape: BatchShape,
    pub newly_scheduled: Vec<Scheduled>,
    pub preempted: Vec<u64>,
    /// Scheduling plus preemption overhead charged to this step.
    pub overhead_us: u64,
}

impl StepPlan {
    pub fn is_empty(&self) -> bool {
        self.shape.requests == 0
    }
}

/// Reorder `queues.waiting` by the scheduler's permutation.
///
/// Indices the scheduler leaves out keep their relative order at the back.
pub fn order_waiting(queues: &mut InstanceQueues, scheduler: &dyn SchedulerPolicy) {
    let waiting: Vec<QueuedRequest> = queues
        .waiting
        .iter()
        .map(ActiveRequest::queued_view)
        .collect();
    let running: Vec<QueuedRequest> = queues
        .running
        .iter()
        .map(ActiveRequest::queued_view)
        .collect();
    let order = scheduler.order(&waiting, &running);

    let mut slots: Vec<Option<ActiveRequest>> = queues.waiting.drain(..).map(Some).collect();
    for idx in order {
        if let Some(req) = slots.get_mut(idx).and_then(Option::take) {
            queues.waiting.push_back(req);
        }
    }
    queues.waiting.extend(slots.into_iter().flatten());
}

/// The vLLM-style two-phase batch former.
#[derive(Debug, Clone, Copy)]
pub struct BatchFormation {
    limits: BatchLimits,
}

impl BatchFormation {
    pub fn new(limits: BatchLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &BatchLimits {
        &self.limits
    }

    fn chunk(&self, remaining_prompt: u32, budget: u32) -> u32 {
        let mut tokens = remaining_prompt;
        let threshold = self.limits.long_prefill_threshold;
        if threshold > 0 && threshold < tokens {
            tokens = threshold;
        }
        tokens.min(budget)
    }

    /// Form the batch for a step starting at `now_us`.
    ///
    /// Mutates the queues and the KV cache; the returned plan describes the
    /// step. Every running request with `scheduled_tokens > 0` is part of it.
    pub fn form(
        &self,
        queues: &mut InstanceQueues,
        kv: &mut KvBlockManager,
        latency: &dyn LatencyModel,
        scheduler: &dyn SchedulerPolicy,
        now_us: u64,
    ) -> StepPlan {
        for req in queues.running.iter_mut() {
            req.scheduled_tokens = 0;
        }
        order_waiting(queues, scheduler);

        let mut plan = StepPlan::default();
        let mut budget = self.limits.max_scheduled_tokens;
        let mut ctl = PreemptionController::new(kv, latency, now_us);

        let mut idx = 0;
        while idx < queues.running.len() {
            if budget == 0 {
                debug!(time_us = now_us, "token budget exhausted, deferring rest of batch");
                break;
            }
            let req = &queues.running[idx];
            let tokens = if req.in_prefill() {
                self.chunk(req.request.input_tokens - req.progress, budget)
            } else {
                1
            };
            if !ctl.grow_running(queues, idx, tokens) {
                break;
            }
            queues.running[idx].scheduled_tokens = tokens;
            budget -= tokens;
            idx += 1;
        }

        while queues.running.len() < self.limits.max_running
            && budget > 0
            && ctl.log.evicted.is_empty()
        {
            let Some(mut next) = queues.waiting.pop_front() else {
                break;
            };

            let block_size = ctl.kv.block_size();
            let input = next.request.input_tokens;
            // Leave at least one prompt token to compute so prefill yields a token.
            let max_cached = (input.saturating_sub(1) / block_size) as usize;
            let cached = ctl
                .kv
                .cached_prefix_len(&next.request.prefix_hashes)
                .min(max_cached);
            let start = cached as u32 * block_size;
            let tokens = self.chunk(input - start, budget);
            let shared = &next.request.prefix_hashes[..cached];

            if !ctl.admit_waiting(queues, &next, start, start + tokens, shared) {
                queues.waiting.push_front(next);
                break;
            }
            budget += std::mem::take(&mut ctl.log.refunded_tokens);

            debug_assert_eq!(next.state, RequestState::Queued);
            next.state = RequestState::Running;
            next.progress = start;
            next.scheduled_tokens = tokens;
            next.scheduled_us.get_or_insert(now_us);
            plan.newly_scheduled.push(Scheduled {
                request_id: next.id(),
                kind: if next.preemptions == 0 {
                    ScheduleKind::First
                } else {
                    ScheduleKind::Resume
                },
                cached_tokens: start,
            });
            plan.overhead_us += latency.scheduling_processing_time();
            budget -= tokens;
            queues.running.push(next);
        }

        plan.preempted = std::mem::take(&mut ctl.log.evicted);
        plan.overhead_us += ctl.log.overhead_us;

        for req in &queues.running {
            if req.scheduled_tokens == 0 {
                continue;
            }
            plan.shape.requests += 1;
            if req.in_prefill() {
                plan.shape.prefill_tokens += u64::from(req.scheduled_tokens);
            } else {
                plan.shape.decode_tokens += u64::from(req.scheduled_tokens);
            }
        }
        plan
    }
}
