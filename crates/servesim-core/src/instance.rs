//! Single-instance simulator.
//!
//! Drives one serving instance through the request lifecycle:
//!
//! ```text
//! routed ──queueing delay──▶ Queued ──batch formation──▶ Running ──▶ Finished
//!                              ▲                            │
//!                              └──────── Preempted ◀────────┘
//! ```
//!
//! The instance never owns the event queue. Handlers receive it and
//! schedule their follow-up events on it, so many instances can share one
//! global clock.

use std::sync::Arc;

use servesim_policies::{InstanceSnapshot, PriorityPolicy, SchedulerPolicy};
use tracing::{debug, warn};

use crate::batch::{BatchFormation, BatchLimits, StepPlan};
use crate::event::{EventQueue, SimEvent};
use crate::kv_cache::KvBlockManager;
use crate::latency::LatencyModel;
use crate::metrics::{InstanceMetrics, RequestRecord};
use crate::preemption::InstanceQueues;
use crate::request::{ActiveRequest, Request, RequestState};

/// Static shape of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceSpec {
    pub kv_blocks: usize,
    pub block_size: u32,
    pub limits: BatchLimits,
}

/// One simulated serving instance.
pub struct InstanceSimulator {
    id: usize,
    queues: InstanceQueues,
    kv: KvBlockManager,
    former: BatchFormation,
    scheduler: Box<dyn SchedulerPolicy>,
    priority: Box<dyn PriorityPolicy>,
    latency: Arc<dyn LatencyModel>,
    /// Routed requests whose queueing delay is still running.
    pending: usize,
    /// A step is in flight; its completion event is scheduled.
    busy: bool,
    step_started_us: u64,
    metrics: InstanceMetrics,
}

impl InstanceSimulator {
    pub fn new(
        id: usize,
        spec: InstanceSpec,
        scheduler: Box<dyn SchedulerPolicy>,
        priority: Box<dyn PriorityPolicy>,
        latency: Arc<dyn LatencyModel>,
    ) -> Self {
        Self {
            id,
            queues: InstanceQueues::default(),
            kv: KvBlockManager::new(spec.kv_blocks, spec.block_size),
            former: BatchFormation::new(spec.limits),
            scheduler,
            priority,
            latency,
            pending: 0,
            busy: false,
            step_started_us: 0,
            metrics: InstanceMetrics::new(id),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn queue_depth(&self) -> usize {
        self.queues.waiting.len()
    }

    pub fn batch_size(&self) -> usize {
        self.queues.running.len()
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn kv(&self) -> &KvBlockManager {
        &self.kv
    }

    pub fn metrics(&self) -> &InstanceMetrics {
        &self.metrics
    }

    /// No queued, running or in-flight work.
    pub fn is_idle(&self) -> bool {
        self.pending == 0 && self.queues.is_idle() && !self.busy
    }

    /// Read-only view for admission and routing.
    pub fn snapshot(&self, request: &Request) -> InstanceSnapshot {
        InstanceSnapshot {
            id: self.id,
            queue_depth: self.queue_depth(),
            batch_size: self.batch_size(),
            pending: self.pending,
            kv_utilization: self.kv.used_ratio(),
            free_kv_blocks: self.kv.free_blocks(),
            total_kv_blocks: self.kv.total_blocks(),
            cached_prefix_blocks: self.kv.cached_prefix_len(&request.prefix_hashes),
        }
    }

    /// Accept a routed request. It joins the wait queue after the model's
    /// queueing delay.
    ///
    /// A request that could not fit even in an empty cache would block the
    /// queue forever, so it is dropped here and counted as unservable.
    pub fn route_in(&mut self, request: Request, now_us: u64, events: &mut EventQueue<SimEvent>) {
        self.metrics.admitted += 1;
        if !self.kv.can_ever_hold(request.total_tokens()) {
            warn!(
                instance = self.id,
                request = request.id,
                tokens = request.total_tokens(),
                kv_blocks = self.kv.total_blocks(),
                "request can never fit in the KV cache, dropping"
            );
            self.metrics.dropped_unservable += 1;
            let record = self.record_unfinished(&ActiveRequest::new(request));
            self.metrics.records.push(record);
            return;
        }
        self.pending += 1;
        let at = now_us + self.latency.queueing_time(&request);
        events.schedule(
            at,
            SimEvent::Queued {
                instance: self.id,
                request,
            },
        );
    }

    /// The queueing delay elapsed: the request enters the wait queue.
    pub fn on_queued(&mut self, request: Request, now_us: u64, events: &mut EventQueue<SimEvent>) {
        self.pending = self.pending.saturating_sub(1);
        let mut active = ActiveRequest::new(request);
        active.queued_us = Some(now_us);
        debug!(instance = self.id, request = active.id(), time_us = now_us, "queued");
        self.queues.waiting.push_back(active);
        if !self.busy {
            self.start_step(now_us, events);
        }
    }

    /// The step in flight finished: apply progress, retire finished
    /// requests, and start the next step if there is work.
    pub fn on_step_complete(&mut self, now_us: u64, events: &mut EventQueue<SimEvent>) {
        self.busy = false;
        self.metrics.busy_us += now_us.saturating_sub(self.step_started_us);

        for req in self.queues.running.iter_mut() {
            if req.scheduled_tokens == 0 {
                continue;
            }
            let before = req.generated();
            req.progress += req.scheduled_tokens;
            req.scheduled_tokens = 0;
            let produced = req.generated() - before;
            if produced > 0 {
                self.metrics.output_tokens += u64::from(produced);
                if req.first_token_us.is_none() {
                    req.first_token_us = Some(now_us);
                } else if let Some(last) = req.last_token_us {
                    req.inter_token_us.push(now_us - last);
                }
                req.last_token_us = Some(now_us);
            }
        }

        let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.queues.running)
            .into_iter()
            .partition(ActiveRequest::is_complete);
        self.queues.running = running;
        for mut req in finished {
            self.kv.release(req.id());
            req.state = RequestState::Finished;
            self.metrics.completed += 1;
            debug!(instance = self.id, request = req.id(), time_us = now_us, "finished");
            let record = self.record_finished(&req, now_us);
            self.metrics.records.push(record);
        }

        if !self.queues.is_idle() {
            self.start_step(now_us, events);
        }
    }

    /// Form a batch and schedule its completion.
    fn start_step(&mut self, now_us: u64, events: &mut EventQueue<SimEvent>) {
        for req in self
            .queues
            .waiting
            .iter_mut()
            .chain(self.queues.running.iter_mut())
        {
            req.priority = self
                .priority
                .compute(&req.request.slo_class, req.request.arrival_us, now_us);
        }

        let queue_depth = self.queues.waiting.len();
        let plan: StepPlan = self.former.form(
            &mut self.queues,
            &mut self.kv,
            self.latency.as_ref(),
            self.scheduler.as_ref(),
            now_us,
        );
        self.metrics.preemptions += plan.preempted.len() as u64;

        if plan.is_empty() && plan.preempted.is_empty() && self.queues.running.is_empty() {
            warn!(
                instance = self.id,
                waiting = self.queues.waiting.len(),
                time_us = now_us,
                "nothing schedulable, instance idles until the next arrival"
            );
            return;
        }
        let duration = (self.latency.step_time(&plan.shape) + plan.overhead_us).max(1);
        self.metrics.sample_step(
            queue_depth,
            self.queues.running.len(),
            self.kv.used_ratio(),
            duration,
        );
        debug!(
            instance = self.id,
            time_us = now_us,
            batch = plan.shape.requests,
            prefill = plan.shape.prefill_tokens,
            decode = plan.shape.decode_tokens,
            duration_us = duration,
            "step"
        );
        self.busy = true;
        self.step_started_us = now_us;
        events.schedule(now_us + duration, SimEvent::StepComplete { instance: self.id });
    }

    fn record_finished(&self, req: &ActiveRequest, now_us: u64) -> RequestRecord {
        let post = self.latency.output_token_processing_time();
        let arrival = req.request.arrival_us;
        let tokens = u64::from(req.target_output());
        RequestRecord {
            finished: true,
            ttft_us: req.first_token_us.map(|t| (t + post).saturating_sub(arrival)),
            e2e_us: Some((now_us + post * tokens).saturating_sub(arrival)),
            ..self.record_unfinished(req)
        }
    }

    fn record_unfinished(&self, req: &ActiveRequest) -> RequestRecord {
        let arrival = req.request.arrival_us;
        RequestRecord {
            request_id: req.id(),
            instance: self.id,
            slo_class: req.request.slo_class.clone(),
            arrival_us: arrival,
            input_tokens: req.request.input_tokens,
            output_tokens: req.request.output_tokens,
            finished: false,
            ttft_us: req.ttft_us(),
            e2e_us: None,
            scheduling_delay_us: req.scheduled_us.map(|t| t.saturating_sub(arrival)),
            preemptions: req.preemptions,
            itl_samples_us: req.inter_token_us.clone(),
        }
    }

    /// Requests this instance has accepted and still accounts for.
    pub fn accounted(&self) -> u64 {
        self.metrics.completed
            + self.metrics.dropped_unservable
            + (self.queues.waiting.len() + self.pending + self.queues.running.len()) as u64
    }

    /// Metrics as of now, without disturbing the simulation.
    ///
    /// Whatever is still waiting (including routed requests whose queueing
    /// delay has not elapsed) counts as queued; the running batch counts as
    /// running. Unfinished requests get a record of their own.
    pub fn report(&self) -> InstanceMetrics {
        let mut metrics = self.metrics.clone();
        metrics.still_queued = (self.queues.waiting.len() + self.pending) as u64;
        metrics.still_running = self.queues.running.len() as u64;
        let stats = self.kv.stats();
        metrics.cache_hits = stats.hits;
        metrics.cache_misses = stats.misses;
        metrics.records.extend(
            self.queues
                .waiting
                .iter()
                .chain(self.queues.running.iter())
                .map(|r| self.record_unfinished(r)),
        );
        metrics
    }
}
