//! Request model for inference-serving simulation.
//!
//! A [`Request`] is the immutable description of one inference call as it
//! arrives (from a trace or the workload generator). Once an instance takes
//! it, the request is wrapped in an [`ActiveRequest`] that carries the
//! lifecycle state the scheduler mutates.

use serde::{Deserialize, Serialize};
use servesim_policies::{QueuedRequest, RequestInfo};

/// A single inference request flowing through the simulated system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Unique request identifier.
    pub id: u64,
    /// Arrival time in simulation microseconds.
    pub arrival_us: u64,
    /// Number of prompt tokens.
    pub input_tokens: u32,
    /// Number of tokens to generate.
    pub output_tokens: u32,
    /// SLO class tag; empty means the default class.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub slo_class: String,
    /// One hash per full input block. Equal leading hashes mean a shared prefix.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prefix_hashes: Vec<u64>,
}

impl Request {
    /// Tokens this request holds in the KV cache when it finishes.
    pub fn total_tokens(&self) -> u64 {
        u64::from(self.input_tokens) + u64::from(self.output_tokens)
    }

    pub fn info(&self) -> RequestInfo {
        RequestInfo {
            id: self.id,
            arrival_us: self.arrival_us,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            slo_class: self.slo_class.clone(),
            prefix_hashes: self.prefix_hashes.clone(),
        }
    }
}

/// Lifecycle state of a request inside an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    Queued,
    Running,
    /// Evicted from the running batch. Passed through on the way back to
    /// `Queued`.
    Preempted,
    Finished,
}

/// Whether an admission into the running batch is the first one or a resume
/// after preemption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleKind {
    First,
    Resume,
}

/// A request owned by one instance, with its mutable scheduling state.
#[derive(Debug, Clone)]
pub struct ActiveRequest {
    pub request: Request,
    pub state: RequestState,
    /// Tokens processed so far. Doubles as the request's KV length.
    pub progress: u32,
    /// Tokens assigned to this request in the step in flight.
    pub scheduled_tokens: u32,
    pub preemptions: u32,
    /// Score from the priority policy, refreshed every step.
    pub priority: f64,
    /// Time the request entered the wait queue for the first time.
    pub queued_us: Option<u64>,
    /// Time the request was first admitted to the running batch.
    pub scheduled_us: Option<u64>,
    pub first_token_us: Option<u64>,
    pub last_token_us: Option<u64>,
    /// Gaps between consecutive output tokens.
    pub inter_token_us: Vec<u64>,
}

impl ActiveRequest {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            state: RequestState::Queued,
            progress: 0,
            scheduled_tokens: 0,
            preemptions: 0,
            priority: 0.0,
            queued_us: None,
            scheduled_us: None,
            first_token_us: None,
            last_token_us: None,
            inter_token_us: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.request.id
    }

    /// Output tokens this request will produce. A zero-output request still
    /// produces the one token that ends prefill.
    pub fn target_output(&self) -> u32 {
        self.request.output_tokens.max(1)
    }

    /// Whether prefill (input processing) is still incomplete.
    pub fn in_prefill(&self) -> bool {
        self.progress < self.request.input_tokens
    }

    /// Output tokens generated so far. Finishing prefill yields the first.
    pub fn generated(&self) -> u32 {
        let input = self.request.input_tokens;
        if input == 0 {
            self.progress
        } else if self.progress < input {
            0
        } else {
            self.progress - input + 1
        }
    }

    /// Output tokens still to generate.
    pub fn remaining_work(&self) -> u32 {
        self.request.output_tokens.saturating_sub(self.generated())
    }

    pub fn is_complete(&self) -> bool {
        self.generated() >= self.target_output()
    }

    /// Scheduler view used by queue ordering policies.
    pub fn queued_view(&self) -> QueuedRequest {
        QueuedRequest {
            id: self.request.id,
            arrival_us: self.request.arrival_us,
            priority: self.priority,
            remaining_work: self.remaining_work(),
        }
    }

    /// Put a preempted request back in line as `Queued`.
    pub fn requeue(&mut self) {
        debug_assert_eq!(self.state, RequestState::Preempted);
        self.state = RequestState::Queued;
    }

    /// Time to first token, once the first token exists.
    pub fn ttft_us(&self) -> Option<u64> {
        self.first_token_us
            .map(|t| t.saturating_sub(self.request.arrival_us))
    }
}
