//! Timing contract between the simulator and its latency model.
//!
//! The simulator never computes durations itself: every delay comes from a
//! [`LatencyModel`]. All queries are pure and return microseconds.
//!
//! [`BlackboxLatencyModel`] is the built-in linear-regression model:
//!
//! ```text
//! step       = beta0 + beta1 * prefill_tokens + beta2 * decode_tokens
//! queueing   = alpha0 + alpha1 * input_tokens
//! per token  = alpha2
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::request::Request;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LatencyError {
    #[error("invalid latency coefficients: {}", .0.join("; "))]
    InvalidCoefficients(Vec<String>),
}

/// Token composition of one step's batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchShape {
    /// Requests in the batch.
    pub requests: usize,
    /// Prompt tokens computed this step (cache misses only).
    pub prefill_tokens: u64,
    /// Decode tokens computed this step (one per decoding request).
    pub decode_tokens: u64,
}

impl BatchShape {
    pub fn total_tokens(&self) -> u64 {
        self.prefill_tokens + self.decode_tokens
    }
}

/// The five timing queries the simulator relies on.
pub trait LatencyModel: Send + Sync {
    /// Delay between routing a request to an instance and it joining the wait queue.
    fn queueing_time(&self, request: &Request) -> u64;

    /// Duration of one forward step for `batch`.
    fn step_time(&self, batch: &BatchShape) -> u64;

    /// Post-processing cost per generated output token.
    fn output_token_processing_time(&self) -> u64;

    /// Overhead of admitting one request into the running batch.
    fn scheduling_processing_time(&self) -> u64;

    /// Overhead of evicting one running request.
    fn preemption_processing_time(&self) -> u64;
}

/// Linear regression latency model calibrated offline.
#[derive(Debug, Clone, PartialEq)]
pub struct BlackboxLatencyModel {
    beta: [f64; 3],
    alpha: [f64; 3],
    scheduling_us: u64,
    preemption_us: u64,
}

fn to_us(value: f64) -> u64 {
    if value <= 0.0 {
        0
    } else {
        value.round() as u64
    }
}

fn check_coefficients(name: &str, values: &[f64], errors: &mut Vec<String>) {
    if values.len() != 3 {
        errors.push(format!("{} needs 3 coefficients, got {}", name, values.len()));
    }
    for (i, v) in values.iter().enumerate() {
        if !v.is_finite() {
            errors.push(format!("{}[{}] must be finite, got {}", name, i, v));
        } else if *v < 0.0 {
            errors.push(format!("{}[{}] must be non-negative, got {}", name, i, v));
        }
    }
}

impl BlackboxLatencyModel {
    /// Build the model, rejecting malformed coefficients.
    ///
    /// Every problem is reported at once rather than stopping at the first.
    pub fn new(
        beta: &[f64],
        alpha: &[f64],
        scheduling_us: u64,
        preemption_us: u64,
    ) -> Result<Self, LatencyError> {
        let mut errors = Vec::new();
        check_coefficients("beta", beta, &mut errors);
        check_coefficients("alpha", alpha, &mut errors);
        if !errors.is_empty() {
            return Err(LatencyError::InvalidCoefficients(errors));
        }
        Ok(Self {
            beta: [beta[0], beta[1], beta[2]],
            alpha: [alpha[0], alpha[1], alpha[2]],
            scheduling_us,
            preemption_us,
        })
    }
}

impl LatencyModel for BlackboxLatencyModel {
    fn queueing_time(&self, request: &Request) -> u64 {
        to_us(self.alpha[0] + self.alpha[1] * f64::from(request.input_tokens))
    }

    fn step_time(&self, batch: &BatchShape) -> u64 {
        to_us(
            self.beta[0]
                + self.beta[1] * batch.prefill_tokens as f64
                + self.beta[2] * batch.decode_tokens as f64,
        )
    }

    fn output_token_processing_time(&self) -> u64 {
        to_us(self.alpha[2])
    }

    fn scheduling_processing_time(&self) -> u64 {
        self.scheduling_us
    }

    fn preemption_processing_time(&self) -> u64 {
        self.preemption_us
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> BlackboxLatencyModel {
        BlackboxLatencyModel::new(&[1000.0, 10.0, 5.0], &[100.0, 1.0, 100.0], 0, 0).unwrap()
    }

    #[test]
    fn test_step_time_linear_in_tokens() {
        let m = model();
        let batch = BatchShape {
            requests: 3,
            prefill_tokens: 100,
            decode_tokens: 2,
        };
        assert_eq!(m.step_time(&batch), 1000 + 1000 + 10);
        assert_eq!(m.step_time(&BatchShape::default()), 1000);
    }

    #[test]
    fn test_queueing_time_depends_on_input() {
        let m = model();
        let req = Request {
            id: 0,
            arrival_us: 0,
            input_tokens: 250,
            output_tokens: 10,
            slo_class: String::new(),
            prefix_hashes: vec![],
        };
        assert_eq!(m.queueing_time(&req), 350);
        assert_eq!(m.output_token_processing_time(), 100);
    }

    #[test]
    fn test_step_time_monotone_in_scheduled_tokens() {
        let m = model();
        let mut last = 0;
        for tokens in (0..4096).step_by(64) {
            let batch = BatchShape {
                requests: 8,
                prefill_tokens: tokens,
                decode_tokens: 8,
            };
            let t = m.step_time(&batch);
            assert!(t >= last, "step time decreased at {} tokens", tokens);
            last = t;
        }
    }

    #[test]
    fn test_rejects_every_bad_coefficient() {
        let err = BlackboxLatencyModel::new(&[f64::NAN, -1.0], &[0.0, f64::INFINITY, 1.0], 0, 0)
            .unwrap_err();
        let LatencyError::InvalidCoefficients(problems) = &err;
        assert_eq!(problems.len(), 4);
        let msg = err.to_string();
        assert!(msg.contains("beta needs 3"));
        assert!(msg.contains("beta[0]"));
        assert!(msg.contains("beta[1]"));
        assert!(msg.contains("alpha[1]"));
    }

    #[test]
    fn test_overheads_are_configurable() {
        let m = BlackboxLatencyModel::new(&[0.0; 3], &[0.0; 3], 7, 11).unwrap();
        assert_eq!(m.scheduling_processing_time(), 7);
        assert_eq!(m.preemption_processing_time(), 11);
    }
}
