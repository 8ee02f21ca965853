//! Loss-derived metrics
//!
//! Metrics are observational only. Anything non-finite saturates to `+inf`
//! instead of failing the loop.

use serde::{Deserialize, Serialize};

/// `e^loss`, or `+inf` when that is not a finite number
pub fn perplexity(loss: f64) -> f64 {
    let ppl = loss.exp();
    if ppl.is_finite() {
        ppl
    } else {
        f64::INFINITY
    }
}

/// Evaluation result for one epoch, aggregated over every worker
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvalMetrics {
    /// Mean gathered loss
    pub loss: f64,

    /// `e^loss`
    pub perplexity: f64,

    /// Number of gathered loss values
    pub samples: usize,
}

impl EvalMetrics {
    /// Aggregate gathered losses
    ///
    /// An empty set, a non-finite mean or an overflowing perplexity all
    /// resolve to `+inf` for both loss and perplexity.
    pub fn from_losses(losses: &[f64]) -> Self {
        let samples = losses.len();
        if samples == 0 {
            return Self::saturated(0);
        }

        let mean = losses.iter().sum::<f64>() / samples as f64;
        if !mean.is_finite() {
            return Self::saturated(samples);
        }
        let ppl = mean.exp();
        if !ppl.is_finite() {
            return Self::saturated(samples);
        }

        Self {
            loss: mean,
            perplexity: ppl,
            samples,
        }
    }

    fn saturated(samples: usize) -> Self {
        Self {
            loss: f64::INFINITY,
            perplexity: f64::INFINITY,
            samples,
        }
    }

    pub fn is_saturated(&self) -> bool {
        self.loss.is_infinite() && self.perplexity.is_infinite()
    }
}
