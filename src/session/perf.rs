//! Post-generation performance statistics.

use crate::engine::Completion;

/// Throughput summary for one completed generation.
///
/// Only a session that reached `Completed` produces a report; interrupted
/// and failed sessions leave the previous report untouched and a chat reset
/// clears it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerformanceReport {
    pub prefill_tokens_per_second: f64,
    pub decode_tokens_per_second: f64,
    pub total_tokens: u64,
    pub wall_clock_seconds: f64,
}

impl PerformanceReport {
    /// Derive a report from engine-reported counts and the orchestrator's
    /// wall-clock measurement.  Unreported timings yield a zero rate rather
    /// than a division error.
    pub fn from_completion(completion: &Completion, wall_clock_seconds: f64) -> Self {
        Self {
            prefill_tokens_per_second: rate(completion.prompt_tokens, completion.prefill_seconds),
            decode_tokens_per_second: rate(completion.completion_tokens, completion.decode_seconds),
            total_tokens: completion.prompt_tokens + completion.completion_tokens,
            wall_clock_seconds,
        }
    }
}

fn rate(tokens: u64, seconds: f64) -> f64 {
    if seconds > 0.0 { tokens as f64 / seconds } else { 0.0 }
}
