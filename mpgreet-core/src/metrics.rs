//! Counters for greeting and merge activity

use metrics::{counter, describe_counter, histogram};
use std::time::Instant;

/// Metric names
pub mod names {
    pub const PACKETS_ENCODED: &str = "greet.packets.encoded";
    pub const PACKETS_DECODED: &str = "greet.packets.decoded";
    pub const PARTIAL_DECODE_SUMMARIES: &str = "greet.partial_decode.summaries";
    pub const OPERATIONS_COMPLETED: &str = "greet.operations.completed";
    pub const OPERATIONS_FAILED: &str = "greet.operations.failed";
    pub const MERGES_COMPUTED: &str = "graph.merges.computed";
    pub const MERGE_DURATION_MS: &str = "graph.merge.duration_ms";
    pub const SUBSCRIBER_FAILURES: &str = "async.subscriber.failures";
}

/// Register metric descriptions with the installed recorder
pub fn init_metrics() {
    describe_counter!(names::PACKETS_ENCODED, "Number of greet packets encoded and signed");
    describe_counter!(names::PACKETS_DECODED, "Number of greet packets decoded and verified");
    describe_counter!(
        names::PARTIAL_DECODE_SUMMARIES,
        "Number of partial decodes that identified an initial or final packet"
    );
    describe_counter!(names::OPERATIONS_COMPLETED, "Number of greeting operations completed");
    describe_counter!(names::OPERATIONS_FAILED, "Number of greeting operations failed");
    describe_counter!(names::MERGES_COMPUTED, "Number of multi-head merges computed");
    describe_counter!(names::SUBSCRIBER_FAILURES, "Number of failed event subscribers");
}

/// Record a counter metric
pub fn record_counter(name: &'static str, value: u64) {
    counter!(name).increment(value);
}

/// Timer for measuring operation duration
pub struct Timer {
    name: &'static str,
    start: Instant,
}

impl Timer {
    pub fn new(name: &'static str) -> Self {
        Self { name, start: Instant::now() }
    }

    /// Stop the timer and record the duration in milliseconds
    pub fn stop(self) {
        histogram!(self.name).record(self.start.elapsed().as_secs_f64() * 1000.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_init() {
        // no recorder installed, so these must be no-ops
        init_metrics();
        record_counter(names::PACKETS_ENCODED, 1);
    }

    #[test]
    fn test_timer() {
        let timer = Timer::new(names::MERGE_DURATION_MS);
        timer.stop();
    }
}
