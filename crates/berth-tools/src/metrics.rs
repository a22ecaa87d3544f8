//! Per-tool execution counters.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Upper bounds (inclusive, in milliseconds) of the duration histogram
/// buckets. A final overflow bucket catches everything slower.
pub const DURATION_BUCKETS_MS: [u64; 5] = [10, 100, 1_000, 10_000, 60_000];

/// Execution statistics for a single tool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolMetrics {
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_duration_ms: u64,
    pub min_duration_ms: Option<u64>,
    pub max_duration_ms: Option<u64>,
    /// One count per entry of [`DURATION_BUCKETS_MS`], plus the overflow bucket.
    pub histogram: [u64; DURATION_BUCKETS_MS.len() + 1],
}

impl ToolMetrics {
    pub fn record(&mut self, duration: Duration, success: bool) {
        let ms = duration.as_millis() as u64;
        self.executions += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.total_duration_ms += ms;
        self.min_duration_ms = Some(self.min_duration_ms.map_or(ms, |m| m.min(ms)));
        self.max_duration_ms = Some(self.max_duration_ms.map_or(ms, |m| m.max(ms)));

        let bucket = DURATION_BUCKETS_MS
            .iter()
            .position(|bound| ms <= *bound)
            .unwrap_or(DURATION_BUCKETS_MS.len());
        self.histogram[bucket] += 1;
    }

    pub fn average_duration_ms(&self) -> Option<u64> {
        (self.executions > 0).then(|| self.total_duration_ms / self.executions)
    }
}
