//! Per-worker export statistics and the merged run summary.

use std::time::{Duration, Instant};

use crate::error::GenericError;
use crate::model::{Batch, BatchExporter};

/// Per-worker collector: one duration and outcome per exporter call.
#[derive(Debug, Default)]
pub struct Stats {
    durations: Vec<Duration>,
    successes: u64,
    failures: u64,
}

impl Stats {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Stats::default()
    }

    /// Records one exporter call.
    pub fn record(&mut self, duration: Duration, success: bool) {
        self.durations.push(duration);
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
    }

    /// Summarizes this collector alone.
    pub fn summary(&self) -> Summary {
        summarize(std::slice::from_ref(self))
    }
}

/// Aggregated view over one or more collectors.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    /// Total exporter calls.
    pub total: u64,
    /// Calls that succeeded.
    pub successes: u64,
    /// Calls that failed.
    pub failures: u64,
    /// Mean call latency.
    pub avg_latency: Duration,
    /// 95th percentile call latency.
    pub p95_latency: Duration,
}

/// Merges collectors into one summary.
///
/// Latencies are pooled across workers before computing the average and the
/// P95 (index `floor((N-1) * 0.95)` of the sorted pool).
pub fn summarize(stats: &[Stats]) -> Summary {
    let mut durations: Vec<Duration> = stats.iter().flat_map(|s| s.durations.iter().copied()).collect();
    let successes = stats.iter().map(|s| s.successes).sum();
    let failures = stats.iter().map(|s| s.failures).sum();

    if durations.is_empty() {
        return Summary {
            total: 0,
            successes,
            failures,
            avg_latency: Duration::ZERO,
            p95_latency: Duration::ZERO,
        };
    }

    durations.sort_unstable();
    let total = durations.len();
    let sum: Duration = durations.iter().sum();
    let avg = sum / total as u32;
    let p95_index = ((total - 1) as f64 * 0.95) as usize;

    Summary {
        total: total as u64,
        successes,
        failures,
        avg_latency: avg,
        p95_latency: durations[p95_index],
    }
}

/// Exporter wrapper that times every call and records its outcome.
pub struct InstrumentedExporter {
    inner: Box<dyn BatchExporter>,
    stats: Stats,
}

impl InstrumentedExporter {
    /// Wraps an exporter with a fresh collector.
    pub fn new(inner: Box<dyn BatchExporter>) -> Self {
        InstrumentedExporter {
            inner,
            stats: Stats::new(),
        }
    }

    /// Exports a batch, recording wall-clock duration and outcome.
    pub async fn export(&mut self, batch: &Batch) -> Result<(), GenericError> {
        let start = Instant::now();
        let result = self.inner.export(batch).await;
        self.stats.record(start.elapsed(), result.is_ok());
        result
    }

    /// Shuts the wrapped exporter down.
    pub async fn shutdown(&mut self) -> Result<(), GenericError> {
        self.inner.shutdown().await
    }

    /// Releases the wrapper, returning the collected stats.
    pub fn into_stats(self) -> Stats {
        self.stats
    }
}

/// Renders the five-line run summary.
pub fn format_summary(summary: &Summary) -> String {
    [
        format!("Sent {} requests", format_count(summary.total)),
        format!("Success: {}", format_count(summary.successes)),
        format!("Failures: {}", format_count(summary.failures)),
        format!("Avg latency: {}", format_latency(summary.avg_latency)),
        format!("P95 latency: {}", format_latency(summary.p95_latency)),
    ]
    .join("\n")
}

/// Formats a count, abbreviating thousands as `12.3k` (or `12k` when exact).
fn format_count(count: u64) -> String {
    if count >= 1000 {
        if count % 1000 == 0 {
            return format!("{}k", count / 1000);
        }
        return format!("{:.1}k", count as f64 / 1000.0);
    }
    format!("{}", count)
}

fn format_latency(duration: Duration) -> String {
    format!("{}ms", duration.as_millis())
}
