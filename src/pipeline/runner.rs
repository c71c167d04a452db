//! Concurrent pipeline execution.
//!
//! The runner spawns one task per worker. Each worker owns its exporter and
//! its metrics collector; the only state shared between workers lives inside
//! individual stages. The first worker error cancels the remaining workers,
//! and the merged summary is produced only after every worker has returned.

use std::sync::Arc;
use std::time::Duration;

use snafu::Snafu;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::Pipeline;
use crate::error::GenericError;
use crate::metrics::{summarize, InstrumentedExporter, Stats, Summary};
use crate::model::{Batch, ExporterFactory};

/// Why a run was interrupted before finishing its configured work.
///
/// Both variants are normal terminations: the summary is still produced, but
/// the cause is surfaced as the run's error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Snafu)]
pub enum Interrupted {
    /// The run was cancelled, typically by a signal.
    #[snafu(display("run cancelled"))]
    Cancelled,
    /// The run's deadline elapsed.
    #[snafu(display("run deadline exceeded"))]
    DeadlineExceeded,
}

/// Cancellation plus optional deadline, shared by every worker of a run.
#[derive(Clone, Debug, Default)]
pub struct RunSignal {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl RunSignal {
    /// Creates a signal with no deadline.
    pub fn new() -> Self {
        RunSignal::default()
    }

    /// Creates a signal whose deadline is `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        RunSignal {
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Cancels the signal, waking every pending [`RunSignal::done`] call.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Derives a signal that is cancelled when this one is, but can also be
    /// cancelled on its own.
    pub fn child(&self) -> RunSignal {
        RunSignal {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Returns the interruption cause, if the signal has fired.
    pub fn interrupted(&self) -> Option<Interrupted> {
        if self.token.is_cancelled() {
            return Some(Interrupted::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Some(Interrupted::DeadlineExceeded);
            }
        }
        None
    }

    /// Waits until the signal fires and returns the cause.
    pub async fn done(&self) -> Interrupted {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => Interrupted::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => Interrupted::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                Interrupted::Cancelled
            }
        }
    }
}

/// Per-worker pacing and bounds.
#[derive(Clone, Copy, Debug, Default)]
pub struct RunOptions {
    /// Delay between consecutive requests; zero means no delay.
    pub request_interval: Duration,
    /// Wall-clock cap per worker; zero means no cap.
    pub request_duration: Duration,
}

/// Spawns N workers, each driving the pipeline in a bounded loop.
pub struct ConcurrencyRunner {
    workers: usize,
    requests_per_worker: u64,
}

impl ConcurrencyRunner {
    /// Creates a runner with the given worker count and per-worker request
    /// budget (zero means unbounded).
    pub fn new(workers: usize, requests_per_worker: u64) -> Self {
        ConcurrencyRunner {
            workers,
            requests_per_worker,
        }
    }

    /// Number of workers.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Requests each worker performs; zero means unbounded.
    pub fn requests_per_worker(&self) -> u64 {
        self.requests_per_worker
    }

    /// Runs the pipeline across all workers and merges their metrics.
    ///
    /// The summary is always produced, even when the run ends with an error;
    /// the error is the first one any worker returned.
    pub async fn run(
        &self,
        pipeline: Arc<Pipeline>,
        factory: Arc<dyn ExporterFactory>,
        options: RunOptions,
        signal: &RunSignal,
    ) -> (Summary, Result<(), GenericError>) {
        // Workers run under a child signal so the first failure can cancel
        // siblings without cancelling the caller's signal.
        let group = signal.child();

        let mut workers = JoinSet::new();
        for worker_id in 0..self.workers {
            let pipeline = Arc::clone(&pipeline);
            let factory = Arc::clone(&factory);
            let signal = group.clone();
            let requests = self.requests_per_worker;
            workers.spawn(async move { run_worker(worker_id, pipeline, factory, signal, options, requests).await });
        }

        let mut stats = Vec::with_capacity(self.workers);
        let mut first_error: Option<GenericError> = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((worker_stats, result)) => {
                    stats.push(worker_stats);
                    if let Err(e) = result {
                        if first_error.is_none() {
                            first_error = Some(e);
                            group.cancel();
                        }
                    }
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(anyhow::anyhow!("worker task failed: {}", e));
                        group.cancel();
                    }
                }
            }
        }

        (summarize(&stats), first_error.map_or(Ok(()), Err))
    }
}

async fn run_worker(
    worker_id: usize,
    pipeline: Arc<Pipeline>,
    factory: Arc<dyn ExporterFactory>,
    signal: RunSignal,
    options: RunOptions,
    requests: u64,
) -> (Stats, Result<(), GenericError>) {
    let exporter = match factory.new_exporter().await {
        Ok(exporter) => exporter,
        Err(e) => return (Stats::new(), Err(e)),
    };
    let mut exporter = InstrumentedExporter::new(exporter);

    let result = worker_loop(&pipeline, &mut exporter, &signal, options, requests).await;

    // Shutdown runs on every exit path.
    if let Err(e) = exporter.shutdown().await {
        warn!(worker_id, error = %e, "Failed to shut down exporter.");
    }
    debug!(worker_id, "Worker finished.");

    (exporter.into_stats(), result)
}

async fn worker_loop(
    pipeline: &Pipeline,
    exporter: &mut InstrumentedExporter,
    signal: &RunSignal,
    options: RunOptions,
    requests: u64,
) -> Result<(), GenericError> {
    let started = Instant::now();
    let mut iteration: u64 = 0;

    loop {
        if requests > 0 && iteration >= requests {
            break;
        }
        if let Some(cause) = signal.interrupted() {
            return Err(cause.into());
        }
        if !options.request_duration.is_zero() && started.elapsed() >= options.request_duration {
            break;
        }

        let batch = pipeline.process(Batch::new())?;
        if !batch.is_empty() {
            tokio::select! {
                result = exporter.export(&batch) => result?,
                cause = signal.done() => return Err(cause.into()),
            }
        }

        let last_iteration = requests > 0 && iteration + 1 >= requests;
        if !options.request_interval.is_zero() && !last_iteration {
            tokio::select! {
                _ = tokio::time::sleep(options.request_interval) => {}
                cause = signal.done() => return Err(cause.into()),
            }
        }

        iteration += 1;
    }

    Ok(())
}
