//! Scan scheduler: periodic, bounded-concurrency evaluation of the
//! instrument universe.
//!
//! Cycles never overlap. Within a cycle each instrument runs as its own task
//! behind a semaphore; per-instrument failures are logged and counted but
//! never abort the cycle. Once shutdown is requested, tasks still waiting for
//! a permit are abandoned and only in-flight evaluations finish.

mod evaluator;

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::FutureExt;
use rand::Rng;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::time::sleep;
use tracing::{debug, error, info, info_span, warn, Instrument as _};

use crate::config::SchedulerConfig;
use crate::market::InstrumentCatalog;

pub use evaluator::{EvaluationError, EvaluatorQueues, InstrumentEvaluator, InstrumentOutcome};

const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Summary of one scan cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub instruments: usize,
    pub decided: usize,
    pub market_closed: usize,
    pub halted: usize,
    pub blocked: usize,
    pub alerts: usize,
    pub opens_requested: usize,
    pub failed: usize,
    /// Never started because shutdown was requested
    pub abandoned: usize,
}

/// How one instrument task ended.
enum TaskResult {
    Done(InstrumentOutcome),
    Failed,
    Abandoned,
}

/// Resolves once shutdown is requested or its sender is gone.
async fn stopped(mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

impl CycleReport {
    fn record(&mut self, outcome: &InstrumentOutcome) {
        match outcome {
            InstrumentOutcome::MarketClosed => self.market_closed += 1,
            InstrumentOutcome::Halted { .. } => self.halted += 1,
            InstrumentOutcome::Decided {
                admission,
                alerted,
                open_requested,
                ..
            } => {
                self.decided += 1;
                if admission.is_blocked() {
                    self.blocked += 1;
                }
                if *alerted {
                    self.alerts += 1;
                }
                if *open_requested {
                    self.opens_requested += 1;
                }
            }
        }
    }
}

/// Drives scan cycles until shutdown.
pub struct ScanScheduler {
    config: SchedulerConfig,
    catalog: Arc<dyn InstrumentCatalog>,
    evaluator: Arc<InstrumentEvaluator>,
}

impl ScanScheduler {
    pub fn new(
        config: SchedulerConfig,
        catalog: Arc<dyn InstrumentCatalog>,
        evaluator: Arc<InstrumentEvaluator>,
    ) -> Self {
        Self {
            config,
            catalog,
            evaluator,
        }
    }

    fn jitter(&self) -> Duration {
        if self.config.jitter_max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=self.config.jitter_max_ms))
    }

    /// Evaluate every instrument once and wait for all tasks to finish.
    ///
    /// Errors only when the universe cannot be loaded.
    pub async fn run_cycle(&self, shutdown: &watch::Receiver<bool>) -> Result<CycleReport> {
        let instruments = self
            .catalog
            .list_instruments()
            .await
            .context("Failed to load instrument universe")?;

        let mut report = CycleReport {
            instruments: instruments.len(),
            ..Default::default()
        };
        if instruments.is_empty() {
            return Ok(report);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut handles = Vec::with_capacity(instruments.len());

        for instrument in instruments {
            let sem = semaphore.clone();
            let evaluator = self.evaluator.clone();
            let jitter = self.jitter();
            let shutdown = shutdown.clone();
            let span = info_span!("evaluate", symbol = %instrument.symbol);

            let handle = tokio::spawn(
                async move {
                    let admitted = tokio::select! {
                        biased;
                        _ = stopped(shutdown) => None,
                        permit = async {
                            let permit = sem.acquire_owned().await.ok()?;
                            sleep(jitter).await;
                            Some(permit)
                        } => permit,
                    };
                    let Some(_permit) = admitted else {
                        debug!("Shutdown requested, instrument abandoned");
                        return TaskResult::Abandoned;
                    };

                    match evaluator.evaluate(&instrument, Utc::now()).await {
                        Ok(outcome) => TaskResult::Done(outcome),
                        Err(e) => {
                            warn!(error = %e, "Instrument skipped");
                            TaskResult::Failed
                        }
                    }
                }
                .instrument(span),
            );
            handles.push(handle);
        }

        for handle in handles {
            match handle.await {
                Ok(TaskResult::Done(outcome)) => report.record(&outcome),
                Ok(TaskResult::Failed) => report.failed += 1,
                Ok(TaskResult::Abandoned) => report.abandoned += 1,
                Err(e) => {
                    error!(error = %e, "Instrument task panicked");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Run cycles until `shutdown` flips to true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.scan_interval_secs,
            max_concurrency = self.config.max_concurrency,
            "🔍 Scan scheduler started"
        );

        while !*shutdown.borrow() {
            let pause = match self.run_cycle(&shutdown).await {
                Ok(report) if report.instruments == 0 => {
                    warn!("Instrument universe is empty, idling");
                    self.config.idle_interval()
                }
                Ok(report) => {
                    info!(
                        instruments = report.instruments,
                        decided = report.decided,
                        market_closed = report.market_closed,
                        halted = report.halted,
                        blocked = report.blocked,
                        alerts = report.alerts,
                        opens = report.opens_requested,
                        failed = report.failed,
                        abandoned = report.abandoned,
                        "Scan cycle complete"
                    );
                    self.config.scan_interval()
                }
                Err(e) => {
                    error!(error = %e, "Scan cycle failed, backing off");
                    self.config.error_backoff()
                }
            };

            tokio::select! {
                _ = sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Scan scheduler stopped");
    }

    /// Keep `run` alive until shutdown, restarting it if it returns early or
    /// panics. The loop runs inside this future, so aborting the task that
    /// drives it cancels the scheduler too.
    pub async fn supervise(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let mut restarts = 0u32;

        loop {
            let result = AssertUnwindSafe(self.run(shutdown.clone()))
                .catch_unwind()
                .await;

            if *shutdown.borrow() || shutdown.has_changed().is_err() {
                break;
            }

            restarts += 1;
            match result {
                Err(_) => error!(restarts, "💥 Scan scheduler panicked, restarting"),
                Ok(()) => warn!(restarts, "Scan scheduler exited unexpectedly, restarting"),
            }
            sleep(RESTART_DELAY).await;
        }
    }
}
