//! Scheduling runtime: spawns the worker pool, paces it with a token
//! governor, and coordinates warmup, duration and shutdown.
//!
//! The governor task adds permits to a shared semaphore at the configured
//! request rate; workers claim one permit per request and forget it, so the
//! governor is the only source of tokens. The semaphore doubles as the
//! bounded work queue: when `requestrate + 2` tokens are already pending the
//! governor drops the tick's surplus and logs a missed-rate warning instead
//! of letting backlog grow without bound.
//!
//! Fractional tokens are carried across governor ticks so low rates are not
//! starved by integer truncation and the long-term average stays exact.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Barrier, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::generator::{Generator, GeneratorFactory, WorkerContext};
use crate::stats::Stats;

/// Governor tick granularity. Smaller ticks smooth the rate at the cost of
/// more wakeups.
const TICK: Duration = Duration::from_millis(100);

/// How many extra tokens beyond the rate may queue up (burst allowance).
const QUEUE_SLACK: u64 = 2;

pub struct Runner {
    requestrate: u64,
    concurrency: usize,
    warmup: Duration,
    duration: Duration,
    cancel: CancellationToken,
    stats: Stats,
    factory: GeneratorFactory,
}

impl Runner {
    pub fn new(
        requestrate: u64,
        concurrency: usize,
        warmup: Duration,
        duration: Duration,
        cancel: CancellationToken,
        stats: Stats,
        factory: GeneratorFactory,
    ) -> Self {
        Self {
            requestrate,
            concurrency,
            warmup,
            duration,
            cancel,
            stats,
            factory,
        }
    }

    /// Run the full lifecycle: spawn workers, wait out the init barrier,
    /// pace ticks until the duration elapses or the context is canceled,
    /// drain, and print the final report.
    pub async fn run(&self) {
        let tokens = Arc::new(Semaphore::new(0));
        let barrier = Arc::new(Barrier::new(self.concurrency + 1));
        let paced = self.requestrate > 0;

        tracing::debug!("starting {} workers", self.concurrency);
        let mut workers = Vec::with_capacity(self.concurrency);
        for id in 1..=self.concurrency {
            let context = WorkerContext {
                id,
                requestrate: self.requestrate,
                concurrency: self.concurrency,
                cancel: self.cancel.clone(),
                stats: self.stats.clone(),
            };
            let factory = self.factory.clone();
            let barrier = barrier.clone();
            let tokens = tokens.clone();
            let cancel = self.cancel.clone();

            workers.push(tokio::spawn(
                async move {
                    let mut generator = factory(context);
                    let init = generator.init().await;
                    // Peers wait on the barrier regardless of our outcome.
                    barrier.wait().await;
                    if let Err(err) = init {
                        tracing::error!("initialization failed: {err:#}");
                        return;
                    }
                    worker_loop(generator, tokens, cancel, paced).await;
                }
                .instrument(tracing::info_span!("worker", id)),
            ));
        }

        barrier.wait().await;
        tracing::info!("starting ...");

        // Connection setup noise does not belong in the measured run.
        self.stats.reset_metrics().await;

        let governor = tokio::spawn(token_governor(
            tokens,
            self.requestrate,
            self.cancel.clone(),
        ));

        if !self.warmup.is_zero() {
            let warmup = self.warmup;
            let stats = self.stats.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(warmup) => {
                        tracing::info!("warmup done ({})", humantime::format_duration(warmup));
                        stats.reset_metrics().await;
                    }
                }
            });
        }

        if !self.duration.is_zero() {
            let deadline = self.warmup + self.duration;
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(deadline) => cancel.cancel(),
                }
            });
        }

        tracing::debug!("waiting for workers to finish");
        for worker in workers {
            if let Err(err) = worker.await {
                tracing::error!("worker panicked: {err}");
            }
        }

        governor.abort();
        let _ = governor.await;

        print!("{}", self.stats.report().await);
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

async fn worker_loop(
    mut generator: Box<dyn Generator>,
    tokens: Arc<Semaphore>,
    cancel: CancellationToken,
    paced: bool,
) {
    if let Err(err) = generator.init_done().await {
        tracing::error!("init_done error: {err:#}");
    }

    tracing::debug!("starting run");
    loop {
        if paced {
            tokio::select! {
                _ = cancel.cancelled() => break,
                permit = tokens.clone().acquire_owned() => match permit {
                    // The governor owns replenishment; claimed tokens are
                    // never returned.
                    Ok(permit) => permit.forget(),
                    Err(_) => break,
                }
            }
        } else if cancel.is_cancelled() {
            break;
        }

        if let Err(err) = generator.tick().await {
            tracing::warn!("{err:#}");
            break;
        }
    }
    tracing::debug!("exiting run");

    if let Err(err) = generator.finish().await {
        tracing::warn!("finish error: {err:#}");
    }
}

/// Adds tokens to the pool at `requestrate` per second. A zero rate closes
/// the pool immediately: workers then run back-to-back with no pacing.
async fn token_governor(tokens: Arc<Semaphore>, requestrate: u64, cancel: CancellationToken) {
    if requestrate == 0 {
        tokens.close();
        return;
    }

    let capacity = (requestrate + QUEUE_SLACK) as usize;
    let mut fractional = 0.0;
    let mut missed: u64 = 0;
    let mut next_tick = Instant::now() + TICK;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep_until(next_tick) => {}
        }
        next_tick += TICK;

        let (add, carry) = tokens_per_tick(requestrate as f64, TICK, fractional);
        fractional = carry;
        if add == 0 {
            continue;
        }

        let pending = tokens.available_permits();
        let grant = add.min(capacity.saturating_sub(pending));
        if grant > 0 {
            tokens.add_permits(grant);
        }

        let dropped = (add - grant) as u64;
        if dropped > 0 {
            if missed % 100 == 0 {
                tracing::warn!("target host is likely slow: missed request rate (queued={pending})");
            }
            missed += dropped;
        }
    }
}

/// Tokens to add for one governor tick, carrying the fractional remainder
/// forward so the long-term average matches the rate exactly.
fn tokens_per_tick(rate: f64, tick: Duration, fractional: f64) -> (usize, f64) {
    let add = rate * tick.as_secs_f64() + fractional;
    let whole = add.floor();
    let carry = add - whole;
    let whole = if whole < 0.0 {
        0
    } else if whole >= Semaphore::MAX_PERMITS as f64 {
        Semaphore::MAX_PERMITS
    } else {
        whole as usize
    };
    (whole, carry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingGenerator {
        ticks: Arc<AtomicUsize>,
        finished: Arc<AtomicUsize>,
        fail_init: bool,
    }

    #[async_trait]
    impl Generator for CountingGenerator {
        async fn init(&mut self) -> anyhow::Result<()> {
            if self.fail_init {
                anyhow::bail!("nope");
            }
            Ok(())
        }

        async fn tick(&mut self) -> anyhow::Result<()> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn finish(&mut self) -> anyhow::Result<()> {
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counting_factory(
        ticks: Arc<AtomicUsize>,
        finished: Arc<AtomicUsize>,
        fail_init_for: Option<usize>,
    ) -> GeneratorFactory {
        Arc::new(move |context: WorkerContext| {
            Box::new(CountingGenerator {
                ticks: ticks.clone(),
                finished: finished.clone(),
                fail_init: fail_init_for == Some(context.id),
            }) as Box<dyn Generator>
        })
    }

    #[test]
    fn tokens_per_tick_is_linear() {
        let mut rate = 100.0;
        let mut expected = 10;
        for _ in 0..5 {
            let (add, carry) = tokens_per_tick(rate, Duration::from_millis(100), 0.0);
            assert_eq!(add, expected);
            assert_eq!(carry, 0.0);
            rate *= 10.0;
            expected *= 10;
        }
    }

    #[test]
    fn tokens_per_tick_carries_fractions() {
        // 12.5 rps over 100ms ticks: 1.25 tokens per tick.
        let mut carry = 0.0;
        let mut total = 0;
        for _ in 0..8 {
            let (add, c) = tokens_per_tick(12.5, Duration::from_millis(100), carry);
            carry = c;
            total += add;
        }
        assert_eq!(total, 10);
        assert_eq!(carry, 0.0);
    }

    #[test]
    fn tokens_per_tick_clamps_extremes() {
        let (add, _) = tokens_per_tick(-5.0, Duration::from_millis(100), 0.0);
        assert_eq!(add, 0);
        let (add, carry) = tokens_per_tick(f64::MAX, Duration::from_secs(1), 0.0);
        assert_eq!(add, Semaphore::MAX_PERMITS);
        assert_eq!(carry, 0.0);
    }

    #[tokio::test]
    async fn zero_rate_closes_the_pool() {
        let tokens = Arc::new(Semaphore::new(0));
        let cancel = CancellationToken::new();
        token_governor(tokens.clone(), 0, cancel).await;
        assert!(tokens.clone().acquire_owned().await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn paced_run_approximates_the_request_rate() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let (stats, collector) = Stats::spawn("t", 50, 2, Duration::from_secs(1), false);

        let runner = Runner::new(
            50,
            2,
            Duration::ZERO,
            Duration::from_secs(1),
            cancel,
            stats.clone(),
            counting_factory(ticks.clone(), finished.clone(), None),
        );
        runner.run().await;

        let observed = ticks.load(Ordering::SeqCst);
        assert!(
            (40..=60).contains(&observed),
            "expected ~50 ticks, got {observed}"
        );
        assert_eq!(finished.load(Ordering::SeqCst), 2);

        stats.stop().await;
        collector.await.unwrap();
    }

    struct RecordingGenerator {
        stats: Stats,
    }

    #[async_trait]
    impl Generator for RecordingGenerator {
        async fn init(&mut self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn tick(&mut self) -> anyhow::Result<()> {
            let mut record =
                crate::stats::TraceRecord::new(crate::stats::TraceKind::Custom, "custom", "tick");
            record.duration = Duration::from_micros(100);
            self.stats.record(record).await;
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn warmup_resets_collected_metrics() {
        let cancel = CancellationToken::new();
        let (stats, collector) = Stats::spawn("t", 40, 1, Duration::from_secs(1), false);

        let factory: GeneratorFactory = Arc::new(|context: WorkerContext| {
            Box::new(RecordingGenerator {
                stats: context.stats.clone(),
            }) as Box<dyn Generator>
        });
        let runner = Runner::new(
            40,
            1,
            Duration::from_millis(500),
            Duration::from_millis(500),
            cancel,
            stats.clone(),
            factory,
        );
        runner.run().await;

        let report = stats.export().await.unwrap();
        let count = report.results.first().map(|r| r.histogram.count).unwrap_or(0);
        // Only the post-warmup half of the run survives the reset.
        assert!(
            count >= 10 && count <= 30,
            "expected ~20 post-warmup records, got {count}"
        );

        stats.stop().await;
        collector.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancellation_before_start_produces_no_ticks() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (stats, collector) = Stats::spawn("t", 10, 3, Duration::ZERO, false);

        let runner = Runner::new(
            10,
            3,
            Duration::ZERO,
            Duration::ZERO,
            cancel,
            stats.clone(),
            counting_factory(ticks.clone(), finished.clone(), None),
        );

        let started = std::time::Instant::now();
        runner.run().await;

        assert_eq!(ticks.load(Ordering::SeqCst), 0);
        assert_eq!(finished.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() < Duration::from_millis(100));

        stats.stop().await;
        collector.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn one_failed_init_does_not_stop_peers() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let (stats, collector) = Stats::spawn("t", 0, 2, Duration::ZERO, false);

        let runner = Runner::new(
            0,
            2,
            Duration::ZERO,
            Duration::from_millis(200),
            cancel,
            stats.clone(),
            counting_factory(ticks.clone(), finished.clone(), Some(1)),
        );
        runner.run().await;

        // Worker 1 never ran, worker 2 ran unpaced.
        assert!(ticks.load(Ordering::SeqCst) > 0);
        assert_eq!(finished.load(Ordering::SeqCst), 1);

        stats.stop().await;
        collector.await.unwrap();
    }
}
