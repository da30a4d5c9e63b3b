use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::stats::Stats;

/// Lifecycle contract every protocol adapter implements.
///
/// The runner drives it in strict order: `init` on every worker, then (once
/// all workers passed the init barrier) `init_done`, then one `tick` per work
/// token, then `finish` on shutdown. A tick performs exactly one logical
/// request and pushes at most one [`crate::stats::TraceRecord`].
///
/// `tick` returns `Err` only when the worker itself is beyond recovery; a
/// failed request is recorded as an error trace and `Ok(())` is returned so
/// the worker keeps going. Cancellation is not an error: an operation that
/// lost to the shared cancel token emits no error record.
#[async_trait]
pub trait Generator: Send {
    /// Establish connections and parse per-worker state.
    async fn init(&mut self) -> anyhow::Result<()>;

    /// Called after every worker finished `init`, successful or not.
    async fn init_done(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Drive exactly one logical request.
    async fn tick(&mut self) -> anyhow::Result<()>;

    /// Release resources.
    async fn finish(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Per-worker state handed to adapter constructors.
///
/// Carries the metrics handle so adapters never reach for shared mutable
/// state; everything an adapter observes flows through here.
#[derive(Clone)]
pub struct WorkerContext {
    /// 1-based worker id, used as a log field.
    pub id: usize,
    pub requestrate: u64,
    pub concurrency: usize,
    pub cancel: CancellationToken,
    pub stats: Stats,
}

/// Constructs one adapter per worker. Construction is infallible and cheap;
/// anything that can fail belongs in [`Generator::init`] so one bad worker
/// never takes down its peers.
pub type GeneratorFactory = Arc<dyn Fn(WorkerContext) -> Box<dyn Generator> + Send + Sync>;
