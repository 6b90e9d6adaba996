//! The shape shared by the four workers: an async `run` loop driven by a
//! single-shot [`CancellationToken`], spawned with `tokio::spawn` and joined
//! on shutdown.
//!
//! Grounded on the teacher's `JobWorker::run` in `kernel/jobs/worker.rs`
//! (`tokio::select!` between `shutdown.cancelled()` and the next timer tick).

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait Worker: Send {
    /// Run until `shutdown` is cancelled, then return. Implementations must
    /// treat cancellation as cooperative: finish the in-flight tick, then
    /// exit without starting a new one.
    async fn run(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()>;
}
