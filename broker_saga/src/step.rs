use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// A single step in a saga, generic over the saga's shared business data
/// `D` and the step's own error type `E`.
///
/// `execute` performs the step's forward action; `compensate` undoes it.
/// Both receive a [`CancellationToken`] and must stop promptly when it is
/// cancelled, propagating out rather than completing partially.
#[async_trait]
pub trait SagaStep<D, E>: Send + Sync {
    /// A short, stable name for this step, used in error reporting and
    /// metrics.
    fn name(&self) -> &str;

    /// Performs the step's forward action against `data`.
    async fn execute(&self, data: &mut D, cancel: &CancellationToken) -> Result<(), E>;

    /// Undoes this step's effect against `data`. Called only after a later
    /// step in the same saga has failed.
    async fn compensate(&self, data: &mut D, cancel: &CancellationToken) -> Result<(), E>;
}
