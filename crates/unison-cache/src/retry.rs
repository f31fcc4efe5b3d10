use std::future::Future;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

/// Contract for the retry layer a fetcher may wrap around its backend
/// calls.
///
/// The cache itself never retries: a failed fetch settles every attached
/// caller and purges the entry. Fetchers that want retry semantics run
/// their backend call through an executor implementing this trait instead.
///
/// Implementations must observe `token` — fetchers receive the all-of
/// reduction over their callers' tokens and are expected to pass it down —
/// and wind down in bounded time once it fires, without starting further
/// attempts. Attempt counts, backoff delays and other retry-level
/// bookkeeping stay behind this interface.
pub trait RetryExecutor: Send + Sync {
    /// Runs `op` until it succeeds, the policy gives up, or `token` fires.
    fn execute<'a, T, F, Fut>(
        &'a self,
        token: CancellationToken,
        op: F,
    ) -> BoxFuture<'a, anyhow::Result<T>>
    where
        T: Send + 'a,
        F: FnMut() -> Fut + Send + 'a,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'a;
}

/// Executor that runs the operation exactly once.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoRetry;

impl RetryExecutor for NoRetry {
    fn execute<'a, T, F, Fut>(
        &'a self,
        token: CancellationToken,
        mut op: F,
    ) -> BoxFuture<'a, anyhow::Result<T>>
    where
        T: Send + 'a,
        F: FnMut() -> Fut + Send + 'a,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'a,
    {
        async move {
            tokio::select! {
                biased;
                result = op() => result,
                _ = token.cancelled() => Err(anyhow::anyhow!("operation cancelled")),
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_the_operation_once() {
        let token = CancellationToken::new();
        let result = NoRetry
            .execute(token, || async { Ok::<_, anyhow::Error>(42) })
            .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn winds_down_on_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let result = NoRetry
            .execute(token, || futures::future::pending::<anyhow::Result<u32>>())
            .await;
        assert!(result.is_err());
    }
}
