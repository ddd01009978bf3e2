//! Bounded calls to external collaborators: every call races a timeout and
//! the event's cancellation token.

use crate::error::{Backend, CoreError, CoreResult};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub async fn bounded<T, F>(
    backend: Backend,
    after: Duration,
    token: &CancellationToken,
    fut: F,
) -> CoreResult<T>
where
    F: Future<Output = CoreResult<T>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(CoreError::Cancelled),
        result = tokio::time::timeout(after, fut) => {
            result.map_err(|_| CoreError::BackendTimeout { backend, after })?
        }
    }
}

/// Like [`bounded`] for collaborator futures that report `anyhow` errors.
pub async fn call<T, F>(
    backend: Backend,
    after: Duration,
    token: &CancellationToken,
    fut: F,
) -> CoreResult<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    bounded(backend, after, token, async move {
        fut.await.map_err(|e| CoreError::unavailable(backend, e))
    })
    .await
}
