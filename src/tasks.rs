//! Fire-and-forget side effects dispatched after a primary operation commits.
//! Failures are logged and never reach the caller.

use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::storage::ObjectStorage;

/// Runs a blocking repository call off the request path.
pub fn spawn_blocking_best_effort<F, T, E>(task: &'static str, work: F)
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let run = move || {
        if let Err(err) = work() {
            warn!(task, error = %err, "best-effort task failed");
        }
    };

    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(run);
        }
        Err(_) => run(),
    }
}

pub fn spawn_best_effort<F, E>(task: &'static str, work: F)
where
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(err) = work.await {
                    warn!(task, error = %err, "best-effort task failed");
                }
            });
        }
        Err(_) => warn!(task, "no runtime available, skipping best-effort task"),
    }
}

/// Deletes each key in turn; one failure does not stop the others.
pub async fn delete_objects(storage: &dyn ObjectStorage, keys: &[String]) {
    for key in keys {
        match storage.delete_object(key).await {
            Ok(()) => debug!(storage_key = %key, "deleted object"),
            Err(err) => warn!(storage_key = %key, error = %err, "failed to delete object"),
        }
    }
}

pub fn spawn_delete_objects(storage: Arc<dyn ObjectStorage>, keys: Vec<String>) {
    if keys.is_empty() {
        return;
    }
    spawn_best_effort("delete_objects", async move {
        delete_objects(storage.as_ref(), &keys).await;
        Ok::<_, std::convert::Infallible>(())
    });
}
