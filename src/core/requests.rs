//! In-flight request tracking and cancellation
//!
//! Backends register each request under its id. Cancelling wakes the
//! request's waiter; a streaming response then ends with
//! `BackendError::Cancelled`. Entries are removed when the guard drops,
//! which also covers clients that disconnect mid-stream.

use crate::core::backend::BackendError;
use futures::StreamExt;
use futures::stream::Stream;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::debug;

/// Registry of in-flight requests
#[derive(Debug, Default)]
pub struct RequestRegistry {
    active: Mutex<HashMap<String, Arc<Notify>>>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Notify>>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a request; it stays tracked until the guard drops
    pub fn register(self: &Arc<Self>, request_id: &str) -> RequestGuard {
        let notify = Arc::new(Notify::new());
        self.lock().insert(request_id.to_string(), notify.clone());
        debug!("Tracking request {}", request_id);
        RequestGuard {
            registry: self.clone(),
            request_id: request_id.to_string(),
            notify,
        }
    }

    /// Signal cancellation
    ///
    /// Returns false if no request with that id is in flight.
    pub fn cancel(&self, request_id: &str) -> bool {
        match self.lock().get(request_id) {
            Some(notify) => {
                // notify_one stores a permit if nobody is waiting right now
                notify.notify_one();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.lock().contains_key(request_id)
    }

    /// Number of requests in flight
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, request_id: &str) {
        self.lock().remove(request_id);
    }
}

/// Keeps a request registered while alive
#[derive(Debug)]
pub struct RequestGuard {
    registry: Arc<RequestRegistry>,
    request_id: String,
    notify: Arc<Notify>,
}

impl RequestGuard {
    /// Run a future, resolving to `Cancelled` if the request is cancelled first
    pub async fn run<F, T>(&self, fut: F) -> Result<T, BackendError>
    where
        F: Future<Output = Result<T, BackendError>>,
    {
        tokio::select! {
            _ = self.notify.notified() => Err(BackendError::Cancelled),
            result = fut => result,
        }
    }

    /// Wrap a stream so it ends with `Cancelled` when the request is cancelled
    ///
    /// The guard moves into the stream and unregisters when it is dropped.
    pub fn wrap_stream<S, T>(
        self,
        stream: S,
    ) -> Pin<Box<dyn Stream<Item = Result<T, BackendError>> + Send>>
    where
        S: Stream<Item = Result<T, BackendError>> + Send + 'static,
        T: Send + 'static,
    {
        let guard = self;
        Box::pin(async_stream::stream! {
            let notify = guard.notify.clone();
            tokio::pin!(stream);

            loop {
                let next = tokio::select! {
                    _ = notify.notified() => None,
                    item = stream.next() => Some(item),
                };

                match next {
                    None => {
                        debug!("Request {} cancelled", guard.request_id);
                        yield Err(BackendError::Cancelled);
                        break;
                    }
                    Some(None) => break,
                    Some(Some(item)) => yield item,
                }
            }
        })
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.request_id);
    }
}
