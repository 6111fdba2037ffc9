//! Deferred request queue
//!
//! Holds calls that failed on an expired credential until the session is
//! restored. Each entry keeps the immutable request descriptor and the
//! sender half of the caller's pending result. Replay is strictly FIFO and
//! sequential; clearing rejects every waiter with the same reason.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Instant;

use tokio::sync::{oneshot, watch};
use tracing::{debug, info};
use transport::{ApiResponse, RequestDescriptor};
use uuid::Uuid;

use crate::error::{Error, Result};

struct QueuedRequest {
    request: RequestDescriptor,
    enqueued_at: Instant,
    responder: oneshot::Sender<Result<ApiResponse>>,
}

/// Caller's handle on a queued request; resolves once it is replayed or dropped.
#[must_use = "the queued result is lost if the handle is dropped"]
pub struct PendingRequest {
    id: Uuid,
    rx: oneshot::Receiver<Result<ApiResponse>>,
}

impl PendingRequest {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Future for PendingRequest {
    type Output = Result<ApiResponse>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|settled| {
            settled.unwrap_or_else(|_| Err(Error::QueueCleared("queue dropped".into())))
        })
    }
}

/// FIFO of requests waiting on a restored credential.
pub struct RequestQueue {
    entries: Mutex<VecDeque<QueuedRequest>>,
    length: watch::Sender<usize>,
}

impl RequestQueue {
    pub fn new() -> Self {
        let (length, _) = watch::channel(0);
        Self {
            entries: Mutex::new(VecDeque::new()),
            length,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<QueuedRequest>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, len: usize) {
        self.length.send_replace(len);
        metrics::gauge!("session_queue_depth").set(len as f64);
    }

    /// Append a request. The same descriptor can be queued at most once.
    pub fn enqueue(&self, request: RequestDescriptor) -> Result<PendingRequest> {
        let id = request.id();
        let (responder, rx) = oneshot::channel();
        let len = {
            let mut entries = self.lock();
            if entries.iter().any(|e| e.request.id() == id) {
                return Err(Error::AlreadyQueued(id));
            }
            debug!(
                request_id = %id,
                path = request.route(),
                "request deferred until session is restored"
            );
            entries.push_back(QueuedRequest {
                request,
                enqueued_at: Instant::now(),
                responder,
            });
            entries.len()
        };
        self.publish(len);
        Ok(PendingRequest { id, rx })
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Whether any request is waiting on re-authentication.
    pub fn has_queued_requests(&self) -> bool {
        !self.is_empty()
    }

    /// Observe the queue length; every mutation publishes.
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.length.subscribe()
    }

    /// Replay every queued request in FIFO order, one at a time.
    ///
    /// The queue is emptied up front; requests deferred during the replay
    /// wait for the next round. Each waiter receives exactly what `replay`
    /// returned for its request. Returns the number of requests replayed.
    pub async fn process<F, Fut>(&self, mut replay: F) -> usize
    where
        F: FnMut(RequestDescriptor) -> Fut,
        Fut: Future<Output = Result<ApiResponse>>,
    {
        let batch: Vec<QueuedRequest> = self.lock().drain(..).collect();
        if batch.is_empty() {
            return 0;
        }
        self.publish(0);
        info!(count = batch.len(), "replaying deferred requests");

        let count = batch.len();
        for entry in batch {
            let id = entry.request.id();
            let waited_ms = entry.enqueued_at.elapsed().as_millis() as u64;
            let result = replay(entry.request).await;
            debug!(request_id = %id, waited_ms, ok = result.is_ok(), "deferred request settled");
            // Caller may have stopped waiting
            let _ = entry.responder.send(result);
        }
        count
    }

    /// Reject every queued request with `reason`. Returns how many were dropped.
    pub fn clear(&self, reason: &str) -> usize {
        let batch: Vec<QueuedRequest> = self.lock().drain(..).collect();
        self.publish(0);
        if !batch.is_empty() {
            info!(count = batch.len(), reason, "dropping deferred requests");
        }
        let count = batch.len();
        for entry in batch {
            let _ = entry.responder.send(Err(Error::QueueCleared(reason.to_string())));
        }
        count
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}
