//! Bounded priority queue with deadline expiry.
//!
//! Ordered by `(priority, seq)`: lower priority value first, then submission order.
//! Each queue has a single consumer, so one stored `Notify` permit is enough to
//! never miss a wakeup.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::scheduler::request::{Job, QueuedRequest};

struct PriorityEntry<P>(QueuedRequest<P>);

impl<P> PartialEq for PriorityEntry<P> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<P> Eq for PriorityEntry<P> {}

impl<P> PartialOrd for PriorityEntry<P> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<P> Ord for PriorityEntry<P> {
    fn cmp(&self, other: &Self) -> Ordering {
        // max-heap: the more urgent entry compares greater
        other
            .0
            .priority
            .cmp(&self.0.priority)
            .then_with(|| other.0.seq.cmp(&self.0.seq))
    }
}

struct QueueInner<P> {
    heap: BinaryHeap<PriorityEntry<P>>,
    next_seq: u64,
    closed: bool,
}

/// Requests taken out of the heap without being dispatched.
struct Swept<P> {
    expired: Vec<QueuedRequest<P>>,
    abandoned: Vec<QueuedRequest<P>>,
}

impl<P> Default for Swept<P> {
    fn default() -> Self {
        Self {
            expired: Vec::new(),
            abandoned: Vec::new(),
        }
    }
}

impl<P> QueueInner<P> {
    fn sweep_expired(&mut self, now: Instant, swept: &mut Swept<P>) {
        if !self.heap.iter().any(|e| e.0.is_expired(now)) {
            return;
        }
        let (expired, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.heap)
            .into_vec()
            .into_iter()
            .partition(|e| e.0.is_expired(now));
        self.heap = live.into();
        swept.expired.extend(expired.into_iter().map(|e| e.0));
    }
}

pub struct PriorityQueue<P> {
    name: &'static str,
    capacity: usize,
    inner: StdMutex<QueueInner<P>>,
    notify: Notify,
    /// Wakes the expiry task when the earliest deadline may have moved.
    expiry: Notify,
}

impl<P> std::fmt::Debug for PriorityQueue<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PriorityQueue({}, depth={})", self.name, self.len())
    }
}

impl<P> PriorityQueue<P> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            inner: StdMutex::new(QueueInner {
                heap: BinaryHeap::new(),
                next_seq: 0,
                closed: false,
            }),
            notify: Notify::new(),
            expiry: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.heap.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().map(|i| i.closed).unwrap_or(true)
    }

    /// Earliest deadline among queued requests.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inner
            .lock()
            .ok()
            .and_then(|i| i.heap.iter().filter_map(|e| e.0.deadline()).min())
    }
}

impl<P: Job> PriorityQueue<P> {
    /// Admits a request and assigns its sequence number. A rejected request has
    /// its result slot resolved with the returned error.
    pub async fn push(&self, mut request: QueuedRequest<P>) -> Result<()> {
        let now = Instant::now();
        let mut swept = Swept::default();

        let rejected = match self.inner.lock() {
            Ok(mut inner) => {
                inner.sweep_expired(now, &mut swept);
                if inner.closed {
                    Some((Error::ShuttingDown, request))
                } else if inner.heap.len() >= self.capacity {
                    Some((Error::QueueFull(self.capacity), request))
                } else {
                    request.seq = inner.next_seq;
                    inner.next_seq += 1;
                    debug!(
                        queue = self.name,
                        request_id = %request.id,
                        caller = %request.caller,
                        priority = request.priority,
                        depth = inner.heap.len() + 1,
                        "Request queued"
                    );
                    inner.heap.push(PriorityEntry(request));
                    None
                }
            }
            Err(_) => Some((Error::ShuttingDown, request)),
        };

        self.settle(swept, now).await;

        match rejected {
            None => {
                self.notify.notify_one();
                self.expiry.notify_one();
                Ok(())
            }
            Some((error, request)) => {
                warn!(queue = self.name, request_id = %request.id, error = %error, "Request rejected at admission");
                request.payload.fail(error.clone()).await;
                Err(error)
            }
        }
    }

    fn take_next(&self, now: Instant, swept: &mut Swept<P>) -> (Option<QueuedRequest<P>>, bool) {
        let Ok(mut inner) = self.inner.lock() else {
            return (None, true);
        };
        inner.sweep_expired(now, swept);
        while let Some(PriorityEntry(request)) = inner.heap.pop() {
            if request.payload.is_abandoned() {
                swept.abandoned.push(request);
            } else {
                return (Some(request), inner.closed);
            }
        }
        (None, inner.closed)
    }

    /// Most urgent live request, if any, without waiting.
    pub async fn try_pop(&self) -> Option<QueuedRequest<P>> {
        let now = Instant::now();
        let mut swept = Swept::default();
        let (next, _) = self.take_next(now, &mut swept);
        self.settle(swept, now).await;
        next
    }

    /// Waits for the most urgent live request. `None` once the queue is closed
    /// and empty.
    pub async fn pop(&self) -> Option<QueuedRequest<P>> {
        loop {
            let now = Instant::now();
            let mut swept = Swept::default();
            let (next, closed) = self.take_next(now, &mut swept);
            self.settle(swept, now).await;

            if next.is_some() {
                return next;
            }
            if closed {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Resolves once something was pushed or the queue was closed.
    pub async fn wait_for_push(&self) {
        self.notify.notified().await;
    }

    /// Resolves every request whose deadline has passed. Returns how many.
    pub async fn expire_due(&self) -> usize {
        let now = Instant::now();
        let mut swept = Swept::default();
        if let Ok(mut inner) = self.inner.lock() {
            inner.sweep_expired(now, &mut swept);
        }
        let count = swept.expired.len();
        self.settle(swept, now).await;
        count
    }

    /// Resolves queued requests as their deadlines pass, so a busy consumer never
    /// leaves an expired caller waiting. Sleeps until the earliest deadline.
    pub async fn run_expiry(self: Arc<Self>, cancel: CancellationToken) {
        debug!(queue = self.name, "Expiry task started");
        loop {
            let wake = self.next_deadline();
            let due = async {
                match wake {
                    // expiry is strict, so wake just past the deadline
                    Some(deadline) => sleep_until(deadline.checked_add(Duration::from_millis(1)).unwrap_or(deadline)).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.expiry.notified() => {}
                _ = due => {
                    self.expire_due().await;
                }
            }
            if self.is_closed() {
                break;
            }
        }
        debug!(queue = self.name, "Expiry task stopped");
    }

    /// Stops admission and resolves everything still queued with `error`.
    pub async fn close(&self, error: Error) -> usize {
        let drained: Vec<QueuedRequest<P>> = match self.inner.lock() {
            Ok(mut inner) => {
                inner.closed = true;
                std::mem::take(&mut inner.heap)
                    .into_sorted_vec()
                    .into_iter()
                    .rev()
                    .map(|e| e.0)
                    .collect()
            }
            Err(_) => Vec::new(),
        };
        self.notify.notify_one();
        self.expiry.notify_one();

        let count = drained.len();
        for request in drained {
            request.payload.fail(error.clone()).await;
        }
        if count > 0 {
            warn!(queue = self.name, count, error = %error, "Drained queued requests");
        }
        count
    }

    async fn settle(&self, swept: Swept<P>, now: Instant) {
        for request in swept.expired {
            let error = request.timeout_error(now);
            warn!(
                queue = self.name,
                request_id = %request.id,
                caller = %request.caller,
                error = %error,
                "Request expired before dispatch"
            );
            request.payload.fail(error).await;
        }
        for request in swept.abandoned {
            debug!(queue = self.name, request_id = %request.id, "Dropping abandoned request");
            request.payload.fail(Error::Cancelled).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::request::CallerClass;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct FakeJob {
        label: &'static str,
        failures: Arc<Mutex<Vec<(&'static str, Error)>>>,
    }

    #[async_trait]
    impl Job for FakeJob {
        fn is_abandoned(&self) -> bool {
            false
        }

        async fn fail(self, error: Error) {
            self.failures.lock().unwrap().push((self.label, error));
        }
    }

    fn request(
        label: &'static str,
        priority: u8,
        timeout_ms: u64,
        failures: &Arc<Mutex<Vec<(&'static str, Error)>>>,
    ) -> QueuedRequest<FakeJob> {
        QueuedRequest::new(
            CallerClass::Chat,
            priority,
            Duration::from_millis(timeout_ms),
            FakeJob {
                label,
                failures: failures.clone(),
            },
        )
    }

    #[tokio::test]
    async fn pops_by_priority_then_submission_order() {
        let failures = Arc::new(Mutex::new(Vec::new()));
        let queue = PriorityQueue::new("test", 16);
        queue.push(request("summary", 8, 10_000, &failures)).await.unwrap();
        queue.push(request("chat-a", 1, 10_000, &failures)).await.unwrap();
        queue.push(request("search", 5, 10_000, &failures)).await.unwrap();
        queue.push(request("chat-b", 1, 10_000, &failures)).await.unwrap();

        let mut order = Vec::new();
        while let Some(r) = queue.try_pop().await {
            order.push(r.payload.label);
        }
        assert_eq!(order, vec!["chat-a", "chat-b", "search", "summary"]);
    }

    #[tokio::test]
    async fn expired_requests_never_dispatch() {
        let failures = Arc::new(Mutex::new(Vec::new()));
        let queue = PriorityQueue::new("test", 16);
        queue.push(request("stale", 0, 10, &failures)).await.unwrap();
        queue.push(request("fresh", 5, 10_000, &failures)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        let next = queue.try_pop().await.unwrap();
        assert_eq!(next.payload.label, "fresh");
        let failures = failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "stale");
        assert!(matches!(failures[0].1, Error::QueueTimeout { .. }));
    }

    #[tokio::test]
    async fn full_queue_rejects_and_resolves() {
        let failures = Arc::new(Mutex::new(Vec::new()));
        let queue = PriorityQueue::new("test", 1);
        queue.push(request("first", 1, 10_000, &failures)).await.unwrap();

        let err = queue.push(request("second", 1, 10_000, &failures)).await.unwrap_err();
        assert_eq!(err, Error::QueueFull(1));
        assert_eq!(failures.lock().unwrap()[0].0, "second");
    }

    #[tokio::test]
    async fn close_drains_and_ends_pop() {
        let failures = Arc::new(Mutex::new(Vec::new()));
        let queue = Arc::new(PriorityQueue::new("test", 16));
        queue.push(request("a", 1, 10_000, &failures)).await.unwrap();
        queue.push(request("b", 2, 10_000, &failures)).await.unwrap();

        assert_eq!(queue.close(Error::ShuttingDown).await, 2);
        assert!(queue.pop().await.is_none());
        assert!(matches!(
            queue.push(request("late", 1, 10_000, &failures)).await,
            Err(Error::ShuttingDown)
        ));
        assert_eq!(failures.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let failures = Arc::new(Mutex::new(Vec::new()));
        let queue = Arc::new(PriorityQueue::<FakeJob>::new("test", 16));

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await.map(|r| r.payload.label) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(request("late", 1, 10_000, &failures)).await.unwrap();

        assert_eq!(consumer.await.unwrap(), Some("late"));
    }

    #[tokio::test]
    async fn expiry_task_resolves_without_a_consumer() {
        let failures = Arc::new(Mutex::new(Vec::new()));
        let queue = Arc::new(PriorityQueue::new("test", 16));
        let cancel = CancellationToken::new();
        let reaper = tokio::spawn(queue.clone().run_expiry(cancel.clone()));

        queue.push(request("short", 1, 40, &failures)).await.unwrap();
        queue.push(request("long", 2, 10_000, &failures)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        {
            let failures = failures.lock().unwrap();
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].0, "short");
            assert!(matches!(failures[0].1, Error::QueueTimeout { .. }));
        }
        assert_eq!(queue.len(), 1);

        cancel.cancel();
        reaper.await.unwrap();
    }

    #[tokio::test]
    async fn unbounded_timeout_does_not_poison_the_queue() {
        let failures = Arc::new(Mutex::new(Vec::new()));
        let queue = PriorityQueue::new("test", 16);
        let forever = QueuedRequest::new(
            CallerClass::Summary,
            8,
            Duration::MAX,
            FakeJob {
                label: "forever",
                failures: failures.clone(),
            },
        );
        queue.push(forever).await.unwrap();
        queue.push(request("next", 1, 10_000, &failures)).await.unwrap();

        assert_eq!(queue.expire_due().await, 0);
        assert!(queue.next_deadline().is_some());
        assert_eq!(queue.try_pop().await.map(|r| r.payload.label), Some("next"));
        assert_eq!(queue.try_pop().await.map(|r| r.payload.label), Some("forever"));
        assert!(!queue.is_closed());
        assert!(failures.lock().unwrap().is_empty());
    }
}
