//! Admission semaphore
//!
//! A counting semaphore with `capacity` permits and a bounded FIFO wait
//! queue. Each queued caller waits at most `queue_timeout`. This is the only
//! backpressure mechanism in a worker: once `capacity` calls are in flight
//! further callers queue, and once the queue is full they are rejected
//! immediately.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::protocol::error::{KeelError, Result};

struct Waiter {
    id: u64,
    grant: oneshot::Sender<Permit>,
}

struct State {
    free: usize,
    queue: VecDeque<Waiter>,
    next_waiter: u64,
}

struct Inner {
    capacity: usize,
    queue_size: usize,
    queue_timeout: Duration,
    state: Mutex<State>,
}

impl Inner {
    /// Hands the permit to the oldest live waiter, or returns it to the pool.
    ///
    /// The waiter receives the permit itself, so a waiter cancelled after
    /// the hand-off releases it again when the unreceived permit is dropped.
    fn leave(self: &Arc<Self>) {
        let mut state = self.state.lock();
        while let Some(waiter) = state.queue.pop_front() {
            let permit = Permit {
                inner: Some(self.clone()),
            };
            match waiter.grant.send(permit) {
                Ok(()) => return,
                // Receiver already gone; disarm without re-entering the lock.
                Err(mut unsent) => {
                    unsent.inner = None;
                }
            }
        }
        if state.free < self.capacity {
            state.free += 1;
        }
    }
}

#[derive(Clone)]
pub struct AdmissionSemaphore {
    inner: Arc<Inner>,
}

impl AdmissionSemaphore {
    pub fn new(capacity: usize, queue_size: usize, queue_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                capacity,
                queue_size,
                queue_timeout,
                state: Mutex::new(State {
                    free: capacity,
                    queue: VecDeque::new(),
                    next_waiter: 0,
                }),
            }),
        }
    }

    /// Acquires a permit.
    ///
    /// Grants immediately when a permit is free. Otherwise the caller is
    /// queued and fails with [`KeelError::Timeout`] if not granted within the
    /// queue timeout, or with [`KeelError::QueueFull`] if the queue is full.
    pub async fn enter(&self) -> Result<Permit> {
        let (id, mut granted) = {
            let mut state = self.inner.state.lock();
            if state.free > 0 {
                state.free -= 1;
                return Ok(self.permit());
            }
            if state.queue.len() >= self.inner.queue_size {
                return Err(KeelError::QueueFull);
            }
            let id = state.next_waiter;
            state.next_waiter += 1;
            let (tx, rx) = oneshot::channel();
            state.queue.push_back(Waiter { id, grant: tx });
            (id, rx)
        };

        match tokio::time::timeout(self.inner.queue_timeout, &mut granted).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(KeelError::Internal("semaphore waiter dropped".into())),
            Err(_) => {
                {
                    let mut state = self.inner.state.lock();
                    if let Some(p) = state.queue.iter().position(|w| w.id == id) {
                        state.queue.remove(p);
                    }
                }
                // A permit granted between the timer firing and taking the
                // lock is released here.
                drop(granted);
                Err(KeelError::Timeout(self.inner.queue_timeout.as_millis() as u64))
            }
        }
    }

    fn permit(&self) -> Permit {
        Permit {
            inner: Some(self.inner.clone()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Permits currently free.
    pub fn available(&self) -> usize {
        self.inner.state.lock().free
    }

    /// Callers currently waiting.
    pub fn queued(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Permits currently held.
    pub fn in_flight(&self) -> usize {
        self.inner.capacity - self.available()
    }
}

/// One admitted execution. Released exactly once, on [`Permit::leave`] or drop.
pub struct Permit {
    inner: Option<Arc<Inner>>,
}

impl Permit {
    pub fn leave(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.leave();
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("held", &self.inner.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_grants_up_to_capacity_then_queues_fifo() {
        let sem = AdmissionSemaphore::new(2, 10, Duration::from_secs(5));

        let first = sem.enter().await.unwrap();
        let second = sem.enter().await.unwrap();
        assert_eq!(sem.available(), 0);

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut waiters = Vec::new();
        for n in 0..2 {
            let waiter_sem = sem.clone();
            let order = order.clone();
            waiters.push(tokio::spawn(async move {
                let permit = waiter_sem.enter().await.unwrap();
                order.lock().push(n);
                permit
            }));
            // Make sure the waiters enqueue in a known order
            while sem.queued() < n + 1 {
                tokio::task::yield_now().await;
            }
        }
        assert_eq!(sem.queued(), 2);
        assert!(order.lock().is_empty());

        first.leave();
        let third = waiters.remove(0).await.unwrap();
        assert_eq!(*order.lock(), vec![0]);

        drop(second);
        let fourth = waiters.remove(0).await.unwrap();
        assert_eq!(*order.lock(), vec![0, 1]);

        assert_eq!(sem.queued(), 0);
        assert_eq!(sem.available(), 0);
        drop(third);
        drop(fourth);
        assert_eq!(sem.available(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_caller_times_out_once() {
        let sem = AdmissionSemaphore::new(1, 10, Duration::from_millis(100));
        let held = sem.enter().await.unwrap();

        let failures = Arc::new(AtomicUsize::new(0));
        let waiter = {
            let sem = sem.clone();
            let failures = failures.clone();
            tokio::spawn(async move {
                if let Err(e) = sem.enter().await {
                    assert!(matches!(e, KeelError::Timeout(100)));
                    failures.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        tokio::time::sleep(Duration::from_millis(150)).await;
        waiter.await.unwrap();
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(sem.queued(), 0);

        // The timed-out waiter must not swallow the next grant
        drop(held);
        assert_eq!(sem.available(), 1);
    }

    #[tokio::test]
    async fn test_queue_full_rejects_immediately() {
        let sem = AdmissionSemaphore::new(1, 1, Duration::from_secs(5));
        let _held = sem.enter().await.unwrap();

        let queued = {
            let sem = sem.clone();
            tokio::spawn(async move { sem.enter().await.map(|_| ()) })
        };
        while sem.queued() < 1 {
            tokio::task::yield_now().await;
        }

        let err = sem.enter().await.unwrap_err();
        assert!(matches!(err, KeelError::QueueFull));
        assert_eq!(err.code(), 504);
        queued.abort();
    }

    #[tokio::test]
    async fn test_cancelled_waiter_is_skipped() {
        let sem = AdmissionSemaphore::new(1, 10, Duration::from_secs(5));
        let held = sem.enter().await.unwrap();

        let cancelled = {
            let sem = sem.clone();
            tokio::spawn(async move { sem.enter().await.map(|_| ()) })
        };
        while sem.queued() < 1 {
            tokio::task::yield_now().await;
        }
        cancelled.abort();
        let _ = cancelled.await;

        drop(held);
        // The permit went back to the pool rather than to the dead waiter
        assert_eq!(sem.available(), 1);
        let _again = sem.enter().await.unwrap();
    }

    #[tokio::test]
    async fn test_grant_to_cancelled_waiter_is_returned() {
        let sem = AdmissionSemaphore::new(1, 10, Duration::from_secs(5));
        let held = sem.enter().await.unwrap();

        let waiter = {
            let sem = sem.clone();
            tokio::spawn(async move { sem.enter().await.map(|_| ()) })
        };
        while sem.queued() < 1 {
            tokio::task::yield_now().await;
        }

        // The grant is sent before the waiter task gets to poll it
        held.leave();
        assert_eq!(sem.queued(), 0);
        waiter.abort();
        let _ = waiter.await;

        assert_eq!(sem.in_flight(), 0);
        assert_eq!(sem.available(), 1);
        let _again = sem.enter().await.unwrap();
    }

    #[tokio::test]
    async fn test_permit_released_once() {
        let sem = AdmissionSemaphore::new(3, 0, Duration::from_millis(10));
        let permit = sem.enter().await.unwrap();
        assert_eq!(sem.in_flight(), 1);
        permit.leave();
        assert_eq!(sem.in_flight(), 0);
        assert_eq!(sem.available(), 3);
    }
}
