use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use rewind_core::TransportError;
use tracing::{trace, warn};

type Tail = Shared<BoxFuture<'static, ()>>;

struct Chain {
    tail: Tail,
    next_ticket: u64,
}

/// Serial queue of outbound sends.
///
/// Each unit starts only after the previous unit finished, so sends reach
/// the transport in the order they were enqueued no matter how long each
/// one takes. A failed unit is logged and dropped; the chain keeps going.
pub struct OrderedDispatchQueue {
    chain: Mutex<Chain>,
    pending: Arc<AtomicUsize>,
    failures: Arc<AtomicU64>,
}

/// Decrements the pending counter even if the unit panics.
struct PendingGuard(Arc<AtomicUsize>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl OrderedDispatchQueue {
    pub fn new() -> Self {
        Self {
            chain: Mutex::new(Chain {
                tail: futures::future::ready(()).boxed().shared(),
                next_ticket: 0,
            }),
            pending: Arc::new(AtomicUsize::new(0)),
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Append `work` behind everything already queued and return its ticket
    /// (position in the chain, starting at 0).
    ///
    /// `work` is not called until the previous unit has completed. Must be
    /// called from within a Tokio runtime.
    pub fn enqueue<F, Fut>(&self, work: F) -> u64
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TransportError>> + Send + 'static,
    {
        self.pending.fetch_add(1, Ordering::AcqRel);
        let guard = PendingGuard(Arc::clone(&self.pending));
        let failures = Arc::clone(&self.failures);

        let mut chain = self.chain.lock();
        let ticket = chain.next_ticket;
        chain.next_ticket += 1;
        let previous = chain.tail.clone();

        let handle = tokio::spawn(async move {
            let _guard = guard;
            previous.await;
            trace!(ticket, "queued send starting");
            if let Err(e) = work().await {
                failures.fetch_add(1, Ordering::Relaxed);
                warn!(ticket, error = %e, kind = e.error_kind(), "queued send failed, dropping notification");
            }
        });

        chain.tail = async move {
            if let Err(e) = handle.await {
                warn!(ticket, error = %e, "queued send task aborted");
            }
        }
        .boxed()
        .shared();

        ticket
    }

    /// Wait until every unit enqueued before this call has been attempted.
    pub async fn drain(&self) {
        let tail = self.chain.lock().tail.clone();
        tail.await;
    }

    /// Units enqueued but not yet finished.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Units whose send returned an error since creation.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl Default for OrderedDispatchQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Step {
        Begin(u64),
        End(u64),
    }

    #[tokio::test(start_paused = true)]
    async fn units_begin_in_enqueue_order_even_when_later_ones_are_faster() {
        let queue = OrderedDispatchQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let m = 8u64;

        for i in 0..m {
            let log = Arc::clone(&log);
            // Earlier units take longest; unchained they would finish last.
            let delay = Duration::from_millis((m - i) * 10);
            let ticket = queue.enqueue(move || async move {
                log.lock().push(Step::Begin(i));
                tokio::time::sleep(delay).await;
                log.lock().push(Step::End(i));
                Ok(())
            });
            assert_eq!(ticket, i);
        }

        queue.drain().await;

        let log = log.lock().clone();
        let begins: Vec<u64> = log
            .iter()
            .filter_map(|s| match s {
                Step::Begin(i) => Some(*i),
                Step::End(_) => None,
            })
            .collect();
        assert_eq!(begins, (0..m).collect::<Vec<_>>());
        // Each unit ends before the next one begins.
        for i in 0..m as usize {
            assert_eq!(log[2 * i], Step::Begin(i as u64));
            assert_eq!(log[2 * i + 1], Step::End(i as u64));
        }
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn concurrent_producers_get_a_total_order() {
        let queue = Arc::new(OrderedDispatchQueue::new());
        let started = Arc::new(Mutex::new(Vec::new()));

        let mut producers = Vec::new();
        for _ in 0..16 {
            let queue = Arc::clone(&queue);
            let started = Arc::clone(&started);
            producers.push(tokio::spawn(async move {
                let slot = Arc::new(Mutex::new(None::<u64>));
                let inner = Arc::clone(&slot);
                let started = Arc::clone(&started);
                let ticket = queue.enqueue(move || async move {
                    // Wait for the producer to publish the ticket.
                    loop {
                        if let Some(t) = *inner.lock() {
                            started.lock().push(t);
                            break;
                        }
                        tokio::task::yield_now().await;
                    }
                    Ok(())
                });
                *slot.lock() = Some(ticket);
            }));
        }
        for p in producers {
            p.await.unwrap();
        }
        queue.drain().await;

        let started = started.lock().clone();
        assert_eq!(started, (0..16).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn failure_does_not_break_the_chain() {
        let queue = OrderedDispatchQueue::new();
        let ran = Arc::new(Mutex::new(Vec::new()));

        let r = Arc::clone(&ran);
        queue.enqueue(move || async move {
            r.lock().push("first");
            Err(TransportError::Closed)
        });
        let r = Arc::clone(&ran);
        queue.enqueue(move || async move {
            r.lock().push("second");
            Ok(())
        });

        queue.drain().await;
        assert_eq!(*ran.lock(), vec!["first", "second"]);
        assert_eq!(queue.failures(), 1);
    }

    #[tokio::test]
    async fn panicking_unit_does_not_break_the_chain() {
        let queue = OrderedDispatchQueue::new();
        let ran = Arc::new(AtomicUsize::new(0));

        async fn explode() -> Result<(), TransportError> {
            panic!("boom")
        }

        queue.enqueue(explode);
        let r = Arc::clone(&ran);
        queue.enqueue(move || async move {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        queue.drain().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_in_flight_send() {
        let queue = OrderedDispatchQueue::new();
        let delivered = Arc::new(AtomicUsize::new(0));

        let d = Arc::clone(&delivered);
        queue.enqueue(move || async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            d.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(queue.pending(), 1);

        queue.drain().await;
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn drain_on_empty_queue_returns_immediately() {
        let queue = OrderedDispatchQueue::default();
        queue.drain().await;
        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.failures(), 0);
    }
}
