//! Document bus: in-process publish/subscribe for [`Document`]s.
//!
//! `publish` delivers synchronously to every registered subscriber whose
//! predicate accepts the document, in subscription order. There is no
//! buffering for late subscribers.
//!
//! # Re-entrancy
//!
//! Publishing uses a queue-and-drain discipline. A document published from
//! inside a subscriber callback (or from another thread while a drain is in
//! progress) is appended to the queue and delivered after the current
//! document has reached every subscriber. The thread that started the drain
//! delivers everything, so all documents seen through one bus have a single
//! total order.
//!
//! # Isolation
//!
//! Each callback runs in isolation: an `Err` return or a panic is reported on
//! the bus [`Diagnostics`] channel and delivery continues with the next
//! subscriber.

use crate::document::{Document, DocumentKind};
use crate::error::{Diagnostics, RunVizError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type Predicate = Arc<dyn Fn(&Document) -> bool + Send + Sync>;
type Handler = Arc<dyn Fn(&Document) -> anyhow::Result<()> + Send + Sync>;

/// Handle returned by [`DocumentBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Clone)]
struct Subscriber {
    id: SubscriptionId,
    predicate: Predicate,
    handler: Handler,
}

#[derive(Default)]
struct Queue {
    pending: VecDeque<Document>,
    draining: bool,
}

struct BusInner {
    subscribers: Mutex<Vec<Subscriber>>,
    queue: Mutex<Queue>,
    next_id: AtomicU64,
    delivered: AtomicU64,
    diagnostics: Diagnostics,
}

/// Process-local document bus. Cloning shares the same bus.
#[derive(Clone)]
pub struct DocumentBus {
    inner: Arc<BusInner>,
}

impl fmt::Debug for DocumentBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentBus")
            .field("subscribers", &self.subscriber_count())
            .field("delivered", &self.delivered_count())
            .finish()
    }
}

impl Default for DocumentBus {
    fn default() -> Self {
        Self::new(Diagnostics::new())
    }
}

impl DocumentBus {
    /// Create a bus reporting subscriber failures on `diagnostics`.
    pub fn new(diagnostics: Diagnostics) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(Vec::new()),
                queue: Mutex::new(Queue::default()),
                next_id: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                diagnostics,
            }),
        }
    }

    /// Diagnostics channel this bus reports on.
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.inner.diagnostics
    }

    /// Register `handler` for every document accepted by `predicate`.
    pub fn subscribe<P, H>(&self, predicate: P, handler: H) -> SubscriptionId
    where
        P: Fn(&Document) -> bool + Send + Sync + 'static,
        H: Fn(&Document) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.subscribers.lock().push(Subscriber {
            id,
            predicate: Arc::new(predicate),
            handler: Arc::new(handler),
        });
        tracing::debug!(subscription = id.0, "bus subscriber added");
        id
    }

    /// Register `handler` for every document.
    pub fn subscribe_all<H>(&self, handler: H) -> SubscriptionId
    where
        H: Fn(&Document) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(|_| true, handler)
    }

    /// Register `handler` for documents of the given kinds.
    pub fn subscribe_kinds<H>(&self, kinds: &[DocumentKind], handler: H) -> SubscriptionId
    where
        H: Fn(&Document) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let kinds = kinds.to_vec();
        self.subscribe(move |doc| kinds.contains(&doc.kind()), handler)
    }

    /// Remove a subscriber. Returns `false` if it was already gone.
    ///
    /// Safe to call from inside a callback, including the subscriber's own.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.inner.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        before != subscribers.len()
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// Total (document, subscriber) deliveries so far.
    pub fn delivered_count(&self) -> u64 {
        self.inner.delivered.load(Ordering::Relaxed)
    }

    /// Deliver a document to all current subscribers.
    ///
    /// If a drain is already running (re-entrant call, or another thread),
    /// the document is queued and delivered by that drain.
    pub fn publish(&self, document: Document) {
        {
            let mut queue = self.inner.queue.lock();
            queue.pending.push_back(document);
            if queue.draining {
                return;
            }
            queue.draining = true;
        }

        loop {
            let next = {
                let mut queue = self.inner.queue.lock();
                match queue.pending.pop_front() {
                    Some(doc) => doc,
                    None => {
                        queue.draining = false;
                        return;
                    }
                }
            };
            self.deliver(&next);
        }
    }

    fn deliver(&self, document: &Document) {
        tracing::debug!(
            kind = %document.kind(),
            run_uid = document.run_uid(),
            "publishing document"
        );
        let snapshot: Vec<Subscriber> = self.inner.subscribers.lock().clone();
        for subscriber in snapshot {
            let still_subscribed = self
                .inner
                .subscribers
                .lock()
                .iter()
                .any(|s| s.id == subscriber.id);
            if !still_subscribed {
                continue;
            }

            let outcome = catch_unwind(AssertUnwindSafe(|| {
                if (subscriber.predicate)(document) {
                    (subscriber.handler)(document).map(|()| true)
                } else {
                    Ok(false)
                }
            }));

            match outcome {
                Ok(Ok(true)) => {
                    self.inner.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Ok(false)) => {}
                Ok(Err(err)) => {
                    self.inner.diagnostics.report(
                        "bus",
                        RunVizError::Subscriber(format!(
                            "subscriber {} failed on {} document: {:#}",
                            subscriber.id.0,
                            document.kind(),
                            err
                        )),
                    );
                }
                Err(_) => {
                    self.inner.diagnostics.report(
                        "bus",
                        RunVizError::Subscriber(format!(
                            "subscriber {} panicked on {} document",
                            subscriber.id.0,
                            document.kind()
                        )),
                    );
                }
            }
        }
    }
}
