// ===============================
// src/bus.rs
// ===============================
//
// In-process pub/sub. Setiap subscriber punya channel unbounded sendiri:
// - publish tidak pernah menunggu subscriber yang lambat,
// - urutan publish terjaga per subscriber,
// - handler yang panic dicatat lalu lanjut ke event berikutnya.
//
// Limitation: queues are unbounded, a subscriber that never drains grows
// without limit. There is no backpressure towards publishers.
//
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error};

use crate::domain::Event;
use crate::metrics::{BUS_HANDLER_PANICS, BUS_PUBLISHED, BUS_SUBSCRIBERS};

#[derive(Default)]
struct Inner {
    next_id: AtomicU64,
    subs: Mutex<HashMap<u64, mpsc::UnboundedSender<Event>>>,
}

impl Inner {
    fn remove(&self, id: u64) {
        let mut subs = self.subs.lock();
        if subs.remove(&id).is_some() {
            BUS_SUBSCRIBERS.set(subs.len() as i64);
        }
    }
}

#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new() -> Self { Self::default() }

    /// Fire-and-forget fan-out; returns how many subscribers got the event.
    pub fn publish(&self, ev: Event) -> usize {
        BUS_PUBLISHED.with_label_values(&[ev.kind()]).inc();
        let mut subs = self.inner.subs.lock();
        let mut delivered = 0;
        subs.retain(|id, tx| match tx.send(ev.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(_) => {
                debug!(id, "bus: pruning closed subscriber");
                false
            }
        });
        BUS_SUBSCRIBERS.set(subs.len() as i64);
        delivered
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subs = self.inner.subs.lock();
        subs.insert(id, tx);
        BUS_SUBSCRIBERS.set(subs.len() as i64);
        Subscription { id, rx, bus: Arc::downgrade(&self.inner) }
    }

    /// Run `handler` for every event on its own task until unsubscribed.
    pub fn subscribe_fn<F>(&self, name: &'static str, mut handler: F) -> SubscriberHandle
    where
        F: FnMut(&Event) + Send + 'static,
    {
        let mut sub = self.subscribe();
        let id = sub.id;
        let task = tokio::spawn(async move {
            while let Some(ev) = sub.recv().await {
                if catch_unwind(AssertUnwindSafe(|| handler(&ev))).is_err() {
                    BUS_HANDLER_PANICS.with_label_values(&[name]).inc();
                    error!(subscriber = name, event = ev.kind(), "bus: handler panicked, continuing");
                }
            }
            debug!(subscriber = name, "bus: subscriber stopped");
        });
        SubscriberHandle { id, bus: Arc::downgrade(&self.inner), task: Some(task) }
    }

    pub fn subscriber_count(&self) -> usize { self.inner.subs.lock().len() }
}

/// Receiving end of a subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<Event>,
    bus: Weak<Inner>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Event> { self.rx.recv().await }

    pub fn try_recv(&mut self) -> Option<Event> { self.rx.try_recv().ok() }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.remove(self.id);
        }
    }
}

/// Handle for a `subscribe_fn` task.
pub struct SubscriberHandle {
    id: u64,
    bus: Weak<Inner>,
    task: Option<JoinHandle<()>>,
}

impl SubscriberHandle {
    /// Stop immediately; events still queued are discarded.
    pub fn unsubscribe(self) {}

    /// Stop accepting new events, let the task drain what is queued, then wait.
    pub async fn close(mut self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.remove(self.id);
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(?e, "bus: subscriber task join failed");
            }
        }
    }
}

impl Drop for SubscriberHandle {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.remove(self.id);
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
