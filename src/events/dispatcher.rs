use std::sync::{Arc, Mutex};
use indexmap::IndexMap;
use futures::StreamExt;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use log::{debug, trace};
use tokio::spawn;
use tokio_util::sync::CancellationToken;

use crate::device::registry::RegistryChange;
use crate::events::types::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

struct Subscriber {
    queue: UnboundedSender<Event>,
    cancel: CancellationToken,
}

struct DispatcherInner {
    next_token: u64,
    subscribers: IndexMap<u64, Subscriber>,
    registry_revision: u64,
}

/// Fans events out to subscribers. Each subscriber has its own queue and delivery task, so
/// `emit` never waits on a handler and a slow handler only delays itself.
#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<Mutex<DispatcherInner>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        let inner = DispatcherInner {
            next_token: 1,
            subscribers: IndexMap::new(),
            registry_revision: 0,
        };
        EventDispatcher { inner: Arc::new(Mutex::new(inner)) }
    }

    /// Register `handler` for every event emitted from now on. Must be called from within a
    /// tokio runtime.
    pub fn subscribe<F>(&self, mut handler: F) -> SubscriptionToken
    where
        F: FnMut(&Event) + Send + 'static,
    {
        let (queue, mut receiver) = unbounded::<Event>();
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        spawn(async move {
            'mainloop: loop {
                tokio::select! {
                    biased;
                    _ = task_cancel.cancelled() => {
                        break 'mainloop;
                    },
                    event = receiver.next() => match event {
                        Some(event) => handler(&event),
                        None => break 'mainloop,
                    },
                }
            }
        });

        let mut inner = self.inner.lock().expect("Failed to lock dispatcher");
        let token = inner.next_token;
        inner.next_token += 1;
        inner.subscribers.insert(token, Subscriber { queue, cancel });
        debug!("Subscriber {} registered", token);

        SubscriptionToken(token)
    }

    /// Returns false if the token was not (or no longer) subscribed.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut inner = self.inner.lock().expect("Failed to lock dispatcher");
        match inner.subscribers.shift_remove(&token.0) {
            Some(subscriber) => {
                subscriber.cancel.cancel();
                debug!("Subscriber {} removed", token.0);
                true
            },
            None => false,
        }
    }

    pub fn emit(&self, event: Event) {
        let mut inner = self.inner.lock().expect("Failed to lock dispatcher");
        debug!("Event {}: {:?}", event.bridge_name(), event);

        // a subscriber whose delivery task is gone is dropped here
        inner.subscribers.retain(|_, subscriber| subscriber.queue.unbounded_send(event.clone()).is_ok());
    }

    pub(crate) fn registry_changed(&self, change: RegistryChange) {
        let mut inner = self.inner.lock().expect("Failed to lock dispatcher");
        inner.registry_revision += 1;
        trace!("Registry revision {}: {:?}", inner.registry_revision, change);
    }

    pub fn registry_revision(&self) -> u64 {
        self.inner.lock().expect("Failed to lock dispatcher").registry_revision
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("Failed to lock dispatcher").subscribers.len()
    }

    pub(crate) fn close(&self) {
        let mut inner = self.inner.lock().expect("Failed to lock dispatcher");
        // dropping the queues lets each delivery task drain what is left and exit
        inner.subscribers.clear();
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use futures::channel::mpsc::unbounded;
    use futures::StreamExt;

    use super::*;
    use crate::events::types::ScanStateReason;

    fn scan_event(scanning: bool) -> Event {
        Event::ScanStateChanged { scanning, reason: if scanning { ScanStateReason::Started } else { ScanStateReason::Stopped } }
    }

    #[tokio::test]
    async fn delivers_in_emission_order() {
        let dispatcher = EventDispatcher::new();
        let (tx, mut rx) = unbounded();
        dispatcher.subscribe(move |event| { tx.unbounded_send(event.clone()).unwrap(); });

        for id in ["A", "B", "C"] {
            dispatcher.emit(Event::DeviceConnected { id: id.to_string() });
        }

        for id in ["A", "B", "C"] {
            assert_eq!(rx.next().await, Some(Event::DeviceConnected { id: id.to_string() }));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_subscriber_does_not_block_emit_or_others() {
        let dispatcher = EventDispatcher::new();
        let (slow_tx, mut slow_rx) = unbounded();
        let (fast_tx, mut fast_rx) = unbounded();

        dispatcher.subscribe(move |event| {
            std::thread::sleep(Duration::from_millis(20));
            slow_tx.unbounded_send(event.clone()).unwrap();
        });
        dispatcher.subscribe(move |event| { fast_tx.unbounded_send(event.clone()).unwrap(); });

        for _ in 0..10 {
            dispatcher.emit(scan_event(true));
        }

        for _ in 0..10 {
            assert_eq!(fast_rx.next().await, Some(scan_event(true)));
        }
        for _ in 0..10 {
            assert_eq!(slow_rx.next().await, Some(scan_event(true)));
        }
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let dispatcher = EventDispatcher::new();
        let (tx, mut rx) = unbounded();
        let token = dispatcher.subscribe(move |event| { let _ = tx.unbounded_send(event.clone()); });

        dispatcher.emit(scan_event(true));
        assert_eq!(rx.next().await, Some(scan_event(true)));

        assert!(dispatcher.unsubscribe(token));
        assert!(!dispatcher.unsubscribe(token));
        assert_eq!(dispatcher.subscriber_count(), 0);

        dispatcher.emit(scan_event(false));
        // the handler (and its sender) is dropped with the delivery task
        assert_eq!(rx.next().await, None);
    }

    #[tokio::test]
    async fn registry_changes_bump_revision_only() {
        let dispatcher = EventDispatcher::new();
        let (tx, mut rx) = unbounded::<Event>();
        dispatcher.subscribe(move |event| { let _ = tx.unbounded_send(event.clone()); });

        dispatcher.registry_changed(RegistryChange::Inserted(String::from("A")));
        dispatcher.registry_changed(RegistryChange::Removed(String::from("A")));
        assert_eq!(dispatcher.registry_revision(), 2);

        dispatcher.emit(scan_event(false));
        assert_eq!(rx.next().await, Some(scan_event(false)));
    }
}
