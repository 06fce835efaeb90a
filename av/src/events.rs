//! A typed publish/subscribe dispatcher.
//!
//! Listeners are registered per event type string.  Dispatch iterates over a
//! snapshot of the listener list so handlers may add or remove listeners
//! (including themselves) without invalidating the iteration.  A listener
//! may carry an invocation budget that removes it once spent.  Nested
//! dispatch from within a handler is allowed up to a depth of 8; anything
//! deeper is reported and dropped.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::error;

const MAX_RECURSION: i32 = 8;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Implemented by event payloads so handlers can halt further delivery
pub trait Dispatchable {
    fn stop_propagation(&mut self);
    fn propagation_stopped(&self) -> bool;
}

/// A registered handler with an optional invocation budget
pub struct EventListener<E> {
    id: u64,
    handler: Box<dyn Fn(&mut E) + Send + Sync>,
    remaining: AtomicI32,
}

impl<E> EventListener<E> {
    /// Creates a listener.  A `count` of zero means unlimited invocations;
    /// otherwise the listener auto-removes after `count` deliveries.
    pub fn new<F>(handler: F, count: i32) -> Arc<EventListener<E>>
    where
        F: Fn(&mut E) + Send + Sync + 'static,
    {
        Arc::new(EventListener {
            id: NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed),
            handler: Box::new(handler),
            remaining: AtomicI32::new(count),
        })
    }
}

/// Dispatches typed events to listener lists keyed by event type
pub struct EventDispatcher<E> {
    listeners: Mutex<HashMap<String, Vec<Arc<EventListener<E>>>>>,
    recursion: AtomicI32,
}

impl<E: Dispatchable> EventDispatcher<E> {
    pub fn new() -> EventDispatcher<E> {
        EventDispatcher {
            listeners: Mutex::new(HashMap::new()),
            recursion: AtomicI32::new(0),
        }
    }

    pub fn add_event_listener(&self, event: &str, listener: Arc<EventListener<E>>) {
        if event.is_empty() {
            return;
        }

        let mut listeners = self.listeners.lock();
        listeners.entry(event.to_string()).or_default().push(listener);
    }

    pub fn remove_event_listener(&self, event: &str, listener: &Arc<EventListener<E>>) {
        let mut listeners = self.listeners.lock();
        if let Some(list) = listeners.get_mut(event) {
            list.retain(|entry| entry.id != listener.id);
        }
    }

    pub fn has_event_listener(&self, event: &str) -> bool {
        let listeners = self.listeners.lock();
        listeners.get(event).map(|list| !list.is_empty()).unwrap_or(false)
    }

    pub fn listener_count(&self, event: &str) -> usize {
        let listeners = self.listeners.lock();
        listeners.get(event).map(|list| list.len()).unwrap_or(0)
    }

    /// Delivers the event to every listener registered for the type, in
    /// registration order
    pub fn dispatch_event(&self, event: &str, payload: &mut E) {
        let depth = self.recursion.fetch_add(1, Ordering::AcqRel) + 1;
        if depth > MAX_RECURSION {
            error!(event, depth, "event dispatch exceeded the recursion limit, dropping");
            self.recursion.fetch_sub(1, Ordering::AcqRel);
            return;
        }

        // Snapshot so handlers can mutate the listener list mid-dispatch
        let snapshot: Vec<Arc<EventListener<E>>> = {
            let listeners = self.listeners.lock();
            match listeners.get(event) {
                Some(list) => list.clone(),
                None => Vec::new(),
            }
        };

        for listener in snapshot {
            (listener.handler)(payload);

            let budget = listener.remaining.load(Ordering::Acquire);
            if budget > 0 {
                let left = listener.remaining.fetch_sub(1, Ordering::AcqRel) - 1;
                if left == 0 {
                    self.remove_event_listener(event, &listener);
                }
            }

            if payload.propagation_stopped() {
                break;
            }
        }

        self.recursion.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<E: Dispatchable> Default for EventDispatcher<E> {
    fn default() -> EventDispatcher<E> {
        EventDispatcher::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountedEvent {
        value: usize,
        stopped: bool,
    }

    impl Dispatchable for CountedEvent {
        fn stop_propagation(&mut self) {
            self.stopped = true;
        }

        fn propagation_stopped(&self) -> bool {
            self.stopped
        }
    }

    fn event() -> CountedEvent {
        CountedEvent {
            value: 0,
            stopped: false,
        }
    }

    #[test]
    fn listeners_run_in_registration_order() {
        let dispatcher: EventDispatcher<CountedEvent> = EventDispatcher::new();

        dispatcher.add_event_listener(
            "tick",
            EventListener::new(|e: &mut CountedEvent| e.value = e.value * 10 + 1, 0),
        );
        dispatcher.add_event_listener(
            "tick",
            EventListener::new(|e: &mut CountedEvent| e.value = e.value * 10 + 2, 0),
        );

        let mut payload = event();
        dispatcher.dispatch_event("tick", &mut payload);
        assert_eq!(payload.value, 12);
    }

    #[test]
    fn counted_listener_removes_itself_after_budget_is_spent() {
        let dispatcher: EventDispatcher<CountedEvent> = EventDispatcher::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = calls.clone();
        dispatcher.add_event_listener(
            "tick",
            EventListener::new(
                move |_: &mut CountedEvent| {
                    calls_clone.fetch_add(1, Ordering::SeqCst);
                },
                2,
            ),
        );

        for _ in 0..5 {
            dispatcher.dispatch_event("tick", &mut event());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!dispatcher.has_event_listener("tick"));
    }

    #[test]
    fn stop_propagation_halts_delivery() {
        let dispatcher: EventDispatcher<CountedEvent> = EventDispatcher::new();

        dispatcher.add_event_listener(
            "tick",
            EventListener::new(
                |e: &mut CountedEvent| {
                    e.value += 1;
                    e.stop_propagation();
                },
                0,
            ),
        );
        dispatcher.add_event_listener(
            "tick",
            EventListener::new(|e: &mut CountedEvent| e.value += 100, 0),
        );

        let mut payload = event();
        dispatcher.dispatch_event("tick", &mut payload);
        assert_eq!(payload.value, 1);
    }

    #[test]
    fn removing_a_listener_stops_future_deliveries() {
        let dispatcher: EventDispatcher<CountedEvent> = EventDispatcher::new();
        let listener = EventListener::new(|e: &mut CountedEvent| e.value += 1, 0);

        dispatcher.add_event_listener("tick", listener.clone());

        let mut payload = event();
        dispatcher.dispatch_event("tick", &mut payload);
        assert_eq!(payload.value, 1);

        dispatcher.remove_event_listener("tick", &listener);
        dispatcher.dispatch_event("tick", &mut payload);
        assert_eq!(payload.value, 1);
    }

    #[test]
    fn dispatch_to_event_type_without_listeners_is_a_noop() {
        let dispatcher: EventDispatcher<CountedEvent> = EventDispatcher::new();
        let mut payload = event();
        dispatcher.dispatch_event("nothing", &mut payload);
        assert_eq!(payload.value, 0);
    }
}
