//! Value subscriptions over resource locators.
//!
//! Consumers register `ValueListener`s per locator and receive
//! `ValueEvent`s carrying either a value or an explicit unavailable marker
//! with its cause, so "no data yet" is never conflated with a legitimate
//! zero. The service routes each subscribed locator into a pool (active,
//! backoff, stale, deferred, notification) and an external scheduler
//! drives cadence through `SubscriptionService::poll_due`.

mod deferred;
mod service;

pub use service::SubscriptionService;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::error::EngineError;
use crate::locator::ResourceLocator;

/// Payload of one subscription event.
#[derive(Debug, Clone, PartialEq)]
pub enum ValuePayload {
    Value(Value),
    /// The locator could not be served; the cause says why.
    Unavailable { cause: EngineError },
}

/// One delivery to a value listener.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueEvent {
    pub locator: ResourceLocator,
    pub timestamp_ms: u64,
    pub payload: ValuePayload,
}

impl ValueEvent {
    pub fn value(locator: ResourceLocator, timestamp_ms: u64, value: Value) -> Self {
        ValueEvent {
            locator,
            timestamp_ms,
            payload: ValuePayload::Value(value),
        }
    }

    pub fn unavailable(locator: ResourceLocator, timestamp_ms: u64, cause: EngineError) -> Self {
        ValueEvent {
            locator,
            timestamp_ms,
            payload: ValuePayload::Unavailable { cause },
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self.payload, ValuePayload::Value(_))
    }
}

/// Callback receiving value events for subscribed locators.
///
/// Invoked on the polling or notification-dispatch thread with no service
/// locks held, so implementations may call back into the service.
pub trait ValueListener: Send + Sync {
    fn value_changed(&self, event: &ValueEvent);
}

/// Identifies one listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

struct ListenerEntry {
    locator: ResourceLocator,
    listener: Arc<dyn ValueListener>,
}

#[derive(Default)]
struct DispatchState {
    next_handle: u64,
    listeners: HashMap<SubscriptionHandle, ListenerEntry>,
    by_locator: HashMap<ResourceLocator, Vec<SubscriptionHandle>>,
    last_events: HashMap<ResourceLocator, ValueEvent>,
}

/// Listener bookkeeping and event fan-out, shared between the service and
/// the endpoint-facing notification sinks.
#[derive(Default)]
pub(crate) struct EventDispatcher {
    state: Mutex<DispatchState>,
}

impl EventDispatcher {
    pub(crate) fn new() -> Self {
        EventDispatcher::default()
    }

    /// Adds a listener; returns the handle and how many listeners the
    /// locator has afterwards.
    pub(crate) fn add(
        &self,
        locator: ResourceLocator,
        listener: Arc<dyn ValueListener>,
    ) -> (SubscriptionHandle, usize) {
        let mut state = self.state.lock().expect("dispatcher state poisoned");
        state.next_handle += 1;
        let handle = SubscriptionHandle(state.next_handle);
        state.listeners.insert(
            handle,
            ListenerEntry {
                locator: locator.clone(),
                listener,
            },
        );
        let handles = state.by_locator.entry(locator).or_default();
        handles.push(handle);
        let count = handles.len();
        (handle, count)
    }

    /// Removes a listener; returns its locator and how many listeners
    /// remain on it. The retained last event is dropped with the last
    /// listener.
    pub(crate) fn remove(&self, handle: SubscriptionHandle) -> Option<(ResourceLocator, usize)> {
        let mut state = self.state.lock().expect("dispatcher state poisoned");
        let entry = state.listeners.remove(&handle)?;
        let remaining = match state.by_locator.get_mut(&entry.locator) {
            Some(handles) => {
                handles.retain(|h| *h != handle);
                let remaining = handles.len();
                if remaining == 0 {
                    state.by_locator.remove(&entry.locator);
                }
                remaining
            }
            None => 0,
        };
        if remaining == 0 {
            state.last_events.remove(&entry.locator);
        }
        Some((entry.locator, remaining))
    }

    /// Records the event as the locator's latest and invokes its listeners
    /// outside the lock.
    pub(crate) fn dispatch(&self, event: ValueEvent) {
        let targets: Vec<Arc<dyn ValueListener>> = {
            let mut state = self.state.lock().expect("dispatcher state poisoned");
            state
                .last_events
                .insert(event.locator.clone(), event.clone());
            state
                .by_locator
                .get(&event.locator)
                .map(|handles| {
                    handles
                        .iter()
                        .filter_map(|handle| state.listeners.get(handle))
                        .map(|entry| entry.listener.clone())
                        .collect()
                })
                .unwrap_or_default()
        };
        for listener in targets {
            listener.value_changed(&event);
        }
    }

    pub(crate) fn last_event(&self, locator: &ResourceLocator) -> Option<ValueEvent> {
        let state = self.state.lock().expect("dispatcher state poisoned");
        state.last_events.get(locator).cloned()
    }

    /// Locators currently carrying at least one listener.
    pub(crate) fn subscribed_locators(&self) -> Vec<ResourceLocator> {
        let state = self.state.lock().expect("dispatcher state poisoned");
        state.by_locator.keys().cloned().collect()
    }
}
