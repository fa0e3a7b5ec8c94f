//! Notification synthesized from one or more underlying sources.

use std::sync::Mutex;

use serde_json::{Map, Value};

use crate::locator::ResourceLocator;

#[derive(Debug, Default)]
struct SyntheticState {
    /// Latest payload per source, keyed by the source's data path.
    accumulated: Map<String, Value>,
    last_value: Option<Value>,
}

/// Accumulates source payloads into one composite value and reports a new
/// value only when the composition actually changed.
///
/// `ingest` runs on the notification-dispatch thread while `last_value` may
/// be polled concurrently; the per-instance lock keeps the state
/// read-consistent from any thread.
#[derive(Debug)]
pub struct NotificationSynthetic {
    locator: ResourceLocator,
    sources: Vec<ResourceLocator>,
    display_name: String,
    description: String,
    state: Mutex<SyntheticState>,
}

impl NotificationSynthetic {
    pub fn new(locator: ResourceLocator, sources: Vec<ResourceLocator>) -> Self {
        let display_name = locator.base_attribute_name().to_owned();
        NotificationSynthetic {
            locator,
            sources,
            display_name,
            description: String::new(),
            state: Mutex::new(SyntheticState::default()),
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn locator(&self) -> &ResourceLocator {
        &self.locator
    }

    /// Underlying notification sources this synthetic folds together.
    pub fn sources(&self) -> &[ResourceLocator] {
        &self.sources
    }

    pub(crate) fn display_name(&self) -> &str {
        &self.display_name
    }

    pub(crate) fn description(&self) -> &str {
        &self.description
    }

    /// Folds one source payload in. Returns the recomposed value when it
    /// differs from the cached one; `None` means nothing should fire.
    pub fn ingest(&self, source: &ResourceLocator, payload: Value) -> Option<Value> {
        let mut state = self
            .state
            .lock()
            .expect("synthetic notification state poisoned");
        state
            .accumulated
            .insert(source.data_path().to_owned(), payload);
        let composed = Value::Object(state.accumulated.clone());
        if state.last_value.as_ref() == Some(&composed) {
            return None;
        }
        state.last_value = Some(composed.clone());
        Some(composed)
    }

    /// Last composed value, if any source has delivered yet.
    pub fn last_value(&self) -> Option<Value> {
        self.state
            .lock()
            .expect("synthetic notification state poisoned")
            .last_value
            .clone()
    }
}
