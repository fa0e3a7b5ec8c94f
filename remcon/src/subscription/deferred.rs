//! Deferred resolution for children of never-observed composites.
//!
//! A subscription targeting a nested field whose composite base has not
//! produced a value yet parks here. One resolver per base locator buffers
//! the pending children and carries the cadence the base is sampled at;
//! the first structurally composite sample resolves the resolver and
//! hands its children back for normal routing.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::locator::{OwnerId, ResourceLocator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResolverState {
    Waiting,
    /// Terminal: resolved or disposed.
    Resolved,
}

#[derive(Debug)]
struct ResolverInner {
    state: ResolverState,
    children: BTreeSet<ResourceLocator>,
    /// Sampling interval for the base attribute; only ever tightens.
    interval_ms: u64,
    last_tick: Option<u64>,
}

#[derive(Debug)]
pub(crate) struct DeferredChildResolver {
    parent: ResourceLocator,
    inner: Mutex<ResolverInner>,
}

impl DeferredChildResolver {
    fn new(parent: ResourceLocator, interval_ms: u64) -> Self {
        DeferredChildResolver {
            parent,
            inner: Mutex::new(ResolverInner {
                state: ResolverState::Waiting,
                children: BTreeSet::new(),
                interval_ms: interval_ms.max(1),
                last_tick: None,
            }),
        }
    }

    pub(crate) fn parent(&self) -> &ResourceLocator {
        &self.parent
    }

    pub(crate) fn is_waiting(&self) -> bool {
        self.inner.lock().expect("deferred resolver poisoned").state == ResolverState::Waiting
    }

    pub(crate) fn interval_ms(&self) -> u64 {
        self.inner
            .lock()
            .expect("deferred resolver poisoned")
            .interval_ms
    }

    pub(crate) fn children(&self) -> Vec<ResourceLocator> {
        self.inner
            .lock()
            .expect("deferred resolver poisoned")
            .children
            .iter()
            .cloned()
            .collect()
    }

    /// Buffers a pending child. A tighter requested interval lowers the
    /// base sampling interval; a looser one never raises it.
    pub(crate) fn add_child(&self, child: ResourceLocator, requested_interval_ms: u64) {
        let mut inner = self.inner.lock().expect("deferred resolver poisoned");
        if inner.state == ResolverState::Resolved {
            return;
        }
        inner.children.insert(child);
        let requested = requested_interval_ms.max(1);
        if requested < inner.interval_ms {
            inner.interval_ms = requested;
        }
    }

    /// Removes a pending child; true when no children remain.
    pub(crate) fn remove_child(&self, child: &ResourceLocator) -> bool {
        let mut inner = self.inner.lock().expect("deferred resolver poisoned");
        inner.children.remove(child);
        inner.children.is_empty()
    }

    /// Next aligned deadline for sampling the base, while waiting with at
    /// least one pending child.
    pub(crate) fn next_due(&self) -> Option<u64> {
        let inner = self.inner.lock().expect("deferred resolver poisoned");
        if inner.state != ResolverState::Waiting || inner.children.is_empty() {
            return None;
        }
        Some(next_aligned(inner.last_tick, inner.interval_ms))
    }

    pub(crate) fn mark_sampled(&self, now_ms: u64) {
        let mut inner = self.inner.lock().expect("deferred resolver poisoned");
        inner.last_tick = Some(now_ms);
    }

    /// Consumes one sampled base value. The first structurally composite
    /// value resolves the resolver and hands the buffered children back
    /// exactly once; anything else keeps it waiting.
    pub(crate) fn try_resolve(&self, value: &Value) -> Option<Vec<ResourceLocator>> {
        if !value.is_object() {
            return None;
        }
        let mut inner = self.inner.lock().expect("deferred resolver poisoned");
        if inner.state == ResolverState::Resolved {
            return None;
        }
        inner.state = ResolverState::Resolved;
        let children = std::mem::take(&mut inner.children);
        Some(children.into_iter().collect())
    }

    /// Terminal stop discarding pending children. Safe from any thread,
    /// any number of times.
    pub(crate) fn dispose(&self) {
        let mut inner = self.inner.lock().expect("deferred resolver poisoned");
        if inner.state == ResolverState::Resolved {
            return;
        }
        inner.state = ResolverState::Resolved;
        inner.children.clear();
        log::debug!("disposed deferred resolver for {}", self.parent);
    }
}

/// At most one resolver per base locator; concurrent child subscriptions
/// on the same unresolved base share it.
#[derive(Debug, Default)]
pub(crate) struct DeferredRepository {
    resolvers: Mutex<HashMap<ResourceLocator, Arc<DeferredChildResolver>>>,
}

impl DeferredRepository {
    pub(crate) fn new() -> Self {
        DeferredRepository::default()
    }

    /// Parks a child under its base's resolver, creating the resolver at
    /// `parent_interval_ms` when absent.
    pub(crate) fn park(
        &self,
        parent: &ResourceLocator,
        child: ResourceLocator,
        requested_interval_ms: u64,
        parent_interval_ms: u64,
    ) {
        let resolver = {
            let mut resolvers = self.resolvers.lock().expect("deferred repository poisoned");
            resolvers
                .entry(parent.clone())
                .or_insert_with(|| {
                    Arc::new(DeferredChildResolver::new(
                        parent.clone(),
                        parent_interval_ms,
                    ))
                })
                .clone()
        };
        resolver.add_child(child, requested_interval_ms);
    }

    /// Removes a pending child; the resolver is disposed and dropped with
    /// its last child.
    pub(crate) fn remove_child(&self, parent: &ResourceLocator, child: &ResourceLocator) {
        let mut resolvers = self.resolvers.lock().expect("deferred repository poisoned");
        if let Some(resolver) = resolvers.get(parent) {
            if resolver.remove_child(child) {
                resolver.dispose();
                resolvers.remove(parent);
            }
        }
    }

    pub(crate) fn remove(&self, parent: &ResourceLocator) -> Option<Arc<DeferredChildResolver>> {
        let mut resolvers = self.resolvers.lock().expect("deferred repository poisoned");
        resolvers.remove(parent)
    }

    /// Removes every resolver, for connection teardown.
    pub(crate) fn drain(&self) -> Vec<Arc<DeferredChildResolver>> {
        let mut resolvers = self.resolvers.lock().expect("deferred repository poisoned");
        resolvers.drain().map(|(_, resolver)| resolver).collect()
    }

    /// Resolvers due for a base sample at `now_ms`.
    pub(crate) fn due_resolvers(&self, now_ms: u64) -> Vec<Arc<DeferredChildResolver>> {
        let resolvers = self.resolvers.lock().expect("deferred repository poisoned");
        resolvers
            .values()
            .filter(|resolver| matches!(resolver.next_due(), Some(due) if due <= now_ms))
            .cloned()
            .collect()
    }

    pub(crate) fn resolvers_for_owner(&self, owner: &OwnerId) -> Vec<Arc<DeferredChildResolver>> {
        let resolvers = self.resolvers.lock().expect("deferred repository poisoned");
        resolvers
            .values()
            .filter(|resolver| resolver.parent().owner() == owner)
            .cloned()
            .collect()
    }

    /// Earliest upcoming sampling deadline over waiting resolvers.
    pub(crate) fn next_deadline(&self) -> Option<u64> {
        let resolvers = self.resolvers.lock().expect("deferred repository poisoned");
        resolvers
            .values()
            .filter_map(|resolver| resolver.next_due())
            .min()
    }
}

fn next_aligned(last: Option<u64>, interval_ms: u64) -> u64 {
    match last {
        None => 0,
        Some(last) => {
            let interval = interval_ms.max(1);
            (last - last % interval).saturating_add(interval)
        }
    }
}
