//! Subscription routing, pools and the poll driver.
//!
//! The first listener on a locator routes it into a pool: available
//! attributes and transformations poll at their policy cadence, children
//! of unresolved composites park on a deferred resolver, missing or
//! failing resources park in backoff, notification locators subscribe on
//! the endpoint. An external scheduler drives everything through
//! `poll_due(now_ms)`; the service owns no thread of its own.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value;

use crate::endpoint::{ManagementEndpoint, NotificationSink, NotificationToken};
use crate::error::EngineError;
use crate::locator::{OwnerId, ResourceKind, ResourceLocator};
use crate::metadata::MetadataCache;
use crate::policy::PolicyStore;
use crate::retriever::ValueRetriever;
use crate::synthetic::{NotificationSynthetic, SyntheticRegistry};

use super::deferred::{DeferredChildResolver, DeferredRepository};
use super::{EventDispatcher, SubscriptionHandle, ValueEvent, ValueListener};

/// Probe schedule for a subscription whose resource is unavailable.
/// Spacing starts at the global default interval and doubles on every
/// failed probe; only the first park dispatches an unavailable event.
#[derive(Debug, Clone, Copy)]
struct BackoffState {
    interval_ms: u64,
    next_probe_ms: u64,
}

impl BackoffState {
    fn first(default_interval_ms: u64, now_ms: u64) -> Self {
        let interval_ms = default_interval_ms.max(1);
        BackoffState {
            interval_ms,
            next_probe_ms: now_ms.saturating_add(interval_ms),
        }
    }

    fn doubled(self, now_ms: u64) -> Self {
        let interval_ms = self.interval_ms.saturating_mul(2);
        BackoffState {
            interval_ms,
            next_probe_ms: now_ms.saturating_add(interval_ms),
        }
    }
}

#[derive(Debug)]
enum SubState {
    /// Polled at the locator's policy cadence. `last_tick` advances on
    /// every dispatch, available or not, so a transiently failing owner is
    /// retried at the next tick instead of in a hot loop.
    Active { last_tick: Option<u64> },
    /// Resource currently missing; probed with doubling spacing.
    Backoff(BackoffState),
    /// Owner unregistered. Never probed; revived by a lifecycle event.
    Stale,
    /// Child buffered on the deferred resolver keyed by its base locator.
    Deferred { parent: ResourceLocator },
    /// Served by endpoint notification deliveries, not by polling.
    Notification { tokens: Vec<NotificationToken> },
}

/// Routes subscribed locators into pools and serves them from `poll_due`.
pub struct SubscriptionService {
    endpoint: Arc<dyn ManagementEndpoint>,
    metadata: Arc<MetadataCache>,
    retriever: Arc<ValueRetriever>,
    policies: Arc<PolicyStore>,
    synthetics: Arc<SyntheticRegistry>,
    dispatcher: Arc<EventDispatcher>,
    deferred: DeferredRepository,
    /// Pool membership per subscribed locator. Endpoint round trips may
    /// run under this lock; event dispatch never does.
    subs: Mutex<HashMap<ResourceLocator, SubState>>,
    /// Scheduler clock: the latest `poll_due` timestamp. Backoff deadlines
    /// are computed against this so probe spacing lives in the same time
    /// base the scheduler polls with.
    last_poll_ms: AtomicU64,
}

impl SubscriptionService {
    pub fn new(
        endpoint: Arc<dyn ManagementEndpoint>,
        metadata: Arc<MetadataCache>,
        retriever: Arc<ValueRetriever>,
        policies: Arc<PolicyStore>,
        synthetics: Arc<SyntheticRegistry>,
    ) -> Self {
        SubscriptionService {
            endpoint,
            metadata,
            retriever,
            policies,
            synthetics,
            dispatcher: Arc::new(EventDispatcher::new()),
            deferred: DeferredRepository::new(),
            subs: Mutex::new(HashMap::new()),
            last_poll_ms: AtomicU64::new(0),
        }
    }

    /// Registers a listener. The first listener on a locator routes it;
    /// further listeners share the underlying subscription. Routing
    /// failures park the subscription and notify the listener, so this
    /// never fails outright.
    pub fn subscribe(
        &self,
        locator: &ResourceLocator,
        listener: Arc<dyn ValueListener>,
    ) -> SubscriptionHandle {
        let mut events = Vec::new();
        let handle = {
            let mut subs = self.subs.lock().expect("subscription pools poisoned");
            let (handle, count) = self.dispatcher.add(locator.clone(), listener);
            if count == 1 {
                let state = self.route_locked(locator, None, &mut events);
                subs.insert(locator.clone(), state);
            }
            handle
        };
        for event in events {
            self.dispatcher.dispatch(event);
        }
        handle
    }

    /// Removes a listener; the last listener tears the subscription down.
    /// Returns false for an unknown handle.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut released: Vec<NotificationToken> = Vec::new();
        let removed = {
            let mut subs = self.subs.lock().expect("subscription pools poisoned");
            match self.dispatcher.remove(handle) {
                None => false,
                Some((locator, 0)) => {
                    match subs.remove(&locator) {
                        Some(SubState::Notification { tokens }) => released = tokens,
                        Some(SubState::Deferred { parent }) => {
                            self.deferred.remove_child(&parent, &locator);
                        }
                        _ => {}
                    }
                    log::debug!("tore down subscription for {}", locator);
                    true
                }
                Some(_) => true,
            }
        };
        self.release_tokens(released);
        removed
    }

    /// Most recent event retained per locator, for late-joining consumers.
    pub fn last_event(&self, locator: &ResourceLocator) -> Option<ValueEvent> {
        self.dispatcher.last_event(locator)
    }

    /// Locators currently carrying at least one listener.
    pub fn subscribed_locators(&self) -> Vec<ResourceLocator> {
        self.dispatcher.subscribed_locators()
    }

    /// Serves everything due at `now_ms`: due active subscriptions and
    /// resolver parents in one batched read per owner, then due backoff
    /// probes. Runs repeated passes so a promoted deferred child or a
    /// recovered probe delivers its value within this same call. Returns
    /// the earliest upcoming deadline. Meant to be driven by one external
    /// scheduler; `now_ms` is the scheduler's clock, not wall time.
    pub fn poll_due(&self, now_ms: u64) -> Option<u64> {
        self.last_poll_ms.fetch_max(now_ms, Ordering::Relaxed);
        loop {
            let mut events = Vec::new();
            let progressed = self.poll_pass(now_ms, &mut events);
            for event in events {
                self.dispatcher.dispatch(event);
            }
            if !progressed {
                break;
            }
        }
        self.next_deadline()
    }

    /// Purges the owner and moves its subscriptions to the stale pool,
    /// dispatching one unavailable event per affected locator. Wired to
    /// the endpoint's lifecycle events by the owning connection.
    pub fn on_owner_unregistered(&self, owner: &OwnerId) {
        self.metadata.on_owner_unregistered(owner);
        let mut events = Vec::new();
        let released = {
            let mut subs = self.subs.lock().expect("subscription pools poisoned");
            self.stale_owner_locked(owner, &mut subs, &mut events)
        };
        self.release_tokens(released);
        for event in events {
            self.dispatcher.dispatch(event);
        }
    }

    /// Re-routes the owner's stale subscriptions through fresh
    /// introspection.
    pub fn on_owner_registered(&self, owner: &OwnerId) {
        let mut events = Vec::new();
        {
            let mut subs = self.subs.lock().expect("subscription pools poisoned");
            let stale: Vec<ResourceLocator> = subs
                .iter()
                .filter(|(locator, state)| {
                    locator.owner() == owner && matches!(state, SubState::Stale)
                })
                .map(|(locator, _)| locator.clone())
                .collect();
            for locator in stale {
                log::debug!("re-routing {} after owner re-registration", locator);
                let state = self.route_locked(&locator, None, &mut events);
                subs.insert(locator, state);
            }
        }
        for event in events {
            self.dispatcher.dispatch(event);
        }
    }

    /// Drops every subscription and releases held endpoint resources.
    pub fn close(&self) {
        let mut released: Vec<NotificationToken> = Vec::new();
        {
            let mut subs = self.subs.lock().expect("subscription pools poisoned");
            for (_, state) in subs.drain() {
                if let SubState::Notification { tokens } = state {
                    released.extend(tokens);
                }
            }
        }
        for resolver in self.deferred.drain() {
            resolver.dispose();
        }
        self.release_tokens(released);
    }

    /// One scheduling pass under the pool lock. Returns whether anything
    /// was due; state transitions made here may leave newly due work for
    /// the next pass.
    fn poll_pass(&self, now_ms: u64, events: &mut Vec<ValueEvent>) -> bool {
        let mut released: Vec<NotificationToken> = Vec::new();
        let progressed = {
            let mut subs = self.subs.lock().expect("subscription pools poisoned");

            let mut due_active: Vec<ResourceLocator> = Vec::new();
            let mut due_probes: Vec<ResourceLocator> = Vec::new();
            for (locator, state) in subs.iter() {
                match state {
                    SubState::Active { last_tick } => {
                        if is_due(self.policies.next_tick(locator, *last_tick), now_ms) {
                            due_active.push(locator.clone());
                        }
                    }
                    SubState::Backoff(backoff) if backoff.next_probe_ms <= now_ms => {
                        due_probes.push(locator.clone());
                    }
                    _ => {}
                }
            }
            let due_resolvers = self.deferred.due_resolvers(now_ms);

            if due_active.is_empty() && due_probes.is_empty() && due_resolvers.is_empty() {
                false
            } else {
                self.serve_due(
                    &due_active,
                    &due_resolvers,
                    now_ms,
                    &mut subs,
                    events,
                    &mut released,
                );
                for locator in &due_probes {
                    let prior = match subs.get(locator) {
                        Some(SubState::Backoff(backoff)) => *backoff,
                        // Re-routed while serving this pass (stale owner).
                        _ => continue,
                    };
                    let state = self.route_locked(locator, Some(prior), events);
                    subs.insert(locator.clone(), state);
                }
                true
            }
        };
        self.release_tokens(released);
        progressed
    }

    /// Reads due active subscriptions and due resolver parents in one
    /// batch, dispatches the outcomes and applies pool transitions.
    fn serve_due(
        &self,
        due_active: &[ResourceLocator],
        due_resolvers: &[Arc<DeferredChildResolver>],
        now_ms: u64,
        subs: &mut HashMap<ResourceLocator, SubState>,
        events: &mut Vec<ValueEvent>,
        released: &mut Vec<NotificationToken>,
    ) {
        if due_active.is_empty() && due_resolvers.is_empty() {
            return;
        }
        let mut batch: Vec<ResourceLocator> = due_active.to_vec();
        batch.extend(due_resolvers.iter().map(|resolver| resolver.parent().clone()));
        let results = self.retriever.read_many(&batch);

        let mut stale_owners: HashSet<OwnerId> = HashSet::new();
        for locator in due_active {
            match results.get(locator) {
                Some(Ok(value)) => {
                    events.push(ValueEvent::value(locator.clone(), wall_clock_ms(), value.clone()));
                    subs.insert(
                        locator.clone(),
                        SubState::Active {
                            last_tick: Some(now_ms),
                        },
                    );
                }
                Some(Err(EngineError::StaleOwner { owner })) => {
                    if stale_owners.insert(owner.clone()) {
                        self.metadata.on_owner_unregistered(owner);
                        released.extend(self.stale_owner_locked(owner, subs, events));
                    }
                }
                Some(Err(e)) if matches!(e, EngineError::TransientFailure(_)) => {
                    // Retried at the next regular tick, not backed off.
                    events.push(ValueEvent::unavailable(
                        locator.clone(),
                        wall_clock_ms(),
                        e.clone(),
                    ));
                    subs.insert(
                        locator.clone(),
                        SubState::Active {
                            last_tick: Some(now_ms),
                        },
                    );
                }
                Some(Err(e)) => {
                    log::debug!("parking {} after read failure: {}", locator, e);
                    events.push(ValueEvent::unavailable(
                        locator.clone(),
                        wall_clock_ms(),
                        e.clone(),
                    ));
                    subs.insert(
                        locator.clone(),
                        SubState::Backoff(BackoffState::first(
                            self.policies.default_interval_ms(),
                            now_ms,
                        )),
                    );
                }
                // Dropped from the batch: the locator no longer resolves.
                None => {
                    let cause = self.unavailable_cause(locator);
                    log::debug!("parking {} after empty batch slot: {}", locator, cause);
                    events.push(ValueEvent::unavailable(locator.clone(), wall_clock_ms(), cause));
                    subs.insert(
                        locator.clone(),
                        SubState::Backoff(BackoffState::first(
                            self.policies.default_interval_ms(),
                            now_ms,
                        )),
                    );
                }
            }
        }

        for resolver in due_resolvers {
            resolver.mark_sampled(now_ms);
            if let Some(Ok(value)) = results.get(resolver.parent()) {
                if let Some(children) = resolver.try_resolve(value) {
                    self.deferred.remove(resolver.parent());
                    log::debug!(
                        "base {} resolved, promoting {} deferred children",
                        resolver.parent(),
                        children.len()
                    );
                    for child in children {
                        if subs.contains_key(&child) {
                            let state = self.route_locked(&child, None, events);
                            subs.insert(child, state);
                        }
                    }
                }
            }
        }
    }

    /// Routes one locator into a pool. Holds no pool lock itself; the
    /// caller does. Probes pass their prior backoff so failures double
    /// silently instead of re-notifying.
    fn route_locked(
        &self,
        locator: &ResourceLocator,
        prior: Option<BackoffState>,
        events: &mut Vec<ValueEvent>,
    ) -> SubState {
        if self.synthetics.provides(locator) {
            return self.route_synthetic(locator, prior, events);
        }
        match locator.kind() {
            ResourceKind::Attribute => self.route_attribute(locator, prior, events),
            // A transformation locator with no registered synthetic.
            ResourceKind::Transformation => self.parked(
                locator,
                EngineError::ResourceNotFound {
                    locator: locator.clone(),
                },
                prior,
                events,
            ),
            ResourceKind::Notification => self.route_plain_notification(locator, prior, events),
        }
    }

    fn route_attribute(
        &self,
        locator: &ResourceLocator,
        prior: Option<BackoffState>,
        events: &mut Vec<ValueEvent>,
    ) -> SubState {
        match self.metadata.resource_set(locator.owner()) {
            Ok(_) => {}
            Err(EngineError::StaleOwner { owner }) => {
                return self.stale(locator, owner, prior, events)
            }
            Err(e) => return self.parked(locator, e, prior, events),
        }
        if self.metadata.is_available(locator) {
            return SubState::Active { last_tick: None };
        }
        if locator.is_nested() {
            let base = locator.base_locator();
            if self.metadata.is_available(&base) && self.metadata.is_pending_discovery(&base) {
                self.deferred.park(
                    &base,
                    locator.clone(),
                    self.policies.effective_interval(locator),
                    self.policies.effective_interval(&base),
                );
                log::debug!("deferring {} until {} resolves", locator, base);
                return SubState::Deferred { parent: base };
            }
        }
        self.parked(locator, self.unavailable_cause(locator), prior, events)
    }

    /// Arithmetic and transformation synthetics poll like attributes once
    /// their dependencies resolve; notification synthetics attach to each
    /// declared source on the endpoint.
    fn route_synthetic(
        &self,
        locator: &ResourceLocator,
        prior: Option<BackoffState>,
        events: &mut Vec<ValueEvent>,
    ) -> SubState {
        self.introspect_dependency_owners(locator);
        if !self.synthetics.has_resolved_dependencies(locator, &self.metadata) {
            let cause = EngineError::UnresolvedDependency {
                locator: locator.clone(),
                missing: self.synthetics.first_unresolved(locator, &self.metadata),
            };
            return self.parked(locator, cause, prior, events);
        }
        match self.synthetics.notification_synthetic(locator) {
            Some(synthetic) => self.attach_synthetic_sources(locator, &synthetic, prior, events),
            None => SubState::Active { last_tick: None },
        }
    }

    fn attach_synthetic_sources(
        &self,
        locator: &ResourceLocator,
        synthetic: &Arc<NotificationSynthetic>,
        prior: Option<BackoffState>,
        events: &mut Vec<ValueEvent>,
    ) -> SubState {
        let mut tokens: Vec<NotificationToken> = Vec::new();
        for source in synthetic.sources() {
            let relay = Arc::new(SyntheticRelay {
                source: source.clone(),
                target: locator.clone(),
                synthetic: synthetic.clone(),
                dispatcher: self.dispatcher.clone(),
            });
            match self
                .endpoint
                .subscribe_notifications(source.owner(), source.base_attribute_name(), relay)
            {
                Ok(token) => tokens.push(token),
                Err(e) => {
                    // Partial attachment is rolled back as a unit.
                    self.release_tokens(tokens);
                    return self.parked(locator, e, prior, events);
                }
            }
        }
        SubState::Notification { tokens }
    }

    fn route_plain_notification(
        &self,
        locator: &ResourceLocator,
        prior: Option<BackoffState>,
        events: &mut Vec<ValueEvent>,
    ) -> SubState {
        match self.metadata.resource_set(locator.owner()) {
            Ok(_) => {}
            Err(EngineError::StaleOwner { owner }) => {
                return self.stale(locator, owner, prior, events)
            }
            Err(e) => return self.parked(locator, e, prior, events),
        }
        if !self.metadata.is_available(locator) {
            return self.parked(locator, self.unavailable_cause(locator), prior, events);
        }
        let relay = Arc::new(NotificationRelay {
            target: locator.clone(),
            dispatcher: self.dispatcher.clone(),
        });
        match self.endpoint.subscribe_notifications(
            locator.owner(),
            locator.base_attribute_name(),
            relay,
        ) {
            Ok(token) => SubState::Notification {
                tokens: vec![token],
            },
            Err(e) => self.parked(locator, e, prior, events),
        }
    }

    /// Availability of a synthetic only means anything once the owners of
    /// its dependency closure are introspected.
    fn introspect_dependency_owners(&self, locator: &ResourceLocator) {
        let mut visited: HashSet<ResourceLocator> = HashSet::new();
        let mut queue = self.synthetics.dependent_locators(locator);
        while let Some(dependent) = queue.pop() {
            if !visited.insert(dependent.clone()) {
                continue;
            }
            if self.synthetics.provides(&dependent) {
                queue.extend(self.synthetics.dependent_locators(&dependent));
            } else if let Err(e) = self.metadata.resource_set(dependent.owner()) {
                log::debug!("introspecting dependency owner of {} failed: {}", locator, e);
            }
        }
    }

    fn parked(
        &self,
        locator: &ResourceLocator,
        cause: EngineError,
        prior: Option<BackoffState>,
        events: &mut Vec<ValueEvent>,
    ) -> SubState {
        match prior {
            // Failed probe: double the spacing, no fresh event.
            Some(backoff) => {
                let next = backoff.doubled(self.sched_now());
                log::warn!(
                    "probe for {} failed ({}), next in {}ms",
                    locator,
                    cause,
                    next.interval_ms
                );
                SubState::Backoff(next)
            }
            None => {
                log::debug!("parking {}: {}", locator, cause);
                events.push(ValueEvent::unavailable(locator.clone(), wall_clock_ms(), cause));
                SubState::Backoff(BackoffState::first(
                    self.policies.default_interval_ms(),
                    self.sched_now(),
                ))
            }
        }
    }

    fn stale(
        &self,
        locator: &ResourceLocator,
        owner: OwnerId,
        prior: Option<BackoffState>,
        events: &mut Vec<ValueEvent>,
    ) -> SubState {
        if prior.is_none() {
            events.push(ValueEvent::unavailable(
                locator.clone(),
                wall_clock_ms(),
                EngineError::StaleOwner { owner },
            ));
        }
        SubState::Stale
    }

    /// Moves every subscription of the owner to the stale pool and
    /// disposes its deferred resolvers; idempotent per locator. Returns
    /// the notification tokens to release.
    fn stale_owner_locked(
        &self,
        owner: &OwnerId,
        subs: &mut HashMap<ResourceLocator, SubState>,
        events: &mut Vec<ValueEvent>,
    ) -> Vec<NotificationToken> {
        for resolver in self.deferred.resolvers_for_owner(owner) {
            resolver.dispose();
            self.deferred.remove(resolver.parent());
        }
        let mut released = Vec::new();
        for (locator, state) in subs.iter_mut() {
            if locator.owner() != owner {
                continue;
            }
            match std::mem::replace(state, SubState::Stale) {
                SubState::Stale => continue,
                SubState::Notification { tokens } => released.extend(tokens),
                _ => {}
            }
            events.push(ValueEvent::unavailable(
                locator.clone(),
                wall_clock_ms(),
                EngineError::StaleOwner {
                    owner: owner.clone(),
                },
            ));
        }
        released
    }

    /// Why a locator that did not resolve is unavailable, judged from the
    /// cached schema.
    fn unavailable_cause(&self, locator: &ResourceLocator) -> EngineError {
        if self.synthetics.provides(locator) {
            return EngineError::UnresolvedDependency {
                locator: locator.clone(),
                missing: self.synthetics.first_unresolved(locator, &self.metadata),
            };
        }
        match locator.kind() {
            ResourceKind::Attribute
                if locator.is_nested() && self.metadata.is_available(&locator.base_locator()) =>
            {
                EngineError::ResourceNotFound {
                    locator: locator.clone(),
                }
            }
            ResourceKind::Transformation => EngineError::ResourceNotFound {
                locator: locator.clone(),
            },
            _ => EngineError::SchemaNotFound {
                owner: locator.owner().clone(),
                resource: locator.base_attribute_name().to_owned(),
            },
        }
    }

    fn next_deadline(&self) -> Option<u64> {
        let subs = self.subs.lock().expect("subscription pools poisoned");
        let scheduled = subs
            .iter()
            .filter_map(|(locator, state)| match state {
                SubState::Active { last_tick } => self.policies.next_tick(locator, *last_tick),
                SubState::Backoff(backoff) => Some(backoff.next_probe_ms),
                SubState::Stale | SubState::Deferred { .. } | SubState::Notification { .. } => None,
            })
            .min();
        match (scheduled, self.deferred.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (deadline, None) => deadline,
            (None, deadline) => deadline,
        }
    }

    fn release_tokens(&self, tokens: Vec<NotificationToken>) {
        for token in tokens {
            if let Err(e) = self.endpoint.unsubscribe_notifications(token) {
                log::warn!("failed to release notification subscription: {}", e);
            }
        }
    }

    fn sched_now(&self) -> u64 {
        self.last_poll_ms.load(Ordering::Relaxed)
    }
}

/// Forwards one endpoint notification stream to the listeners of a
/// subscribed notification locator.
struct NotificationRelay {
    target: ResourceLocator,
    dispatcher: Arc<EventDispatcher>,
}

impl NotificationSink for NotificationRelay {
    fn notification(&self, _owner: &OwnerId, _name: &str, payload: Value, timestamp_ms: u64) {
        self.dispatcher
            .dispatch(ValueEvent::value(self.target.clone(), timestamp_ms, payload));
    }
}

/// Feeds one source stream into a notification synthetic and dispatches
/// the recomposed value when it actually changed.
struct SyntheticRelay {
    source: ResourceLocator,
    target: ResourceLocator,
    synthetic: Arc<NotificationSynthetic>,
    dispatcher: Arc<EventDispatcher>,
}

impl NotificationSink for SyntheticRelay {
    fn notification(&self, _owner: &OwnerId, _name: &str, payload: Value, timestamp_ms: u64) {
        if let Some(composed) = self.synthetic.ingest(&self.source, payload) {
            self.dispatcher
                .dispatch(ValueEvent::value(self.target.clone(), timestamp_ms, composed));
        }
    }
}

fn is_due(next: Option<u64>, now_ms: u64) -> bool {
    matches!(next, Some(due) if due <= now_ms)
}

fn wall_clock_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::local::LocalEndpoint;
    use crate::policy::UpdatePolicy;
    use crate::schema::{AttributeDescriptor, NotificationDescriptor};
    use crate::subscription::testing::RecordingListener;
    use crate::subscription::ValuePayload;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct Harness {
        endpoint: Arc<LocalEndpoint>,
        policies: Arc<PolicyStore>,
        service: SubscriptionService,
    }

    fn runtime() -> OwnerId {
        OwnerId::new("app:type=Runtime").unwrap()
    }

    fn uptime() -> ResourceLocator {
        ResourceLocator::attribute("app:type=Runtime", "Uptime").unwrap()
    }

    fn service_over(endpoint: Arc<LocalEndpoint>) -> Harness {
        let synthetics = Arc::new(SyntheticRegistry::new());
        let metadata = Arc::new(MetadataCache::new(
            endpoint.clone(),
            synthetics.clone(),
            &EngineConfig::default(),
        ));
        let retriever = Arc::new(ValueRetriever::new(
            endpoint.clone(),
            metadata.clone(),
            synthetics.clone(),
        ));
        let policies = Arc::new(PolicyStore::new(1000));
        let service = SubscriptionService::new(
            endpoint.clone(),
            metadata,
            retriever,
            policies.clone(),
            synthetics,
        );
        Harness {
            endpoint,
            policies,
            service,
        }
    }

    fn harness() -> Harness {
        let endpoint = Arc::new(LocalEndpoint::new());
        endpoint.register_owner(runtime());
        endpoint
            .add_attribute(
                &runtime(),
                AttributeDescriptor::scalar("Uptime", "long"),
                json!(5),
            )
            .unwrap();
        service_over(endpoint)
    }

    #[test]
    fn active_subscriptions_tick_on_the_policy_grid() {
        let h = harness();
        let listener = RecordingListener::shared();
        h.service.subscribe(&uptime(), listener.clone());
        assert_eq!(listener.events().len(), 0);

        assert_eq!(h.service.poll_due(0), Some(1000));
        assert_eq!(listener.events().len(), 1);
        assert_eq!(listener.events()[0].payload, ValuePayload::Value(json!(5)));

        // Mid-interval polls are quiet and issue no reads.
        let before = h.endpoint.stats();
        assert_eq!(h.service.poll_due(500), Some(1000));
        assert_eq!(h.endpoint.stats(), before);
        assert_eq!(listener.events().len(), 1);

        h.endpoint
            .set_attribute_value(&runtime(), "Uptime", json!(6))
            .unwrap();
        assert_eq!(h.service.poll_due(1000), Some(2000));
        let events = listener.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].payload, ValuePayload::Value(json!(6)));
    }

    #[test]
    fn listeners_share_one_underlying_subscription() {
        let h = harness();
        let first = RecordingListener::shared();
        let second = RecordingListener::shared();
        let a = h.service.subscribe(&uptime(), first.clone());
        let _b = h.service.subscribe(&uptime(), second.clone());
        assert_eq!(h.endpoint.stats().schema_queries, 1);
        assert_eq!(h.service.subscribed_locators(), vec![uptime()]);

        h.service.poll_due(0);
        assert_eq!(h.endpoint.stats().batch_reads, 1);
        assert_eq!(first.events().len(), 1);
        assert_eq!(second.events().len(), 1);

        // Removing one listener keeps the subscription alive.
        assert!(h.service.unsubscribe(a));
        h.service.poll_due(1000);
        assert_eq!(first.events().len(), 1);
        assert_eq!(second.events().len(), 2);
        assert!(h.service.last_event(&uptime()).is_some());
    }

    #[test]
    fn offline_routing_parks_and_probes_with_doubling_backoff() {
        let h = harness();
        h.endpoint.set_offline(true);
        let listener = RecordingListener::shared();
        h.service.subscribe(&uptime(), listener.clone());
        let events = listener.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0].payload,
            ValuePayload::Unavailable {
                cause: EngineError::TransientFailure(_)
            }
        ));

        // First probe lands one default interval out, then spacing doubles
        // silently on every failure.
        assert_eq!(h.service.poll_due(0), Some(1000));
        assert_eq!(h.service.poll_due(1000), Some(3000));
        assert_eq!(h.service.poll_due(3000), Some(7000));
        assert_eq!(listener.events().len(), 1);

        // A successful probe reinstates and delivers within the same call.
        h.endpoint.set_offline(false);
        assert_eq!(h.service.poll_due(7000), Some(8000));
        let events = listener.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].payload, ValuePayload::Value(json!(5)));
    }

    #[test]
    fn oneshot_fires_once_until_the_policy_changes() {
        let h = harness();
        h.policies.set(&uptime(), UpdatePolicy::OneShot);
        let listener = RecordingListener::shared();
        h.service.subscribe(&uptime(), listener.clone());

        assert_eq!(h.service.poll_due(0), None);
        assert_eq!(listener.events().len(), 1);
        assert_eq!(h.service.poll_due(5000), None);
        assert_eq!(listener.events().len(), 1);

        // Policy changes reach the live subscription at the next poll.
        h.policies
            .set(&uptime(), UpdatePolicy::simple(500).unwrap());
        assert_eq!(h.service.poll_due(5000), Some(5500));
        assert_eq!(listener.events().len(), 2);
    }

    #[test]
    fn plain_notifications_relay_deliveries_until_torn_down() {
        let h = harness();
        h.endpoint
            .add_notification(&runtime(), NotificationDescriptor::new("gc"))
            .unwrap();
        let gc = ResourceLocator::notification("app:type=Runtime", "gc").unwrap();
        let listener = RecordingListener::shared();
        let handle = h.service.subscribe(&gc, listener.clone());
        assert_eq!(listener.events().len(), 0);

        assert_eq!(
            h.endpoint
                .fire_notification(&runtime(), "gc", json!({"pauseMs": 3})),
            1
        );
        let events = listener.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].locator, gc);
        assert_eq!(events[0].payload, ValuePayload::Value(json!({"pauseMs": 3})));

        // The last listener releases the endpoint subscription too.
        assert!(h.service.unsubscribe(handle));
        assert_eq!(
            h.endpoint
                .fire_notification(&runtime(), "gc", json!({"pauseMs": 4})),
            0
        );
        assert!(h.service.subscribed_locators().is_empty());
    }

    #[test]
    fn unregistered_owners_park_stale_until_re_registration() {
        let h = harness();
        let listener = RecordingListener::shared();
        h.service.subscribe(&uptime(), listener.clone());
        h.service.poll_due(0);
        assert_eq!(listener.events().len(), 1);

        h.endpoint.unregister_owner(&runtime());
        h.service.on_owner_unregistered(&runtime());
        let events = listener.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1].payload,
            ValuePayload::Unavailable {
                cause: EngineError::StaleOwner { .. }
            }
        ));

        // Stale subscriptions are not probed.
        assert_eq!(h.service.poll_due(10_000), None);
        assert_eq!(listener.events().len(), 2);

        h.endpoint.register_owner(runtime());
        h.endpoint
            .add_attribute(
                &runtime(),
                AttributeDescriptor::scalar("Uptime", "long"),
                json!(9),
            )
            .unwrap();
        h.service.on_owner_registered(&runtime());
        assert_eq!(h.service.poll_due(20_000), Some(21_000));
        let events = listener.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].payload, ValuePayload::Value(json!(9)));
    }

    #[test]
    fn deferred_children_promote_when_the_base_first_resolves() {
        let endpoint = Arc::new(LocalEndpoint::new());
        endpoint.register_owner(runtime());
        endpoint
            .add_attribute(
                &runtime(),
                AttributeDescriptor::composite_dynamic("Heap"),
                Value::Null,
            )
            .unwrap();
        let h = service_over(endpoint);
        let used = ResourceLocator::attribute("app:type=Runtime", "Heap#used").unwrap();
        let listener = RecordingListener::shared();
        h.service.subscribe(&used, listener.clone());
        // Parked on the resolver, not in backoff: no unavailable event.
        assert_eq!(listener.events().len(), 0);

        // The base still produces Null, so the resolver keeps waiting.
        assert_eq!(h.service.poll_due(0), Some(1000));
        assert_eq!(listener.events().len(), 0);

        h.endpoint
            .set_attribute_value(&runtime(), "Heap", json!({"used": 7, "max": 32}))
            .unwrap();
        assert_eq!(h.service.poll_due(1000), Some(2000));
        let events = listener.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload, ValuePayload::Value(json!(7)));
    }

    #[test]
    fn transient_failures_keep_the_subscription_active() {
        let h = harness();
        let listener = RecordingListener::shared();
        h.service.subscribe(&uptime(), listener.clone());
        h.service.poll_due(0);

        h.endpoint.set_offline(true);
        h.service.poll_due(1000);
        h.service.poll_due(2000);
        let events = listener.events();
        assert_eq!(events.len(), 3);
        assert!(matches!(
            events[1].payload,
            ValuePayload::Unavailable {
                cause: EngineError::TransientFailure(_)
            }
        ));
        assert!(!events[2].is_available());

        h.endpoint.set_offline(false);
        h.service.poll_due(3000);
        let events = listener.events();
        assert_eq!(events.len(), 4);
        assert_eq!(events[3].payload, ValuePayload::Value(json!(5)));
    }
}
