//! Connection-scoped facade over one management endpoint.
//!
//! `ServerConnection` owns the metadata cache, value retriever, policy
//! store, synthetic registry and subscription service for a single
//! endpoint and wires the endpoint's owner lifecycle events into them.
//! There is no process-wide state: every connection is independent, and
//! dropping it (after `close`) releases everything it held.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};

use serde_json::Value;

use crate::config::EngineConfig;
use crate::endpoint::{ManagementEndpoint, OwnerLifecycleSink};
use crate::error::EngineResult;
use crate::locator::{OwnerId, ResourceLocator};
use crate::metadata::MetadataCache;
use crate::policy::{PolicyStore, UpdatePolicy};
use crate::retriever::ValueRetriever;
use crate::schema::ResourceSchemaEntry;
use crate::subscription::{SubscriptionHandle, SubscriptionService, ValueEvent, ValueListener};
use crate::synthetic::{
    ArithmeticSynthetic, NotificationSynthetic, SingleResourceTransformation, SyntheticRegistry,
};

pub struct ServerConnection {
    metadata: Arc<MetadataCache>,
    retriever: Arc<ValueRetriever>,
    policies: Arc<PolicyStore>,
    synthetics: Arc<SyntheticRegistry>,
    subscriptions: Arc<SubscriptionService>,
}

impl ServerConnection {
    /// Builds the engine stack over the endpoint and registers for its
    /// owner lifecycle events.
    pub fn new(endpoint: Arc<dyn ManagementEndpoint>, config: EngineConfig) -> Self {
        let synthetics = Arc::new(SyntheticRegistry::new());
        let metadata = Arc::new(MetadataCache::new(
            endpoint.clone(),
            synthetics.clone(),
            &config,
        ));
        let retriever = Arc::new(ValueRetriever::new(
            endpoint.clone(),
            metadata.clone(),
            synthetics.clone(),
        ));
        let policies = Arc::new(PolicyStore::new(config.default_interval_ms));
        let subscriptions = Arc::new(SubscriptionService::new(
            endpoint.clone(),
            metadata.clone(),
            retriever.clone(),
            policies.clone(),
            synthetics.clone(),
        ));
        endpoint.watch_owners(Arc::new(LifecycleRelay {
            service: Arc::downgrade(&subscriptions),
        }));
        ServerConnection {
            metadata,
            retriever,
            policies,
            synthetics,
            subscriptions,
        }
    }

    /// Every known locator of the owner, introspecting on first access.
    pub fn resource_set(&self, owner: &OwnerId) -> EngineResult<BTreeSet<ResourceLocator>> {
        self.metadata.resource_set(owner)
    }

    /// Cached availability; no round trip.
    pub fn is_available(&self, locator: &ResourceLocator) -> bool {
        self.metadata.is_available(locator)
    }

    /// Cached schema entry for the locator.
    pub fn schema_entry(&self, locator: &ResourceLocator) -> Option<ResourceSchemaEntry> {
        self.metadata.schema_entry(locator)
    }

    pub fn read_one(&self, locator: &ResourceLocator) -> EngineResult<Value> {
        self.retriever.read(locator)
    }

    /// Batched read, one round trip per distinct owner. Locators that do
    /// not resolve are omitted from the result.
    pub fn read_many(
        &self,
        locators: &[ResourceLocator],
    ) -> HashMap<ResourceLocator, EngineResult<Value>> {
        self.retriever.read_many(locators)
    }

    pub fn write_one(&self, locator: &ResourceLocator, value: Value) -> EngineResult<()> {
        self.retriever.write(locator, value)
    }

    /// The locator's update policy, defaulting to `Default`.
    pub fn policy(&self, locator: &ResourceLocator) -> UpdatePolicy {
        self.policies.get(locator)
    }

    /// Changes the policy; a live subscription picks it up at its next
    /// poll without being torn down.
    pub fn set_policy(&self, locator: &ResourceLocator, policy: UpdatePolicy) {
        self.policies.set(locator, policy);
    }

    /// Canonical policy string, for the surrounding persistence layer.
    pub fn policy_string(&self, locator: &ResourceLocator) -> String {
        self.policies.policy_string(locator)
    }

    pub fn set_policy_from_string(
        &self,
        locator: &ResourceLocator,
        text: &str,
    ) -> EngineResult<()> {
        self.policies.set_from_string(locator, text)
    }

    pub fn register_arithmetic(&self, synthetic: ArithmeticSynthetic) -> EngineResult<()> {
        self.synthetics.register_arithmetic(synthetic)
    }

    /// Registers a notification synthetic, returning the shared handle its
    /// sources feed.
    pub fn register_notification(
        &self,
        synthetic: NotificationSynthetic,
    ) -> EngineResult<Arc<NotificationSynthetic>> {
        self.synthetics.register_notification(synthetic)
    }

    pub fn register_transformation(
        &self,
        synthetic: SingleResourceTransformation,
    ) -> EngineResult<()> {
        self.synthetics.register_transformation(synthetic)
    }

    pub fn unregister_synthetic(&self, locator: &ResourceLocator) -> bool {
        self.synthetics.unregister(locator)
    }

    /// Adds a value listener; see `SubscriptionService::subscribe`.
    pub fn subscribe(
        &self,
        locator: &ResourceLocator,
        listener: Arc<dyn ValueListener>,
    ) -> SubscriptionHandle {
        self.subscriptions.subscribe(locator, listener)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.subscriptions.unsubscribe(handle)
    }

    /// Most recent event retained for the locator.
    pub fn last_event(&self, locator: &ResourceLocator) -> Option<ValueEvent> {
        self.subscriptions.last_event(locator)
    }

    /// Drives due subscriptions; returns the next deadline. Call this from
    /// the external scheduler with its own clock.
    pub fn poll_due(&self, now_ms: u64) -> Option<u64> {
        self.subscriptions.poll_due(now_ms)
    }

    /// Tears down every subscription and releases endpoint resources held
    /// on their behalf.
    pub fn close(&self) {
        self.subscriptions.close();
    }
}

/// Forwards endpoint owner lifecycle events into the subscription
/// service. Holds a weak reference so the endpoint keeping the sink alive
/// does not keep the connection alive.
struct LifecycleRelay {
    service: Weak<SubscriptionService>,
}

impl OwnerLifecycleSink for LifecycleRelay {
    fn owner_registered(&self, owner: &OwnerId) {
        if let Some(service) = self.service.upgrade() {
            service.on_owner_registered(owner);
        }
    }

    fn owner_unregistered(&self, owner: &OwnerId) {
        if let Some(service) = self.service.upgrade() {
            service.on_owner_unregistered(owner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::OwnerSchema;
    use crate::error::EngineError;
    use crate::local::LocalEndpoint;
    use crate::schema::AttributeDescriptor;
    use crate::schema::NotificationDescriptor;
    use crate::subscription::testing::RecordingListener;
    use crate::subscription::ValuePayload;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn runtime() -> OwnerId {
        OwnerId::new("app:type=Runtime").unwrap()
    }

    fn uptime() -> ResourceLocator {
        ResourceLocator::attribute("app:type=Runtime", "Uptime").unwrap()
    }

    fn pid() -> ResourceLocator {
        ResourceLocator::attribute("app:type=Runtime", "Pid").unwrap()
    }

    #[test]
    fn reads_writes_and_metadata_flow_through_one_facade() {
        let endpoint = Arc::new(LocalEndpoint::new());
        endpoint.register_owner(runtime());
        endpoint
            .add_attribute(
                &runtime(),
                AttributeDescriptor::scalar("Pid", "long").with_writable(true),
                json!(41),
            )
            .unwrap();
        endpoint
            .add_attribute(
                &runtime(),
                AttributeDescriptor::composite_dynamic("Heap"),
                json!({"used": 10}),
            )
            .unwrap();
        let conn = ServerConnection::new(endpoint.clone(), EngineConfig::default());

        let set = conn.resource_set(&runtime()).unwrap();
        assert!(set.contains(&pid()));
        let used = ResourceLocator::attribute("app:type=Runtime", "Heap#used").unwrap();
        assert!(conn.is_available(&used));
        assert_eq!(conn.read_one(&used).unwrap(), json!(10));
        assert_eq!(conn.schema_entry(&pid()).unwrap().type_name, "long");

        conn.write_one(&pid(), json!(42)).unwrap();
        assert_eq!(conn.read_one(&pid()).unwrap(), json!(42));
    }

    #[test]
    fn synthetics_register_and_read_like_native_resources() {
        let endpoint = Arc::new(LocalEndpoint::new());
        endpoint.register_owner(runtime());
        endpoint
            .add_attribute(
                &runtime(),
                AttributeDescriptor::scalar("Elapsed", "long"),
                json!(10000),
            )
            .unwrap();
        endpoint
            .add_attribute(&runtime(), AttributeDescriptor::scalar("Tick", "long"), json!(50))
            .unwrap();
        let conn = ServerConnection::new(endpoint, EngineConfig::default());

        let ratio = ResourceLocator::transformation("app:type=Runtime", "Ratio").unwrap();
        conn.register_arithmetic(
            ArithmeticSynthetic::quotient(
                ratio.clone(),
                ResourceLocator::attribute("app:type=Runtime", "Elapsed").unwrap(),
                ResourceLocator::attribute("app:type=Runtime", "Tick").unwrap(),
            )
            .with_factor(2.0),
        )
        .unwrap();

        assert!(conn.resource_set(&runtime()).unwrap().contains(&ratio));
        assert!(conn.is_available(&ratio));
        assert_eq!(conn.read_one(&ratio).unwrap(), json!(400.0));

        assert!(conn.unregister_synthetic(&ratio));
        assert!(!conn.is_available(&ratio));
    }

    #[test]
    fn lifecycle_events_reach_subscriptions_without_manual_wiring() {
        let endpoint = Arc::new(LocalEndpoint::new());
        endpoint.register_owner(runtime());
        endpoint
            .add_attribute(
                &runtime(),
                AttributeDescriptor::scalar("Uptime", "long"),
                json!(5),
            )
            .unwrap();
        let conn = ServerConnection::new(endpoint.clone(), EngineConfig::default());
        let listener = RecordingListener::shared();
        conn.subscribe(&uptime(), listener.clone());
        conn.poll_due(0);
        assert_eq!(listener.events().len(), 1);

        endpoint.unregister_owner(&runtime());
        let events = listener.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1].payload,
            ValuePayload::Unavailable {
                cause: EngineError::StaleOwner { .. }
            }
        ));
        assert_eq!(conn.poll_due(10_000), None);

        let schema = OwnerSchema {
            attributes: vec![AttributeDescriptor::scalar("Uptime", "long")],
            notifications: vec![],
        };
        let mut values = HashMap::new();
        values.insert("Uptime".to_string(), json!(9));
        endpoint.register_owner_with(runtime(), schema, values);

        assert_eq!(conn.poll_due(20_000), Some(21_000));
        let events = listener.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].payload, ValuePayload::Value(json!(9)));
    }

    #[test]
    fn policy_changes_reach_live_subscriptions() {
        let endpoint = Arc::new(LocalEndpoint::new());
        endpoint.register_owner(runtime());
        endpoint
            .add_attribute(
                &runtime(),
                AttributeDescriptor::scalar("Uptime", "long"),
                json!(5),
            )
            .unwrap();
        let conn = ServerConnection::new(endpoint, EngineConfig::default());

        conn.set_policy_from_string(&uptime(), "simple:500").unwrap();
        assert_eq!(conn.policy_string(&uptime()), "simple:500");
        assert_eq!(conn.policy(&uptime()), UpdatePolicy::Simple { interval_ms: 500 });

        let listener = RecordingListener::shared();
        conn.subscribe(&uptime(), listener.clone());
        assert_eq!(conn.poll_due(0), Some(500));
        assert_eq!(conn.poll_due(500), Some(1000));
        assert_eq!(listener.events().len(), 2);

        conn.set_policy(&uptime(), UpdatePolicy::Default);
        assert_eq!(conn.poll_due(1000), Some(2000));
    }

    #[test]
    fn close_releases_endpoint_notification_subscriptions() {
        let endpoint = Arc::new(LocalEndpoint::new());
        endpoint.register_owner(runtime());
        endpoint
            .add_notification(&runtime(), NotificationDescriptor::new("gc"))
            .unwrap();
        let conn = ServerConnection::new(endpoint.clone(), EngineConfig::default());

        let gc = ResourceLocator::notification("app:type=Runtime", "gc").unwrap();
        let listener = RecordingListener::shared();
        conn.subscribe(&gc, listener.clone());
        assert_eq!(endpoint.fire_notification(&runtime(), "gc", json!({"n": 1})), 1);

        conn.close();
        assert_eq!(endpoint.fire_notification(&runtime(), "gc", json!({"n": 2})), 0);
        assert_eq!(listener.events().len(), 1);
    }
}
