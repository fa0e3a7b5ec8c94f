//! In-process management endpoint.
//!
//! Owners live in in-memory tables; notifications fan out synchronously on
//! the firing thread; an offline switch simulates connection outages.
//! Per-operation counters expose how many round trips callers actually
//! issued, which the test suite uses to verify batching and caching.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::endpoint::{
    ManagementEndpoint, NotificationSink, NotificationToken, OwnerLifecycleSink, OwnerSchema,
};
use crate::error::{EngineError, EngineResult};
use crate::locator::{OwnerId, ResourceKind, ResourceLocator};
use crate::schema::{AttributeDescriptor, NotificationDescriptor};

/// Round-trip counters, one per endpoint operation kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointStats {
    pub schema_queries: u64,
    pub single_reads: u64,
    pub batch_reads: u64,
    pub writes: u64,
}

#[derive(Debug, Clone, Default)]
struct LocalOwner {
    schema: OwnerSchema,
    values: HashMap<String, Value>,
}

struct NotificationRoute {
    owner: OwnerId,
    name: String,
    sink: Arc<dyn NotificationSink>,
}

/// In-memory `ManagementEndpoint` for embedded use and tests.
#[derive(Default)]
pub struct LocalEndpoint {
    owners: Mutex<HashMap<OwnerId, LocalOwner>>,
    routes: Mutex<HashMap<u64, NotificationRoute>>,
    lifecycle_sinks: Mutex<Vec<Arc<dyn OwnerLifecycleSink>>>,
    next_token: AtomicU64,
    offline: AtomicBool,
    schema_queries: AtomicU64,
    single_reads: AtomicU64,
    batch_reads: AtomicU64,
    writes: AtomicU64,
}

impl LocalEndpoint {
    pub fn new() -> Self {
        LocalEndpoint::default()
    }

    /// Registers an owner and announces it to lifecycle sinks. Registering
    /// an already-present owner is a no-op.
    pub fn register_owner(&self, owner: OwnerId) {
        self.register_owner_with(owner, OwnerSchema::default(), HashMap::new());
    }

    /// Registers an owner together with its full schema and initial
    /// values, so lifecycle sinks observe it completely declared. Live
    /// connections introspect on the registration event; an owner built
    /// piecemeal after `register_owner` looks empty to them.
    pub fn register_owner_with(
        &self,
        owner: OwnerId,
        schema: OwnerSchema,
        values: HashMap<String, Value>,
    ) {
        let inserted = {
            let mut owners = self.owners.lock().expect("local endpoint owners poisoned");
            match owners.entry(owner.clone()) {
                std::collections::hash_map::Entry::Occupied(_) => false,
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(LocalOwner { schema, values });
                    true
                }
            }
        };
        if inserted {
            for sink in self.lifecycle_snapshot() {
                sink.owner_registered(&owner);
            }
        }
    }

    /// Removes an owner, drops its notification routes, and announces the
    /// removal to lifecycle sinks.
    pub fn unregister_owner(&self, owner: &OwnerId) {
        let removed = {
            let mut owners = self.owners.lock().expect("local endpoint owners poisoned");
            owners.remove(owner).is_some()
        };
        if removed {
            let mut routes = self.routes.lock().expect("local endpoint routes poisoned");
            routes.retain(|_, route| route.owner != *owner);
            drop(routes);
            for sink in self.lifecycle_snapshot() {
                sink.owner_unregistered(owner);
            }
        }
    }

    /// Declares an attribute on a registered owner, with its initial value.
    pub fn add_attribute(
        &self,
        owner: &OwnerId,
        descriptor: AttributeDescriptor,
        initial: Value,
    ) -> EngineResult<()> {
        if descriptor.name.contains('#') || descriptor.name.contains('/') {
            return Err(EngineError::malformed_locator(
                &descriptor.name,
                "attribute names must not contain '#' or '/'",
            ));
        }
        let mut owners = self.owners.lock().expect("local endpoint owners poisoned");
        let entry = owners
            .get_mut(owner)
            .ok_or_else(|| EngineError::StaleOwner {
                owner: owner.clone(),
            })?;
        entry.values.insert(descriptor.name.clone(), initial);
        entry.schema.attributes.retain(|a| a.name != descriptor.name);
        entry.schema.attributes.push(descriptor);
        Ok(())
    }

    /// Declares a notification on a registered owner.
    pub fn add_notification(
        &self,
        owner: &OwnerId,
        descriptor: NotificationDescriptor,
    ) -> EngineResult<()> {
        let mut owners = self.owners.lock().expect("local endpoint owners poisoned");
        let entry = owners
            .get_mut(owner)
            .ok_or_else(|| EngineError::StaleOwner {
                owner: owner.clone(),
            })?;
        entry
            .schema
            .notifications
            .retain(|n| n.name != descriptor.name);
        entry.schema.notifications.push(descriptor);
        Ok(())
    }

    /// Mutates an attribute value locally, bypassing the writable flag.
    pub fn set_attribute_value(
        &self,
        owner: &OwnerId,
        name: &str,
        value: Value,
    ) -> EngineResult<()> {
        let mut owners = self.owners.lock().expect("local endpoint owners poisoned");
        let entry = owners
            .get_mut(owner)
            .ok_or_else(|| EngineError::StaleOwner {
                owner: owner.clone(),
            })?;
        if !entry.schema.attributes.iter().any(|a| a.name == name) {
            return Err(EngineError::SchemaNotFound {
                owner: owner.clone(),
                resource: name.to_string(),
            });
        }
        entry.values.insert(name.to_string(), value);
        Ok(())
    }

    /// Delivers a notification to every matching subscriber, stamped with
    /// the current wall clock. Returns the number of deliveries.
    pub fn fire_notification(&self, owner: &OwnerId, name: &str, payload: Value) -> usize {
        let timestamp_ms = chrono::Utc::now().timestamp_millis() as u64;
        let sinks: Vec<Arc<dyn NotificationSink>> = {
            let routes = self.routes.lock().expect("local endpoint routes poisoned");
            routes
                .values()
                .filter(|route| route.owner == *owner && route.name == name)
                .map(|route| Arc::clone(&route.sink))
                .collect()
        };
        for sink in &sinks {
            sink.notification(owner, name, payload.clone(), timestamp_ms);
        }
        sinks.len()
    }

    /// Simulates a connection outage: while offline, every endpoint
    /// operation fails with a transient error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn stats(&self) -> EndpointStats {
        EndpointStats {
            schema_queries: self.schema_queries.load(Ordering::SeqCst),
            single_reads: self.single_reads.load(Ordering::SeqCst),
            batch_reads: self.batch_reads.load(Ordering::SeqCst),
            writes: self.writes.load(Ordering::SeqCst),
        }
    }

    fn check_online(&self) -> EngineResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(EngineError::transient("endpoint offline"))
        } else {
            Ok(())
        }
    }

    fn lifecycle_snapshot(&self) -> Vec<Arc<dyn OwnerLifecycleSink>> {
        self.lifecycle_sinks
            .lock()
            .expect("local endpoint lifecycle sinks poisoned")
            .clone()
    }

    fn attribute_locator(&self, owner: &OwnerId, name: &str) -> EngineResult<ResourceLocator> {
        ResourceLocator::new(ResourceKind::Attribute, owner.clone(), name)
    }
}

impl ManagementEndpoint for LocalEndpoint {
    fn schema(&self, owner: &OwnerId) -> EngineResult<OwnerSchema> {
        self.check_online()?;
        self.schema_queries.fetch_add(1, Ordering::SeqCst);
        let owners = self.owners.lock().expect("local endpoint owners poisoned");
        owners
            .get(owner)
            .map(|entry| entry.schema.clone())
            .ok_or_else(|| EngineError::StaleOwner {
                owner: owner.clone(),
            })
    }

    fn value(&self, owner: &OwnerId, name: &str) -> EngineResult<Value> {
        self.check_online()?;
        self.single_reads.fetch_add(1, Ordering::SeqCst);
        let owners = self.owners.lock().expect("local endpoint owners poisoned");
        let entry = owners.get(owner).ok_or_else(|| EngineError::StaleOwner {
            owner: owner.clone(),
        })?;
        let declared = entry
            .schema
            .attributes
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| EngineError::SchemaNotFound {
                owner: owner.clone(),
                resource: name.to_string(),
            })?;
        if !declared.readable {
            return Err(EngineError::NotReadable {
                locator: self.attribute_locator(owner, name)?,
            });
        }
        Ok(entry.values.get(name).cloned().unwrap_or(Value::Null))
    }

    fn values(&self, owner: &OwnerId, names: &[String]) -> EngineResult<HashMap<String, Value>> {
        self.check_online()?;
        self.batch_reads.fetch_add(1, Ordering::SeqCst);
        let owners = self.owners.lock().expect("local endpoint owners poisoned");
        let entry = owners.get(owner).ok_or_else(|| EngineError::StaleOwner {
            owner: owner.clone(),
        })?;
        let mut fetched = HashMap::new();
        for name in names {
            let declared = entry
                .schema
                .attributes
                .iter()
                .find(|a| a.name == *name && a.readable);
            if declared.is_some() {
                let value = entry.values.get(name).cloned().unwrap_or(Value::Null);
                fetched.insert(name.clone(), value);
            }
        }
        Ok(fetched)
    }

    fn set_value(&self, owner: &OwnerId, name: &str, value: Value) -> EngineResult<()> {
        self.check_online()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut owners = self.owners.lock().expect("local endpoint owners poisoned");
        let entry = owners
            .get_mut(owner)
            .ok_or_else(|| EngineError::StaleOwner {
                owner: owner.clone(),
            })?;
        let declared = entry
            .schema
            .attributes
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| EngineError::SchemaNotFound {
                owner: owner.clone(),
                resource: name.to_string(),
            })?;
        if !declared.writable {
            return Err(EngineError::NotWritable {
                locator: self.attribute_locator(owner, name)?,
            });
        }
        entry.values.insert(name.to_string(), value);
        Ok(())
    }

    fn subscribe_notifications(
        &self,
        owner: &OwnerId,
        name: &str,
        sink: Arc<dyn NotificationSink>,
    ) -> EngineResult<NotificationToken> {
        self.check_online()?;
        {
            let owners = self.owners.lock().expect("local endpoint owners poisoned");
            let entry = owners.get(owner).ok_or_else(|| EngineError::StaleOwner {
                owner: owner.clone(),
            })?;
            if !entry.schema.notifications.iter().any(|n| n.name == name) {
                return Err(EngineError::SchemaNotFound {
                    owner: owner.clone(),
                    resource: name.to_string(),
                });
            }
        }
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let mut routes = self.routes.lock().expect("local endpoint routes poisoned");
        routes.insert(
            token,
            NotificationRoute {
                owner: owner.clone(),
                name: name.to_string(),
                sink,
            },
        );
        Ok(NotificationToken(token))
    }

    fn unsubscribe_notifications(&self, token: NotificationToken) -> EngineResult<()> {
        let mut routes = self.routes.lock().expect("local endpoint routes poisoned");
        routes.remove(&token.0);
        Ok(())
    }

    fn watch_owners(&self, sink: Arc<dyn OwnerLifecycleSink>) {
        self.lifecycle_sinks
            .lock()
            .expect("local endpoint lifecycle sinks poisoned")
            .push(sink);
    }

    fn owners(&self) -> EngineResult<Vec<OwnerId>> {
        self.check_online()?;
        let owners = self.owners.lock().expect("local endpoint owners poisoned");
        Ok(owners.keys().cloned().collect())
    }
}
