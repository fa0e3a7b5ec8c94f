//! Per-owner schema cache with recursive composite introspection.
//!
//! Responsibilities:
//! - One endpoint schema query per owner introspection.
//! - Composite field layout from static descriptors when declared, else at
//!   most one live-value discovery read per composite per attempt.
//! - Incremental promotion from "cached but partial" to "fully
//!   introspected"; partial owners retry pending discovery on later access
//!   and through values observed by the retriever.
//! - Purge on owner unregistration; the next access re-introspects.
//!
//! Introspection and mutation are serialized by one coarse lock per cache;
//! completed snapshots are read under a brief read lock only.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use serde_json::{Map, Value};

use crate::config::EngineConfig;
use crate::endpoint::ManagementEndpoint;
use crate::error::EngineResult;
use crate::locator::{OwnerId, ResourceKind, ResourceLocator};
use crate::schema::{ResourceSchemaEntry, StructureDescriptor};
use crate::synthetic::SyntheticRegistry;

#[derive(Debug, Clone, Default)]
struct OwnerRecord {
    entries: BTreeMap<ResourceLocator, ResourceSchemaEntry>,
    /// Base attribute locators of composites whose field layout is still
    /// unknown (no static structure, no successful sample yet).
    pending: BTreeSet<ResourceLocator>,
    fully_introspected: bool,
}

pub struct MetadataCache {
    endpoint: Arc<dyn ManagementEndpoint>,
    synthetics: Arc<SyntheticRegistry>,
    sampling_enabled: bool,
    /// Coarse per-cache lock serializing introspection and mutation.
    introspection: Mutex<()>,
    owners: RwLock<HashMap<OwnerId, OwnerRecord>>,
}

impl MetadataCache {
    pub fn new(
        endpoint: Arc<dyn ManagementEndpoint>,
        synthetics: Arc<SyntheticRegistry>,
        config: &EngineConfig,
    ) -> Self {
        MetadataCache {
            endpoint,
            synthetics,
            sampling_enabled: config.introspection_sampling,
            introspection: Mutex::new(()),
            owners: RwLock::new(HashMap::new()),
        }
    }

    /// Every known locator of the owner, merged with registered synthetic
    /// locators it owns. Triggers introspection for uncached owners and
    /// retries pending composite discovery for partially introspected ones.
    pub fn resource_set(&self, owner: &OwnerId) -> EngineResult<BTreeSet<ResourceLocator>> {
        self.ensure_introspected(owner)?;
        let mut set: BTreeSet<ResourceLocator> = {
            let owners = self.owners.read().expect("metadata owners poisoned");
            owners
                .get(owner)
                .map(|record| record.entries.keys().cloned().collect())
                .unwrap_or_default()
        };
        set.extend(self.synthetics.locators_for_owner(owner));
        Ok(set)
    }

    /// Pure cached lookup; no I/O. For registered synthetic locators,
    /// true iff every declared dependent locator is available (recursive).
    pub fn is_available(&self, locator: &ResourceLocator) -> bool {
        if self.synthetics.provides(locator) {
            return self.synthetics.has_resolved_dependencies(locator, self);
        }
        if locator.kind() == ResourceKind::Transformation {
            return false;
        }
        let owners = self.owners.read().expect("metadata owners poisoned");
        owners
            .get(locator.owner())
            .map(|record| record.entries.contains_key(locator))
            .unwrap_or(false)
    }

    /// Cached schema entry; entries for synthetic locators are derived
    /// from the registry.
    pub fn schema_entry(&self, locator: &ResourceLocator) -> Option<ResourceSchemaEntry> {
        if self.synthetics.provides(locator) {
            return self.synthetics.metadata_entry(locator, self);
        }
        if locator.kind() == ResourceKind::Transformation {
            return None;
        }
        let owners = self.owners.read().expect("metadata owners poisoned");
        owners
            .get(locator.owner())
            .and_then(|record| record.entries.get(locator).cloned())
    }

    /// True once every composite of the owner has a known field layout.
    pub fn is_fully_introspected(&self, owner: &OwnerId) -> bool {
        let owners = self.owners.read().expect("metadata owners poisoned");
        owners
            .get(owner)
            .map(|record| record.fully_introspected)
            .unwrap_or(false)
    }

    /// True while a composite base attribute still awaits its first
    /// successful field discovery.
    pub fn is_pending_discovery(&self, base: &ResourceLocator) -> bool {
        let owners = self.owners.read().expect("metadata owners poisoned");
        owners
            .get(base.owner())
            .map(|record| record.pending.contains(base))
            .unwrap_or(false)
    }

    /// Purges the owner's schema; the next access re-introspects.
    pub fn on_owner_unregistered(&self, owner: &OwnerId) {
        let _guard = self
            .introspection
            .lock()
            .expect("metadata introspection lock poisoned");
        let mut owners = self.owners.write().expect("metadata owners poisoned");
        if owners.remove(owner).is_some() {
            log::debug!("purged cached schema for unregistered owner {}", owner);
        }
    }

    /// Feeds an observed composite base value back into the cache. This is
    /// how children of not-statically-known composites become available
    /// after the first successful read. No-op for fully introspected owners
    /// and for owners without a cached record.
    pub fn record_composite_sample(&self, base: &ResourceLocator, value: &Value) {
        let Value::Object(fields) = value else {
            return;
        };
        {
            let owners = self.owners.read().expect("metadata owners poisoned");
            match owners.get(base.owner()) {
                None => return,
                Some(record) if record.fully_introspected => return,
                Some(record) if !record.entries.contains_key(&base.base_locator()) => return,
                Some(_) => {}
            }
        }
        let _guard = self
            .introspection
            .lock()
            .expect("metadata introspection lock poisoned");
        self.apply_sample(&base.base_locator(), fields);
    }

    fn ensure_introspected(&self, owner: &OwnerId) -> EngineResult<()> {
        // Completed snapshots are readable without the coarse lock.
        let state = {
            let owners = self.owners.read().expect("metadata owners poisoned");
            owners.get(owner).map(|record| record.fully_introspected)
        };
        if state == Some(true) {
            return Ok(());
        }

        let _guard = self
            .introspection
            .lock()
            .expect("metadata introspection lock poisoned");
        // Re-check: a racing first-time caller may have introspected while
        // this thread waited on the coarse lock.
        let state = {
            let owners = self.owners.read().expect("metadata owners poisoned");
            owners.get(owner).map(|record| record.fully_introspected)
        };
        match state {
            Some(true) => Ok(()),
            Some(false) => {
                self.sample_pending(owner);
                Ok(())
            }
            None => self.introspect(owner),
        }
    }

    // Coarse lock held by the caller.
    fn introspect(&self, owner: &OwnerId) -> EngineResult<()> {
        let schema = self.endpoint.schema(owner)?;
        let mut record = OwnerRecord::default();

        for descriptor in &schema.attributes {
            let base = match ResourceLocator::new(
                ResourceKind::Attribute,
                owner.clone(),
                &descriptor.name,
            ) {
                Ok(base) => base,
                Err(e) => {
                    log::warn!("skipping undeclarable attribute on {}: {}", owner, e);
                    continue;
                }
            };
            let entry = ResourceSchemaEntry::from_attribute(descriptor);
            if descriptor.composite {
                match &descriptor.structure {
                    Some(structure) => {
                        insert_declared_children(&mut record, &base, structure, &entry)
                    }
                    None => {
                        record.pending.insert(base.clone());
                    }
                }
            }
            record.entries.insert(base, entry);
        }

        for descriptor in &schema.notifications {
            let locator = match ResourceLocator::new(
                ResourceKind::Notification,
                owner.clone(),
                &descriptor.name,
            ) {
                Ok(locator) => locator,
                Err(e) => {
                    log::warn!("skipping undeclarable notification on {}: {}", owner, e);
                    continue;
                }
            };
            record
                .entries
                .insert(locator, ResourceSchemaEntry::from_notification(descriptor));
        }

        record.fully_introspected = record.pending.is_empty();
        log::debug!(
            "introspected {}: {} entries, {} composites pending discovery",
            owner,
            record.entries.len(),
            record.pending.len()
        );
        {
            let mut owners = self.owners.write().expect("metadata owners poisoned");
            owners.insert(owner.clone(), record);
        }
        self.sample_pending(owner);
        Ok(())
    }

    // Coarse lock held by the caller. At most one live read per pending
    // composite; a failed or non-composite sample stays pending.
    fn sample_pending(&self, owner: &OwnerId) {
        if !self.sampling_enabled {
            return;
        }
        let pending: Vec<ResourceLocator> = {
            let owners = self.owners.read().expect("metadata owners poisoned");
            match owners.get(owner) {
                Some(record) => record.pending.iter().cloned().collect(),
                None => return,
            }
        };
        for base in pending {
            match self.endpoint.value(owner, base.base_attribute_name()) {
                Ok(Value::Object(fields)) => self.apply_sample(&base, &fields),
                Ok(other) => {
                    log::debug!(
                        "discovery sample for {} is {} rather than composite, keeping pending",
                        base,
                        crate::schema::sampled_type_name(&other)
                    );
                }
                Err(e) => {
                    log::warn!("discovery sample for {} failed: {}", base, e);
                }
            }
        }
    }

    // Coarse lock held by the caller.
    fn apply_sample(&self, base: &ResourceLocator, fields: &Map<String, Value>) {
        let mut owners = self.owners.write().expect("metadata owners poisoned");
        let Some(record) = owners.get_mut(base.owner()) else {
            return;
        };
        let Some(base_entry) = record.entries.get(base).cloned() else {
            return;
        };
        insert_sampled_children(record, base, fields, &base_entry);
        record.pending.remove(base);
        if record.pending.is_empty() && !record.fully_introspected {
            record.fully_introspected = true;
            log::debug!("owner {} is now fully introspected", base.owner());
        }
    }
}

fn insert_declared_children(
    record: &mut OwnerRecord,
    parent: &ResourceLocator,
    structure: &StructureDescriptor,
    base_entry: &ResourceSchemaEntry,
) {
    for field in &structure.fields {
        let child = match parent.child(&field.name) {
            Ok(child) => child,
            Err(e) => {
                log::warn!("skipping undeclarable field under {}: {}", parent, e);
                continue;
            }
        };
        let entry = ResourceSchemaEntry::from_field(field, base_entry);
        if let Some(nested) = &field.structure {
            insert_declared_children(record, &child, nested, base_entry);
        }
        record.entries.insert(child, entry);
    }
}

fn insert_sampled_children(
    record: &mut OwnerRecord,
    parent: &ResourceLocator,
    fields: &Map<String, Value>,
    base_entry: &ResourceSchemaEntry,
) {
    for (name, value) in fields {
        let child = match parent.child(name) {
            Ok(child) => child,
            Err(e) => {
                log::warn!("skipping undiscoverable field under {}: {}", parent, e);
                continue;
            }
        };
        let entry = ResourceSchemaEntry::from_sample(name, value, base_entry);
        if let Value::Object(nested) = value {
            insert_sampled_children(record, &child, nested, base_entry);
        }
        record.entries.insert(child, entry);
    }
}
