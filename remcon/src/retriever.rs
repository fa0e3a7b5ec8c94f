//! Value reads and writes with per-owner batching.
//!
//! Nested locators never cost a separate round trip: the base attribute is
//! read once and the child value extracted from the returned composite.
//! Every composite base value observed here is fed back into the metadata
//! cache so children of dynamically structured composites become available
//! after the first successful read.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::Value;

use crate::endpoint::ManagementEndpoint;
use crate::error::{EngineError, EngineResult};
use crate::locator::{OwnerId, ResourceKind, ResourceLocator};
use crate::metadata::MetadataCache;
use crate::synthetic::SyntheticRegistry;

pub struct ValueRetriever {
    endpoint: Arc<dyn ManagementEndpoint>,
    metadata: Arc<MetadataCache>,
    synthetics: Arc<SyntheticRegistry>,
}

impl ValueRetriever {
    pub fn new(
        endpoint: Arc<dyn ManagementEndpoint>,
        metadata: Arc<MetadataCache>,
        synthetics: Arc<SyntheticRegistry>,
    ) -> Self {
        ValueRetriever {
            endpoint,
            metadata,
            synthetics,
        }
    }

    /// Reads one locator. Nested attribute locators read their base
    /// attribute and extract the addressed field. Notification locators
    /// are only readable when a synthetic accumulates state for them.
    pub fn read(&self, locator: &ResourceLocator) -> EngineResult<Value> {
        match locator.kind() {
            ResourceKind::Attribute => {
                let base_value = self
                    .endpoint
                    .value(locator.owner(), locator.base_attribute_name())?;
                self.metadata
                    .record_composite_sample(&locator.base_locator(), &base_value);
                extract_nested(base_value, locator)
            }
            ResourceKind::Transformation => self.synthetics.evaluate(locator, self),
            ResourceKind::Notification => {
                if self.synthetics.provides(locator) {
                    self.synthetics.evaluate(locator, self)
                } else {
                    Err(EngineError::NotReadable {
                        locator: locator.clone(),
                    })
                }
            }
        }
    }

    /// Reads a set of locators with one batch round trip per distinct
    /// owner. Locators sharing a base attribute share one fetched value.
    ///
    /// A locator that does not resolve (unknown base name, missing nested
    /// field) is left out of the result instead of failing the batch; a
    /// failed round trip produces an error entry for every locator of that
    /// owner so one broken owner never poisons the others.
    pub fn read_many(
        &self,
        locators: &[ResourceLocator],
    ) -> HashMap<ResourceLocator, EngineResult<Value>> {
        let mut results = HashMap::with_capacity(locators.len());
        let mut by_owner: HashMap<&OwnerId, Vec<&ResourceLocator>> = HashMap::new();

        for locator in locators {
            match locator.kind() {
                ResourceKind::Attribute => {
                    by_owner.entry(locator.owner()).or_default().push(locator);
                }
                ResourceKind::Transformation => {
                    results.insert(locator.clone(), self.synthetics.evaluate(locator, self));
                }
                ResourceKind::Notification => {
                    if self.synthetics.provides(locator) {
                        results.insert(locator.clone(), self.synthetics.evaluate(locator, self));
                    } else {
                        log::debug!("batch read skipping notification locator {}", locator);
                    }
                }
            }
        }

        for (owner, group) in by_owner {
            let names: Vec<String> = group
                .iter()
                .map(|locator| locator.base_attribute_name().to_owned())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            match self.endpoint.values(owner, &names) {
                Ok(base_values) => {
                    for (name, value) in &base_values {
                        if let Ok(base) =
                            ResourceLocator::new(ResourceKind::Attribute, owner.clone(), name)
                        {
                            self.metadata.record_composite_sample(&base, value);
                        }
                    }
                    for locator in group {
                        match base_values.get(locator.base_attribute_name()) {
                            Some(value) => match extract_nested(value.clone(), locator) {
                                Ok(resolved) => {
                                    results.insert(locator.clone(), Ok(resolved));
                                }
                                Err(e) => {
                                    log::debug!("dropping {} from batch result: {}", locator, e);
                                }
                            },
                            None => {
                                log::debug!(
                                    "dropping {} from batch result: not in response",
                                    locator
                                );
                            }
                        }
                    }
                }
                Err(e) => {
                    log::warn!("batch read against {} failed: {}", owner, e);
                    for locator in group {
                        results.insert(locator.clone(), Err(e.clone()));
                    }
                }
            }
        }

        results
    }

    /// Writes a base attribute. Nested fields, transformations and
    /// notifications are never writable.
    pub fn write(&self, locator: &ResourceLocator, value: Value) -> EngineResult<()> {
        if locator.kind() != ResourceKind::Attribute || locator.is_nested() {
            return Err(EngineError::NotWritable {
                locator: locator.clone(),
            });
        }
        self.endpoint
            .set_value(locator.owner(), locator.base_attribute_name(), value)
    }

    pub(crate) fn metadata(&self) -> &MetadataCache {
        &self.metadata
    }
}

/// Walks the nested segments of `locator` down into a base value.
fn extract_nested(base_value: Value, locator: &ResourceLocator) -> EngineResult<Value> {
    let mut current = base_value;
    for segment in locator.nested_segments() {
        match current {
            Value::Object(mut fields) => match fields.remove(segment) {
                Some(child) => current = child,
                None => {
                    return Err(EngineError::ResourceNotFound {
                        locator: locator.clone(),
                    })
                }
            },
            _ => {
                return Err(EngineError::ResourceNotFound {
                    locator: locator.clone(),
                })
            }
        }
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::local::LocalEndpoint;
    use crate::schema::AttributeDescriptor;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn harness() -> (Arc<LocalEndpoint>, ValueRetriever) {
        let endpoint = Arc::new(LocalEndpoint::new());
        let owner = OwnerId::new("app:type=Runtime").unwrap();
        endpoint.register_owner(owner.clone());
        endpoint
            .add_attribute(
                &owner,
                AttributeDescriptor::scalar("Pid", "long").with_writable(true),
                json!(41),
            )
            .unwrap();
        endpoint
            .add_attribute(
                &owner,
                AttributeDescriptor::composite_dynamic("Heap"),
                json!({"used": 10, "limits": {"soft": 1, "hard": 2}}),
            )
            .unwrap();
        let synthetics = Arc::new(SyntheticRegistry::new());
        let metadata = Arc::new(MetadataCache::new(
            endpoint.clone(),
            synthetics.clone(),
            &EngineConfig::default().with_introspection_sampling(false),
        ));
        let retriever = ValueRetriever::new(endpoint.clone(), metadata, synthetics);
        (endpoint, retriever)
    }

    #[test]
    fn nested_reads_extract_from_one_base_read() {
        let (endpoint, retriever) = harness();
        let soft = ResourceLocator::attribute("app:type=Runtime", "Heap#limits#soft").unwrap();
        assert_eq!(retriever.read(&soft).unwrap(), json!(1));
        assert_eq!(endpoint.stats().single_reads, 1);
    }

    #[test]
    fn missing_nested_paths_report_the_full_locator() {
        let (_endpoint, retriever) = harness();
        let ghost = ResourceLocator::attribute("app:type=Runtime", "Heap#ghost").unwrap();
        assert_eq!(
            retriever.read(&ghost),
            Err(EngineError::ResourceNotFound {
                locator: ghost.clone()
            })
        );
    }

    #[test]
    fn read_many_issues_one_batch_per_owner() {
        let (endpoint, retriever) = harness();
        let pid = ResourceLocator::attribute("app:type=Runtime", "Pid").unwrap();
        let used = ResourceLocator::attribute("app:type=Runtime", "Heap#used").unwrap();
        let soft = ResourceLocator::attribute("app:type=Runtime", "Heap#limits#soft").unwrap();

        let results = retriever.read_many(&[pid.clone(), used.clone(), soft.clone()]);
        assert_eq!(results[&pid], Ok(json!(41)));
        assert_eq!(results[&used], Ok(json!(10)));
        assert_eq!(results[&soft], Ok(json!(1)));
        assert_eq!(endpoint.stats().batch_reads, 1);
        assert_eq!(endpoint.stats().single_reads, 0);
    }

    #[test]
    fn read_many_omits_what_does_not_resolve() {
        let (_endpoint, retriever) = harness();
        let pid = ResourceLocator::attribute("app:type=Runtime", "Pid").unwrap();
        let ghost = ResourceLocator::attribute("app:type=Runtime", "Ghost").unwrap();
        let hole = ResourceLocator::attribute("app:type=Runtime", "Heap#limits#ghost").unwrap();
        let gc = ResourceLocator::notification("app:type=Runtime", "gc").unwrap();

        let results = retriever.read_many(&[pid.clone(), ghost.clone(), hole.clone(), gc.clone()]);
        assert_eq!(results[&pid], Ok(json!(41)));
        assert!(!results.contains_key(&ghost));
        assert!(!results.contains_key(&hole));
        assert!(!results.contains_key(&gc));
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn observed_composites_feed_schema_discovery() {
        let (endpoint, retriever) = harness();
        let owner = OwnerId::new("app:type=Runtime").unwrap();
        // Sampling is disabled in the harness, so introspection alone does
        // not expose composite children.
        retriever.metadata.resource_set(&owner).unwrap();
        let used = ResourceLocator::attribute("app:type=Runtime", "Heap#used").unwrap();
        assert!(!retriever.metadata.is_available(&used));

        retriever.read_many(&[used.base_locator()]);
        assert!(retriever.metadata.is_available(&used));
        assert_eq!(endpoint.stats().batch_reads, 1);
    }

    #[test]
    fn only_base_attributes_are_writable() {
        let (_endpoint, retriever) = harness();
        let pid = ResourceLocator::attribute("app:type=Runtime", "Pid").unwrap();
        retriever.read(&pid).unwrap();
        retriever.write(&pid, json!(42)).unwrap();
        assert_eq!(retriever.read(&pid).unwrap(), json!(42));

        let used = ResourceLocator::attribute("app:type=Runtime", "Heap#used").unwrap();
        assert_eq!(
            retriever.write(&used, json!(0)),
            Err(EngineError::NotWritable {
                locator: used.clone()
            })
        );
    }

    #[test]
    fn transport_failures_reach_every_locator_of_the_owner() {
        let (endpoint, retriever) = harness();
        endpoint.set_offline(true);
        let pid = ResourceLocator::attribute("app:type=Runtime", "Pid").unwrap();
        let used = ResourceLocator::attribute("app:type=Runtime", "Heap#used").unwrap();
        let results = retriever.read_many(&[pid.clone(), used.clone()]);
        assert!(matches!(
            results[&pid],
            Err(EngineError::TransientFailure(_))
        ));
        assert!(matches!(
            results[&used],
            Err(EngineError::TransientFailure(_))
        ));
    }
}
