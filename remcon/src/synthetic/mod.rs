//! Synthetic resources: derived attributes, synthesized notifications and
//! metadata-forwarding transformations.
//!
//! A registry keyed by locator owns the closed set of synthetic kinds.
//! Availability resolves recursively through the metadata cache, with a
//! visited set so mutually dependent synthetics report unresolved instead
//! of recursing forever. Dependency resolution is always checked before a
//! combinator runs, so consumers see `UnresolvedDependency` rather than a
//! raw lookup failure.

mod arithmetic;
mod notification;
mod transform;

pub use arithmetic::{ArithmeticOp, ArithmeticSynthetic};
pub use notification::NotificationSynthetic;
pub use transform::{SingleResourceTransformation, TEMPLATE_SLOT};

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::locator::{OwnerId, ResourceKind, ResourceLocator};
use crate::metadata::MetadataCache;
use crate::retriever::ValueRetriever;
use crate::schema::ResourceSchemaEntry;

/// Closed set of synthetic resource kinds.
#[derive(Debug, Clone)]
pub enum SyntheticKind {
    Arithmetic(ArithmeticSynthetic),
    Notification(Arc<NotificationSynthetic>),
    Transformation(SingleResourceTransformation),
}

impl SyntheticKind {
    pub fn locator(&self) -> &ResourceLocator {
        match self {
            SyntheticKind::Arithmetic(synthetic) => synthetic.locator(),
            SyntheticKind::Notification(synthetic) => synthetic.locator(),
            SyntheticKind::Transformation(synthetic) => synthetic.locator(),
        }
    }

    /// Locators this synthetic reads or listens to.
    pub fn dependent_locators(&self) -> Vec<ResourceLocator> {
        match self {
            SyntheticKind::Arithmetic(synthetic) => synthetic.dependent_locators(),
            SyntheticKind::Notification(synthetic) => synthetic.sources().to_vec(),
            SyntheticKind::Transformation(synthetic) => synthetic.dependent_locators(),
        }
    }
}

#[derive(Debug, Clone)]
struct RegisteredSynthetic {
    kind: SyntheticKind,
    registered_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct SyntheticRegistry {
    entries: RwLock<HashMap<ResourceLocator, RegisteredSynthetic>>,
}

impl SyntheticRegistry {
    pub fn new() -> Self {
        SyntheticRegistry {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a synthetic under its own locator; re-registration
    /// replaces the previous definition. Attribute-like synthetics must
    /// use Transformation locators, notification synthetics Notification
    /// locators.
    pub fn register(&self, kind: SyntheticKind) -> EngineResult<()> {
        let locator = kind.locator().clone();
        let expected = match kind {
            SyntheticKind::Arithmetic(_) | SyntheticKind::Transformation(_) => {
                ResourceKind::Transformation
            }
            SyntheticKind::Notification(_) => ResourceKind::Notification,
        };
        if locator.kind() != expected {
            return Err(EngineError::MalformedLocator {
                input: locator.canonical_form().to_owned(),
                reason: format!("synthetic must register under a {} locator", expected),
            });
        }
        let entry = RegisteredSynthetic {
            kind,
            registered_at: Utc::now(),
        };
        let mut entries = self.entries.write().expect("synthetic registry poisoned");
        if entries.insert(locator.clone(), entry).is_some() {
            log::debug!("replaced synthetic registration for {}", locator);
        } else {
            log::debug!("registered synthetic {}", locator);
        }
        Ok(())
    }

    pub fn register_arithmetic(&self, synthetic: ArithmeticSynthetic) -> EngineResult<()> {
        self.register(SyntheticKind::Arithmetic(synthetic))
    }

    /// Registers a notification synthetic and returns the shared handle the
    /// notification plumbing feeds payloads through.
    pub fn register_notification(
        &self,
        synthetic: NotificationSynthetic,
    ) -> EngineResult<Arc<NotificationSynthetic>> {
        let shared = Arc::new(synthetic);
        self.register(SyntheticKind::Notification(shared.clone()))?;
        Ok(shared)
    }

    pub fn register_transformation(
        &self,
        synthetic: SingleResourceTransformation,
    ) -> EngineResult<()> {
        self.register(SyntheticKind::Transformation(synthetic))
    }

    pub fn unregister(&self, locator: &ResourceLocator) -> bool {
        let mut entries = self.entries.write().expect("synthetic registry poisoned");
        entries.remove(locator).is_some()
    }

    /// True when a synthetic is registered under this locator.
    pub fn provides(&self, locator: &ResourceLocator) -> bool {
        let entries = self.entries.read().expect("synthetic registry poisoned");
        entries.contains_key(locator)
    }

    pub fn registered_at(&self, locator: &ResourceLocator) -> Option<DateTime<Utc>> {
        let entries = self.entries.read().expect("synthetic registry poisoned");
        entries.get(locator).map(|entry| entry.registered_at)
    }

    pub fn locators_for_owner(&self, owner: &OwnerId) -> Vec<ResourceLocator> {
        let entries = self.entries.read().expect("synthetic registry poisoned");
        entries
            .keys()
            .filter(|locator| locator.owner() == owner)
            .cloned()
            .collect()
    }

    pub fn dependent_locators(&self, locator: &ResourceLocator) -> Vec<ResourceLocator> {
        let entries = self.entries.read().expect("synthetic registry poisoned");
        entries
            .get(locator)
            .map(|entry| entry.kind.dependent_locators())
            .unwrap_or_default()
    }

    /// Shared handle for a registered notification synthetic.
    pub fn notification_synthetic(
        &self,
        locator: &ResourceLocator,
    ) -> Option<Arc<NotificationSynthetic>> {
        let entries = self.entries.read().expect("synthetic registry poisoned");
        match entries.get(locator) {
            Some(RegisteredSynthetic {
                kind: SyntheticKind::Notification(synthetic),
                ..
            }) => Some(synthetic.clone()),
            _ => None,
        }
    }

    /// True iff every declared dependent locator currently resolves,
    /// following synthetic-on-synthetic dependencies recursively.
    pub fn has_resolved_dependencies(
        &self,
        locator: &ResourceLocator,
        cache: &MetadataCache,
    ) -> bool {
        let mut visiting = HashSet::new();
        self.resolved_inner(locator, cache, &mut visiting)
    }

    fn resolved_inner(
        &self,
        locator: &ResourceLocator,
        cache: &MetadataCache,
        visiting: &mut HashSet<ResourceLocator>,
    ) -> bool {
        if !visiting.insert(locator.clone()) {
            log::warn!("synthetic dependency cycle through {}", locator);
            return false;
        }
        let dependents = {
            let entries = self.entries.read().expect("synthetic registry poisoned");
            match entries.get(locator) {
                Some(entry) => entry.kind.dependent_locators(),
                None => return false,
            }
        };
        dependents.iter().all(|dependent| {
            if self.provides(dependent) {
                self.resolved_inner(dependent, cache, visiting)
            } else {
                cache.is_available(dependent)
            }
        })
    }

    /// Schema entry derived from the synthetic's own declaration, or for
    /// transformations from their dependent's cached entry.
    pub fn metadata_entry(
        &self,
        locator: &ResourceLocator,
        cache: &MetadataCache,
    ) -> Option<ResourceSchemaEntry> {
        let kind = {
            let entries = self.entries.read().expect("synthetic registry poisoned");
            entries.get(locator).map(|entry| entry.kind.clone())
        }?;
        match kind {
            SyntheticKind::Arithmetic(synthetic) => {
                let type_name = match synthetic.op() {
                    ArithmeticOp::Quotient { .. } => "double".to_owned(),
                    // Differences keep their operands' representation.
                    ArithmeticOp::Difference => cache
                        .schema_entry(synthetic.left())
                        .map(|entry| entry.type_name)
                        .unwrap_or_else(|| "number".to_owned()),
                };
                Some(ResourceSchemaEntry {
                    display_name: synthetic.display_name().to_owned(),
                    description: synthetic.description().to_owned(),
                    type_name,
                    is_composite: false,
                    readable: true,
                    writable: false,
                    raw: Value::Null,
                })
            }
            SyntheticKind::Notification(synthetic) => Some(ResourceSchemaEntry {
                display_name: synthetic.display_name().to_owned(),
                description: synthetic.description().to_owned(),
                type_name: "notification".to_owned(),
                is_composite: true,
                readable: true,
                writable: false,
                raw: Value::Null,
            }),
            SyntheticKind::Transformation(synthetic) => synthetic.metadata_entry(cache),
        }
    }

    /// Evaluates a synthetic's current value through the retriever.
    pub fn evaluate(
        &self,
        locator: &ResourceLocator,
        retriever: &ValueRetriever,
    ) -> EngineResult<Value> {
        let kind = {
            let entries = self.entries.read().expect("synthetic registry poisoned");
            entries.get(locator).map(|entry| entry.kind.clone())
        }
        .ok_or_else(|| EngineError::ResourceNotFound {
            locator: locator.clone(),
        })?;

        if !self.has_resolved_dependencies(locator, retriever.metadata()) {
            return Err(EngineError::UnresolvedDependency {
                locator: locator.clone(),
                missing: self.first_unresolved(locator, retriever.metadata()),
            });
        }

        match kind {
            SyntheticKind::Arithmetic(synthetic) => {
                let dependents = synthetic.dependent_locators();
                let values = retriever.read_many(&dependents);
                let left = dependent_value(&values, &dependents[0], locator)?;
                let right = dependent_value(&values, &dependents[1], locator)?;
                synthetic.combine(&left, &right)
            }
            SyntheticKind::Notification(synthetic) => {
                Ok(synthetic.last_value().unwrap_or(Value::Null))
            }
            SyntheticKind::Transformation(synthetic) => match synthetic.derived() {
                Some((minuend, subtrahend)) => {
                    let operands = [minuend.clone(), subtrahend.clone()];
                    let values = retriever.read_many(&operands);
                    let left = dependent_value(&values, minuend, locator)?;
                    let right = dependent_value(&values, subtrahend, locator)?;
                    arithmetic::difference_value(&left, &right)
                }
                None => retriever.read(synthetic.source()),
            },
        }
    }

    /// First dependent that does not currently resolve, for error causes.
    pub(crate) fn first_unresolved(
        &self,
        locator: &ResourceLocator,
        cache: &MetadataCache,
    ) -> ResourceLocator {
        self.dependent_locators(locator)
            .into_iter()
            .find(|dependent| {
                if self.provides(dependent) {
                    !self.has_resolved_dependencies(dependent, cache)
                } else {
                    !cache.is_available(dependent)
                }
            })
            .unwrap_or_else(|| locator.clone())
    }
}

fn dependent_value(
    values: &HashMap<ResourceLocator, EngineResult<Value>>,
    dependent: &ResourceLocator,
    synthetic: &ResourceLocator,
) -> EngineResult<Value> {
    match values.get(dependent) {
        Some(Ok(value)) => Ok(value.clone()),
        Some(Err(e)) => Err(e.clone()),
        None => Err(EngineError::UnresolvedDependency {
            locator: synthetic.clone(),
            missing: dependent.clone(),
        }),
    }
}
