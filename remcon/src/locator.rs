//! Canonical addressing for manageable resources.
//!
//! A locator names one attribute, notification, or transformation on a
//! remote owner: `ATTRIBUTE://app:type=Runtime/Uptime#elapsedMs`. The
//! canonical string is the equality/hash key and the persistence format;
//! nested-field segments after `#` address fields inside composite values.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{EngineError, EngineResult};

const KIND_SEPARATOR: &str = "://";
const PATH_SEPARATOR: char = '/';
const NESTED_DELIMITER: char = '#';

/// The addressable resource categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Attribute,
    Notification,
    Transformation,
}

impl ResourceKind {
    /// Upper-case name used in the canonical locator form.
    pub fn canonical_name(&self) -> &'static str {
        match self {
            ResourceKind::Attribute => "ATTRIBUTE",
            ResourceKind::Notification => "NOTIFICATION",
            ResourceKind::Transformation => "TRANSFORMATION",
        }
    }

    fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_uppercase().as_str() {
            "ATTRIBUTE" => Some(ResourceKind::Attribute),
            "NOTIFICATION" => Some(ResourceKind::Notification),
            "TRANSFORMATION" => Some(ResourceKind::Transformation),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.canonical_name())
    }
}

/// Identifier of the managed-resource container a locator belongs to,
/// e.g. `app:type=Runtime`.
///
/// Owners must contain a domain separator `:` and may not contain `/`,
/// which keeps the canonical locator form unambiguous to parse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> EngineResult<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(EngineError::malformed_locator(&id, "owner must not be empty"));
        }
        if id.contains(PATH_SEPARATOR) {
            return Err(EngineError::malformed_locator(
                &id,
                "owner must not contain '/'",
            ));
        }
        if !id.contains(':') {
            return Err(EngineError::malformed_locator(
                &id,
                "owner must contain a ':' domain separator",
            ));
        }
        Ok(OwnerId(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The portion before the first `:`.
    pub fn domain(&self) -> &str {
        self.0.split(':').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for OwnerId {
    type Err = EngineError;

    fn from_str(s: &str) -> EngineResult<Self> {
        OwnerId::new(s)
    }
}

/// Canonical address of a manageable resource. Immutable once constructed;
/// equality, hashing, and ordering follow the canonical string form.
#[derive(Debug, Clone)]
pub struct ResourceLocator {
    kind: ResourceKind,
    owner: OwnerId,
    data_path: String,
    canonical: String,
}

impl ResourceLocator {
    pub fn new(kind: ResourceKind, owner: OwnerId, data_path: impl Into<String>) -> EngineResult<Self> {
        let data_path = data_path.into();
        if data_path.is_empty() {
            return Err(EngineError::malformed_locator(
                &data_path,
                "data path must not be empty",
            ));
        }
        if data_path
            .split(NESTED_DELIMITER)
            .any(|segment| segment.is_empty())
        {
            return Err(EngineError::malformed_locator(
                &data_path,
                "data path must not contain empty nested segments",
            ));
        }
        Ok(Self::from_parts(kind, owner, data_path))
    }

    /// Shorthand for an attribute locator; parses the owner string.
    pub fn attribute(owner: &str, data_path: &str) -> EngineResult<Self> {
        Self::new(ResourceKind::Attribute, OwnerId::new(owner)?, data_path)
    }

    /// Shorthand for a notification locator; parses the owner string.
    pub fn notification(owner: &str, data_path: &str) -> EngineResult<Self> {
        Self::new(ResourceKind::Notification, OwnerId::new(owner)?, data_path)
    }

    /// Shorthand for a transformation locator; parses the owner string.
    pub fn transformation(owner: &str, data_path: &str) -> EngineResult<Self> {
        Self::new(ResourceKind::Transformation, OwnerId::new(owner)?, data_path)
    }

    /// Parses a canonical string such as
    /// `ATTRIBUTE://app:type=Runtime/Uptime#elapsedMs`.
    /// The kind prefix is matched case-insensitively.
    pub fn parse(canonical: &str) -> EngineResult<Self> {
        let (kind_text, rest) = canonical.split_once(KIND_SEPARATOR).ok_or_else(|| {
            EngineError::malformed_locator(canonical, "missing '://' kind separator")
        })?;
        let kind = ResourceKind::parse(kind_text).ok_or_else(|| {
            EngineError::malformed_locator(canonical, "unknown resource kind")
        })?;
        let (owner_text, data_path) = rest.split_once(PATH_SEPARATOR).ok_or_else(|| {
            EngineError::malformed_locator(canonical, "missing '/' between owner and data path")
        })?;
        Self::new(kind, OwnerId::new(owner_text)?, data_path)
    }

    // Components are already validated; rebuilds the canonical form only.
    fn from_parts(kind: ResourceKind, owner: OwnerId, data_path: String) -> Self {
        let canonical = format!(
            "{}{}{}{}{}",
            kind.canonical_name(),
            KIND_SEPARATOR,
            owner,
            PATH_SEPARATOR,
            data_path
        );
        ResourceLocator {
            kind,
            owner,
            data_path,
            canonical,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    pub fn data_path(&self) -> &str {
        &self.data_path
    }

    pub fn canonical_form(&self) -> &str {
        &self.canonical
    }

    /// The portion of the data path before the first nested-field delimiter.
    pub fn base_attribute_name(&self) -> &str {
        self.data_path
            .split(NESTED_DELIMITER)
            .next()
            .unwrap_or(&self.data_path)
    }

    /// True if the data path addresses a field inside a composite value.
    pub fn is_nested(&self) -> bool {
        self.data_path.contains(NESTED_DELIMITER)
    }

    /// Nested-field segments after the base attribute name, outermost first.
    pub fn nested_segments(&self) -> Vec<&str> {
        self.data_path.split(NESTED_DELIMITER).skip(1).collect()
    }

    /// Locator of the base attribute (same kind and owner, no nesting).
    pub fn base_locator(&self) -> Self {
        Self::from_parts(
            self.kind,
            self.owner.clone(),
            self.base_attribute_name().to_string(),
        )
    }

    /// The immediate ancestor, or `None` for a non-nested locator.
    pub fn parent(&self) -> Option<Self> {
        let (parent_path, _) = self.data_path.rsplit_once(NESTED_DELIMITER)?;
        Some(Self::from_parts(
            self.kind,
            self.owner.clone(),
            parent_path.to_string(),
        ))
    }

    /// Successive ancestors, nearest parent first, terminating at the
    /// non-nested base locator. Empty for a non-nested locator.
    pub fn parent_locators(&self) -> Vec<Self> {
        let mut ancestors = Vec::new();
        let mut current = self.parent();
        while let Some(ancestor) = current {
            current = ancestor.parent();
            ancestors.push(ancestor);
        }
        ancestors
    }

    /// Extends the data path by one nested-field segment.
    pub fn child(&self, segment: &str) -> EngineResult<Self> {
        Self::new(
            self.kind,
            self.owner.clone(),
            format!("{}{}{}", self.data_path, NESTED_DELIMITER, segment),
        )
    }

    /// True if `other` is nested directly under this locator.
    pub fn is_parent_of(&self, other: &ResourceLocator) -> bool {
        other.parent().as_ref() == Some(self)
    }
}

impl PartialEq for ResourceLocator {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for ResourceLocator {}

impl Hash for ResourceLocator {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl PartialOrd for ResourceLocator {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ResourceLocator {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical.cmp(&other.canonical)
    }
}

impl fmt::Display for ResourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl FromStr for ResourceLocator {
    type Err = EngineError;

    fn from_str(s: &str) -> EngineResult<Self> {
        ResourceLocator::parse(s)
    }
}

impl Serialize for ResourceLocator {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.canonical)
    }
}

impl<'de> Deserialize<'de> for ResourceLocator {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct LocatorVisitor;

        impl<'de> Visitor<'de> for LocatorVisitor {
            type Value = ResourceLocator;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a canonical resource locator string")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                ResourceLocator::parse(value).map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_str(LocatorVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn uptime_child() -> ResourceLocator {
        ResourceLocator::attribute("app:type=Runtime", "Uptime#elapsedMs").unwrap()
    }

    #[test]
    fn canonical_form_round_trips() {
        let locator = uptime_child();
        assert_eq!(
            locator.canonical_form(),
            "ATTRIBUTE://app:type=Runtime/Uptime#elapsedMs"
        );
        let reparsed = ResourceLocator::parse(locator.canonical_form()).unwrap();
        assert_eq!(reparsed, locator);
    }

    #[test]
    fn kind_prefix_parses_case_insensitively() {
        let locator = ResourceLocator::parse("attribute://app:type=Runtime/Uptime").unwrap();
        assert_eq!(locator.kind(), ResourceKind::Attribute);
        // Canonicalizes back to upper case.
        assert_eq!(
            locator.canonical_form(),
            "ATTRIBUTE://app:type=Runtime/Uptime"
        );
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(ResourceLocator::parse("app:type=Runtime/Uptime").is_err());
        assert!(ResourceLocator::parse("GAUGE://app:type=Runtime/Uptime").is_err());
        assert!(ResourceLocator::parse("ATTRIBUTE://app:type=Runtime").is_err());
        assert!(ResourceLocator::parse("ATTRIBUTE://app:type=Runtime/").is_err());
        assert!(ResourceLocator::parse("ATTRIBUTE://app:type=Runtime/Uptime##x").is_err());
        assert!(OwnerId::new("no-domain-separator").is_err());
        assert!(OwnerId::new("bad/owner:type=X").is_err());
        assert!(OwnerId::new("").is_err());
    }

    #[test]
    fn parents_terminate_at_the_base_attribute() {
        let deep = ResourceLocator::attribute("app:type=Mem", "Heap#usage#max").unwrap();
        let parents = deep.parent_locators();
        assert_eq!(parents.len(), 2);
        assert_eq!(parents[0].data_path(), "Heap#usage");
        assert_eq!(parents[1].data_path(), "Heap");
        assert!(!parents[1].is_nested());
        assert!(ResourceLocator::attribute("app:type=Mem", "Heap")
            .unwrap()
            .parent_locators()
            .is_empty());
    }

    #[test]
    fn base_attribute_and_base_locator() {
        let child = uptime_child();
        assert_eq!(child.base_attribute_name(), "Uptime");
        assert_eq!(
            child.base_locator(),
            ResourceLocator::attribute("app:type=Runtime", "Uptime").unwrap()
        );
        assert_eq!(child.nested_segments(), vec!["elapsedMs"]);
    }

    #[test]
    fn child_and_parent_relation() {
        let base = ResourceLocator::attribute("app:type=Runtime", "Uptime").unwrap();
        let child = base.child("elapsedMs").unwrap();
        assert_eq!(child, uptime_child());
        assert!(base.is_parent_of(&child));
        assert!(!child.is_parent_of(&base));
        assert_eq!(child.parent(), Some(base));
    }

    #[test]
    fn owner_accessors() {
        let owner = OwnerId::new("app:type=Runtime").unwrap();
        assert_eq!(owner.domain(), "app");
        assert_eq!(owner.as_str(), "app:type=Runtime");
    }

    #[test]
    fn serde_uses_the_canonical_string() {
        let locator = uptime_child();
        let json = serde_json::to_string(&locator).unwrap();
        assert_eq!(json, "\"ATTRIBUTE://app:type=Runtime/Uptime#elapsedMs\"");
        let back: ResourceLocator = serde_json::from_str(&json).unwrap();
        assert_eq!(back, locator);
        assert!(serde_json::from_str::<ResourceLocator>("\"nope\"").is_err());
    }

    #[test]
    fn ordering_follows_the_canonical_form() {
        let a = ResourceLocator::attribute("app:type=Runtime", "Uptime").unwrap();
        let n = ResourceLocator::notification("app:type=Runtime", "Uptime").unwrap();
        let t = ResourceLocator::transformation("app:type=Runtime", "Uptime").unwrap();
        let mut sorted = vec![t.clone(), n.clone(), a.clone()];
        sorted.sort();
        assert_eq!(sorted, vec![a, n, t]);
    }
}
