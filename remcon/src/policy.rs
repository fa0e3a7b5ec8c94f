//! Polling cadence rules and the per-connection policy store.
//!
//! `Default` aligns ticks to multiples of the shared global interval so
//! subscriptions update in lockstep and share batched reads; `Simple` does
//! the same with a custom interval; `OneShot` fires once. Policies persist
//! as strings (`default`, `simple:<ms>`, `oneshot`) on locator metadata.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{EngineError, EngineResult};
use crate::locator::ResourceLocator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdatePolicy {
    /// Tick at the connection-wide default interval.
    Default,
    /// Tick at a custom interval, aligned the same way.
    Simple { interval_ms: u64 },
    /// Fire exactly once, then never reschedule.
    OneShot,
}

impl UpdatePolicy {
    /// A `Simple` policy; the interval must be positive.
    pub fn simple(interval_ms: u64) -> EngineResult<Self> {
        if interval_ms == 0 {
            return Err(EngineError::MalformedPolicy(
                "simple interval must be positive".to_string(),
            ));
        }
        Ok(UpdatePolicy::Simple { interval_ms })
    }

    /// The persisted string form.
    pub fn canonical_form(&self) -> String {
        match self {
            UpdatePolicy::Default => "default".to_string(),
            UpdatePolicy::Simple { interval_ms } => format!("simple:{}", interval_ms),
            UpdatePolicy::OneShot => "oneshot".to_string(),
        }
    }

    pub fn parse(text: &str) -> EngineResult<Self> {
        let normalized = text.trim().to_ascii_lowercase();
        if normalized == "default" {
            return Ok(UpdatePolicy::Default);
        }
        if normalized == "oneshot" {
            return Ok(UpdatePolicy::OneShot);
        }
        if let Some(interval_text) = normalized.strip_prefix("simple:") {
            let interval_ms: u64 = interval_text
                .parse()
                .map_err(|_| EngineError::MalformedPolicy(text.to_string()))?;
            return UpdatePolicy::simple(interval_ms)
                .map_err(|_| EngineError::MalformedPolicy(text.to_string()));
        }
        Err(EngineError::MalformedPolicy(text.to_string()))
    }

    /// Next due tick given the last dispatched tick. A subscription that
    /// never ticked is due immediately; a OneShot that has ticked is never
    /// due again. Alignment: `next = last - (last mod interval) + interval`.
    pub fn next_tick(&self, last_tick: Option<u64>, default_interval_ms: u64) -> Option<u64> {
        let last = match last_tick {
            None => return Some(0),
            Some(last) => last,
        };
        match self {
            UpdatePolicy::Default => Some(align(last, default_interval_ms)),
            UpdatePolicy::Simple { interval_ms } => Some(align(last, *interval_ms)),
            UpdatePolicy::OneShot => None,
        }
    }

    /// The polling interval this policy effectively requests. OneShot maps
    /// to the default interval (it bounds how soon the single shot lands).
    pub fn interval_ms(&self, default_interval_ms: u64) -> u64 {
        match self {
            UpdatePolicy::Simple { interval_ms } => *interval_ms,
            UpdatePolicy::Default | UpdatePolicy::OneShot => default_interval_ms,
        }
    }
}

fn align(last: u64, interval_ms: u64) -> u64 {
    let interval = interval_ms.max(1);
    (last - last % interval).saturating_add(interval)
}

impl fmt::Display for UpdatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_form())
    }
}

impl FromStr for UpdatePolicy {
    type Err = EngineError;

    fn from_str(s: &str) -> EngineResult<Self> {
        UpdatePolicy::parse(s)
    }
}

impl Serialize for UpdatePolicy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.canonical_form())
    }
}

impl<'de> Deserialize<'de> for UpdatePolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PolicyVisitor;

        impl<'de> Visitor<'de> for PolicyVisitor {
            type Value = UpdatePolicy;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an update policy string")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                UpdatePolicy::parse(value).map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_str(PolicyVisitor)
    }
}

/// Per-connection policy map with string get/set for the surrounding
/// persistence layer. Live subscriptions consult the store at every poll,
/// so a change takes effect without tearing the subscription down.
pub struct PolicyStore {
    default_interval_ms: u64,
    policies: RwLock<HashMap<ResourceLocator, UpdatePolicy>>,
}

impl PolicyStore {
    pub fn new(default_interval_ms: u64) -> Self {
        PolicyStore {
            default_interval_ms,
            policies: RwLock::new(HashMap::new()),
        }
    }

    pub fn default_interval_ms(&self) -> u64 {
        self.default_interval_ms
    }

    /// The stored policy, falling back to `Default`.
    pub fn get(&self, locator: &ResourceLocator) -> UpdatePolicy {
        let policies = self.policies.read().expect("policy store poisoned");
        policies.get(locator).copied().unwrap_or(UpdatePolicy::Default)
    }

    pub fn set(&self, locator: &ResourceLocator, policy: UpdatePolicy) {
        let mut policies = self.policies.write().expect("policy store poisoned");
        policies.insert(locator.clone(), policy);
    }

    pub fn policy_string(&self, locator: &ResourceLocator) -> String {
        self.get(locator).canonical_form()
    }

    pub fn set_from_string(&self, locator: &ResourceLocator, text: &str) -> EngineResult<()> {
        self.set(locator, UpdatePolicy::parse(text)?);
        Ok(())
    }

    pub fn next_tick(&self, locator: &ResourceLocator, last_tick: Option<u64>) -> Option<u64> {
        self.get(locator).next_tick(last_tick, self.default_interval_ms)
    }

    /// Interval the locator's current policy requests.
    pub fn effective_interval(&self, locator: &ResourceLocator) -> u64 {
        self.get(locator).interval_ms(self.default_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn uptime() -> ResourceLocator {
        ResourceLocator::attribute("app:type=Runtime", "Uptime").unwrap()
    }

    #[test]
    fn default_policy_aligns_to_interval_multiples() {
        let policy = UpdatePolicy::Default;
        assert_eq!(policy.next_tick(Some(1999), 1000), Some(2000));
        assert_eq!(policy.next_tick(Some(2000), 1000), Some(3000));
        assert_eq!(policy.next_tick(None, 1000), Some(0));
    }

    #[test]
    fn aligned_subscriptions_tick_in_lockstep() {
        // Two subscriptions last dispatched at different offsets inside the
        // same interval window land on the same next tick.
        let policy = UpdatePolicy::Default;
        assert_eq!(
            policy.next_tick(Some(5001), 1000),
            policy.next_tick(Some(5999), 1000)
        );
    }

    #[test]
    fn simple_uses_its_own_interval() {
        let policy = UpdatePolicy::simple(250).unwrap();
        assert_eq!(policy.next_tick(Some(1999), 1000), Some(2000));
        assert_eq!(policy.next_tick(Some(2010), 1000), Some(2250));
        assert!(UpdatePolicy::simple(0).is_err());
    }

    #[test]
    fn oneshot_never_reschedules() {
        let policy = UpdatePolicy::OneShot;
        assert_eq!(policy.next_tick(None, 1000), Some(0));
        assert_eq!(policy.next_tick(Some(0), 1000), None);
        assert_eq!(policy.next_tick(Some(5000), 1000), None);
    }

    #[test]
    fn string_form_round_trips() {
        for policy in [
            UpdatePolicy::Default,
            UpdatePolicy::simple(2000).unwrap(),
            UpdatePolicy::OneShot,
        ] {
            assert_eq!(UpdatePolicy::parse(&policy.canonical_form()).unwrap(), policy);
        }
        assert_eq!(
            UpdatePolicy::parse("Simple:125").unwrap(),
            UpdatePolicy::Simple { interval_ms: 125 }
        );
        assert!(UpdatePolicy::parse("simple:0").is_err());
        assert!(UpdatePolicy::parse("simple:x").is_err());
        assert!(UpdatePolicy::parse("eager").is_err());
    }

    #[test]
    fn serde_uses_the_string_form() {
        let json = serde_json::to_string(&UpdatePolicy::simple(125).unwrap()).unwrap();
        assert_eq!(json, "\"simple:125\"");
        let back: UpdatePolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, UpdatePolicy::Simple { interval_ms: 125 });
    }

    #[test]
    fn store_falls_back_to_default_and_applies_changes() {
        let store = PolicyStore::new(1000);
        let locator = uptime();
        assert_eq!(store.get(&locator), UpdatePolicy::Default);
        assert_eq!(store.effective_interval(&locator), 1000);
        assert_eq!(store.next_tick(&locator, Some(1999)), Some(2000));

        store.set_from_string(&locator, "simple:100").unwrap();
        assert_eq!(store.policy_string(&locator), "simple:100");
        assert_eq!(store.effective_interval(&locator), 100);
        assert_eq!(store.next_tick(&locator, Some(1999)), Some(2000));
        assert_eq!(store.next_tick(&locator, Some(2000)), Some(2100));
    }
}
