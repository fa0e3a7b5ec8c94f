//! Remote management endpoint contract.
//!
//! The engine consumes this trait; implementations live elsewhere (or see
//! `LocalEndpoint` for the in-process one). Every operation is synchronous
//! and may block for a network round trip. Notification deliveries and owner
//! lifecycle events arrive asynchronously on the endpoint's dispatcher
//! thread through the sink traits.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineResult;
use crate::locator::OwnerId;
use crate::schema::{AttributeDescriptor, NotificationDescriptor};

/// Schema reported by one owner: its declared attributes and notifications.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OwnerSchema {
    pub attributes: Vec<AttributeDescriptor>,
    pub notifications: Vec<NotificationDescriptor>,
}

/// Receives asynchronous notification deliveries.
pub trait NotificationSink: Send + Sync {
    fn notification(&self, owner: &OwnerId, name: &str, payload: Value, timestamp_ms: u64);
}

/// Receives owner registered/unregistered events.
pub trait OwnerLifecycleSink: Send + Sync {
    fn owner_registered(&self, owner: &OwnerId);
    fn owner_unregistered(&self, owner: &OwnerId);
}

/// Identifies one notification subscription held on an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotificationToken(pub u64);

/// Synchronous contract to the remote runtime.
///
/// Implementations translate their transport failures into the engine
/// taxonomy: `TransientFailure` for I/O, `StaleOwner` for unknown owners,
/// `SchemaNotFound` for undeclared resources.
pub trait ManagementEndpoint: Send + Sync {
    /// Queries the owner's declared resources. One call per introspection.
    fn schema(&self, owner: &OwnerId) -> EngineResult<OwnerSchema>;

    /// Reads one base attribute value.
    fn value(&self, owner: &OwnerId, name: &str) -> EngineResult<Value>;

    /// Batched read. Returns the subset of `names` it could fetch; a name
    /// the owner does not offer is omitted rather than failing the batch.
    fn values(&self, owner: &OwnerId, names: &[String]) -> EngineResult<HashMap<String, Value>>;

    /// Writes one base attribute value.
    fn set_value(&self, owner: &OwnerId, name: &str, value: Value) -> EngineResult<()>;

    /// Subscribes to a declared notification. Deliveries arrive on the
    /// endpoint's dispatcher thread.
    fn subscribe_notifications(
        &self,
        owner: &OwnerId,
        name: &str,
        sink: Arc<dyn NotificationSink>,
    ) -> EngineResult<NotificationToken>;

    /// Releases a notification subscription. Idempotent: releasing an
    /// already-released token is not an error.
    fn unsubscribe_notifications(&self, token: NotificationToken) -> EngineResult<()>;

    /// Registers a sink for owner lifecycle events.
    fn watch_owners(&self, sink: Arc<dyn OwnerLifecycleSink>);

    /// Currently registered owners.
    fn owners(&self) -> EngineResult<Vec<OwnerId>>;
}
