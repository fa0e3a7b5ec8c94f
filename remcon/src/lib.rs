// Remcon Library
// Resource metadata and subscription engine for remote management endpoints

pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod local;
pub mod locator;
pub mod metadata;
pub mod policy;
pub mod retriever;
pub mod schema;
pub mod subscription;
pub mod synthetic;

// Re-export the connection facade and its collaborators so consumers can
// work from the crate root.
pub use config::EngineConfig;
pub use connection::ServerConnection;
pub use endpoint::{
    ManagementEndpoint, NotificationSink, NotificationToken, OwnerLifecycleSink, OwnerSchema,
};
pub use error::{EngineError, EngineResult};
pub use local::LocalEndpoint;
pub use locator::{OwnerId, ResourceKind, ResourceLocator};
pub use policy::UpdatePolicy;
pub use schema::{AttributeDescriptor, NotificationDescriptor, ResourceSchemaEntry};
pub use subscription::{
    SubscriptionHandle, SubscriptionService, ValueEvent, ValueListener, ValuePayload,
};
pub use synthetic::{ArithmeticSynthetic, NotificationSynthetic, SingleResourceTransformation};
