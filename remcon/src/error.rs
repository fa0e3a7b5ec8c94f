//! Error taxonomy shared by the engine and the endpoint contract.
//!
//! Variants are cloneable so a failure cause can be embedded in the
//! unavailable marker of a value event.

use thiserror::Error;

use crate::locator::{OwnerId, ResourceLocator};

/// Errors produced by the engine and by endpoint implementations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// A canonical locator string (or owner id) failed to parse.
    #[error("malformed locator '{input}': {reason}")]
    MalformedLocator { input: String, reason: String },

    /// An update-policy string failed to parse.
    #[error("malformed update policy '{0}'")]
    MalformedPolicy(String),

    /// The owner does not declare the named resource. Surfaced, not retried.
    #[error("owner {owner} does not declare resource '{resource}'")]
    SchemaNotFound { owner: OwnerId, resource: String },

    /// A nested field did not resolve inside a composite value.
    #[error("no value at {locator}")]
    ResourceNotFound { locator: ResourceLocator },

    /// A round trip to the endpoint failed. The scheduler retries at the
    /// next tick; listeners see an unavailable event carrying this cause.
    #[error("connection failure: {0}")]
    TransientFailure(String),

    /// A synthetic resource was read while a dependent locator is missing.
    #[error("synthetic resource {locator} has unresolved dependency {missing}")]
    UnresolvedDependency {
        locator: ResourceLocator,
        missing: ResourceLocator,
    },

    /// The owner is not currently registered on the endpoint.
    #[error("owner {owner} is not registered")]
    StaleOwner { owner: OwnerId },

    /// Write rejected: nested locator or non-writable attribute.
    #[error("{locator} is not writable")]
    NotWritable { locator: ResourceLocator },

    /// Read rejected: the locator kind has no polled value.
    #[error("{locator} is not readable")]
    NotReadable { locator: ResourceLocator },

    /// An arithmetic combinator received operands it cannot combine.
    #[error("invalid operands: {0}")]
    InvalidOperands(String),

    /// Engine configuration failed to parse.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl EngineError {
    /// Helper for endpoint implementations translating transport failures.
    pub fn transient(details: impl Into<String>) -> Self {
        EngineError::TransientFailure(details.into())
    }

    pub(crate) fn malformed_locator(input: &str, reason: &str) -> Self {
        EngineError::MalformedLocator {
            input: input.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
