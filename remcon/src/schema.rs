//! Schema data model.
//!
//! Endpoint-side descriptors (`AttributeDescriptor`, `NotificationDescriptor`,
//! optional static `StructureDescriptor`) and the cache-side
//! `ResourceSchemaEntry` stored per locator. Scalar type names for sampled
//! values are inferred from the JSON representation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Statically-declared structure of a composite value type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureDescriptor {
    pub fields: Vec<FieldDescriptor>,
}

impl StructureDescriptor {
    pub fn new(fields: Vec<FieldDescriptor>) -> Self {
        StructureDescriptor { fields }
    }

    /// Total number of declared fields, including nested structures.
    pub fn field_count_recursive(&self) -> usize {
        self.fields
            .iter()
            .map(|field| {
                1 + field
                    .structure
                    .as_ref()
                    .map(StructureDescriptor::field_count_recursive)
                    .unwrap_or(0)
            })
            .sum()
    }
}

/// One declared field of a composite value type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub description: String,
    pub type_name: String,
    /// Present when the field itself is a statically-declared composite.
    pub structure: Option<StructureDescriptor>,
}

impl FieldDescriptor {
    pub fn scalar(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        FieldDescriptor {
            name: name.into(),
            description: String::new(),
            type_name: type_name.into(),
            structure: None,
        }
    }

    pub fn composite(name: impl Into<String>, structure: StructureDescriptor) -> Self {
        FieldDescriptor {
            name: name.into(),
            description: String::new(),
            type_name: TYPE_COMPOSITE.to_string(),
            structure: Some(structure),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Declared attribute as reported by an endpoint schema query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDescriptor {
    pub name: String,
    pub description: String,
    pub type_name: String,
    /// True when the declared type denotes a composite structure.
    pub composite: bool,
    /// Statically-known structure; `None` for a composite means the field
    /// layout must be discovered from a live value.
    pub structure: Option<StructureDescriptor>,
    pub readable: bool,
    pub writable: bool,
    /// Opaque endpoint-specific descriptor payload.
    pub raw: Value,
}

impl AttributeDescriptor {
    pub fn scalar(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        AttributeDescriptor {
            name: name.into(),
            description: String::new(),
            type_name: type_name.into(),
            composite: false,
            structure: None,
            readable: true,
            writable: false,
            raw: Value::Null,
        }
    }

    /// A composite attribute whose field layout is declared statically.
    pub fn composite_static(name: impl Into<String>, structure: StructureDescriptor) -> Self {
        AttributeDescriptor {
            name: name.into(),
            description: String::new(),
            type_name: TYPE_COMPOSITE.to_string(),
            composite: true,
            structure: Some(structure),
            readable: true,
            writable: false,
            raw: Value::Null,
        }
    }

    /// A composite attribute whose field layout is only discoverable from a
    /// live value.
    pub fn composite_dynamic(name: impl Into<String>) -> Self {
        AttributeDescriptor {
            name: name.into(),
            description: String::new(),
            type_name: TYPE_COMPOSITE.to_string(),
            composite: true,
            structure: None,
            readable: true,
            writable: false,
            raw: Value::Null,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    pub fn with_raw(mut self, raw: Value) -> Self {
        self.raw = raw;
        self
    }
}

/// Declared notification as reported by an endpoint schema query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationDescriptor {
    pub name: String,
    pub description: String,
    pub type_name: String,
    pub raw: Value,
}

impl NotificationDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        NotificationDescriptor {
            name: name.into(),
            description: String::new(),
            type_name: "notification".to_string(),
            raw: Value::Null,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Cached per-locator metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSchemaEntry {
    pub display_name: String,
    pub description: String,
    pub type_name: String,
    pub is_composite: bool,
    pub readable: bool,
    pub writable: bool,
    /// Opaque endpoint-specific descriptor payload.
    pub raw: Value,
}

impl ResourceSchemaEntry {
    pub fn from_attribute(descriptor: &AttributeDescriptor) -> Self {
        ResourceSchemaEntry {
            display_name: descriptor.name.clone(),
            description: descriptor.description.clone(),
            type_name: descriptor.type_name.clone(),
            is_composite: descriptor.composite,
            readable: descriptor.readable,
            writable: descriptor.writable,
            raw: descriptor.raw.clone(),
        }
    }

    pub fn from_notification(descriptor: &NotificationDescriptor) -> Self {
        ResourceSchemaEntry {
            display_name: descriptor.name.clone(),
            description: descriptor.description.clone(),
            type_name: descriptor.type_name.clone(),
            is_composite: false,
            readable: false,
            writable: false,
            raw: descriptor.raw.clone(),
        }
    }

    /// Entry for a statically-declared nested field. Readable/writable are
    /// inherited from the base attribute.
    pub fn from_field(field: &FieldDescriptor, base: &ResourceSchemaEntry) -> Self {
        ResourceSchemaEntry {
            display_name: field.name.clone(),
            description: field.description.clone(),
            type_name: field.type_name.clone(),
            is_composite: field.structure.is_some(),
            readable: base.readable,
            writable: base.writable,
            raw: Value::Null,
        }
    }

    /// Entry for a field discovered from a sampled value. Readable/writable
    /// are inherited from the base attribute; the description is unknown.
    pub fn from_sample(name: &str, value: &Value, base: &ResourceSchemaEntry) -> Self {
        ResourceSchemaEntry {
            display_name: name.to_string(),
            description: String::new(),
            type_name: sampled_type_name(value).to_string(),
            is_composite: value.is_object(),
            readable: base.readable,
            writable: base.writable,
            raw: Value::Null,
        }
    }
}

pub(crate) const TYPE_COMPOSITE: &str = "composite";

/// Type name inferred from a sampled value's JSON representation.
pub fn sampled_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "double",
        Value::Number(_) => "long",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => TYPE_COMPOSITE,
    }
}
