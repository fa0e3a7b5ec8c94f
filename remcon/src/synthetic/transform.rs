//! Metadata-forwarding transformation over a single dependent resource.

use crate::locator::ResourceLocator;
use crate::metadata::MetadataCache;
use crate::schema::ResourceSchemaEntry;

use serde_json::Value;

/// Placeholder replaced by the dependent's forwarded text.
pub const TEMPLATE_SLOT: &str = "{0}";

/// Forwards display name and description from exactly one dependent
/// locator through single-placeholder templates, optionally exposing a
/// derived subtraction value over two further locators it declares.
#[derive(Debug, Clone)]
pub struct SingleResourceTransformation {
    locator: ResourceLocator,
    source: ResourceLocator,
    display_template: String,
    description_template: String,
    derived: Option<(ResourceLocator, ResourceLocator)>,
}

impl SingleResourceTransformation {
    pub fn new(locator: ResourceLocator, source: ResourceLocator) -> Self {
        SingleResourceTransformation {
            locator,
            source,
            display_template: TEMPLATE_SLOT.to_owned(),
            description_template: TEMPLATE_SLOT.to_owned(),
            derived: None,
        }
    }

    pub fn with_display_template(mut self, template: impl Into<String>) -> Self {
        self.display_template = template.into();
        self
    }

    pub fn with_description_template(mut self, template: impl Into<String>) -> Self {
        self.description_template = template.into();
        self
    }

    /// Derived value `minuend - subtrahend`; both become dependents.
    pub fn with_difference(
        mut self,
        minuend: ResourceLocator,
        subtrahend: ResourceLocator,
    ) -> Self {
        self.derived = Some((minuend, subtrahend));
        self
    }

    pub fn locator(&self) -> &ResourceLocator {
        &self.locator
    }

    pub fn source(&self) -> &ResourceLocator {
        &self.source
    }

    pub(crate) fn derived(&self) -> Option<&(ResourceLocator, ResourceLocator)> {
        self.derived.as_ref()
    }

    pub(crate) fn dependent_locators(&self) -> Vec<ResourceLocator> {
        let mut dependents = vec![self.source.clone()];
        if let Some((minuend, subtrahend)) = &self.derived {
            dependents.push(minuend.clone());
            dependents.push(subtrahend.clone());
        }
        dependents
    }

    /// Entry with display name and description rendered from the source's
    /// entry. `None` while the source itself has no cached schema.
    pub(crate) fn metadata_entry(&self, cache: &MetadataCache) -> Option<ResourceSchemaEntry> {
        let source_entry = cache.schema_entry(&self.source)?;
        let type_name = match &self.derived {
            Some((minuend, _)) => cache
                .schema_entry(minuend)
                .map(|entry| entry.type_name)
                .unwrap_or_else(|| source_entry.type_name.clone()),
            None => source_entry.type_name.clone(),
        };
        Some(ResourceSchemaEntry {
            display_name: render_template(&self.display_template, &source_entry.display_name),
            description: render_template(&self.description_template, &source_entry.description),
            type_name,
            is_composite: false,
            readable: true,
            writable: false,
            raw: Value::Null,
        })
    }
}

fn render_template(template: &str, forwarded: &str) -> String {
    template.replace(TEMPLATE_SLOT, forwarded)
}
