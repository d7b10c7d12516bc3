use super::schema::{FieldSpec, Schema};
use super::{Document, DocumentKind};
use crate::error::ValidationError;
use crate::permissions::{Action, ActionRule, OwnershipLevel, PermissionRules, UserId};
use indexmap::IndexMap;
use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::Arc;

/// Kind-specific capabilities supplied at construction: derivation and the
/// lifecycle callbacks run after the authority acknowledges a change.
///
/// Per-item callbacks fire once for each affected document. The
/// `*_descendants` callbacks fire once per batch on the parent of embedded
/// documents, after every per-item callback of that batch.
#[allow(unused_variables)]
pub trait DocumentBehavior: Send + Sync {
    fn prepare_derived(
        &self,
        subtype: Option<&str>,
        source: &Map<String, Value>,
        derived: &mut Map<String, Value>,
    ) {
    }

    fn on_create(&self, document: &Document, user_id: &UserId) {}

    fn on_update(&self, document: &Document, changes: &Map<String, Value>, user_id: &UserId) {}

    fn on_delete(&self, document: &Document, user_id: &UserId) {}

    fn on_create_descendants(
        &self,
        parent: &Document,
        field: &str,
        created: &[Document],
        user_id: &UserId,
    ) {
    }

    fn on_update_descendants(
        &self,
        parent: &Document,
        field: &str,
        updated: &[Document],
        user_id: &UserId,
    ) {
    }

    fn on_delete_descendants(
        &self,
        parent: &Document,
        field: &str,
        deleted: &[Document],
        user_id: &UserId,
    ) {
    }
}

pub struct DefaultBehavior;

impl DocumentBehavior for DefaultBehavior {}

#[derive(Clone, Debug, PartialEq)]
pub struct EmbeddedField {
    pub field: &'static str,
    pub kind: DocumentKind,
}

/// Everything that distinguishes one document kind from another.
pub struct DocumentDescriptor {
    kind: DocumentKind,
    schema: Schema,
    subtypes: Vec<&'static str>,
    embedded: Vec<EmbeddedField>,
    permissions: PermissionRules,
    behavior: Arc<dyn DocumentBehavior>,
    top_level: bool,
}

impl fmt::Debug for DocumentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentDescriptor")
            .field("kind", &self.kind)
            .field("subtypes", &self.subtypes)
            .field("embedded", &self.embedded)
            .field("top_level", &self.top_level)
            .finish()
    }
}

impl DocumentDescriptor {
    pub fn builder(kind: DocumentKind) -> DescriptorBuilder {
        DescriptorBuilder {
            kind,
            schema: Schema::document(),
            subtypes: Vec::new(),
            embedded: Vec::new(),
            permissions: PermissionRules::default(),
            behavior: Arc::new(DefaultBehavior),
            top_level: true,
        }
    }

    pub fn kind(&self) -> &DocumentKind {
        &self.kind
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn subtypes(&self) -> &[&'static str] {
        &self.subtypes
    }

    pub fn embedded(&self) -> &[EmbeddedField] {
        &self.embedded
    }

    pub fn permissions(&self) -> &PermissionRules {
        &self.permissions
    }

    pub fn behavior(&self) -> &Arc<dyn DocumentBehavior> {
        &self.behavior
    }

    /// Whether documents of this kind live in a world collection.
    pub fn is_top_level(&self) -> bool {
        self.top_level
    }

    pub fn embedded_field(&self, kind: &DocumentKind) -> Option<&EmbeddedField> {
        self.embedded.iter().find(|e| &e.kind == kind)
    }

    /// Subtypes are either configured names or module-namespaced `module.name`.
    pub fn validate_subtype(&self, subtype: Option<&str>) -> Result<(), ValidationError> {
        if self.subtypes.is_empty() {
            return Ok(());
        }
        match subtype {
            None => Err(ValidationError::new("type", "may not be undefined")),
            Some(t) if self.subtypes.iter().any(|s| *s == t) || is_module_subtype(t) => Ok(()),
            Some(t) => Err(ValidationError::new(
                "type",
                format!("{t} is not a valid type for the {} document", self.kind),
            )),
        }
    }
}

fn is_module_subtype(subtype: &str) -> bool {
    matches!(
        subtype.split_once('.'),
        Some((module, name)) if !module.is_empty() && !name.is_empty()
    )
}

pub struct DescriptorBuilder {
    kind: DocumentKind,
    schema: Schema,
    subtypes: Vec<&'static str>,
    embedded: Vec<EmbeddedField>,
    permissions: PermissionRules,
    behavior: Arc<dyn DocumentBehavior>,
    top_level: bool,
}

impl DescriptorBuilder {
    pub fn field(mut self, spec: FieldSpec) -> Self {
        self.schema = self.schema.field(spec);
        self
    }

    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    pub fn subtypes(mut self, subtypes: impl IntoIterator<Item = &'static str>) -> Self {
        self.subtypes = subtypes.into_iter().collect();
        self
    }

    pub fn embed(mut self, field: &'static str, kind: DocumentKind) -> Self {
        self.embedded.push(EmbeddedField { field, kind });
        self
    }

    pub fn permission(mut self, action: Action, rule: ActionRule) -> Self {
        self.permissions.set(action, rule);
        self
    }

    pub fn behavior(mut self, behavior: Arc<dyn DocumentBehavior>) -> Self {
        self.behavior = behavior;
        self
    }

    /// Documents of this kind only exist inside a parent. Their ownership
    /// defaults to `INHERIT` and creating one requires owning the parent.
    pub fn embedded_only(mut self) -> Self {
        self.top_level = false;
        self.schema = self
            .schema
            .field(
                FieldSpec::object("ownership").default(json!({"default": OwnershipLevel::Inherit})),
            );
        self.permissions
            .set(Action::Create, ActionRule::Level(OwnershipLevel::Owner));
        self
    }

    pub fn build(self) -> Arc<DocumentDescriptor> {
        let mut schema = self.schema;
        if !self.subtypes.is_empty() && !schema.contains("type") {
            schema = schema.field(FieldSpec::string("type").required());
        }
        for embedded in &self.embedded {
            if !schema.contains(embedded.field) {
                schema = schema.field(FieldSpec::embedded(embedded.field, embedded.kind.clone()));
            }
        }
        Arc::new(DocumentDescriptor {
            kind: self.kind,
            schema,
            subtypes: self.subtypes,
            embedded: self.embedded,
            permissions: self.permissions,
            behavior: self.behavior,
            top_level: self.top_level,
        })
    }
}

/// The set of document kinds known to a registry or an authority.
#[derive(Clone, Debug, Default)]
pub struct DocumentTypes {
    descriptors: IndexMap<DocumentKind, Arc<DocumentDescriptor>>,
}

impl DocumentTypes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: Arc<DocumentDescriptor>) {
        self.descriptors.insert(descriptor.kind().clone(), descriptor);
    }

    pub fn with(mut self, descriptor: Arc<DocumentDescriptor>) -> Self {
        self.register(descriptor);
        self
    }

    pub fn get(&self, kind: &DocumentKind) -> Option<&Arc<DocumentDescriptor>> {
        self.descriptors.get(kind)
    }

    pub fn require(
        &self,
        kind: &DocumentKind,
    ) -> Result<&Arc<DocumentDescriptor>, ValidationError> {
        self.get(kind)
            .ok_or_else(|| {
                ValidationError::new("documentKind", format!("{kind} is not a registered kind"))
            })
    }

    pub fn top_level(&self) -> impl Iterator<Item = &Arc<DocumentDescriptor>> {
        self.descriptors.values().filter(|d| d.is_top_level())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<DocumentDescriptor>> {
        self.descriptors.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_adds_type_and_embedded_fields() {
        let descriptor = DocumentDescriptor::builder(DocumentKind::ACTOR)
            .field(FieldSpec::string("name").required())
            .subtypes(["character", "npc"])
            .embed("items", DocumentKind::ITEM)
            .build();
        assert!(descriptor.schema().contains("type"));
        assert!(descriptor.schema().contains("items"));
        assert_eq!(
            descriptor.embedded_field(&DocumentKind::ITEM).map(|e| e.field),
            Some("items")
        );
    }

    #[test]
    fn subtypes_accept_module_namespaces() {
        let descriptor = DocumentDescriptor::builder(DocumentKind::ITEM)
            .subtypes(["weapon"])
            .build();
        assert!(descriptor.validate_subtype(Some("weapon")).is_ok());
        assert!(descriptor.validate_subtype(Some("my-module.relic")).is_ok());
        assert!(descriptor.validate_subtype(Some("relic")).is_err());
        assert!(descriptor.validate_subtype(Some(".relic")).is_err());
        assert!(descriptor.validate_subtype(None).is_err());
    }
}
