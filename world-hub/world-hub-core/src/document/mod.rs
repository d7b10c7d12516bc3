//! Documents: the per-record state container shared by every document kind.
//!
//! A [`Document`] owns its persisted `source`, the `derived` view recomputed
//! from it, and one [`EmbeddedCollection`] per embedded field declared by its
//! [`DocumentDescriptor`]. Documents are only mutated by the CRUD pipeline in
//! [`crate::registry`] and by the [`crate::authority`].

mod descriptor;
pub mod diff;
mod flags;
mod schema;
pub mod standard;

pub use descriptor::{
    DefaultBehavior, DescriptorBuilder, DocumentBehavior, DocumentDescriptor, DocumentTypes,
    EmbeddedField,
};
pub use flags::{FlagScopes, CORE_SCOPE, WORLD_SCOPE};
pub use schema::{FieldSpec, FieldType, Schema};

pub(crate) use flags::flag_changes;

use crate::collection::EmbeddedCollection;
use crate::permissions::{Ownership, UserId};
use indexmap::IndexMap;
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::{Borrow, Cow};
use std::fmt;
use std::sync::Arc;

pub const ID_LENGTH: usize = 16;

/// Name of a document kind (`Actor`, `Item`, ...). Kinds are data, not types.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentKind(Cow<'static, str>);

impl DocumentKind {
    pub const ACTOR: Self = Self::from_static("Actor");
    pub const ITEM: Self = Self::from_static("Item");
    pub const ACTIVE_EFFECT: Self = Self::from_static("ActiveEffect");
    pub const SCENE: Self = Self::from_static("Scene");
    pub const TOKEN: Self = Self::from_static("Token");
    pub const WALL: Self = Self::from_static("Wall");
    pub const REGION: Self = Self::from_static("Region");
    pub const CHAT_MESSAGE: Self = Self::from_static("ChatMessage");
    pub const COMBAT: Self = Self::from_static("Combat");
    pub const COMBATANT: Self = Self::from_static("Combatant");
    pub const PLAYLIST: Self = Self::from_static("Playlist");
    pub const PLAYLIST_SOUND: Self = Self::from_static("PlaylistSound");
    pub const FOLDER: Self = Self::from_static("Folder");
    pub const JOURNAL_ENTRY: Self = Self::from_static("JournalEntry");

    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque identifier assigned by the authority when a document is first stored.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn generate() -> Self {
        Self::generate_with_length(ID_LENGTH)
    }

    pub fn generate_with_length(length: usize) -> Self {
        let id = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(length)
            .map(char::from)
            .collect();
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&DocumentId> for DocumentId {
    fn from(id: &DocumentId) -> Self {
        id.clone()
    }
}

impl Borrow<str> for DocumentId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for DocumentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentState {
    /// Constructed locally, no id yet.
    Pending,
    /// Mirrors an authoritative record.
    Stored,
    /// Terminal. Any further operation fails with `NotFound`.
    Deleted,
}

/// Non-owning link from an embedded document to its parent.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParentRef {
    pub kind: DocumentKind,
    pub id: DocumentId,
    pub field: String,
}

/// Provenance maintained by the authority.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DocumentStats {
    pub created_time: Option<i64>,
    pub modified_time: Option<i64>,
    pub last_modified_by: Option<UserId>,
}

#[derive(Clone)]
pub struct Document {
    descriptor: Arc<DocumentDescriptor>,
    state: DocumentState,
    source: Map<String, Value>,
    derived: Map<String, Value>,
    parent: Option<ParentRef>,
    embedded: IndexMap<String, EmbeddedCollection>,
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("kind", self.kind())
            .field("id", &self.id())
            .field("state", &self.state)
            .field("parent", &self.parent)
            .field("source", &self.source)
            .finish()
    }
}

impl Document {
    pub(crate) fn build(
        descriptor: Arc<DocumentDescriptor>,
        types: &DocumentTypes,
        source: Map<String, Value>,
        state: DocumentState,
        parent: Option<ParentRef>,
    ) -> Self {
        let mut doc = Self {
            descriptor,
            state,
            source,
            derived: Map::new(),
            parent,
            embedded: IndexMap::new(),
        };
        doc.rebuild_embedded(types);
        doc.prepare();
        doc
    }

    fn rebuild_embedded(&mut self, types: &DocumentTypes) {
        self.embedded.clear();
        let descriptor = self.descriptor.clone();
        for field in descriptor.embedded() {
            let Some(child_descriptor) = types.get(&field.kind) else {
                tracing::warn!(kind = %field.kind, "embedded kind is not registered");
                continue;
            };
            let parent = self.id().map(|id| ParentRef {
                kind: self.kind().clone(),
                id: DocumentId::from(id),
                field: field.field.to_string(),
            });
            let mut collection =
                EmbeddedCollection::new(field.field, child_descriptor.clone(), parent.clone());
            if let Some(Value::Array(entries)) = self.source.get(field.field) {
                for entry in entries {
                    let Value::Object(child_source) = entry else { continue };
                    // Children without an id are not indexed until the authority assigns one.
                    if child_source.get("_id").and_then(Value::as_str).is_none() {
                        continue;
                    }
                    let child = Document::build(
                        child_descriptor.clone(),
                        types,
                        child_source.clone(),
                        self.state,
                        parent.clone(),
                    );
                    collection.set(child);
                }
            }
            self.embedded.insert(field.field.to_string(), collection);
        }
    }

    /// Recompute `derived` from `source`.
    fn prepare(&mut self) {
        let mut derived = self.source.clone();
        self.descriptor
            .behavior()
            .prepare_derived(self.subtype(), &self.source, &mut derived);
        self.derived = derived;
    }

    pub fn descriptor(&self) -> &Arc<DocumentDescriptor> {
        &self.descriptor
    }

    pub fn kind(&self) -> &DocumentKind {
        self.descriptor.kind()
    }

    pub fn state(&self) -> DocumentState {
        self.state
    }

    pub fn id(&self) -> Option<&str> {
        self.source.get("_id").and_then(Value::as_str)
    }

    pub fn document_id(&self) -> Option<DocumentId> {
        self.id().map(DocumentId::from)
    }

    pub fn name(&self) -> Option<&str> {
        self.source.get("name").and_then(Value::as_str)
    }

    pub fn subtype(&self) -> Option<&str> {
        self.source.get("type").and_then(Value::as_str)
    }

    pub fn source(&self) -> &Map<String, Value> {
        &self.source
    }

    pub fn derived(&self) -> &Map<String, Value> {
        &self.derived
    }

    /// Read a dotted path from the derived data.
    pub fn get(&self, path: &str) -> Option<&Value> {
        diff::get_property(&self.derived, path)
    }

    pub fn parent(&self) -> Option<&ParentRef> {
        self.parent.as_ref()
    }

    pub fn is_embedded(&self) -> bool {
        self.parent.is_some()
    }

    /// `Kind.id`, prefixed by the parent's address for embedded documents.
    pub fn uuid(&self) -> Option<String> {
        let id = self.id()?;
        Some(match &self.parent {
            Some(parent) => format!("{}.{}.{}.{}", parent.kind, parent.id, self.kind(), id),
            None => format!("{}.{}", self.kind(), id),
        })
    }

    pub fn flags(&self) -> Option<&Map<String, Value>> {
        self.source.get("flags").and_then(Value::as_object)
    }

    pub fn ownership(&self) -> Ownership {
        Ownership::from_value(self.source.get("ownership"))
    }

    pub fn stats(&self) -> DocumentStats {
        self.source
            .get("_stats")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    pub fn embedded(&self, field: &str) -> Option<&EmbeddedCollection> {
        self.embedded.get(field)
    }

    pub fn embedded_collections(&self) -> impl Iterator<Item = &EmbeddedCollection> {
        self.embedded.values()
    }

    pub fn to_object(&self) -> Value {
        Value::Object(self.source.clone())
    }

    pub(crate) fn set_parent(&mut self, parent: Option<ParentRef>) {
        self.parent = parent;
    }

    pub(crate) fn apply_diff(&mut self, diff: &Map<String, Value>) {
        diff::merge_object(&mut self.source, diff);
        self.prepare();
    }

    /// Mark deleted and sever the parent link of every embedded child.
    pub(crate) fn detach(&mut self) {
        self.state = DocumentState::Deleted;
        self.parent = None;
        for collection in self.embedded.values_mut() {
            collection.sever();
        }
    }

    pub(crate) fn insert_embedded(&mut self, field: &str, child: Document) -> bool {
        let Some(collection) = self.embedded.get_mut(field) else {
            return false;
        };
        let entries = self
            .source
            .entry(field.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if !entries.is_array() {
            *entries = Value::Array(Vec::new());
        }
        if let Value::Array(entries) = entries {
            if let Some(id) = child.id() {
                entries.retain(|e| e.get("_id").and_then(Value::as_str) != Some(id));
            }
            entries.push(Value::Object(child.source.clone()));
        }
        collection.set(child);
        self.prepare();
        true
    }

    pub(crate) fn update_embedded(
        &mut self,
        field: &str,
        id: &str,
        diff: &Map<String, Value>,
    ) -> Option<Document> {
        let child = self.embedded.get_mut(field)?.get_mut(id)?;
        child.apply_diff(diff);
        let updated = child.clone();
        if let Some(Value::Array(entries)) = self.source.get_mut(field) {
            for entry in entries.iter_mut() {
                if entry.get("_id").and_then(Value::as_str) == Some(id) {
                    *entry = Value::Object(updated.source.clone());
                }
            }
        }
        self.prepare();
        Some(updated)
    }

    pub(crate) fn remove_embedded(&mut self, field: &str, id: &str) -> Option<Document> {
        let mut child = self.embedded.get_mut(field)?.remove(id)?;
        if let Some(Value::Array(entries)) = self.source.get_mut(field) {
            entries.retain(|e| e.get("_id").and_then(Value::as_str) != Some(id));
        }
        child.detach();
        self.prepare();
        Some(child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn actor(types: &DocumentTypes, source: Value) -> Document {
        let Value::Object(source) = source else { unreachable!() };
        Document::build(
            types.get(&DocumentKind::ACTOR).unwrap().clone(),
            types,
            source,
            DocumentState::Stored,
            None,
        )
    }

    #[test]
    fn generated_ids_are_alphanumeric() {
        let id = DocumentId::generate();
        assert_eq!(id.as_str().len(), ID_LENGTH);
        assert!(id.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(id, DocumentId::generate());
    }

    #[test]
    fn kinds_compare_by_name() {
        assert_eq!(DocumentKind::new("Actor"), DocumentKind::ACTOR);
        assert_eq!(DocumentKind::ITEM.to_string(), "Item");
    }

    #[test]
    fn embedded_children_link_to_parent() {
        let types = DocumentTypes::standard();
        let doc = actor(
            &types,
            json!({
                "_id": "actor0000000001",
                "name": "Goblin",
                "type": "npc",
                "items": [{"_id": "item00000000001", "name": "Dagger", "type": "weapon"}],
            }),
        );
        let items = doc.embedded("items").unwrap();
        assert_eq!(items.len(), 1);
        let dagger = items.get("item00000000001").unwrap();
        assert_eq!(dagger.parent().unwrap().id.as_str(), "actor0000000001");
        assert_eq!(
            dagger.uuid().as_deref(),
            Some("Actor.actor0000000001.Item.item00000000001")
        );
    }

    #[test]
    fn embedded_mutations_keep_source_and_index_in_sync() {
        let types = DocumentTypes::standard();
        let mut doc = actor(
            &types,
            json!({"_id": "a1", "name": "Goblin", "type": "npc", "items": []}),
        );
        let item_descriptor = types.get(&DocumentKind::ITEM).unwrap().clone();
        let Value::Object(source) = json!({"_id": "i1", "name": "Dagger", "type": "weapon"}) else {
            unreachable!()
        };
        let child = Document::build(item_descriptor, &types, source, DocumentState::Stored, None);
        assert!(doc.insert_embedded("items", child));
        assert_eq!(doc.source()["items"].as_array().unwrap().len(), 1);

        let Value::Object(diff) = json!({"name": "Knife"}) else { unreachable!() };
        let updated = doc.update_embedded("items", "i1", &diff).unwrap();
        assert_eq!(updated.name(), Some("Knife"));
        assert_eq!(doc.source()["items"][0]["name"], "Knife");

        let removed = doc.remove_embedded("items", "i1").unwrap();
        assert!(removed.parent().is_none());
        assert_eq!(removed.state(), DocumentState::Deleted);
        assert!(doc.embedded("items").unwrap().is_empty());
        assert!(doc.source()["items"].as_array().unwrap().is_empty());
    }
}
