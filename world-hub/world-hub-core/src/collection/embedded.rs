use crate::document::{Document, DocumentDescriptor, DocumentId, DocumentKind, ParentRef};
use indexmap::IndexMap;
use std::sync::Arc;

/// Index over one embedded field of one parent document.
///
/// The parent's `source[field]` array is the persisted form; this index is
/// kept in step with it by the owning [`Document`].
#[derive(Clone, Debug)]
pub struct EmbeddedCollection {
    field: String,
    descriptor: Arc<DocumentDescriptor>,
    parent: Option<ParentRef>,
    docs: IndexMap<DocumentId, Document>,
}

impl EmbeddedCollection {
    pub fn new(
        field: &str,
        descriptor: Arc<DocumentDescriptor>,
        parent: Option<ParentRef>,
    ) -> Self {
        Self {
            field: field.to_string(),
            descriptor,
            parent,
            docs: IndexMap::new(),
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn parent(&self) -> Option<&ParentRef> {
        self.parent.as_ref()
    }

    pub fn descriptor(&self) -> &Arc<DocumentDescriptor> {
        &self.descriptor
    }

    pub fn kind(&self) -> &DocumentKind {
        self.descriptor.kind()
    }

    pub fn get(&self, id: &str) -> Option<&Document> {
        self.docs.get(id)
    }

    pub fn get_name(&self, name: &str) -> Option<&Document> {
        self.docs.values().find(|d| d.name() == Some(name))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.docs.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Document> {
        self.docs.values()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Index a child, linking it to this collection's parent.
    pub(crate) fn set(&mut self, mut child: Document) -> bool {
        let Some(id) = child.document_id() else {
            return false;
        };
        if self.parent.is_some() {
            child.set_parent(self.parent.clone());
        }
        self.docs.insert(id, child);
        true
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut Document> {
        self.docs.get_mut(id)
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<Document> {
        self.docs.shift_remove(id)
    }

    /// Drop the parent link of this collection and every child.
    pub(crate) fn sever(&mut self) {
        self.parent = None;
        for child in self.docs.values_mut() {
            child.detach();
        }
    }
}
