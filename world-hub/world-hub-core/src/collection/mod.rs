//! Id-indexed, insertion-ordered containers of documents.

mod embedded;

pub use embedded::EmbeddedCollection;

use crate::document::{Document, DocumentId, DocumentKind};
use indexmap::IndexMap;

/// The world collection for one top-level kind.
#[derive(Clone, Debug)]
pub struct Collection {
    kind: DocumentKind,
    docs: IndexMap<DocumentId, Document>,
}

impl Collection {
    pub fn new(kind: DocumentKind) -> Self {
        Self {
            kind,
            docs: IndexMap::new(),
        }
    }

    pub fn kind(&self) -> &DocumentKind {
        &self.kind
    }

    pub fn get(&self, id: &str) -> Option<&Document> {
        self.docs.get(id)
    }

    /// First document whose display name matches.
    pub fn get_name(&self, name: &str) -> Option<&Document> {
        self.docs.values().find(|d| d.name() == Some(name))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.docs.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Document> {
        self.docs.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &DocumentId> {
        self.docs.keys()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Insert or replace. Documents without an id are never stored.
    pub(crate) fn set(&mut self, document: Document) -> bool {
        let Some(id) = document.document_id() else {
            return false;
        };
        self.docs.insert(id, document);
        true
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut Document> {
        self.docs.get_mut(id)
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<Document> {
        self.docs.shift_remove(id)
    }
}

impl<'a> IntoIterator for &'a Collection {
    type Item = &'a Document;
    type IntoIter = indexmap::map::Values<'a, DocumentId, Document>;

    fn into_iter(self) -> Self::IntoIter {
        self.docs.values()
    }
}
