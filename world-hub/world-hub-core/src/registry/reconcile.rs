use super::{DocumentKey, Registry};
use crate::collection::Collection;
use crate::document::{Document, DocumentId, DocumentState, ParentRef};
use crate::error::{DocumentError, Result, TransportError};
use crate::hooks::{Hook, HookArgs, HookContext, HookEvent};
use crate::transport::{Operation, Response};
use serde_json::{Map, Value};

/// Documents touched by one acknowledged request, in result order.
struct Applied {
    items: Vec<(Document, Option<Map<String, Value>>)>,
    parent: Option<(Document, String)>,
}

fn protocol(reason: impl Into<String>) -> DocumentError {
    TransportError::Protocol(reason.into()).into()
}

fn source_of(value: &Value) -> Result<Map<String, Value>> {
    match value {
        Value::Object(map) if map.get("_id").and_then(Value::as_str).is_some() => Ok(map.clone()),
        other => Err(protocol(format!("expected a stored document, got {other}"))),
    }
}

fn diff_of(value: &Value) -> Result<(DocumentId, Map<String, Value>)> {
    let mut diff = source_of(value)?;
    match diff.remove("_id") {
        Some(Value::String(id)) => Ok((DocumentId::from(id), diff)),
        _ => Err(protocol("update result without an _id")),
    }
}

fn id_of(value: &Value) -> Result<DocumentId> {
    value
        .as_str()
        .map(DocumentId::from)
        .ok_or_else(|| protocol(format!("expected a document id, got {value}")))
}

impl Registry {
    /// Apply an acknowledged request to the local collections, then run the
    /// behaviour callbacks, on hooks and the render observer.
    pub(super) fn reconcile(&self, response: &Response) -> Result<Vec<Document>> {
        let request = &response.request;
        let applied = match (&request.parent, request.operation) {
            (None, Operation::Create) => self.apply_create(response)?,
            (None, Operation::Update) => self.apply_update(response)?,
            (None, Operation::Delete) => self.apply_delete(response)?,
            (Some(parent), operation) => self.apply_embedded(parent, operation, response)?,
        };
        self.notify(response, &applied);
        Ok(applied.items.into_iter().map(|(doc, _)| doc).collect())
    }

    fn apply_create(&self, response: &Response) -> Result<Applied> {
        let kind = &response.request.kind;
        let descriptor = self.inner.types.require(kind)?.clone();
        let created = response
            .result
            .iter()
            .map(|value| {
                let source = source_of(value)?;
                Ok(self.build(&descriptor, source, DocumentState::Stored, None))
            })
            .collect::<Result<Vec<_>>>()?;
        let mut collections = self.inner.collections.write();
        let collection = collections
            .entry(kind.clone())
            .or_insert_with(|| Collection::new(kind.clone()));
        for doc in &created {
            collection.set(doc.clone());
        }
        Ok(Applied {
            items: created.into_iter().map(|doc| (doc, None)).collect(),
            parent: None,
        })
    }

    fn apply_update(&self, response: &Response) -> Result<Applied> {
        let kind = &response.request.kind;
        let diffs = response.result.iter().map(diff_of).collect::<Result<Vec<_>>>()?;
        let mut collections = self.inner.collections.write();
        let mut items = Vec::with_capacity(diffs.len());
        for (id, diff) in diffs {
            let Some(doc) = collections.get_mut(kind).and_then(|c| c.get_mut(id.as_str())) else {
                tracing::debug!(%kind, %id, "update for a document not held locally");
                continue;
            };
            doc.apply_diff(&diff);
            items.push((doc.clone(), Some(diff)));
        }
        Ok(Applied { items, parent: None })
    }

    fn apply_delete(&self, response: &Response) -> Result<Applied> {
        let kind = &response.request.kind;
        let ids = response.result.iter().map(id_of).collect::<Result<Vec<_>>>()?;
        let mut released: Vec<DocumentKey> =
            ids.iter().map(|id| (kind.clone(), id.clone())).collect();
        let mut items = Vec::with_capacity(ids.len());
        {
            let mut collections = self.inner.collections.write();
            for id in &ids {
                let Some(mut doc) = collections
                    .get_mut(kind)
                    .and_then(|c| c.remove(id.as_str()))
                else {
                    continue;
                };
                for collection in doc.embedded_collections() {
                    released.extend(
                        collection
                            .iter()
                            .filter_map(|child| Some((child.kind().clone(), child.document_id()?))),
                    );
                }
                doc.detach();
                items.push((doc, None));
            }
        }
        self.release(released);
        Ok(Applied { items, parent: None })
    }

    fn apply_embedded(
        &self,
        parent_ref: &ParentRef,
        operation: Operation,
        response: &Response,
    ) -> Result<Applied> {
        let kind = &response.request.kind;
        let descriptor = self.inner.types.require(kind)?.clone();
        let field = parent_ref.field.as_str();

        let mut collections = self.inner.collections.write();
        let Some(parent) = collections
            .get_mut(&parent_ref.kind)
            .and_then(|c| c.get_mut(parent_ref.id.as_str()))
        else {
            return Err(DocumentError::not_found(&parent_ref.kind, &parent_ref.id));
        };

        let mut items = Vec::with_capacity(response.result.len());
        match operation {
            Operation::Create => {
                let children = response
                    .result
                    .iter()
                    .map(|value| {
                        let source = source_of(value)?;
                        let parent = Some(parent_ref.clone());
                        Ok(self.build(&descriptor, source, DocumentState::Stored, parent))
                    })
                    .collect::<Result<Vec<_>>>()?;
                for child in children {
                    if parent.insert_embedded(field, child.clone()) {
                        items.push((child, None));
                    }
                }
            }
            Operation::Update => {
                let diffs = response.result.iter().map(diff_of).collect::<Result<Vec<_>>>()?;
                for (id, diff) in diffs {
                    if let Some(child) = parent.update_embedded(field, id.as_str(), &diff) {
                        items.push((child, Some(diff)));
                    }
                }
            }
            Operation::Delete => {
                let ids = response.result.iter().map(id_of).collect::<Result<Vec<_>>>()?;
                for id in ids {
                    if let Some(child) = parent.remove_embedded(field, id.as_str()) {
                        items.push((child, None));
                    }
                }
            }
        }
        let parent = parent.clone();
        drop(collections);
        if operation == Operation::Delete {
            self.release(
                items
                    .iter()
                    .filter_map(|(child, _)| Some((kind.clone(), child.document_id()?))),
            );
        }
        Ok(Applied {
            items,
            parent: Some((parent, field.to_string())),
        })
    }

    /// Runs with no registry lock held.
    fn notify(&self, response: &Response, applied: &Applied) {
        let request = &response.request;
        let user_id = &response.user_id;
        let options = &request.options;
        let event = match request.operation {
            Operation::Create => HookEvent::Create,
            Operation::Update => HookEvent::Update,
            Operation::Delete => HookEvent::Delete,
        };
        let hook = Hook::Lifecycle(event, request.kind.clone());
        let observer = self.inner.observer.read().clone();
        let empty = Map::new();

        for (doc, changes) in &applied.items {
            let behavior = doc.descriptor().behavior();
            match request.operation {
                Operation::Create => behavior.on_create(doc, user_id),
                Operation::Update => {
                    behavior.on_update(doc, changes.as_ref().unwrap_or(&empty), user_id)
                }
                Operation::Delete => behavior.on_delete(doc, user_id),
            }
            if !options.no_hook {
                let args = HookArgs::Document(HookContext {
                    document: doc,
                    changes: changes.as_ref(),
                    options,
                    user_id,
                });
                self.inner.hooks.call_all(&hook, &args);
            }
            if let Some(observer) = &observer {
                observer.refresh(doc, request.operation);
                let mine = *user_id == self.inner.user.id;
                if request.operation == Operation::Create && options.render_sheet && mine {
                    observer.render_sheet(doc);
                }
            }
        }

        if let Some((parent, field)) = &applied.parent {
            let children: Vec<Document> =
                applied.items.iter().map(|(doc, _)| doc.clone()).collect();
            let behavior = parent.descriptor().behavior();
            match request.operation {
                Operation::Create => {
                    behavior.on_create_descendants(parent, field, &children, user_id)
                }
                Operation::Update => {
                    behavior.on_update_descendants(parent, field, &children, user_id)
                }
                Operation::Delete => {
                    behavior.on_delete_descendants(parent, field, &children, user_id)
                }
            }
            if let Some(observer) = &observer {
                observer.refresh(parent, Operation::Update);
            }
        }
    }
}
