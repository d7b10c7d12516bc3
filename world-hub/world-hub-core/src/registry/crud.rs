use super::Registry;
use crate::document::diff::{changed_paths, diff_object, expand_object};
use crate::document::{flag_changes, Document, DocumentId, DocumentKind, DocumentState, ParentRef};
use crate::error::{DocumentError, Result, ValidationError};
use crate::hooks::Hook;
use crate::permissions::Action;
use crate::transport::{Operation, OperationOptions, Request};
use serde_json::{Map, Value};

fn changes_of(data: Value) -> Result<(DocumentId, Map<String, Value>)> {
    let Value::Object(data) = data else {
        return Err(ValidationError::new("data", "must be an object").into());
    };
    let mut changes = expand_object(data);
    match changes.remove("_id") {
        Some(Value::String(id)) if !id.is_empty() => Ok((DocumentId::from(id), changes)),
        _ => Err(ValidationError::new("_id", "may not be undefined").into()),
    }
}

fn with_id(id: &DocumentId, mut diff: Map<String, Value>) -> Value {
    diff.insert("_id".to_string(), Value::String(id.to_string()));
    Value::Object(diff)
}

impl Registry {
    /// Create top-level documents. Vetoed candidates are dropped; temporary
    /// documents come back `Pending` and are never stored.
    pub async fn create(
        &self,
        kind: &DocumentKind,
        data: Vec<Value>,
        options: OperationOptions,
    ) -> Result<Vec<Document>> {
        let descriptor = self.top_level_descriptor(kind)?;
        let mut candidates = Vec::with_capacity(data.len());
        for entry in data {
            let source = self.prepare_candidate(&descriptor, entry, &options, true)?;
            let candidate = self.build(&descriptor, source, DocumentState::Pending, None);
            self.authorize(Action::Create, &candidate, None, Some(candidate.source()))?;
            candidates.push(candidate);
        }
        self.submit_creates(kind, None, candidates, options).await
    }

    pub async fn create_document(
        &self,
        kind: &DocumentKind,
        data: Value,
        options: OperationOptions,
    ) -> Result<Option<Document>> {
        Ok(self.create(kind, vec![data], options).await?.into_iter().next())
    }

    /// Create documents inside `parent`'s field for `kind`, as one request.
    pub async fn create_embedded(
        &self,
        parent: &Document,
        kind: &DocumentKind,
        data: Vec<Value>,
        options: OperationOptions,
    ) -> Result<Vec<Document>> {
        let parent_ref = self.embedded_target(parent, kind)?;
        let parent = self.resolve_parent(&parent_ref)?;
        let descriptor = self.inner.types.require(kind)?.clone();
        let mut candidates = Vec::with_capacity(data.len());
        for entry in data {
            let source = self.prepare_candidate(&descriptor, entry, &options, false)?;
            let candidate =
                self.build(&descriptor, source, DocumentState::Pending, Some(parent_ref.clone()));
            self.authorize(Action::Create, &candidate, Some(&parent), Some(candidate.source()))?;
            candidates.push(candidate);
        }
        self.submit_creates(kind, Some(parent_ref), candidates, options).await
    }

    async fn submit_creates(
        &self,
        kind: &DocumentKind,
        parent: Option<ParentRef>,
        candidates: Vec<Document>,
        options: OperationOptions,
    ) -> Result<Vec<Document>> {
        let mut accepted = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let hook = Hook::pre_create(kind.clone());
            if self.pre_hook(hook, &candidate, Some(candidate.source()), &options)? {
                accepted.push(candidate);
            }
        }
        if accepted.is_empty() || options.temporary {
            return Ok(accepted);
        }
        let data = accepted.iter().map(Document::to_object).collect();
        let request = Request::new(Operation::Create, kind.clone(), parent, data, options);
        self.send(request).await
    }

    /// Update top-level documents by `_id`. Only changed paths are sent, and a
    /// batch with nothing to change never reaches the transport.
    pub async fn update(
        &self,
        kind: &DocumentKind,
        data: Vec<Value>,
        options: OperationOptions,
    ) -> Result<Vec<Document>> {
        self.top_level_descriptor(kind)?;
        let items = data.into_iter().map(changes_of).collect::<Result<Vec<_>>>()?;
        let _guards = self
            .serialize(items.iter().map(|(id, _)| (kind.clone(), id.clone())))
            .await;
        let mut staged = Vec::with_capacity(items.len());
        for (id, changes) in items {
            let current = self
                .get(kind, id.as_str())
                .ok_or_else(|| DocumentError::not_found(kind, &id))?;
            let diff = self.stage_update(&current, None, changes, &options)?;
            if !diff.is_empty() {
                staged.push((id, current, diff));
            }
        }
        self.submit_updates(kind, None, staged, options).await
    }

    pub async fn update_embedded(
        &self,
        parent: &Document,
        kind: &DocumentKind,
        data: Vec<Value>,
        options: OperationOptions,
    ) -> Result<Vec<Document>> {
        let parent_ref = self.embedded_target(parent, kind)?;
        let items = data.into_iter().map(changes_of).collect::<Result<Vec<_>>>()?;
        let _guards = self
            .serialize(items.iter().map(|(id, _)| (kind.clone(), id.clone())))
            .await;
        let parent = self.resolve_parent(&parent_ref)?;
        let mut staged = Vec::with_capacity(items.len());
        for (id, changes) in items {
            let current = parent
                .embedded(&parent_ref.field)
                .and_then(|c| c.get(id.as_str()))
                .cloned()
                .ok_or_else(|| DocumentError::not_found(kind, &id))?;
            let diff = self.stage_update(&current, Some(&parent), changes, &options)?;
            if !diff.is_empty() {
                staged.push((id, current, diff));
            }
        }
        self.submit_updates(kind, Some(parent_ref), staged, options).await
    }

    /// Update one document, embedded or not.
    pub async fn update_document(
        &self,
        document: &Document,
        changes: Value,
        options: OperationOptions,
    ) -> Result<Option<Document>> {
        let id = self.stored_id(document)?;
        let Value::Object(mut changes) = changes else {
            return Err(ValidationError::new("data", "must be an object").into());
        };
        changes.insert("_id".to_string(), Value::String(id.to_string()));
        let updated = match document.parent() {
            Some(parent_ref) => {
                let parent = self.resolve_parent(parent_ref)?;
                let changes = vec![Value::Object(changes)];
                self.update_embedded(&parent, document.kind(), changes, options)
                    .await?
            }
            None => {
                self.update(document.kind(), vec![Value::Object(changes)], options)
                    .await?
            }
        };
        Ok(updated.into_iter().next())
    }

    fn stage_update(
        &self,
        current: &Document,
        parent: Option<&Document>,
        mut changes: Map<String, Value>,
        options: &OperationOptions,
    ) -> Result<Map<String, Value>> {
        current.descriptor().schema().validate_update(&mut changes)?;
        if let Some(subtype) = changes.get("type") {
            if current.source().get("type") != Some(subtype) {
                return Err(ValidationError::new(
                    "type",
                    "may not be changed by an update; replace the document instead",
                )
                .into());
            }
        }
        self.check_flag_scopes(&changes)?;
        self.authorize(Action::Update, current, parent, Some(&changes))?;
        Ok(if options.diff {
            diff_object(current.source(), &changes)
        } else {
            changes
        })
    }

    async fn submit_updates(
        &self,
        kind: &DocumentKind,
        parent: Option<ParentRef>,
        staged: Vec<(DocumentId, Document, Map<String, Value>)>,
        options: OperationOptions,
    ) -> Result<Vec<Document>> {
        let mut data = Vec::with_capacity(staged.len());
        for (id, current, diff) in staged {
            let hook = Hook::pre_update(kind.clone());
            if self.pre_hook(hook, &current, Some(&diff), &options)? {
                tracing::debug!(%kind, %id, paths = ?changed_paths(&diff), "staged update");
                data.push(with_id(&id, diff));
            }
        }
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let request = Request::new(Operation::Update, kind.clone(), parent, data, options);
        self.send(request).await
    }

    pub async fn delete(
        &self,
        kind: &DocumentKind,
        ids: Vec<DocumentId>,
        options: OperationOptions,
    ) -> Result<Vec<Document>> {
        self.top_level_descriptor(kind)?;
        let _guards = self
            .serialize(ids.iter().map(|id| (kind.clone(), id.clone())))
            .await;
        let mut targets = Vec::with_capacity(ids.len());
        for id in ids {
            let current = self
                .get(kind, id.as_str())
                .ok_or_else(|| DocumentError::not_found(kind, &id))?;
            self.authorize(Action::Delete, &current, None, None)?;
            targets.push((id, current));
        }
        self.submit_deletes(kind, None, targets, options).await
    }

    pub async fn delete_embedded(
        &self,
        parent: &Document,
        kind: &DocumentKind,
        ids: Vec<DocumentId>,
        options: OperationOptions,
    ) -> Result<Vec<Document>> {
        let parent_ref = self.embedded_target(parent, kind)?;
        let _guards = self
            .serialize(ids.iter().map(|id| (kind.clone(), id.clone())))
            .await;
        let parent = self.resolve_parent(&parent_ref)?;
        let mut targets = Vec::with_capacity(ids.len());
        for id in ids {
            let current = parent
                .embedded(&parent_ref.field)
                .and_then(|c| c.get(id.as_str()))
                .cloned()
                .ok_or_else(|| DocumentError::not_found(kind, &id))?;
            self.authorize(Action::Delete, &current, Some(&parent), None)?;
            targets.push((id, current));
        }
        self.submit_deletes(kind, Some(parent_ref), targets, options).await
    }

    pub async fn delete_document(
        &self,
        document: &Document,
        options: OperationOptions,
    ) -> Result<Option<Document>> {
        let id = self.stored_id(document)?;
        let deleted = match document.parent() {
            Some(parent_ref) => {
                let parent = self.resolve_parent(parent_ref)?;
                self.delete_embedded(&parent, document.kind(), vec![id], options)
                    .await?
            }
            None => self.delete(document.kind(), vec![id], options).await?,
        };
        Ok(deleted.into_iter().next())
    }

    async fn submit_deletes(
        &self,
        kind: &DocumentKind,
        parent: Option<ParentRef>,
        targets: Vec<(DocumentId, Document)>,
        options: OperationOptions,
    ) -> Result<Vec<Document>> {
        let mut data = Vec::with_capacity(targets.len());
        for (id, current) in targets {
            let hook = Hook::pre_delete(kind.clone());
            let duplicate = data.contains(&Value::from(id.as_str()));
            if self.pre_hook(hook, &current, None, &options)? && !duplicate {
                data.push(Value::String(id.to_string()));
            }
        }
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let request = Request::new(Operation::Delete, kind.clone(), parent, data, options);
        self.send(request).await
    }

    /// Write one flag. A `null` value removes it.
    pub async fn set_flag(
        &self,
        document: &Document,
        scope: &str,
        key: &str,
        value: Value,
    ) -> Result<Option<Document>> {
        self.inner.scopes.validate(scope)?;
        let value = (!value.is_null()).then_some(value);
        let changes = flag_changes(scope, key, value);
        self.update_document(document, Value::Object(changes), OperationOptions::default())
            .await
    }

    pub async fn unset_flag(
        &self,
        document: &Document,
        scope: &str,
        key: &str,
    ) -> Result<Option<Document>> {
        self.set_flag(document, scope, key, Value::Null).await
    }

    fn stored_id(&self, document: &Document) -> Result<DocumentId> {
        let Some(id) = document.document_id() else {
            return Err(ValidationError::new("_id", "document has not been created").into());
        };
        if document.state() == DocumentState::Deleted {
            return Err(DocumentError::not_found(document.kind(), id));
        }
        Ok(id)
    }

    async fn send(&self, request: Request) -> Result<Vec<Document>> {
        tracing::debug!(
            request_id = %request.request_id,
            operation = ?request.operation,
            kind = %request.kind,
            count = request.data.len(),
            "sending request"
        );
        let response = self.inner.transport.request(request).await?;
        self.reconcile(&response)
    }
}
