//! The client-side document registry.
//!
//! A [`Registry`] holds one world [`Collection`] per top-level kind and runs
//! the CRUD pipeline: permission gate, pre hooks, a round trip through the
//! [`Transport`], application of the acknowledged result, then on hooks and
//! the render observer. Nothing changes locally until the authority answers.

mod crud;
mod reconcile;

use crate::collection::Collection;
use crate::config::RegistryConfig;
use crate::document::diff::expand_object;
use crate::document::{
    Document, DocumentDescriptor, DocumentId, DocumentKind, DocumentState, DocumentTypes,
    FlagScopes, ParentRef,
};
use crate::error::{DocumentError, PermissionError, Result, ValidationError};
use crate::hooks::{Hook, HookArgs, HookContext, Hooks};
use crate::permissions::{can_user, grant_creator, Action, User};
use crate::transport::{OperationOptions, Operation, Response, Transport};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

/// Receives presentation notifications. Rendering itself happens elsewhere.
#[allow(unused_variables)]
pub trait RenderObserver: Send + Sync {
    /// A document created with `renderSheet` by this registry's user.
    fn render_sheet(&self, document: &Document) {}

    /// Any applied change, local or remote.
    fn refresh(&self, document: &Document, operation: Operation) {}
}

type DocumentKey = (DocumentKind, DocumentId);

struct Inner {
    config: RegistryConfig,
    scopes: FlagScopes,
    types: DocumentTypes,
    hooks: Hooks,
    user: User,
    transport: Arc<dyn Transport>,
    collections: RwLock<IndexMap<DocumentKind, Collection>>,
    in_flight: Mutex<HashMap<DocumentKey, Arc<tokio::sync::Mutex<()>>>>,
    observer: RwLock<Option<Arc<dyn RenderObserver>>>,
}

#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("user", &self.inner.user.id)
            .field("config", &self.inner.config)
            .field("hooks", &self.inner.hooks)
            .finish()
    }
}

impl Registry {
    pub fn new(
        config: RegistryConfig,
        types: DocumentTypes,
        transport: Arc<dyn Transport>,
        user: User,
    ) -> Self {
        let collections = types
            .top_level()
            .map(|d| (d.kind().clone(), Collection::new(d.kind().clone())))
            .collect();
        Self {
            inner: Arc::new(Inner {
                scopes: config.flag_scopes(),
                config,
                types,
                hooks: Hooks::new(),
                user,
                transport,
                collections: RwLock::new(collections),
                in_flight: Mutex::new(HashMap::new()),
                observer: RwLock::new(None),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    pub fn types(&self) -> &DocumentTypes {
        &self.inner.types
    }

    pub fn hooks(&self) -> &Hooks {
        &self.inner.hooks
    }

    pub fn user(&self) -> &User {
        &self.inner.user
    }

    pub fn set_observer(&self, observer: Arc<dyn RenderObserver>) {
        *self.inner.observer.write() = Some(observer);
    }

    pub fn get(&self, kind: &DocumentKind, id: &str) -> Option<Document> {
        self.inner.collections.read().get(kind)?.get(id).cloned()
    }

    pub fn get_name(&self, kind: &DocumentKind, name: &str) -> Option<Document> {
        self.inner.collections.read().get(kind)?.get_name(name).cloned()
    }

    /// Snapshot of a world collection in insertion order.
    pub fn documents(&self, kind: &DocumentKind) -> Vec<Document> {
        self.with_collection(kind, |c| c.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn with_collection<R>(
        &self,
        kind: &DocumentKind,
        f: impl FnOnce(&Collection) -> R,
    ) -> Option<R> {
        self.inner.collections.read().get(kind).map(f)
    }

    /// Build a pending document from candidate data without storing it.
    pub fn construct(&self, kind: &DocumentKind, data: Value) -> Result<Document> {
        let descriptor = self.top_level_descriptor(kind)?;
        let source = self.prepare_candidate(&descriptor, data, &OperationOptions::default(), true)?;
        Ok(self.build(&descriptor, source, DocumentState::Pending, None))
    }

    /// Replace every world collection with the authority's current view.
    pub async fn load_world(&self) -> Result<usize> {
        let snapshot = self.inner.transport.world().await?;
        let mut loaded = 0;
        let mut collections = IndexMap::new();
        for (kind, sources) in snapshot.documents {
            let Some(descriptor) = self.inner.types.get(&kind).cloned() else {
                tracing::warn!(%kind, "world snapshot holds an unregistered kind");
                continue;
            };
            let mut collection = Collection::new(kind.clone());
            for source in sources {
                if collection.set(self.build(&descriptor, source, DocumentState::Stored, None)) {
                    loaded += 1;
                }
            }
            collections.insert(kind, collection);
        }
        let mut current = self.inner.collections.write();
        for descriptor in self.inner.types.top_level() {
            let kind = descriptor.kind().clone();
            let collection = collections
                .shift_remove(&kind)
                .unwrap_or_else(|| Collection::new(kind.clone()));
            current.insert(kind, collection);
        }
        tracing::debug!(user = %self.inner.user.id, loaded, "world loaded");
        Ok(loaded)
    }

    /// Apply a change another client made, firing on hooks but no pre hooks.
    pub fn apply_remote(&self, response: &Response) -> Result<Vec<Document>> {
        tracing::debug!(
            request_id = %response.request.request_id,
            kind = %response.request.kind,
            user = %response.user_id,
            "applying remote change"
        );
        self.reconcile(response)
    }

    fn build(
        &self,
        descriptor: &Arc<DocumentDescriptor>,
        source: Map<String, Value>,
        state: DocumentState,
        parent: Option<ParentRef>,
    ) -> Document {
        Document::build(descriptor.clone(), &self.inner.types, source, state, parent)
    }

    fn top_level_descriptor(&self, kind: &DocumentKind) -> Result<Arc<DocumentDescriptor>> {
        let descriptor = self.inner.types.require(kind)?;
        if !descriptor.is_top_level() {
            return Err(ValidationError::new(
                "documentKind",
                format!("{kind} documents only exist inside a parent"),
            )
            .into());
        }
        Ok(descriptor.clone())
    }

    /// Resolve where children of `kind` live inside `parent`.
    fn embedded_target(&self, parent: &Document, kind: &DocumentKind) -> Result<ParentRef> {
        let Some(id) = parent.document_id() else {
            let err = ValidationError::new("parent", "must be stored before it can hold documents");
            return Err(err.into());
        };
        if parent.state() == DocumentState::Deleted {
            return Err(DocumentError::not_found(parent.kind(), id));
        }
        if parent.is_embedded() {
            return Err(
                ValidationError::new("parent", "embedded documents cannot hold documents").into(),
            );
        }
        let field = parent.descriptor().embedded_field(kind).ok_or_else(|| {
            ValidationError::new("documentKind", format!("{} does not embed {kind}", parent.kind()))
        })?;
        Ok(ParentRef {
            kind: parent.kind().clone(),
            id,
            field: field.field.to_string(),
        })
    }

    /// Current local copy of a stored parent.
    fn resolve_parent(&self, parent: &ParentRef) -> Result<Document> {
        self.get(&parent.kind, parent.id.as_str())
            .ok_or_else(|| DocumentError::not_found(&parent.kind, &parent.id))
    }

    fn prepare_candidate(
        &self,
        descriptor: &DocumentDescriptor,
        data: Value,
        options: &OperationOptions,
        top_level: bool,
    ) -> Result<Map<String, Value>> {
        let Value::Object(data) = data else {
            return Err(ValidationError::new("data", "must be an object").into());
        };
        let mut data = expand_object(data);
        if !options.keep_id {
            data.remove("_id");
        }
        data.remove("_stats");
        descriptor.schema().clean_create(&mut data)?;
        descriptor.validate_subtype(data.get("type").and_then(Value::as_str))?;
        self.check_flag_scopes(&data)?;
        if top_level {
            grant_creator(&mut data, &self.inner.user);
        }
        Ok(data)
    }

    fn check_flag_scopes(&self, data: &Map<String, Value>) -> Result<()> {
        if let Some(Value::Object(flags)) = data.get("flags") {
            for scope in flags.keys() {
                let scope = scope
                    .strip_prefix(crate::document::diff::DELETION_PREFIX)
                    .unwrap_or(scope);
                self.inner.scopes.validate(scope)?;
            }
        }
        Ok(())
    }

    fn authorize(
        &self,
        action: Action,
        document: &Document,
        parent: Option<&Document>,
        data: Option<&Map<String, Value>>,
    ) -> Result<()> {
        let user = &self.inner.user;
        if can_user(user, action, document, parent, data) {
            Ok(())
        } else {
            tracing::debug!(user = %user.id, %action, kind = %document.kind(), "permission denied");
            Err(PermissionError {
                user: user.id.clone(),
                action,
                kind: document.kind().clone(),
            }
            .into())
        }
    }

    /// Run a cancelable pre hook. `Ok(false)` means a handler vetoed.
    fn pre_hook(
        &self,
        hook: Hook,
        document: &Document,
        changes: Option<&Map<String, Value>>,
        options: &OperationOptions,
    ) -> Result<bool> {
        if options.no_hook {
            return Ok(true);
        }
        let args = HookArgs::Document(HookContext {
            document,
            changes,
            options,
            user_id: &self.inner.user.id,
        });
        let proceed = self.inner.hooks.call(&hook, &args)?;
        if !proceed {
            tracing::debug!(%hook, id = ?document.id(), "operation vetoed by hook");
        }
        Ok(proceed)
    }

    /// Wait for earlier mutations of the same documents to be acknowledged.
    /// Keys are locked in sorted order.
    async fn serialize(
        &self,
        keys: impl IntoIterator<Item = DocumentKey>,
    ) -> Vec<OwnedMutexGuard<()>> {
        let mut keys: Vec<_> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();
        let mutexes: Vec<_> = {
            let mut in_flight = self.inner.in_flight.lock();
            keys.into_iter()
                .map(|key| in_flight.entry(key).or_default().clone())
                .collect()
        };
        let mut guards = Vec::with_capacity(mutexes.len());
        for mutex in mutexes {
            guards.push(mutex.lock_owned().await);
        }
        guards
    }

    fn release(&self, keys: impl IntoIterator<Item = DocumentKey>) {
        let mut in_flight = self.inner.in_flight.lock();
        for key in keys {
            in_flight.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::Authority;
    use crate::config::AuthorityConfig;
    use crate::permissions::{UserRole, Users};
    use crate::transport::LocalTransport;
    use serde_json::json;

    #[tokio::test]
    async fn deleting_a_parent_releases_its_children() {
        let gm = User::new("gm", "Game Master", UserRole::GameMaster);
        let authority = Arc::new(Authority::new(
            AuthorityConfig::default(),
            DocumentTypes::standard(),
            Users::new([gm.clone()]),
        ));
        let transport = Arc::new(LocalTransport::new(authority.clone(), "gm"));
        let registry = Registry::new(
            RegistryConfig::default(),
            authority.types().clone(),
            transport,
            gm,
        );

        let actor = registry
            .create_document(
                &DocumentKind::ACTOR,
                json!({"name": "Goblin", "type": "npc"}),
                OperationOptions::default(),
            )
            .await
            .unwrap()
            .unwrap();
        let items = registry
            .create_embedded(
                &actor,
                &DocumentKind::ITEM,
                vec![json!({"name": "Dagger", "type": "weapon"})],
                OperationOptions::default(),
            )
            .await
            .unwrap();
        registry
            .update_document(&items[0], json!({"name": "Knife"}), OperationOptions::default())
            .await
            .unwrap();
        registry
            .update_document(&actor, json!({"name": "Hobgoblin"}), OperationOptions::default())
            .await
            .unwrap();
        assert_eq!(registry.inner.in_flight.lock().len(), 2);

        registry
            .delete_document(&actor, OperationOptions::default())
            .await
            .unwrap();
        assert!(registry.inner.in_flight.lock().is_empty());
    }
}
