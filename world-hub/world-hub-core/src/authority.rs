//! The authoritative, in-memory document store.
//!
//! Every request is validated and permission-checked in full before any
//! record changes, so a rejected batch leaves the store untouched.

use crate::config::AuthorityConfig;
use crate::document::diff::{diff_object, expand_object, merge_object, DELETION_PREFIX};
use crate::document::{
    Document, DocumentDescriptor, DocumentId, DocumentKind, DocumentState, DocumentTypes,
    ParentRef,
};
use crate::error::TransportError;
use crate::permissions::{can_user, grant_creator, Action, User, UserId, Users};
use crate::transport::{Operation, Request, Response, WorldSnapshot};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use std::fmt::Display;
use std::sync::Arc;

type Records = IndexMap<DocumentKind, IndexMap<DocumentId, Map<String, Value>>>;

fn rejected(reason: impl Display) -> TransportError {
    TransportError::Rejected(reason.to_string())
}

fn as_object(value: &Value) -> Result<Map<String, Value>, TransportError> {
    match value {
        Value::Object(map) => Ok(expand_object(map.clone())),
        other => Err(rejected(format!("expected an object, got {other}"))),
    }
}

fn take_id(changes: &mut Map<String, Value>) -> Result<DocumentId, TransportError> {
    match changes.remove("_id") {
        Some(Value::String(id)) if !id.is_empty() => Ok(DocumentId::from(id)),
        _ => Err(rejected("update data must carry an _id")),
    }
}

fn entry_id(entry: &Value) -> Option<&str> {
    entry.get("_id").and_then(Value::as_str)
}

#[derive(Debug)]
pub struct Authority {
    config: AuthorityConfig,
    types: DocumentTypes,
    users: RwLock<Users>,
    records: Mutex<Records>,
}

impl Authority {
    pub fn new(config: AuthorityConfig, types: DocumentTypes, users: Users) -> Self {
        Self {
            config,
            types,
            users: RwLock::new(users),
            records: Mutex::new(IndexMap::new()),
        }
    }

    pub fn types(&self) -> &DocumentTypes {
        &self.types
    }

    pub fn add_user(&self, user: User) {
        self.users.write().insert(user);
    }

    pub fn user(&self, id: &UserId) -> Option<User> {
        self.users.read().get(id).cloned()
    }

    /// The stored record of a top-level document.
    pub fn record(&self, kind: &DocumentKind, id: &str) -> Option<Map<String, Value>> {
        self.records.lock().get(kind)?.get(id).cloned()
    }

    pub fn count(&self, kind: &DocumentKind) -> usize {
        self.records.lock().get(kind).map_or(0, IndexMap::len)
    }

    pub fn handle(&self, user_id: &UserId, request: Request) -> Result<Response, TransportError> {
        let user = self
            .user(user_id)
            .ok_or_else(|| rejected(format!("unknown user {user_id}")))?;
        let descriptor = self.types.require(&request.kind).map_err(rejected)?.clone();
        let mut records = self.records.lock();
        let outcome = match (request.operation, request.parent.as_ref()) {
            (Operation::Create, None) => self.create(&mut records, &user, &descriptor, &request),
            (Operation::Update, None) => self.update(&mut records, &user, &descriptor, &request),
            (Operation::Delete, None) => self.delete(&mut records, &user, &descriptor, &request),
            (operation, Some(parent)) => {
                self.embedded(&mut records, &user, &descriptor, parent, operation, &request)
            }
        };
        drop(records);
        match outcome {
            Ok(result) => {
                tracing::debug!(
                    request_id = %request.request_id,
                    operation = ?request.operation,
                    kind = %request.kind,
                    user = %user.id,
                    count = result.len(),
                    "request applied"
                );
                Ok(Response {
                    request,
                    result,
                    user_id: user.id,
                })
            }
            Err(err) => {
                tracing::warn!(
                    request_id = %request.request_id,
                    kind = %request.kind,
                    user = %user.id,
                    error = %err,
                    "request rejected"
                );
                Err(err)
            }
        }
    }

    /// Every top-level record the user may view.
    pub fn world(&self, user_id: &UserId) -> Result<WorldSnapshot, TransportError> {
        let user = self
            .user(user_id)
            .ok_or_else(|| rejected(format!("unknown user {user_id}")))?;
        let records = self.records.lock();
        let mut snapshot = WorldSnapshot::default();
        for descriptor in self.types.top_level() {
            let visible = records
                .get(descriptor.kind())
                .into_iter()
                .flat_map(|table| table.values())
                .filter(|source| {
                    let doc = self.document(descriptor, (*source).clone(), None);
                    can_user(&user, Action::View, &doc, None, None)
                })
                .cloned()
                .collect();
            snapshot.documents.insert(descriptor.kind().clone(), visible);
        }
        Ok(snapshot)
    }

    /// Whether the user may view a stored top-level record. Missing records
    /// are visible to nobody.
    pub fn visible_to(&self, user_id: &UserId, kind: &DocumentKind, id: &str) -> bool {
        let (Some(user), Some(descriptor)) = (self.user(user_id), self.types.get(kind)) else {
            return false;
        };
        let Some(source) = self.record(kind, id) else {
            return false;
        };
        let doc = self.document(descriptor, source, None);
        can_user(&user, Action::View, &doc, None, None)
    }

    /// Every user who may currently view a stored top-level record.
    pub fn viewers(&self, kind: &DocumentKind, id: &str) -> Vec<UserId> {
        let (Some(descriptor), Some(source)) = (self.types.get(kind), self.record(kind, id)) else {
            return Vec::new();
        };
        let doc = self.document(descriptor, source, None);
        self.users
            .read()
            .iter()
            .filter(|user| can_user(user, Action::View, &doc, None, None))
            .map(|user| user.id.clone())
            .collect()
    }

    fn document(
        &self,
        descriptor: &Arc<DocumentDescriptor>,
        source: Map<String, Value>,
        parent: Option<ParentRef>,
    ) -> Document {
        Document::build(descriptor.clone(), &self.types, source, DocumentState::Stored, parent)
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn check_flags(&self, data: &Map<String, Value>) -> Result<(), TransportError> {
        if let Some(Value::Object(flags)) = data.get("flags") {
            for scope in flags.keys() {
                let scope = scope.strip_prefix(DELETION_PREFIX).unwrap_or(scope);
                self.config.flag_scopes.validate(scope).map_err(rejected)?;
            }
        }
        Ok(())
    }

    /// Clean a create candidate and stamp it with an id and stats. Embedded
    /// children in the candidate are prepared the same way.
    fn prepare_create(
        &self,
        user: &User,
        descriptor: &DocumentDescriptor,
        mut data: Map<String, Value>,
        keep_id: bool,
        now: i64,
    ) -> Result<Map<String, Value>, TransportError> {
        let requested = match data.remove("_id") {
            Some(Value::String(id)) if !id.is_empty() => Some(id),
            _ => None,
        };
        data.remove("_stats");
        descriptor.schema().clean_create(&mut data).map_err(rejected)?;
        descriptor.validate_subtype(data.get("type").and_then(Value::as_str)).map_err(rejected)?;
        self.check_flags(&data)?;

        let id = match requested {
            Some(id) if keep_id && self.config.allow_keep_id && user.is_gm() => id,
            _ => DocumentId::generate_with_length(self.config.id_length).to_string(),
        };
        data.insert("_id".to_string(), Value::String(id));
        data.insert(
            "_stats".to_string(),
            json!({"createdTime": now, "modifiedTime": now, "lastModifiedBy": user.id}),
        );

        for field in descriptor.embedded() {
            let child_descriptor = self.types.require(&field.kind).map_err(rejected)?;
            let Some(Value::Array(children)) = data.remove(field.field) else {
                continue;
            };
            let mut prepared = Vec::with_capacity(children.len());
            for child in children {
                let Value::Object(child) = child else {
                    return Err(rejected(format!("{} entries must be objects", field.field)));
                };
                let child = self.prepare_create(user, child_descriptor, child, keep_id, now)?;
                prepared.push(Value::Object(child));
            }
            data.insert(field.field.to_string(), Value::Array(prepared));
        }
        Ok(data)
    }

    #[allow(clippy::too_many_arguments)]
    fn stage_update(
        &self,
        user: &User,
        descriptor: &Arc<DocumentDescriptor>,
        current: &Map<String, Value>,
        mut changes: Map<String, Value>,
        parent: Option<(&Document, &ParentRef)>,
        diff: bool,
        now: i64,
    ) -> Result<Option<(Map<String, Value>, Map<String, Value>)>, TransportError> {
        descriptor.schema().validate_update(&mut changes).map_err(rejected)?;
        if let Some(subtype) = changes.get("type") {
            if current.get("type") != Some(subtype) {
                return Err(rejected("type may not be changed through an update"));
            }
        }
        self.check_flags(&changes)?;
        let doc = self.document(descriptor, current.clone(), parent.map(|(_, r)| r.clone()));
        if !can_user(user, Action::Update, &doc, parent.map(|(p, _)| p), Some(&changes)) {
            return Err(rejected(format!("user {} may not update {}", user.id, descriptor.kind())));
        }
        let mut delta = if diff {
            diff_object(current, &changes)
        } else {
            changes
        };
        if delta.is_empty() {
            return Ok(None);
        }
        let stats = json!({
            "createdTime": current.get("_stats").and_then(|s| s.get("createdTime")).cloned(),
            "modifiedTime": now,
            "lastModifiedBy": user.id,
        });
        delta.insert("_stats".to_string(), stats);
        let mut next = current.clone();
        merge_object(&mut next, &delta);
        Ok(Some((next, delta)))
    }

    fn create(
        &self,
        records: &mut Records,
        user: &User,
        descriptor: &Arc<DocumentDescriptor>,
        request: &Request,
    ) -> Result<Vec<Value>, TransportError> {
        if !descriptor.is_top_level() {
            return Err(rejected(format!("{} documents need a parent", descriptor.kind())));
        }
        let now = Self::now();
        let existing = records.get(descriptor.kind());
        let mut created: Vec<(DocumentId, Map<String, Value>)> = Vec::new();
        for raw in &request.data {
            let data = as_object(raw)?;
            let mut source =
                self.prepare_create(user, descriptor, data, request.options.keep_id, now)?;
            grant_creator(&mut source, user);
            let doc = self.document(descriptor, source.clone(), None);
            if !can_user(user, Action::Create, &doc, None, Some(&source)) {
                return Err(rejected(format!(
                    "user {} may not create {}",
                    user.id,
                    descriptor.kind()
                )));
            }
            let Some(id) = doc.document_id() else {
                return Err(rejected("created document has no id"));
            };
            let taken = existing.map_or(false, |t| t.contains_key(&id))
                || created.iter().any(|(other, _)| *other == id);
            if taken {
                return Err(rejected(format!("{} {id} already exists", descriptor.kind())));
            }
            created.push((id, source));
        }
        let table = records.entry(descriptor.kind().clone()).or_default();
        Ok(created
            .into_iter()
            .map(|(id, source)| {
                table.insert(id, source.clone());
                Value::Object(source)
            })
            .collect())
    }

    fn update(
        &self,
        records: &mut Records,
        user: &User,
        descriptor: &Arc<DocumentDescriptor>,
        request: &Request,
    ) -> Result<Vec<Value>, TransportError> {
        let now = Self::now();
        let kind = descriptor.kind();
        let mut staged: IndexMap<DocumentId, Map<String, Value>> = IndexMap::new();
        let mut result = Vec::new();
        for raw in &request.data {
            let mut changes = as_object(raw)?;
            let id = take_id(&mut changes)?;
            let current = match staged.get(&id) {
                Some(current) => current.clone(),
                None => records
                    .get(kind)
                    .and_then(|t| t.get(&id))
                    .cloned()
                    .ok_or_else(|| rejected(format!("{kind} {id} does not exist")))?,
            };
            let staged_update =
                self.stage_update(
                    user,
                    descriptor,
                    &current,
                    changes,
                    None,
                    request.options.diff,
                    now,
                )?;
            if let Some((next, mut delta)) = staged_update {
                delta.insert("_id".to_string(), Value::String(id.to_string()));
                result.push(Value::Object(delta));
                staged.insert(id, next);
            }
        }
        let table = records.entry(kind.clone()).or_default();
        table.extend(staged);
        Ok(result)
    }

    fn delete(
        &self,
        records: &mut Records,
        user: &User,
        descriptor: &Arc<DocumentDescriptor>,
        request: &Request,
    ) -> Result<Vec<Value>, TransportError> {
        let kind = descriptor.kind();
        let mut ids: Vec<DocumentId> = Vec::new();
        for raw in &request.data {
            let id = raw
                .as_str()
                .map(DocumentId::from)
                .ok_or_else(|| rejected("delete data must be ids"))?;
            if ids.contains(&id) {
                continue;
            }
            let source = records
                .get(kind)
                .and_then(|t| t.get(&id))
                .ok_or_else(|| rejected(format!("{kind} {id} does not exist")))?;
            let doc = self.document(descriptor, source.clone(), None);
            if !can_user(user, Action::Delete, &doc, None, None) {
                return Err(rejected(format!("user {} may not delete {kind} {id}", user.id)));
            }
            ids.push(id);
        }
        if let Some(table) = records.get_mut(kind) {
            for id in &ids {
                table.shift_remove(id);
            }
        }
        Ok(ids.into_iter().map(|id| Value::String(id.to_string())).collect())
    }

    /// Create, update or delete children inside one field of a parent. The
    /// parent's array is rebuilt on a copy and swapped in at the end.
    fn embedded(
        &self,
        records: &mut Records,
        user: &User,
        descriptor: &Arc<DocumentDescriptor>,
        parent_ref: &ParentRef,
        operation: Operation,
        request: &Request,
    ) -> Result<Vec<Value>, TransportError> {
        let parent_descriptor = self.types.require(&parent_ref.kind).map_err(rejected)?;
        let field = parent_descriptor
            .embedded_field(descriptor.kind())
            .filter(|f| f.field == parent_ref.field)
            .ok_or_else(|| {
                rejected(format!(
                    "{} does not embed {} in {}",
                    parent_ref.kind,
                    descriptor.kind(),
                    parent_ref.field
                ))
            })?;
        let parent_source = records
            .get(&parent_ref.kind)
            .and_then(|t| t.get(&parent_ref.id))
            .cloned()
            .ok_or_else(|| {
                rejected(format!("{} {} does not exist", parent_ref.kind, parent_ref.id))
            })?;
        let parent_doc = self.document(parent_descriptor, parent_source.clone(), None);
        let mut children = match parent_source.get(field.field) {
            Some(Value::Array(children)) => children.clone(),
            _ => Vec::new(),
        };

        let now = Self::now();
        let mut result = Vec::new();
        match operation {
            Operation::Create => {
                for raw in &request.data {
                    let data = as_object(raw)?;
                    let source =
                        self.prepare_create(user, descriptor, data, request.options.keep_id, now)?;
                    let doc = self.document(descriptor, source.clone(), Some(parent_ref.clone()));
                    if !can_user(user, Action::Create, &doc, Some(&parent_doc), Some(&source)) {
                        return Err(rejected(format!(
                            "user {} may not create {} in {} {}",
                            user.id,
                            descriptor.kind(),
                            parent_ref.kind,
                            parent_ref.id
                        )));
                    }
                    let id = doc.id().unwrap_or_default();
                    if children.iter().any(|c| entry_id(c) == Some(id)) {
                        return Err(rejected(format!("{} {id} already exists", descriptor.kind())));
                    }
                    children.push(Value::Object(source.clone()));
                    result.push(Value::Object(source));
                }
            }
            Operation::Update => {
                for raw in &request.data {
                    let mut changes = as_object(raw)?;
                    let id = take_id(&mut changes)?;
                    let slot = children
                        .iter_mut()
                        .find(|c| entry_id(c) == Some(id.as_str()))
                        .ok_or_else(|| {
                            rejected(format!("{} {id} does not exist", descriptor.kind()))
                        })?;
                    let Value::Object(current) = slot else {
                        return Err(rejected(format!("{} {id} is malformed", descriptor.kind())));
                    };
                    let staged = self.stage_update(
                        user,
                        descriptor,
                        current,
                        changes,
                        Some((&parent_doc, parent_ref)),
                        request.options.diff,
                        now,
                    )?;
                    if let Some((next, mut delta)) = staged {
                        *current = next;
                        delta.insert("_id".to_string(), Value::String(id.to_string()));
                        result.push(Value::Object(delta));
                    }
                }
            }
            Operation::Delete => {
                for raw in &request.data {
                    let id = raw.as_str().ok_or_else(|| rejected("delete data must be ids"))?;
                    let Some(index) = children.iter().position(|c| entry_id(c) == Some(id)) else {
                        return Err(rejected(format!("{} {id} does not exist", descriptor.kind())));
                    };
                    let Value::Object(source) = &children[index] else {
                        return Err(rejected(format!("{} {id} is malformed", descriptor.kind())));
                    };
                    let doc = self.document(descriptor, source.clone(), Some(parent_ref.clone()));
                    if !can_user(user, Action::Delete, &doc, Some(&parent_doc), None) {
                        return Err(rejected(format!(
                            "user {} may not delete {} {id}",
                            user.id,
                            descriptor.kind()
                        )));
                    }
                    children.remove(index);
                    result.push(Value::String(id.to_string()));
                }
            }
        }

        if let Some(parent) = records
            .get_mut(&parent_ref.kind)
            .and_then(|t| t.get_mut(&parent_ref.id))
        {
            parent.insert(field.field.to_string(), Value::Array(children));
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::UserRole;
    use crate::transport::OperationOptions;

    fn authority() -> Authority {
        Authority::new(
            AuthorityConfig::default(),
            DocumentTypes::standard(),
            Users::new([
                User::new("gm", "Game Master", UserRole::GameMaster),
                User::new("p1", "Player One", UserRole::Player),
                User::new("p2", "Player Two", UserRole::Player),
            ]),
        )
    }

    fn request(operation: Operation, kind: DocumentKind, data: Vec<Value>) -> Request {
        Request::new(operation, kind, None, data, OperationOptions::default())
    }

    fn create_goblin(authority: &Authority, user: &str) -> Map<String, Value> {
        let response = authority
            .handle(
                &UserId::from(user),
                request(
                    Operation::Create,
                    DocumentKind::ACTOR,
                    vec![json!({"name": "Goblin", "type": "npc"})],
                ),
            )
            .unwrap();
        let Value::Object(source) = response.result[0].clone() else { unreachable!() };
        source
    }

    #[test]
    fn create_assigns_id_stats_and_creator_ownership() {
        let authority = authority();
        let source = create_goblin(&authority, "p1");
        let id = source["_id"].as_str().unwrap();
        assert_eq!(id.len(), 16);
        assert_eq!(source["ownership"], json!({"default": 0, "p1": 3}));
        assert_eq!(source["_stats"]["lastModifiedBy"], "p1");
        assert!(authority.record(&DocumentKind::ACTOR, id).is_some());
    }

    #[test]
    fn invalid_batches_change_nothing() {
        let authority = authority();
        let err = authority
            .handle(
                &UserId::from("gm"),
                request(
                    Operation::Create,
                    DocumentKind::ACTOR,
                    vec![json!({"name": "Goblin", "type": "npc"}), json!({"type": "npc"})],
                ),
            )
            .unwrap_err();
        assert!(matches!(err, TransportError::Rejected(_)));
        assert_eq!(authority.count(&DocumentKind::ACTOR), 0);
    }

    #[test]
    fn update_returns_minimal_diff_and_rejects_strangers() {
        let authority = authority();
        let source = create_goblin(&authority, "p1");
        let id = source["_id"].as_str().unwrap();

        let response = authority
            .handle(
                &UserId::from("p1"),
                request(
                    Operation::Update,
                    DocumentKind::ACTOR,
                    vec![json!({"_id": id, "name": "Hobgoblin", "type": "npc"})],
                ),
            )
            .unwrap();
        assert_eq!(response.result.len(), 1);
        assert_eq!(response.result[0]["name"], "Hobgoblin");
        assert!(response.result[0].get("type").is_none());

        let unchanged = authority
            .handle(
                &UserId::from("p1"),
                request(
                    Operation::Update,
                    DocumentKind::ACTOR,
                    vec![json!({"_id": id, "name": "Hobgoblin"})],
                ),
            )
            .unwrap();
        assert!(unchanged.result.is_empty());

        let err = authority.handle(
            &UserId::from("p2"),
            request(
                Operation::Update,
                DocumentKind::ACTOR,
                vec![json!({"_id": id, "name": "Mine"})],
            ),
        );
        assert!(err.is_err());
        assert_eq!(authority.record(&DocumentKind::ACTOR, id).unwrap()["name"], "Hobgoblin");
    }

    #[test]
    fn viewers_follow_ownership_and_vanish_with_the_record() {
        let authority = authority();
        let source = create_goblin(&authority, "p1");
        let id = source["_id"].as_str().unwrap();
        let mut viewers = authority.viewers(&DocumentKind::ACTOR, id);
        viewers.sort();
        assert_eq!(viewers, vec![UserId::from("gm"), UserId::from("p1")]);
        assert!(!authority.visible_to(&UserId::from("p2"), &DocumentKind::ACTOR, id));

        authority
            .handle(
                &UserId::from("p1"),
                request(Operation::Delete, DocumentKind::ACTOR, vec![json!(id)]),
            )
            .unwrap();
        assert!(authority.viewers(&DocumentKind::ACTOR, id).is_empty());
        assert!(!authority.visible_to(&UserId::from("gm"), &DocumentKind::ACTOR, id));
    }

    #[test]
    fn updates_may_not_remove_identity_or_ownership() {
        let authority = authority();
        let source = create_goblin(&authority, "p1");
        let id = source["_id"].as_str().unwrap();
        for field in ["-=_id", "-=_stats", "-=ownership", "-=flags"] {
            let mut changes = Map::new();
            changes.insert("_id".into(), json!(id));
            changes.insert(field.into(), Value::Null);
            let err = authority
                .handle(
                    &UserId::from("p1"),
                    request(Operation::Update, DocumentKind::ACTOR, vec![Value::Object(changes)]),
                )
                .unwrap_err();
            assert!(matches!(err, TransportError::Rejected(_)), "{field}");
        }
        let record = authority.record(&DocumentKind::ACTOR, id).unwrap();
        assert_eq!(record["_id"], json!(id));
        assert_eq!(record["ownership"], json!({"default": 0, "p1": 3}));
        assert!(record.contains_key("_stats"));
    }

    #[test]
    fn embedded_operations_rewrite_the_parent_field() {
        let authority = authority();
        let source = create_goblin(&authority, "p1");
        let id = DocumentId::from(source["_id"].as_str().unwrap());
        let parent = ParentRef {
            kind: DocumentKind::ACTOR,
            id: id.clone(),
            field: "items".into(),
        };
        let created = authority
            .handle(
                &UserId::from("p1"),
                Request::new(
                    Operation::Create,
                    DocumentKind::ITEM,
                    Some(parent.clone()),
                    vec![json!({"name": "Dagger", "type": "weapon"})],
                    OperationOptions::default(),
                ),
            )
            .unwrap();
        let item_id = created.result[0]["_id"].as_str().unwrap().to_string();
        let record = authority.record(&DocumentKind::ACTOR, id.as_str()).unwrap();
        assert_eq!(record["items"][0]["name"], "Dagger");

        let err = authority.handle(
            &UserId::from("p2"),
            Request::new(
                Operation::Delete,
                DocumentKind::ITEM,
                Some(parent.clone()),
                vec![json!(item_id)],
                OperationOptions::default(),
            ),
        );
        assert!(err.is_err());

        authority
            .handle(
                &UserId::from("p1"),
                Request::new(
                    Operation::Delete,
                    DocumentKind::ITEM,
                    Some(parent),
                    vec![json!(item_id)],
                    OperationOptions::default(),
                ),
            )
            .unwrap();
        let items = &authority.record(&DocumentKind::ACTOR, id.as_str()).unwrap()["items"];
        assert_eq!(items, &json!([]));
    }

    #[test]
    fn world_is_filtered_by_view_permission() {
        let authority = authority();
        create_goblin(&authority, "p1");
        let mine = authority.world(&UserId::from("p1")).unwrap();
        let theirs = authority.world(&UserId::from("p2")).unwrap();
        assert_eq!(mine.documents[&DocumentKind::ACTOR].len(), 1);
        assert!(theirs.documents[&DocumentKind::ACTOR].is_empty());
    }
}
