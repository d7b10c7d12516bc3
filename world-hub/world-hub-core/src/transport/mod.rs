//! The request/response contract between a registry and the authority.

mod local;

pub use local::LocalTransport;

use crate::document::{DocumentKind, ParentRef};
use crate::error::TransportError;
use crate::permissions::UserId;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OperationOptions {
    /// Skip pre and on hooks.
    pub no_hook: bool,
    /// Create locally without contacting the authority.
    pub temporary: bool,
    /// Ask the render observer to open the created document.
    pub render_sheet: bool,
    /// Send only changed paths on update.
    pub diff: bool,
    /// Keep a caller-supplied `_id` on create.
    pub keep_id: bool,
}

impl Default for OperationOptions {
    fn default() -> Self {
        Self {
            no_hook: false,
            temporary: false,
            render_sheet: false,
            diff: true,
            keep_id: false,
        }
    }
}

impl OperationOptions {
    pub fn with_no_hook(mut self) -> Self {
        self.no_hook = true;
        self
    }

    pub fn with_temporary(mut self) -> Self {
        self.temporary = true;
        self
    }

    pub fn with_render_sheet(mut self) -> Self {
        self.render_sheet = true;
        self
    }

    pub fn without_diff(mut self) -> Self {
        self.diff = false;
        self
    }

    pub fn with_keep_id(mut self) -> Self {
        self.keep_id = true;
        self
    }
}

/// One batched operation on documents of a single kind. Embedded operations
/// carry the parent they mutate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub request_id: Uuid,
    pub operation: Operation,
    pub kind: DocumentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentRef>,
    pub data: Vec<Value>,
    #[serde(default)]
    pub options: OperationOptions,
}

impl Request {
    pub fn new(
        operation: Operation,
        kind: DocumentKind,
        parent: Option<ParentRef>,
        data: Vec<Value>,
        options: OperationOptions,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            operation,
            kind,
            parent,
            data,
            options,
        }
    }
}

/// The authority's acknowledgement.
///
/// `result` holds full sources for creates, `{_id, ...diff}` objects for
/// updates and bare ids for deletes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub request: Request,
    pub result: Vec<Value>,
    pub user_id: UserId,
}

/// Every stored top-level record visible to the requesting user.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldSnapshot {
    pub documents: IndexMap<DocumentKind, Vec<Map<String, Value>>>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(&self, request: Request) -> Result<Response, TransportError>;

    async fn world(&self) -> Result<WorldSnapshot, TransportError>;
}
