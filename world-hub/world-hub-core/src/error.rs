use crate::document::{DocumentId, DocumentKind};
use crate::permissions::{Action, UserId};

/// Candidate data failed schema shape or type rules.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid `{field}`: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("user {user} may not {action} {kind}")]
pub struct PermissionError {
    pub user: UserId,
    pub action: Action,
    pub kind: DocumentKind,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("request rejected by the authority: {0}")]
    Rejected(String),
    #[error("transport disconnected")]
    Disconnected,
    #[error("protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("hook {hook} failed: {message}")]
pub struct HookError {
    pub hook: String,
    pub message: String,
}

/// Every failure the CRUD pipeline can surface to a caller.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DocumentError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Permission(#[from] PermissionError),
    #[error("{kind} {id} does not exist")]
    NotFound { kind: DocumentKind, id: DocumentId },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Hook(#[from] HookError),
}

impl DocumentError {
    pub fn not_found(kind: &DocumentKind, id: impl Into<DocumentId>) -> Self {
        Self::NotFound {
            kind: kind.clone(),
            id: id.into(),
        }
    }
}

pub type Result<T, E = DocumentError> = std::result::Result<T, E>;
