//! Replicated, permission-gated document store.
//!
//! [`registry::Registry`] is the client view of a world; it mirrors the
//! records held by an [`authority::Authority`] and reaches it through a
//! [`transport::Transport`].

pub mod authority;
pub mod collection;
pub mod config;
pub mod document;
pub mod error;
pub mod hooks;
pub mod permissions;
pub mod registry;
pub mod transport;

pub use authority::Authority;
pub use collection::{Collection, EmbeddedCollection};
pub use config::{AuthorityConfig, RegistryConfig};
pub use document::{Document, DocumentId, DocumentKind, DocumentState, DocumentTypes, ParentRef};
pub use error::{DocumentError, Result};
pub use hooks::{Flow, Hook, HookArgs, HookEvent, Hooks};
pub use permissions::{OwnershipLevel, User, UserId, UserRole, Users};
pub use registry::{RenderObserver, Registry};
pub use transport::{LocalTransport, Operation, OperationOptions, Request, Response, Transport};
