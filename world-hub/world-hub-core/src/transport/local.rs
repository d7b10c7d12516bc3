use super::{Request, Response, Transport, WorldSnapshot};
use crate::authority::Authority;
use crate::error::TransportError;
use crate::permissions::UserId;
use async_trait::async_trait;
use std::sync::Arc;

/// In-process transport that talks straight to an [`Authority`] as one user.
#[derive(Clone, Debug)]
pub struct LocalTransport {
    authority: Arc<Authority>,
    user: UserId,
}

impl LocalTransport {
    pub fn new(authority: Arc<Authority>, user: impl Into<UserId>) -> Self {
        Self {
            authority,
            user: user.into(),
        }
    }

    pub fn authority(&self) -> &Arc<Authority> {
        &self.authority
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn request(&self, request: Request) -> Result<Response, TransportError> {
        self.authority.handle(&self.user, request)
    }

    async fn world(&self) -> Result<WorldSnapshot, TransportError> {
        self.authority.world(&self.user)
    }
}
