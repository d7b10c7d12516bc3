//! WebSocket edge hosting the authority.

use crate::auth::TokenVerifier;
use crate::events::{Applied, EventBus};
use crate::protocol::{ClientMessage, ServerMessage};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        FromRequestParts, State,
    },
    http::{request::Parts, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tower_http::trace::TraceLayer;
use uuid::Uuid;
use world_hub_core::error::TransportError;
use world_hub_core::{Authority, Operation, Request, Response, UserId};

/// Authentication context extracted from request headers.
#[derive(Clone, Debug)]
pub struct AuthContext {
    pub user_id: UserId,
}

impl FromRequestParts<AppState> for AuthContext {
    type Rejection = StatusCode;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let headers = &parts.headers;
        if let Some(auth) = headers.get("Authorization") {
            let token = auth
                .to_str()
                .ok()
                .and_then(|v| v.strip_prefix("Bearer "))
                .ok_or(StatusCode::UNAUTHORIZED)?;
            let claims = state
                .verifier
                .verify(token)
                .await
                .ok_or(StatusCode::UNAUTHORIZED)?;
            return Ok(Self {
                user_id: UserId::from(claims.sub),
            });
        }
        if !state.allow_user_header {
            return Err(StatusCode::UNAUTHORIZED);
        }
        headers
            .get("X-User-Id")
            .and_then(|v| v.to_str().ok())
            .map(|id| Self {
                user_id: UserId::from(id),
            })
            .ok_or(StatusCode::UNAUTHORIZED)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub authority: Arc<Authority>,
    pub events: EventBus,
    pub verifier: Arc<dyn TokenVerifier>,
    /// Trust an unauthenticated `X-User-Id` header. Development only.
    pub allow_user_header: bool,
}

impl AppState {
    pub fn new(authority: Arc<Authority>, verifier: Arc<dyn TokenVerifier>) -> Self {
        Self {
            authority,
            events: EventBus::new(),
            verifier,
            allow_user_header: false,
        }
    }

    pub fn with_user_header(mut self, allow: bool) -> Self {
        self.allow_user_header = allow;
        self
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_session))
        .route("/health", get(|| async { "OK" }))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ws_session(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    auth: AuthContext,
) -> axum::response::Response {
    if state.authority.user(&auth.user_id).is_none() {
        tracing::warn!(user = %auth.user_id, "connection from unknown user");
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| async move {
        handle_session(socket, state, auth.user_id).await;
    })
}

async fn handle_session(mut socket: WebSocket, state: AppState, user: UserId) {
    let session = Uuid::new_v4();
    let mut rx = state.events.subscribe();
    tracing::info!(%session, %user, "session opened");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = dispatch(&state, session, &user, text.as_str());
                        if send(&mut socket, &reply).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
            res = rx.recv() => {
                match res {
                    Ok(applied) if applied.origin != session => {
                        let Some(response) = visible_part(&state.authority, &user, applied) else {
                            continue;
                        };
                        if send(&mut socket, &ServerMessage::Broadcast(response)).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(%session, skipped, "session fell behind the broadcast bus");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }
    tracing::info!(%session, %user, "session closed");
}

fn dispatch(state: &AppState, session: Uuid, user: &UserId, text: &str) -> ServerMessage {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(err) => {
            let request_id = serde_json::from_str::<Value>(text)
                .ok()
                .and_then(|v| v.get("requestId")?.as_str()?.parse().ok())
                .unwrap_or(Uuid::nil());
            return ServerMessage::Rejected {
                request_id,
                reason: format!("malformed message: {err}"),
            };
        }
    };
    let request_id = message.request_id();
    let outcome = match message {
        ClientMessage::Request(request) => {
            let prior_viewers = prior_viewers(&state.authority, &request);
            state.authority.handle(user, request).map(|response| {
                state.events.send(Applied {
                    origin: session,
                    response: response.clone(),
                    prior_viewers,
                });
                ServerMessage::Response(response)
            })
        }
        ClientMessage::World { request_id } => state
            .authority
            .world(user)
            .map(|snapshot| ServerMessage::World { request_id, snapshot }),
    };
    outcome.unwrap_or_else(|err| ServerMessage::Rejected {
        request_id,
        reason: match err {
            TransportError::Rejected(reason) => reason,
            other => other.to_string(),
        },
    })
}

/// Who may see each target of a top-level delete, taken before it runs.
fn prior_viewers(authority: &Authority, request: &Request) -> HashMap<String, Vec<UserId>> {
    if request.operation != Operation::Delete || request.parent.is_some() {
        return HashMap::new();
    }
    request
        .data
        .iter()
        .filter_map(Value::as_str)
        .map(|id| (id.to_string(), authority.viewers(&request.kind, id)))
        .collect()
}

/// The part of an applied response `user` may see, if any.
fn visible_part(authority: &Authority, user: &UserId, applied: Applied) -> Option<Response> {
    let Applied {
        mut response,
        prior_viewers,
        ..
    } = applied;
    if let Some(parent) = &response.request.parent {
        let visible = authority.visible_to(user, &parent.kind, parent.id.as_str());
        return visible.then_some(response);
    }
    let kind = response.request.kind.clone();
    response.result.retain(|item| match item {
        Value::String(id) => prior_viewers
            .get(id)
            .is_some_and(|viewers| viewers.contains(user)),
        Value::Object(map) => map
            .get("_id")
            .and_then(Value::as_str)
            .is_some_and(|id| authority.visible_to(user, &kind, id)),
        _ => false,
    });
    (!response.result.is_empty()).then_some(response)
}

async fn send(socket: &mut WebSocket, message: &ServerMessage) -> Result<(), axum::Error> {
    match serde_json::to_string(message) {
        Ok(text) => socket.send(Message::Text(text.into())).await,
        Err(err) => {
            tracing::warn!(error = %err, "failed to encode server message");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use world_hub_core::{
        AuthorityConfig, DocumentKind, DocumentTypes, OperationOptions, User, UserRole, Users,
    };

    fn state() -> AppState {
        let authority = Arc::new(Authority::new(
            AuthorityConfig::default(),
            DocumentTypes::standard(),
            Users::new([
                User::new("gm", "Game Master", UserRole::GameMaster),
                User::new("p1", "Player One", UserRole::Player),
            ]),
        ));
        AppState::new(authority, Arc::new(crate::auth::Hs256Verifier::new("secret".into())))
    }

    fn send_request(state: &AppState, user: &str, request: Request) -> Applied {
        let mut rx = state.events.subscribe();
        let text = serde_json::to_string(&ClientMessage::Request(request)).unwrap();
        let reply = dispatch(state, Uuid::new_v4(), &UserId::from(user), &text);
        assert!(matches!(reply, ServerMessage::Response(_)), "{reply:?}");
        rx.try_recv().unwrap()
    }

    #[test]
    fn broadcasts_hide_documents_the_user_cannot_see() {
        let state = state();
        let created = send_request(
            &state,
            "gm",
            Request::new(
                Operation::Create,
                DocumentKind::ACTOR,
                None,
                vec![
                    json!({"name": "Secret", "type": "npc"}),
                    json!({"name": "Open", "type": "npc", "ownership": {"default": 2}}),
                ],
                OperationOptions::default(),
            ),
        );
        let ids: Vec<Value> = created
            .response
            .result
            .iter()
            .map(|source| source["_id"].clone())
            .collect();

        let seen = visible_part(&state.authority, &UserId::from("p1"), created.clone()).unwrap();
        assert_eq!(seen.result.len(), 1);
        assert_eq!(seen.result[0]["name"], "Open");
        let all = visible_part(&state.authority, &UserId::from("gm"), created).unwrap();
        assert_eq!(all.result.len(), 2);

        let deleted = send_request(
            &state,
            "gm",
            Request::new(
                Operation::Delete,
                DocumentKind::ACTOR,
                None,
                ids.clone(),
                OperationOptions::default(),
            ),
        );
        let seen = visible_part(&state.authority, &UserId::from("p1"), deleted.clone()).unwrap();
        assert_eq!(seen.result, vec![ids[1].clone()]);
        let all = visible_part(&state.authority, &UserId::from("gm"), deleted).unwrap();
        assert_eq!(all.result, ids);
    }

    #[test]
    fn hidden_deletes_are_not_broadcast() {
        let state = state();
        let created = send_request(
            &state,
            "gm",
            Request::new(
                Operation::Create,
                DocumentKind::ACTOR,
                None,
                vec![json!({"name": "Secret", "type": "npc"})],
                OperationOptions::default(),
            ),
        );
        let id = created.response.result[0]["_id"].clone();
        let deleted = send_request(
            &state,
            "gm",
            Request::new(
                Operation::Delete,
                DocumentKind::ACTOR,
                None,
                vec![id],
                OperationOptions::default(),
            ),
        );
        assert!(visible_part(&state.authority, &UserId::from("p1"), deleted).is_none());
    }

    #[test]
    fn malformed_messages_are_rejected_with_their_id() {
        let state = state();
        let id = Uuid::new_v4();
        let text = json!({"type": "request", "requestId": id.to_string()}).to_string();
        match dispatch(&state, Uuid::new_v4(), &UserId::from("gm"), &text) {
            ServerMessage::Rejected { request_id, .. } => assert_eq!(request_id, id),
            other => panic!("unexpected reply {other:?}"),
        }
    }
}
