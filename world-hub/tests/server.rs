use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use world_hub::api::{self, AppState};
use world_hub::auth::Hs256Verifier;
use world_hub::client::{Credentials, WsTransport};
use world_hub::protocol::{ClientMessage, ServerMessage};
use world_hub_core::error::{DocumentError, TransportError};
use world_hub_core::{
    Authority, AuthorityConfig, DocumentKind, DocumentTypes, Flow, Hook, Operation,
    OperationOptions, Registry, RegistryConfig, Request, User, UserId, UserRole, Users,
};

const SECRET: &str = "test-secret";

type Server = (SocketAddr, Arc<Authority>, JoinHandle<std::io::Result<()>>);

async fn start() -> Result<Server> {
    start_with(true).await
}

async fn start_with(allow_user_header: bool) -> Result<Server> {
    let authority = Arc::new(Authority::new(
        AuthorityConfig::default(),
        DocumentTypes::standard(),
        Users::new([
            User::new("gm", "Game Master", UserRole::GameMaster),
            User::new("p1", "Player One", UserRole::Player),
        ]),
    ));
    let verifier = Arc::new(Hs256Verifier::new(SECRET.into()));
    let state = AppState::new(authority.clone(), verifier).with_user_header(allow_user_header);
    let app = api::router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server = tokio::spawn(axum::serve(listener, app.into_make_service()).into_future());
    Ok((addr, authority, server))
}

async fn connect(
    addr: SocketAddr,
    user: &str,
    credentials: Credentials,
) -> Result<(Registry, Arc<WsTransport>)> {
    let url = format!("ws://{addr}/ws");
    let transport = Arc::new(WsTransport::connect(&url, credentials).await?);
    let role = if user == "gm" { UserRole::GameMaster } else { UserRole::Player };
    let registry = Registry::new(
        RegistryConfig::default(),
        DocumentTypes::standard(),
        transport.clone(),
        User::new(user, user, role),
    );
    transport.follow(registry.clone());
    Ok((registry, transport))
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn changes_reach_other_clients() -> Result<()> {
    let (addr, authority, server) = start().await?;
    let token = Hs256Verifier::new(SECRET.into())
        .issue(&UserId::from("gm"), chrono::Duration::hours(1))?;
    let (gm, _gm_transport) = connect(addr, "gm", Credentials::Token(token)).await?;
    let (p1, _p1_transport) = connect(addr, "p1", Credentials::User(UserId::from("p1"))).await?;

    let created = Arc::new(AtomicUsize::new(0));
    let counter = created.clone();
    p1.hooks().on(Hook::create(DocumentKind::ACTOR), move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Flow::Continue)
    });

    let goblin = gm
        .create_document(
            &DocumentKind::ACTOR,
            json!({"name": "Goblin", "type": "npc", "ownership": {"default": "OBSERVER"}}),
            OperationOptions::default(),
        )
        .await?
        .expect("created");
    let id = goblin.id().expect("stored").to_string();
    assert_eq!(authority.count(&DocumentKind::ACTOR), 1);

    assert!(eventually(|| p1.get(&DocumentKind::ACTOR, &id).is_some()).await);
    assert!(eventually(|| created.load(Ordering::SeqCst) == 1).await);

    gm.update_document(&goblin, json!({"name": "Hobgoblin"}), OperationOptions::default())
        .await?;
    assert!(
        eventually(|| {
            p1.get(&DocumentKind::ACTOR, &id)
                .is_some_and(|d| d.name() == Some("Hobgoblin"))
        })
        .await
    );

    let mirror = p1.get(&DocumentKind::ACTOR, &id).expect("mirrored");
    let denied = p1
        .update_document(&mirror, json!({"name": "Mine"}), OperationOptions::default())
        .await;
    assert!(matches!(denied, Err(DocumentError::Permission(_))));

    let hobgoblin = gm.get(&DocumentKind::ACTOR, &id).expect("held");
    gm.delete_document(&hobgoblin, OperationOptions::default()).await?;
    assert!(eventually(|| p1.get(&DocumentKind::ACTOR, &id).is_none()).await);
    assert_eq!(authority.count(&DocumentKind::ACTOR), 0);

    server.abort();
    Ok(())
}

#[tokio::test]
async fn hidden_documents_are_not_broadcast() -> Result<()> {
    let (addr, _authority, server) = start().await?;
    let (gm, _gm_transport) = connect(addr, "gm", Credentials::User(UserId::from("gm"))).await?;
    let (p1, _p1_transport) = connect(addr, "p1", Credentials::User(UserId::from("p1"))).await?;

    gm.create(
        &DocumentKind::ACTOR,
        vec![
            json!({"name": "Secret", "type": "npc"}),
            json!({"name": "Public", "type": "npc", "ownership": {"default": "LIMITED"}}),
        ],
        OperationOptions::default(),
    )
    .await?;

    assert!(eventually(|| p1.get_name(&DocumentKind::ACTOR, "Public").is_some()).await);
    assert!(p1.get_name(&DocumentKind::ACTOR, "Secret").is_none());

    let (late, _late_transport) = connect(addr, "p1", Credentials::User(UserId::from("p1"))).await?;
    assert_eq!(late.load_world().await?, 1);

    server.abort();
    Ok(())
}

#[tokio::test]
async fn authority_rejections_come_back_as_errors() -> Result<()> {
    let (addr, authority, server) = start().await?;
    let credentials = Credentials::User(UserId::from("p1"));
    let transport = WsTransport::connect(&format!("ws://{addr}/ws"), credentials).await?;

    // a Scene needs an assistant or better
    let request = Request::new(
        Operation::Create,
        DocumentKind::SCENE,
        None,
        vec![json!({"name": "Keep"})],
        OperationOptions::default(),
    );
    let result = world_hub_core::Transport::request(&transport, request).await;
    assert!(matches!(result, Err(TransportError::Rejected(_))));
    assert_eq!(authority.count(&DocumentKind::SCENE), 0);

    server.abort();
    Ok(())
}

#[tokio::test]
async fn connections_need_a_known_user() -> Result<()> {
    let (addr, _authority, server) = start().await?;
    let url = format!("ws://{addr}/ws");

    assert!(connect_async(url.as_str()).await.is_err());

    let mut request = url.as_str().into_client_request()?;
    request.headers_mut().insert("X-User-Id", "stranger".parse()?);
    assert!(connect_async(request).await.is_err());

    let mut request = url.as_str().into_client_request()?;
    request.headers_mut().insert("Authorization", "Bearer forged".parse()?);
    assert!(connect_async(request).await.is_err());

    // a failed token never falls back to the header
    let mut request = url.as_str().into_client_request()?;
    request.headers_mut().insert("Authorization", "Bearer forged".parse()?);
    request.headers_mut().insert("X-User-Id", "gm".parse()?);
    assert!(connect_async(request).await.is_err());

    server.abort();
    Ok(())
}

#[tokio::test]
async fn user_header_is_refused_unless_enabled() -> Result<()> {
    let (addr, _authority, server) = start_with(false).await?;
    let url = format!("ws://{addr}/ws");

    let mut request = url.as_str().into_client_request()?;
    request.headers_mut().insert("X-User-Id", "gm".parse()?);
    assert!(connect_async(request).await.is_err());
    let header_only = WsTransport::connect(&url, Credentials::User(UserId::from("gm"))).await;
    assert!(matches!(header_only, Err(TransportError::Disconnected)));

    let token = Hs256Verifier::new(SECRET.into())
        .issue(&UserId::from("gm"), chrono::Duration::hours(1))?;
    let (gm, _transport) = connect(addr, "gm", Credentials::Token(token)).await?;
    assert_eq!(gm.load_world().await?, 0);

    server.abort();
    Ok(())
}

#[tokio::test]
async fn raw_protocol_round_trip() -> Result<()> {
    let (addr, _authority, server) = start().await?;
    let mut request = format!("ws://{addr}/ws").into_client_request()?;
    request.headers_mut().insert("X-User-Id", "gm".parse()?);
    let (mut ws, _) = connect_async(request).await?;

    let message = ClientMessage::Request(Request::new(
        Operation::Create,
        DocumentKind::FOLDER,
        None,
        vec![json!({"name": "Monsters", "type": "Actor"})],
        OperationOptions::default(),
    ));
    let request_id = message.request_id();
    ws.send(Message::Text(serde_json::to_string(&message)?.into())).await?;

    let Some(Ok(Message::Text(text))) = ws.next().await else {
        panic!("no reply");
    };
    match serde_json::from_str::<ServerMessage>(text.as_str())? {
        ServerMessage::Response(response) => {
            assert_eq!(response.request.request_id, request_id);
            assert_eq!(response.user_id.as_str(), "gm");
            assert_eq!(response.result[0]["name"], "Monsters");
            assert!(response.result[0]["_id"].is_string());
        }
        other => panic!("unexpected reply {other:?}"),
    }

    server.abort();
    Ok(())
}
