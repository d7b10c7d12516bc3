use anyhow::Result;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use world_hub::api::{self, AppState};
use world_hub::auth::Hs256Verifier;
use world_hub::config::Config;
use world_hub_core::document::FlagScopes;
use world_hub_core::{Authority, AuthorityConfig, DocumentTypes, User, UserId, UserRole, Users};

#[derive(Parser)]
#[command(name = "world-hub")]
#[command(about = "Replicated, permission-gated document store")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Host a world over WebSocket
    Serve {
        #[arg(long)]
        addr: Option<SocketAddr>,
        #[arg(long)]
        secret: Option<String>,
        /// JSON array of users
        #[arg(long)]
        users: Option<PathBuf>,
        #[arg(long)]
        system_id: Option<String>,
        /// Comma-separated active module ids
        #[arg(long, value_delimiter = ',')]
        modules: Vec<String>,
        /// Trust the X-User-Id header without a token (development only)
        #[arg(long)]
        allow_user_header: bool,
    },
    /// Mint an access token for a user
    Token {
        #[arg(long)]
        user: String,
        #[arg(long)]
        secret: Option<String>,
        #[arg(long, default_value_t = 24)]
        ttl_hours: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;

    match cli.command {
        Commands::Serve {
            addr,
            secret,
            users,
            system_id,
            modules,
            allow_user_header,
        } => {
            if let Some(addr) = addr {
                config.addr = addr;
            }
            if let Some(secret) = secret {
                config.secret = secret;
            }
            if users.is_some() {
                config.users = users;
            }
            if system_id.is_some() {
                config.system_id = system_id;
            }
            if !modules.is_empty() {
                config.modules = modules;
            }
            config.allow_user_header |= allow_user_header;
            serve(config).await
        }
        Commands::Token {
            user,
            secret,
            ttl_hours,
        } => {
            let verifier = Hs256Verifier::new(secret.unwrap_or(config.secret));
            let token = verifier.issue(&UserId::from(user), chrono::Duration::hours(ttl_hours))?;
            println!("{token}");
            Ok(())
        }
    }
}

async fn serve(config: Config) -> Result<()> {
    let users = match &config.users {
        Some(path) => Users::from_json_file(path)?,
        None => Users::new([User::new("gm", "Game Master", UserRole::GameMaster)]),
    };
    tracing::info!(users = users.len(), system = ?config.system_id, "loading world");

    let authority = Authority::new(
        AuthorityConfig {
            flag_scopes: FlagScopes::new(config.system_id.clone(), config.modules.clone()),
            ..AuthorityConfig::default()
        },
        DocumentTypes::standard(),
        users,
    );
    let state = AppState::new(
        Arc::new(authority),
        Arc::new(Hs256Verifier::new(config.secret.clone())),
    )
    .with_user_header(config.allow_user_header);
    if config.allow_user_header {
        tracing::warn!("accepting unauthenticated X-User-Id headers");
    }

    let listener = TcpListener::bind(config.addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, api::router(state)).await?;
    Ok(())
}
