use clap::{Parser, ValueEnum};
use propdesk_core::{PropdeskConfig, StorageConfig, TokenConfig};
use propdesk_service::{build_router, BootstrapAdmin, ServiceConfig, ServiceState};
use std::net::SocketAddr;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StorageMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(name = "propdeskd", version, about = "Propdesk request desk REST service")]
struct Cli {
    /// REST socket address to bind, e.g. 127.0.0.1:8095
    #[arg(long, default_value = "127.0.0.1:8095")]
    listen: SocketAddr,
    /// Persistence backend. `auto` picks postgres when a database url is configured.
    #[arg(long, value_enum, default_value_t = StorageMode::Auto, env = "PROPDESK_STORAGE")]
    storage: StorageMode,
    /// PostgreSQL url; falls back to DATABASE_URL.
    #[arg(long, env = "PROPDESK_DATABASE_URL")]
    database_url: Option<String>,
    /// Max PostgreSQL pool connections.
    #[arg(long, default_value_t = 5, env = "PROPDESK_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,
    /// HMAC secret for bearer tokens, at least 32 bytes.
    #[arg(long, env = "PROPDESK_TOKEN_SECRET", hide_env_values = true)]
    token_secret: Option<String>,
    /// Bearer token lifetime in hours, 1 to 2160.
    #[arg(
        long,
        default_value_t = 24,
        env = "PROPDESK_TOKEN_TTL_HOURS",
        value_parser = clap::value_parser!(u32).range(1..=2160)
    )]
    token_ttl_hours: u32,
    #[arg(long, default_value = "propdesk", env = "PROPDESK_TOKEN_ISSUER")]
    token_issuer: String,
    /// Administrator seeded into an empty store.
    #[arg(long, env = "PROPDESK_BOOTSTRAP_ADMIN_EMAIL")]
    bootstrap_admin_email: Option<String>,
    #[arg(long, env = "PROPDESK_BOOTSTRAP_ADMIN_PASSWORD", hide_env_values = true)]
    bootstrap_admin_password: Option<String>,
}

fn resolve_storage(cli: &Cli) -> anyhow::Result<StorageConfig> {
    let resolved_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let storage = match cli.storage {
        StorageMode::Memory => StorageConfig::Memory,
        StorageMode::Postgres => {
            let database_url = resolved_url.ok_or_else(|| {
                anyhow::anyhow!("storage=postgres requires --database-url or DATABASE_URL")
            })?;
            StorageConfig::postgres(database_url, cli.pg_max_connections)
        }
        StorageMode::Auto => match resolved_url {
            Some(database_url) => StorageConfig::postgres(database_url, cli.pg_max_connections),
            None => StorageConfig::Memory,
        },
    };

    Ok(storage)
}

fn resolve_tokens(cli: &Cli) -> anyhow::Result<TokenConfig> {
    let base = match &cli.token_secret {
        Some(secret) => TokenConfig::try_new(secret.clone())?,
        None => {
            warn!("no token secret configured, using the built-in development secret");
            TokenConfig::default()
        }
    };
    Ok(base
        .with_issuer(cli.token_issuer.clone())
        .with_ttl_hours(cli.token_ttl_hours)?)
}

fn resolve_admin(cli: &Cli) -> anyhow::Result<Option<BootstrapAdmin>> {
    match (&cli.bootstrap_admin_email, &cli.bootstrap_admin_password) {
        (Some(email), Some(password)) => Ok(Some(BootstrapAdmin {
            email: email.clone(),
            password: password.clone(),
        })),
        (None, None) => Ok(None),
        _ => anyhow::bail!(
            "--bootstrap-admin-email and --bootstrap-admin-password must be given together"
        ),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "propdesk_service=info,propdesk_core=info,info".to_string()),
        )
        .init();

    let cli = Cli::parse();
    let config = ServiceConfig {
        desk: PropdeskConfig {
            storage: resolve_storage(&cli)?,
            tokens: resolve_tokens(&cli)?,
        },
        bootstrap_admin: resolve_admin(&cli)?,
    };
    let state = ServiceState::bootstrap(config).await?;
    info!(backend = state.desk.storage_label(), "propdesk storage ready");
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!("propdesk-service REST listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
