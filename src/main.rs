use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chrono::Utc;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gatehouse::auth::opaque;
use gatehouse::cli::{self, Commands, KeysetCommands, SigningKeyCommands, TokenCommands};
use gatehouse::config::{self, Config};
use gatehouse::crypto::migration::{self, MigrationOptions};
use gatehouse::crypto::{Envelope, Keyset};
use gatehouse::features::{MemorySetStore, RedisSetStore, SetStore};
use gatehouse::integrations::catalog::{self, BuilderRegistry, Catalog};
use gatehouse::store::memory::MemoryStore;
use gatehouse::store::postgres::{PgStore, SealedColumn};
use gatehouse::store::{ApiTokenRecord, IdentityStore, PersonalAccessTokenRecord};
use gatehouse::tokens::{JwksCache, JwksValidator, TokenConfig, TokenManager, TokenValidator};
use gatehouse::{api, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cfg = config::load()?;
    let args = cli::Cli::parse();

    let result = match args.command {
        Some(Commands::Serve { port, memory }) => run_server(cfg, port, memory).await,
        Some(Commands::Keyset { command }) => handle_keyset_command(&cfg, command),
        Some(Commands::SigningKey { command }) => handle_signing_key_command(command),
        Some(Commands::EncryptColumn {
            table,
            column,
            batch_size,
            progress_every,
        }) => {
            let column = SealedColumn::parse(&table, &column)
                .with_context(|| format!("{}.{} is not a secret column", table, column))?;
            let envelope = Envelope::from_base64(cfg.keyset.as_deref())?;
            let db = PgStore::connect(&cfg.database_url).await?;
            let source = db.sealed_column(column);
            let report = migration::encrypt_column(
                &source,
                &envelope,
                MigrationOptions {
                    batch_size,
                    progress_every,
                },
            )
            .await?;
            println!(
                "scanned {} rows: encrypted {}, already encrypted {}",
                report.scanned, report.encrypted, report.skipped
            );
            Ok(())
        }
        Some(Commands::Token { command }) => {
            let envelope = Envelope::from_base64(cfg.keyset.as_deref())?;
            let db = PgStore::connect(&cfg.database_url).await?;
            handle_token_command(&db, &envelope, command).await
        }
        None => run_server(cfg, None, false).await,
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,gatehouse=debug"));
    let json = std::env::var("GATEHOUSE_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn token_manager(cfg: &Config) -> anyhow::Result<TokenManager> {
    let token_cfg = TokenConfig::from_config(cfg);
    match &cfg.signing_key {
        Some(encoded) => {
            let pkcs8 = B64
                .decode(encoded.trim())
                .context("GATEHOUSE_SIGNING_KEY is not valid base64")?;
            Ok(TokenManager::from_pkcs8(token_cfg, cfg.signing_kid.clone(), &pkcs8)?)
        }
        None => {
            tracing::warn!("GATEHOUSE_SIGNING_KEY not set; using an ephemeral signing key");
            Ok(TokenManager::generate(token_cfg)?)
        }
    }
}

async fn run_server(cfg: Config, port: Option<u16>, memory: bool) -> anyhow::Result<()> {
    let envelope = Envelope::from_base64(cfg.keyset.as_deref())
        .context("loading OPENLANE_TINK_KEYSET")?;
    let tokens = Arc::new(token_manager(&cfg)?);

    let http = reqwest::Client::builder()
        .timeout(cfg.http_timeout)
        .connect_timeout(Duration::from_secs(5))
        .build()
        .context("building http client")?;

    let jwks_cache = match &cfg.jwks_url {
        Some(url) => {
            tracing::info!(url = %url, "using remote jwks");
            let cache = Arc::new(JwksCache::remote(url.clone(), http.clone(), cfg.jwks_min_refresh));
            cache.refresh().await.context("initial jwks fetch")?;
            cache
        }
        None => Arc::new(JwksCache::local(&tokens.jwks())),
    };
    let validator: Arc<dyn TokenValidator> =
        Arc::new(JwksValidator::new(jwks_cache.clone(), tokens.verify_settings()));

    let specs = match &cfg.provider_specs_path {
        Some(path) => catalog::load_specs(path)?,
        None => Vec::new(),
    };
    let catalog = Catalog::build(&specs, &BuilderRegistry::default())?;
    tracing::info!(providers = catalog.len(), "provider catalog loaded");

    let port = port.unwrap_or(cfg.port);
    let state = if memory {
        tracing::warn!("serving from in-memory stores; nothing is persisted");
        let feature_store: Arc<dyn SetStore> = Arc::new(MemorySetStore::default());
        AppState::assemble(
            cfg,
            tokens,
            validator,
            Arc::new(MemoryStore::new()),
            envelope,
            catalog,
            feature_store,
            http,
        )
    } else {
        tracing::info!("Connecting to database...");
        let db = PgStore::connect(&cfg.database_url).await?;
        tracing::info!("Running migrations...");
        db.migrate().await?;

        tracing::info!("Connecting to Redis...");
        let redis_client = redis::Client::open(cfg.redis_url.as_str())?;
        let redis_conn = redis::aio::ConnectionManager::new(redis_client).await?;
        let feature_store: Arc<dyn SetStore> = Arc::new(RedisSetStore::new(redis_conn));

        AppState::assemble(
            cfg,
            tokens,
            validator,
            Arc::new(db),
            envelope,
            catalog,
            feature_store,
            http,
        )
    };
    let state = Arc::new(state);

    let cancel = CancellationToken::new();
    let refresher = jwks_cache.spawn_refresher(cancel.clone());

    let app = api::router(state.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("gatehouse listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down");
    cancel.cancel();
    if let Some(handle) = refresher {
        let _ = handle.await;
    }
    state
        .runner
        .pool()
        .drain(tokio::time::Instant::now() + Duration::from_secs(10))
        .await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => tracing::error!("failed to install SIGTERM handler: {}", e),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn handle_keyset_command(cfg: &Config, cmd: KeysetCommands) -> anyhow::Result<()> {
    let load = || -> anyhow::Result<Keyset> {
        let encoded = cfg
            .keyset
            .as_deref()
            .context("OPENLANE_TINK_KEYSET is not set")?;
        Ok(Keyset::from_base64(encoded)?)
    };

    match cmd {
        KeysetCommands::Generate => {
            println!("{}", Keyset::generate().to_base64()?);
        }
        KeysetCommands::Rotate => {
            let mut keyset = load()?;
            let id = keyset.rotate();
            eprintln!("new primary key id: {}", id);
            println!("{}", keyset.to_base64()?);
        }
        KeysetCommands::DisableOld { keep } => {
            let mut keyset = load()?;
            let disabled = keyset.disable_old_keys(keep);
            eprintln!("disabled {} keys", disabled);
            println!("{}", keyset.to_base64()?);
        }
        KeysetCommands::Info => {
            let keyset = load()?;
            println!("{}", serde_json::to_string_pretty(&keyset.info())?);
        }
    }
    Ok(())
}

fn handle_signing_key_command(cmd: SigningKeyCommands) -> anyhow::Result<()> {
    match cmd {
        SigningKeyCommands::Generate => {
            let pkcs8 = TokenManager::generate_pkcs8()?;
            println!("{}", B64.encode(pkcs8));
        }
    }
    Ok(())
}

async fn handle_token_command(
    db: &PgStore,
    envelope: &Envelope,
    cmd: TokenCommands,
) -> anyhow::Result<()> {
    let expiry = |days: Option<i64>| days.map(|d| Utc::now() + chrono::Duration::days(d));

    match cmd {
        TokenCommands::CreatePat {
            user_id,
            name,
            organization_ids,
            expires_in_days,
        } => {
            if db.find_user(&user_id).await?.is_none() {
                anyhow::bail!("user {} not found", user_id);
            }
            let issued = opaque::issue(opaque::PAT_PREFIX, envelope)?;
            let id = uuid::Uuid::new_v4().to_string();
            db.insert_personal_access_token(PersonalAccessTokenRecord {
                id: id.clone(),
                owner_id: user_id,
                name,
                token_hash: issued.token_hash,
                encrypted_token: issued.encrypted_token,
                expires_at: expiry(expires_in_days),
                organization_ids,
                sso_authorizations: Default::default(),
                last_used_at: None,
            })
            .await?;
            println!("Token ID: {}", id);
            println!("Token:    {}", issued.plaintext);
            println!("(the token is shown only once)");
        }
        TokenCommands::CreateApi {
            organization_id,
            name,
            scopes,
            expires_in_days,
        } => {
            if db.find_organization(&organization_id).await?.is_none() {
                anyhow::bail!("organization {} not found", organization_id);
            }
            let issued = opaque::issue(opaque::API_TOKEN_PREFIX, envelope)?;
            let id = uuid::Uuid::new_v4().to_string();
            db.insert_api_token(ApiTokenRecord {
                id: id.clone(),
                owner_id: organization_id,
                name,
                token_hash: issued.token_hash,
                encrypted_token: issued.encrypted_token,
                expires_at: expiry(expires_in_days),
                scopes,
                sso_authorizations: Default::default(),
                last_used_at: None,
            })
            .await?;
            println!("Token ID: {}", id);
            println!("Token:    {}", issued.plaintext);
            println!("(the token is shown only once)");
        }
    }
    Ok(())
}
