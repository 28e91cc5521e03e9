use anyhow::Context;
use ordo_api::{app, state::{AppState, AuthConfig}, worker};
use ordo_order::{CancellationEngine, RecoveryRelay};
use ordo_store::{Config, DbClient, HttpPaymentGateway, PgOrderStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ordo_api=debug,ordo_order=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;
    tracing::info!("Starting Ordo API on port {}", config.server.port);

    let db = DbClient::new(&config.database)
        .await
        .context("Failed to connect to Postgres")?;
    db.migrate().await.context("Failed to run migrations")?;

    let store = Arc::new(PgOrderStore::new(db.pool.clone()));
    let gateway = Arc::new(
        HttpPaymentGateway::new(&config.gateway).context("Failed to build payment gateway client")?,
    );

    let engine = CancellationEngine::new(store.clone(), gateway, config.cancellation.clone())
        .with_gateway_timeout(config.gateway.timeout());

    let relay = RecoveryRelay::new(
        store,
        chrono::Duration::seconds(config.recovery.stale_after_seconds),
    );
    tokio::spawn(worker::start_recovery_worker(
        relay,
        tokio::time::Duration::from_secs(config.recovery.interval_seconds),
    ));

    let app_state = AppState {
        engine: Arc::new(engine),
        auth: AuthConfig {
            secret: config.auth.jwt_secret.clone(),
        },
    };

    let app = app(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
