use permission_service::{
    AppState,
    config::{AppConfig, Env},
    create_router,
    repository::{CatalogState, DirectoryState, LedgerState, PostgresRepository},
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often idle cache slots are swept.
const CACHE_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// main
///
/// Entry point: configuration, logging, database and migrations, shared state, HTTP server.
#[tokio::main]
async fn main() {
    // 1. Configuration (fail-fast on missing secrets)
    dotenv::dotenv().ok();
    let config = AppConfig::load();

    // 2. Logging: RUST_LOG wins, otherwise crate debug and request info.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "permission_service=debug,tower_http=info,axum=info".into());

    match config.env {
        Env::Local => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
        Env::Production => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
    }

    tracing::info!("Application starting in {:?} mode", config.env);

    // 3. Database
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.db_url)
        .await
        .expect("FATAL: Failed to connect to Postgres. Check DATABASE_URL.");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("FATAL: Failed to apply database migrations.");

    // One repository backs the catalog, the ledger and the role directory.
    let repo = Arc::new(PostgresRepository::new(pool));
    let catalog: CatalogState = repo.clone();
    let ledger: LedgerState = repo.clone();
    let directory: DirectoryState = repo;

    // 4. State: resolver, cache and assignment service are wired here once.
    let bind_addr = config.bind_addr.clone();
    let app_state = AppState::new(catalog, ledger, directory, config);

    let cache = app_state.cache.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CACHE_PRUNE_INTERVAL);
        loop {
            ticker.tick().await;
            let removed = cache.prune();
            if removed > 0 {
                tracing::debug!(removed, "pruned idle permission cache slots");
            }
        }
    });

    // 5. Router and server
    let app = create_router(app_state);

    let listener = TcpListener::bind(&bind_addr)
        .await
        .expect("FATAL: Failed to bind the HTTP listener. Check BIND_ADDR.");

    tracing::info!("Listening on {}", bind_addr);
    tracing::info!("API Documentation (Swagger UI) available at: http://{}/swagger-ui", bind_addr);

    axum::serve(listener, app).await.expect("HTTP server error");
}
