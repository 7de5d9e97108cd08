use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use tokio::net::TcpListener;
use tower::make::Shared;
use tracing_subscriber::EnvFilter;

use qrdocs::config::AppConfig;
use qrdocs::db;
use qrdocs::repo::PgRepository;
use qrdocs::routes;
use qrdocs::state::AppState;
use qrdocs::storage::S3Storage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "server",
        database_url = %config.redacted_database_url(),
        pool_size = config.database_max_pool_size,
        server_host = %config.server_host,
        server_port = config.server_port,
        s3_bucket = %config.s3_bucket,
        orphan_sweep_enabled = config.orphan_sweep_interval_seconds.is_some(),
        "loaded configuration"
    );

    let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
    let applied = db::run_migrations(&pool)?;
    if applied > 0 {
        tracing::info!(applied, "applied pending migrations");
    }

    let storage = Arc::new(S3Storage::from_config(&config).await?);
    let repo = Arc::new(PgRepository::new(pool));
    let state = AppState::new(repo, config, storage);

    if let Some(interval_secs) = state.config.orphan_sweep_interval_seconds {
        let reaper = state.reaper.clone();
        let max_age = ChronoDuration::minutes(state.config.orphan_max_age_minutes);
        tokio::spawn(async move {
            reaper
                .run(Duration::from_secs(interval_secs.max(1)), max_age)
                .await;
        });
    }

    let listen_addr: SocketAddr =
        format!("{}:{}", state.config.server_host, state.config.server_port).parse()?;
    let router = routes::create_router(state);

    let listener = TcpListener::bind(listen_addr).await?;
    tracing::info!("listening on {}", listen_addr);

    axum::serve(listener, Shared::new(router)).await?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
