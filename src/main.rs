use anyhow::Result;
use event_router::cache::TranslationCache;
use event_router::config::Config;
use event_router::db;
use event_router::dispatch::Dispatcher;
use event_router::downstream::ActionClient;
use event_router::ratelimit::{
    CounterStore, PostgresCounterStore, RateLimiter, RedisCounterStore,
};
use event_router::server::{build_router, AppState};
use event_router::translation::{Enricher, Provider};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (ignored in production)
    let _ = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("event_router=info".parse()?),
        )
        .init();

    info!("Starting event router");

    // Load configuration from environment
    let config = Config::from_env()?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.provider_timeout_secs))
        .build()?;

    // Durable store: rate-limit fallback + handler-response inbox.
    // Startup proceeds without it; the limiter degrades accordingly.
    let pool = match &config.database_url {
        Some(url) => match db::connect(url).await {
            Ok(pool) => {
                db::init_schema(&pool).await?;
                info!("Connected to Postgres");
                Some(pool)
            }
            Err(e) => {
                warn!("Postgres unavailable, running without durable store: {e:#}");
                None
            }
        },
        None => {
            info!("DATABASE_URL not set, running without durable store");
            None
        }
    };

    // Primary counter store
    let primary = match &config.redis_url {
        Some(url) => match RedisCounterStore::connect(url).await {
            Ok(store) => {
                info!("Connected to Redis");
                Some(CounterStore::Redis(store))
            }
            Err(e) => {
                warn!("Redis unavailable, rate limiting falls back to Postgres: {e:#}");
                None
            }
        },
        None => {
            info!("REDIS_URL not set, rate limiting uses the durable store only");
            None
        }
    };
    let fallback = pool
        .clone()
        .map(|pool| CounterStore::Postgres(PostgresCounterStore::new(pool)));

    let limiter = Arc::new(RateLimiter::new(
        primary,
        fallback,
        config.rate_limits.clone(),
        Duration::from_secs(config.store_timeout_secs),
    ));

    let cache = Arc::new(TranslationCache::new(config.translation_cache_size));
    let provider = Provider::from_config(&config, client.clone())?;
    info!("Translation provider: {}", provider.name());
    let enricher = Enricher::new(provider, cache.clone(), &config);

    let downstream = ActionClient::new(
        client,
        config.downstream_url.clone(),
        Duration::from_secs(config.downstream_timeout_secs),
    );

    let dispatcher = Arc::new(Dispatcher::new(
        enricher,
        limiter.clone(),
        downstream,
        config.batch_concurrency,
    ));

    // Periodically drop expired counter rows from the fallback table
    if let Some(pool) = pool.clone() {
        tokio::spawn(async move {
            let store = PostgresCounterStore::new(pool);
            let mut interval = tokio::time::interval(Duration::from_secs(600));
            loop {
                interval.tick().await;
                match store.purge_expired().await {
                    Ok(purged) if purged > 0 => {
                        info!("Purged {} expired rate-limit buckets", purged)
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Counter purge failed: {e:#}"),
                }
            }
        });
    }

    let port = config.port;
    let state = AppState {
        config: Arc::new(config),
        dispatcher,
        limiter,
        cache,
        pool,
    };

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Listening on port {}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
    }
}
