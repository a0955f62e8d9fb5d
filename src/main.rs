use anyhow::Context;
use axum_chat_relay::prelude::*;
use axum_chat_relay::protocol::UserId;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("axum_chat_relay=info".parse()?)
                .add_directive("chat_relay=info".parse()?),
        )
        .init();

    let config = RelayConfig::from_env().context("invalid relay configuration")?;
    info!(?config, "Starting chat relay.");

    match config.store {
        StoreBackend::Memory => serve(Arc::new(MemoryStore::new()), &config).await,
        #[cfg(feature = "redis-store")]
        StoreBackend::Redis => {
            let store = RedisStore::connect(&config.redis_url)
                .await
                .context("failed to connect to Redis")?;
            serve(Arc::new(store), &config).await
        }
        #[cfg(not(feature = "redis-store"))]
        StoreBackend::Redis => anyhow::bail!("built without the `redis-store` feature"),
    }
}

async fn serve<S>(store: Arc<S>, config: &RelayConfig) -> anyhow::Result<()>
where
    S: ChatStore + TokenValidator<User = UserId>,
{
    let relay = RelayService::new(store, config);
    let app = router(Arc::clone(&relay));

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!("Listening on {}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received.");
            relay.shutdown().await;
        })
        .await
        .context("server error")
}
