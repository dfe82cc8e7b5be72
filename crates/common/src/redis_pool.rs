use redis::Client;
use redis::aio::ConnectionManager;

/// Connect to Redis for the notification read cache.
///
/// Issues a `PING` so a bad `REDIS_URL` surfaces at startup instead of on the
/// first cached lookup.
pub async fn create_redis_pool(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let client = Client::open(redis_url)?;
    let mut manager = ConnectionManager::new(client).await?;

    let _: String = redis::cmd("PING").query_async(&mut manager).await?;

    tracing::info!("Connected to Redis");
    Ok(manager)
}
