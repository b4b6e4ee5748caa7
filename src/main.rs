use anyhow::Result;
use quota_throttler::config::{ServerConfig, ThrottleConfig};
use quota_throttler::policy::ThrottlePolicy;
use quota_throttler::server::Server;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Flags, environment and .env
    let config = ServerConfig::load().unwrap_or_else(|e| e.exit());

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("quota_throttler={},tower_http=debug", config.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let throttle = ThrottleConfig::try_from(&config)
        .map_err(|e| anyhow::anyhow!("Invalid throttle configuration: {}", e))?;

    tracing::info!(
        "Configuration: bind_addr={}, rule_id={}, persistent={}",
        config.bind_addr,
        throttle.rule_id,
        throttle.persistent
    );

    // Opening a store may touch the file system or network.
    let policy = tokio::task::spawn_blocking(move || ThrottlePolicy::new(throttle))
        .await?
        .map_err(|e| anyhow::anyhow!("Failed to open quota store: {}", e))?;

    Server::new(Arc::new(policy), config.bind_addr)
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
