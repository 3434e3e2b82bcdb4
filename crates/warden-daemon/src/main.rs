use anyhow::Result;

use warden_daemon::server::{self, AppConfig};
use warden_daemon::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_env()?;
    telemetry::init(&config.log_level, config.log_format)?;
    server::run(config).await
}
