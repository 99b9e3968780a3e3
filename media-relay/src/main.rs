use std::sync::Arc;

use anyhow::Context;
use media_relay::logging::init_logging;
use media_relay::{AppConfig, RelayService, ToolSet};
use tracing::{error, info};
use vlc_remote::{SessionFile, SessionRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let (logging, _guard) = init_logging(&config.log_dir).context("failed to initialize logging")?;

    info!("Starting media-relay");

    if let Err(e) = tokio::fs::create_dir_all(&config.video_dir).await {
        error!(dir = %config.video_dir.display(), error = %e, "Video directory not writable");
        return Err(e).context("failed to create video directory");
    }

    let http = vlc_remote::build_http_client(&config.player)?;
    let players = Arc::new(SessionRegistry::new(
        http.clone(),
        Some(SessionFile::new(config.session_file.clone())),
    ));

    let tools = ToolSet::system(&config, players.clone(), http);
    let service = RelayService::new(config, players, tools);
    service.start();
    logging.start_retention_cleanup(service.task_tracker(), service.shutdown_token());

    if let Err(e) = service.restore_sessions().await {
        error!(error = %e, "Failed to restore player session");
    }

    info!("media-relay ready");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("Shutdown signal received");
    service.shutdown().await;
    Ok(())
}
