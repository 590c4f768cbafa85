pub mod auth;
pub mod config;
pub mod constants;
pub mod dispatch;
pub mod error;
pub mod logger;
pub mod mappers;
pub mod quota;
pub mod server;
pub mod upstream;

use crate::auth::AuthManager;
use crate::config::AppConfig;
use crate::dispatch::Orchestrator;
use crate::error::AppResult;
use crate::quota::QuotaTracker;
use crate::server::AppState;
use crate::upstream::UpstreamClient;
use std::sync::Arc;
use tracing::{error, info, warn};

async fn start_runtime() -> AppResult<()> {
    let config = Arc::new(AppConfig::load()?);
    logger::init_logger(config.debug);

    let client = Arc::new(UpstreamClient::new(&config)?);
    let auth = AuthManager::new(client.clone(), constants::AUTHS_DIR);

    match auth.load_accounts().await {
        Ok(0) => warn!("No usable accounts in ./{}", constants::AUTHS_DIR),
        Ok(count) => info!("Serving with {} account(s)", count),
        Err(e) => warn!("Account load failed: {}", e),
    }

    let quota = QuotaTracker::new();
    quota.start_refresher(auth.clone(), client.clone(), config.quota_refresh_s);

    let orchestrator = Orchestrator::new(
        auth.clone(),
        quota.clone(),
        client.clone(),
        config.retry_delay_ms,
    );

    let state = AppState {
        config,
        auth,
        quota,
        orchestrator,
    };

    tokio::select! {
        result = server::serve(state) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    }
}

pub fn run() {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to create Tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    runtime.block_on(async {
        if let Err(e) = start_runtime().await {
            error!("Startup failed: {}", e);
            std::process::exit(1);
        }
    });
}
