// SPDX-License-Identifier: PMPL-1.0-or-later
//! ThreadLog API server binary
//!
//! Opens the store (replaying the WAL) and starts the HTTP API server.

use threadlog_api::ApiConfig;
use threadlog_store::{LogStore, StoreConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("THREADLOG_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let store_config = StoreConfig::from_env()?;
    let api_config = ApiConfig::from_env()?;

    tracing::info!(
        data_dir = %store_config.data_dir.display(),
        "Opening ThreadLog store"
    );
    let store = LogStore::open(store_config).await?;

    threadlog_api::serve(api_config, store).await?;

    Ok(())
}
