// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Gram Server - Deployment Pipeline
//!
//! An HTTP server responsible for:
//! - Asset uploads (OpenAPI documents, images, chat attachments, functions)
//! - Deployments and their event logs
//! - The deployment workflow worker
//! - Function runner deploys and reaping

use tracing::{info, warn};

use gram_server::config::Config;
use gram_server::runtime::GramRuntime;
use gram_server::{blob_store, metrics, migrations, runner};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gram_server=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        http_addr = %config.http_addr,
        server_url = %config.server_url,
        assets_uri = %config.assets_uri,
        provider = ?config.functions.provider,
        "Starting Gram Server"
    );

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    info!("Connected to database");

    migrations::run(&pool).await?;

    info!("Database migrations applied");

    let blobs = blob_store::from_uri(&config.assets_uri, &config.object_storage).await?;
    let platform = runner::platform_from_config(&config.functions)?;
    info!(provider = platform.provider(), "Runner platform initialized");

    let mut builder = GramRuntime::builder()
        .pool(pool)
        .blob_store(blobs)
        .platform(platform)
        .config(config.clone());
    if let Some(handle) = metrics::install() {
        builder = builder.metrics(handle);
    }

    let runtime = builder.build()?.start().await?;

    info!(addr = %config.http_addr, "Gram server ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Gram server shut down");

    Ok(())
}
