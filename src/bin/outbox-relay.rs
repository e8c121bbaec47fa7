// Copyright (c) 2025 - Cowboy AI, Inc.
//! Outbox Relay
//!
//! Polls the configured Postgres outbox tables and forwards committed rows
//! to NATS subjects named after their topics.
//!
//! Run with: cargo run --bin outbox-relay
//!
//! Prerequisites:
//! 1. Postgres reachable via DATABASE_URL
//! 2. NATS server running (NATS_URL, default: nats://localhost:4222)
//! 3. OUTBOX_TABLES and OUTBOX_TOPIC_MAP set, e.g.
//!    `OUTBOX_TABLES=order_outbox OUTBOX_TOPIC_MAP=order.placed=order_outbox`

use std::sync::Arc;

use anyhow::{Context, Result};
use cim_outbox::{NatsBus, NatsConfig, OutboxConfig, OutboxService, PostgresDatabase};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("🚀 Starting Outbox Relay");

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL not set")?;
    let nats_url =
        std::env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string());
    let config = OutboxConfig::from_env().context("Invalid outbox configuration")?;

    info!("📋 Configuration loaded:");
    info!("  - NATS URL: {}", nats_url);
    info!("  - Consumer group: {}", config.consumer_group);
    info!("  - Poll interval: {:?}", config.poll_interval);
    for (topic, table) in &config.topic_to_table {
        info!("  - {} → {}", topic, table);
    }

    info!("🔌 Connecting to Postgres");
    let db = PostgresDatabase::connect(&database_url, 5)
        .await
        .context("Failed to connect to Postgres")?;
    info!("✅ Connected to Postgres");

    info!("🔌 Connecting to NATS at {}", nats_url);
    let bus = NatsBus::connect(NatsConfig {
        name: "outbox-relay".to_string(),
        ..NatsConfig::with_url(nats_url)
    })
    .await
    .context("Failed to connect to NATS")?;
    info!("✅ Connected to NATS");

    let service = Arc::new(OutboxService::new(config, Arc::new(db), Arc::new(bus))?);
    service
        .initialize()
        .await
        .context("Failed to initialize outbox tables")?;
    info!("✅ Outbox tables ready");
    let ctx = CancellationToken::new();

    let runner = {
        let service = service.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { service.run(ctx).await })
    };

    info!("🎧 Relaying outbox rows, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("🛑 Shutting down");
    ctx.cancel();
    service.shutdown().await?;
    match runner.await? {
        Ok(()) => info!("✅ Outbox relay stopped"),
        Err(e) => error!("❌ Outbox relay failed: {}", e),
    }
    Ok(())
}
