//! Agreement Bot Server
//!
//! Long-running service that negotiates agreements with producer devices on
//! behalf of a consumer of edge compute capacity.
//!
//! ## Architecture
//!
//! The binary wires four pieces together:
//! - **Agreement store**: embedded SQLite database holding agreement and
//!   workload-usage records
//! - **Exchange client**: REST client for the directory and message relay
//! - **Protocol driver**: the Basic agreement protocol over a configurable
//!   ledger (none by default)
//! - **Worker pool**: fixed-size pool consuming negotiation events
//!
//! Event sources (policy search, inbound message polling, governance) run
//! as separate components and enqueue work through the pool's sender.
//!
//! ## Configuration
//!
//! All configuration is done via environment variables:
//! - `AGBOT_EXCHANGE_URL` / `AGBOT_EXCHANGE_ID` / `AGBOT_EXCHANGE_TOKEN`:
//!   exchange coordinates (required)
//! - `AGBOT_DB_PATH`: SQLite path (default: ./data/agbot.db)
//! - `AGBOT_AGREEMENT_WORKERS`: pool size (default: 5)
//! - `AGBOT_NO_DATA_INTERVAL_S`: proposal no-data interval (default: 900)
//! - `AGBOT_DEFAULT_WORKLOAD_PW`: fallback workload password
//! - `AGBOT_IGNORE_PROPERTIES`: comma list of disqualifying device
//!   properties (default: ethereum_account)
//! - `AGBOT_HTTP_TIMEOUT_S`: exchange client timeout (default: 20)
//! - `AGBOT_PURGE_ARCHIVED_HOURS`: archived-record retention; 0 disables
//! - `AGBOT_DEFERRED_CANCEL_INTERVAL_S`: deferred cancel retry interval
//! - `AGBOT_EXCHANGE_MESSAGE_TTL`: relay message TTL (default: 180)
//!
//! ## Logging
//!
//! Controlled via `RUST_LOG`, e.g. `RUST_LOG=debug agbot-server`.

mod config;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info};

use agbot_exchange::HttpExchangeClient;
use agbot_protocol::{BasicProtocolDriver, NullLedger, ProtocolDriver};
use agbot_store::{AgreementStore, SqliteAgreementStore};
use agbot_worker::{AgreementLockManager, NegotiationConfig, WorkerPool};

use config::AgbotConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = AgbotConfig::from_env()?;

    if let Some(parent) = std::path::Path::new(&config.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    info!("initializing agreement store at {}", config.db_path);
    let store: Arc<dyn AgreementStore> = Arc::new(SqliteAgreementStore::new(&config.db_path).await?);

    info!("connecting to exchange at {}", config.exchange_url);
    let exchange = Arc::new(HttpExchangeClient::new(
        &config.exchange_url,
        &config.exchange_id,
        &config.exchange_token,
        config.http_timeout_s,
    )?);

    let (deferred_tx, deferred_rx) = mpsc::unbounded_channel();
    let driver: Arc<dyn ProtocolDriver> = Arc::new(BasicProtocolDriver::new(
        &config.exchange_id,
        config.exchange_message_ttl_s,
        exchange.clone(),
        store.clone(),
        Arc::new(NullLedger),
        deferred_tx,
    ));

    let pool = WorkerPool::start(
        config.agreement_workers,
        store.clone(),
        exchange.clone(),
        driver,
        Arc::new(AgreementLockManager::new()),
        NegotiationConfig {
            no_data_interval_s: config.no_data_interval_s,
            default_workload_pw: config.default_workload_pw.clone(),
            ignore_contract_with_attribs: config.ignore_contract_with_attribs.clone(),
        },
        deferred_rx,
        config.deferred_cancel_interval,
    );

    // Event sources attach here: they hold the sender and enqueue
    // Initiate/Reply/DataReceivedAck/Cancel/WorkloadUpgrade work.
    let _sender = pool.sender();

    let purge_handle = if config.purge_archived_agreement_hours > 0 {
        Some(tokio::spawn(purge_archived_loop(
            store.clone(),
            config.purge_archived_agreement_hours,
        )))
    } else {
        None
    };

    info!(
        workers = config.agreement_workers,
        exchange_id = %config.exchange_id,
        "agbot started"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    if let Some(handle) = purge_handle {
        handle.abort();
    }
    pool.shutdown().await;

    Ok(())
}

/// Delete archived agreements older than the retention window, hourly.
async fn purge_archived_loop(store: Arc<dyn AgreementStore>, retention_hours: u64) {
    let interval = Duration::from_secs(3600);
    loop {
        tokio::time::sleep(interval).await;
        let cutoff = chrono::Utc::now().timestamp() - (retention_hours as i64) * 3600;
        match store.purge_archived(cutoff).await {
            Ok(0) => {}
            Ok(purged) => info!(purged, "purged archived agreements"),
            Err(e) => error!(error = %e, "error purging archived agreements"),
        }
    }
}
