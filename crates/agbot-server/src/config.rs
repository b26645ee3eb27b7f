//! Service Configuration
//!
//! All configuration comes from environment variables with sensible
//! defaults; only the exchange coordinates are required.

use std::time::Duration;

use anyhow::{bail, Context, Result};

#[derive(Debug, Clone)]
pub struct AgbotConfig {
    /// SQLite database path.
    pub db_path: String,

    /// Exchange base URL, e.g. `https://exchange.example.com/v1`.
    pub exchange_url: String,

    /// Org-qualified exchange id of this agbot.
    pub exchange_id: String,

    /// The agbot's exchange authentication token.
    pub exchange_token: String,

    /// Size of the negotiation worker pool.
    pub agreement_workers: usize,

    /// Default no-data interval folded into proposals (seconds).
    pub no_data_interval_s: u64,

    /// Workload password offered when a policy does not set one.
    pub default_workload_pw: String,

    /// Producer properties that disqualify a device.
    pub ignore_contract_with_attribs: Vec<String>,

    /// HTTP client timeout for exchange calls (seconds).
    pub http_timeout_s: u64,

    /// Hours an archived agreement is kept before deletion; zero disables
    /// the purge task.
    pub purge_archived_agreement_hours: u64,

    /// How often deferred ledger cancellations are retried.
    pub deferred_cancel_interval: Duration,

    /// TTL for protocol messages queued on the exchange (seconds).
    pub exchange_message_ttl_s: u64,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(v) => v.parse::<T>().with_context(|| format!("invalid {name}")),
        Err(_) => Ok(default),
    }
}

impl AgbotConfig {
    pub fn from_env() -> Result<AgbotConfig> {
        let exchange_url = env_or("AGBOT_EXCHANGE_URL", "");
        let exchange_id = env_or("AGBOT_EXCHANGE_ID", "");
        let exchange_token = env_or("AGBOT_EXCHANGE_TOKEN", "");
        if exchange_url.is_empty() || exchange_id.is_empty() || exchange_token.is_empty() {
            bail!(
                "AGBOT_EXCHANGE_URL, AGBOT_EXCHANGE_ID, and AGBOT_EXCHANGE_TOKEN must be set"
            );
        }

        let ignore = env_or("AGBOT_IGNORE_PROPERTIES", "ethereum_account");

        Ok(AgbotConfig {
            db_path: env_or("AGBOT_DB_PATH", "./data/agbot.db"),
            exchange_url,
            exchange_id,
            exchange_token,
            agreement_workers: env_parse("AGBOT_AGREEMENT_WORKERS", 5usize)?,
            no_data_interval_s: env_parse("AGBOT_NO_DATA_INTERVAL_S", 900u64)?,
            default_workload_pw: env_or("AGBOT_DEFAULT_WORKLOAD_PW", ""),
            ignore_contract_with_attribs: ignore
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            http_timeout_s: env_parse("AGBOT_HTTP_TIMEOUT_S", 20u64)?,
            purge_archived_agreement_hours: env_parse("AGBOT_PURGE_ARCHIVED_HOURS", 0u64)?,
            deferred_cancel_interval: Duration::from_secs(env_parse(
                "AGBOT_DEFERRED_CANCEL_INTERVAL_S",
                30u64,
            )?),
            exchange_message_ttl_s: env_parse("AGBOT_EXCHANGE_MESSAGE_TTL", 180u64)?,
        })
    }
}
