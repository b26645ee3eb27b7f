//! SQLite Agreement Store Implementation
//!
//! Implements the [`AgreementStore`] trait over an embedded SQLite
//! database.
//!
//! ## Why SQLite?
//!
//! The negotiation core runs as a single process and serializes writes per
//! agreement id with its own locks, so an embedded database with per-key
//! atomic updates is all that is required:
//! - zero configuration, no separate server
//! - ACID single-statement updates
//! - in-memory databases for fast, isolated tests
//!
//! ## Implementation Notes
//!
//! This implementation uses **runtime queries** (`sqlx::query` with
//! `.bind()` and `Row::get`) instead of the compile-time checked macros so
//! the crate builds without a `DATABASE_URL`. The schema is applied on
//! startup via `sqlx::migrate!` from the embedded `migrations/` directory.
//!
//! The "at most one unarchived record per agreement id" invariant is
//! enforced by a partial unique index, so a racing duplicate insert
//! surfaces as a constraint violation rather than a silent overwrite.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use crate::error::{Result, StoreError};
use crate::types::{Agreement, AgreementFilter, WorkloadUsage};
use crate::AgreementStore;

/// SQLite-backed agreement store.
pub struct SqliteAgreementStore {
    pool: SqlitePool,
}

impl SqliteAgreementStore {
    /// Open (or create) a database file and run migrations.
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", path.as_ref().display()))?
                .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// In-memory database for testing. A single connection keeps every
    /// query on the same database instance.
    pub async fn new_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    fn now() -> i64 {
        Utc::now().timestamp()
    }

    async fn get_agreement(&self, agreement_id: &str, protocol: &str) -> Result<Option<Agreement>> {
        let rows = sqlx::query(
            "SELECT * FROM agreements WHERE current_agreement_id = ?1 AND protocol = ?2
             ORDER BY id DESC LIMIT 1",
        )
        .bind(agreement_id)
        .bind(protocol)
        .fetch_all(&self.pool)
        .await?;

        rows.first().map(agreement_from_row).transpose()
    }

    async fn get_usage(&self, device_id: &str, policy_name: &str) -> Result<Option<WorkloadUsage>> {
        let row = sqlx::query(
            "SELECT * FROM workload_usages WHERE device_id = ?1 AND policy_name = ?2",
        )
        .bind(device_id)
        .bind(policy_name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(usage_from_row).transpose()
    }
}

#[async_trait]
impl AgreementStore for SqliteAgreementStore {
    async fn agreement_attempt(
        &self,
        agreement_id: &str,
        org: &str,
        device_id: &str,
        policy_name: &str,
        ledger_type: &str,
        ledger_name: &str,
        ledger_org: &str,
        protocol: &str,
        pattern_id: &str,
        node_health: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO agreements
                (current_agreement_id, device_id, org, policy_name, protocol,
                 pattern_id, ledger_type, ledger_name, ledger_org, node_health,
                 agreement_creation_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )
        .bind(agreement_id)
        .bind(device_id)
        .bind(org)
        .bind(policy_name)
        .bind(protocol)
        .bind(pattern_id)
        .bind(ledger_type)
        .bind(ledger_name)
        .bind(ledger_org)
        .bind(node_health)
        .bind(Self::now())
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            if e.to_string().contains("UNIQUE constraint failed") {
                return Err(StoreError::AgreementExists(agreement_id.to_string()));
            }
            return Err(e.into());
        }
        Ok(())
    }

    async fn persist_agreement_proposal(
        &self,
        agreement_id: &str,
        protocol: &str,
        proposal: &str,
        policy: &str,
    ) -> Result<Agreement> {
        let rows_affected = sqlx::query(
            "UPDATE agreements
             SET proposal = ?1, policy = ?2, agreement_initiated_time = ?3
             WHERE current_agreement_id = ?4 AND protocol = ?5 AND archived = 0",
        )
        .bind(proposal)
        .bind(policy)
        .bind(Self::now())
        .bind(agreement_id)
        .bind(protocol)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(StoreError::AgreementNotFound(agreement_id.to_string()));
        }
        self.get_agreement(agreement_id, protocol)
            .await?
            .ok_or_else(|| StoreError::AgreementNotFound(agreement_id.to_string()))
    }

    async fn find_single_agreement(
        &self,
        agreement_id: &str,
        protocol: &str,
        filters: &[AgreementFilter],
    ) -> Result<Option<Agreement>> {
        let found = self.get_agreement(agreement_id, protocol).await?;
        Ok(found.filter(|ag| filters.iter().all(|f| f.matches(ag))))
    }

    async fn find_agreements(
        &self,
        filters: &[AgreementFilter],
        protocol: &str,
    ) -> Result<Vec<Agreement>> {
        let rows = sqlx::query("SELECT * FROM agreements WHERE protocol = ?1 ORDER BY id")
            .bind(protocol)
            .fetch_all(&self.pool)
            .await?;

        let mut agreements = Vec::new();
        for row in &rows {
            let ag = agreement_from_row(row)?;
            if filters.iter().all(|f| f.matches(&ag)) {
                agreements.push(ag);
            }
        }
        Ok(agreements)
    }

    async fn persist_reply(
        &self,
        agreement_id: &str,
        protocol: &str,
        counterparty_address: &str,
        protocol_version: u32,
    ) -> Result<Agreement> {
        let rows_affected = sqlx::query(
            "UPDATE agreements
             SET agreement_reply_time = ?1, counterparty_address = ?2, protocol_version = ?3
             WHERE current_agreement_id = ?4 AND protocol = ?5
               AND archived = 0 AND agreement_reply_time = 0",
        )
        .bind(Self::now())
        .bind(counterparty_address)
        .bind(i64::from(protocol_version))
        .bind(agreement_id)
        .bind(protocol)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return match self.get_agreement(agreement_id, protocol).await? {
                Some(ag) if ag.already_received_reply() => {
                    Err(StoreError::AlreadyReplied(agreement_id.to_string()))
                }
                _ => Err(StoreError::AgreementNotFound(agreement_id.to_string())),
            };
        }
        self.get_agreement(agreement_id, protocol)
            .await?
            .ok_or_else(|| StoreError::AgreementNotFound(agreement_id.to_string()))
    }

    async fn data_notification(&self, agreement_id: &str, protocol: &str) -> Result<Agreement> {
        let rows_affected = sqlx::query(
            "UPDATE agreements SET data_notification_time = ?1
             WHERE current_agreement_id = ?2 AND protocol = ?3 AND archived = 0",
        )
        .bind(Self::now())
        .bind(agreement_id)
        .bind(protocol)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(StoreError::AgreementNotFound(agreement_id.to_string()));
        }
        self.get_agreement(agreement_id, protocol)
            .await?
            .ok_or_else(|| StoreError::AgreementNotFound(agreement_id.to_string()))
    }

    async fn agreement_timedout(&self, agreement_id: &str, protocol: &str) -> Result<Agreement> {
        let rows_affected = sqlx::query(
            "UPDATE agreements SET agreement_timedout_time = ?1
             WHERE current_agreement_id = ?2 AND protocol = ?3 AND archived = 0",
        )
        .bind(Self::now())
        .bind(agreement_id)
        .bind(protocol)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(StoreError::AgreementNotFound(agreement_id.to_string()));
        }
        self.get_agreement(agreement_id, protocol)
            .await?
            .ok_or_else(|| StoreError::AgreementNotFound(agreement_id.to_string()))
    }

    async fn archive_agreement(
        &self,
        agreement_id: &str,
        protocol: &str,
        reason_code: u32,
        reason_text: &str,
    ) -> Result<Agreement> {
        let rows_affected = sqlx::query(
            "UPDATE agreements
             SET archived = 1, terminated_reason = ?1, terminated_description = ?2
             WHERE current_agreement_id = ?3 AND protocol = ?4 AND archived = 0",
        )
        .bind(i64::from(reason_code))
        .bind(reason_text)
        .bind(agreement_id)
        .bind(protocol)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(StoreError::AgreementNotFound(agreement_id.to_string()));
        }
        self.get_agreement(agreement_id, protocol)
            .await?
            .ok_or_else(|| StoreError::AgreementNotFound(agreement_id.to_string()))
    }

    async fn delete_agreement(&self, agreement_id: &str, protocol: &str) -> Result<()> {
        let rows_affected = sqlx::query(
            "DELETE FROM agreements
             WHERE current_agreement_id = ?1 AND protocol = ?2 AND archived = 0",
        )
        .bind(agreement_id)
        .bind(protocol)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(StoreError::AgreementNotFound(agreement_id.to_string()));
        }
        Ok(())
    }

    async fn purge_archived(&self, cutoff: i64) -> Result<u64> {
        let rows_affected = sqlx::query(
            "DELETE FROM agreements
             WHERE archived = 1 AND agreement_timedout_time != 0 AND agreement_timedout_time < ?1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows_affected)
    }

    async fn find_single_workload_usage(
        &self,
        device_id: &str,
        policy_name: &str,
    ) -> Result<Option<WorkloadUsage>> {
        self.get_usage(device_id, policy_name).await
    }

    async fn new_workload_usage(
        &self,
        device_id: &str,
        ha_partners: &[String],
        policy: &str,
        policy_name: &str,
        priority: u32,
        retry_duration_s: u32,
        verified_duration_s: u32,
        reqs_not_met: bool,
        agreement_id: &str,
    ) -> Result<()> {
        let partners_json = serde_json::to_string(ha_partners)?;
        let result = sqlx::query(
            "INSERT INTO workload_usages
                (device_id, policy_name, ha_partners, policy, priority,
                 retry_duration_s, verified_duration_s, reqs_not_met,
                 first_try_time, current_agreement_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(device_id)
        .bind(policy_name)
        .bind(partners_json)
        .bind(policy)
        .bind(i64::from(priority))
        .bind(i64::from(retry_duration_s))
        .bind(i64::from(verified_duration_s))
        .bind(reqs_not_met)
        .bind(Self::now())
        .bind(agreement_id)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            if e.to_string().contains("UNIQUE constraint failed") {
                return Err(StoreError::WorkloadUsageExists {
                    device_id: device_id.to_string(),
                    policy_name: policy_name.to_string(),
                });
            }
            return Err(e.into());
        }
        Ok(())
    }

    async fn update_priority(
        &self,
        device_id: &str,
        policy_name: &str,
        priority: u32,
        retry_duration_s: u32,
        verified_duration_s: u32,
        agreement_id: &str,
    ) -> Result<Option<WorkloadUsage>> {
        let rows_affected = sqlx::query(
            "UPDATE workload_usages
             SET priority = ?1, retry_duration_s = ?2, verified_duration_s = ?3,
                 retry_count = 0, first_try_time = ?4, latest_retry_time = 0,
                 current_agreement_id = ?5
             WHERE device_id = ?6 AND policy_name = ?7",
        )
        .bind(i64::from(priority))
        .bind(i64::from(retry_duration_s))
        .bind(i64::from(verified_duration_s))
        .bind(Self::now())
        .bind(agreement_id)
        .bind(device_id)
        .bind(policy_name)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Ok(None);
        }
        self.get_usage(device_id, policy_name).await
    }

    async fn update_retry_count(
        &self,
        device_id: &str,
        policy_name: &str,
        retry_count: u32,
        agreement_id: &str,
    ) -> Result<Option<WorkloadUsage>> {
        let rows_affected = sqlx::query(
            "UPDATE workload_usages
             SET retry_count = ?1, latest_retry_time = ?2, current_agreement_id = ?3
             WHERE device_id = ?4 AND policy_name = ?5",
        )
        .bind(i64::from(retry_count))
        .bind(Self::now())
        .bind(agreement_id)
        .bind(device_id)
        .bind(policy_name)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Ok(None);
        }
        self.get_usage(device_id, policy_name).await
    }

    async fn update_policy(
        &self,
        device_id: &str,
        policy_name: &str,
        policy: &str,
    ) -> Result<Option<WorkloadUsage>> {
        let rows_affected = sqlx::query(
            "UPDATE workload_usages SET policy = ?1
             WHERE device_id = ?2 AND policy_name = ?3",
        )
        .bind(policy)
        .bind(device_id)
        .bind(policy_name)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Ok(None);
        }
        self.get_usage(device_id, policy_name).await
    }

    async fn update_wu_agreement_id(
        &self,
        device_id: &str,
        policy_name: &str,
        agreement_id: &str,
    ) -> Result<Option<WorkloadUsage>> {
        let rows_affected = sqlx::query(
            "UPDATE workload_usages SET current_agreement_id = ?1
             WHERE device_id = ?2 AND policy_name = ?3",
        )
        .bind(agreement_id)
        .bind(device_id)
        .bind(policy_name)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Ok(None);
        }
        self.get_usage(device_id, policy_name).await
    }

    async fn disable_workload_retry(
        &self,
        device_id: &str,
        policy_name: &str,
    ) -> Result<Option<WorkloadUsage>> {
        let rows_affected = sqlx::query(
            "UPDATE workload_usages SET disable_retry = 1
             WHERE device_id = ?1 AND policy_name = ?2",
        )
        .bind(device_id)
        .bind(policy_name)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Ok(None);
        }
        self.get_usage(device_id, policy_name).await
    }

    async fn delete_workload_usage(&self, device_id: &str, policy_name: &str) -> Result<()> {
        sqlx::query("DELETE FROM workload_usages WHERE device_id = ?1 AND policy_name = ?2")
            .bind(device_id)
            .bind(policy_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn agreement_from_row(row: &SqliteRow) -> Result<Agreement> {
    Ok(Agreement {
        current_agreement_id: row.get("current_agreement_id"),
        device_id: row.get("device_id"),
        org: row.get("org"),
        policy_name: row.get("policy_name"),
        policy: row.get("policy"),
        proposal: row.get("proposal"),
        protocol: row.get("protocol"),
        protocol_version: row.get::<i64, _>("protocol_version") as u32,
        pattern_id: row.get("pattern_id"),
        ledger_type: row.get("ledger_type"),
        ledger_name: row.get("ledger_name"),
        ledger_org: row.get("ledger_org"),
        counterparty_address: row.get("counterparty_address"),
        node_health: row.get("node_health"),
        agreement_creation_time: row.get("agreement_creation_time"),
        agreement_initiated_time: row.get("agreement_initiated_time"),
        agreement_reply_time: row.get("agreement_reply_time"),
        data_notification_time: row.get("data_notification_time"),
        agreement_timedout_time: row.get("agreement_timedout_time"),
        archived: row.get("archived"),
        terminated_reason: row.get::<i64, _>("terminated_reason") as u32,
        terminated_description: row.get("terminated_description"),
    })
}

fn usage_from_row(row: &SqliteRow) -> Result<WorkloadUsage> {
    let partners: Vec<String> = serde_json::from_str(row.get::<String, _>("ha_partners").as_str())?;
    Ok(WorkloadUsage {
        device_id: row.get("device_id"),
        policy_name: row.get("policy_name"),
        ha_partners: partners,
        policy: row.get("policy"),
        priority: row.get::<i64, _>("priority") as u32,
        retry_count: row.get::<i64, _>("retry_count") as u32,
        retry_duration_s: row.get::<i64, _>("retry_duration_s") as u32,
        verified_duration_s: row.get::<i64, _>("verified_duration_s") as u32,
        disable_retry: row.get("disable_retry"),
        reqs_not_met: row.get("reqs_not_met"),
        first_try_time: row.get("first_try_time"),
        latest_retry_time: row.get("latest_retry_time"),
        current_agreement_id: row.get("current_agreement_id"),
    })
}
