//! Durable-Commit Substrate
//!
//! The ledger anchors finalized agreements outside the agbot's own store.
//! It may be absent, read-only, or writable at different times; the
//! negotiation core probes writability before committing and defers
//! cancellations while the substrate is unavailable.

use async_trait::async_trait;

use crate::error::LedgerError;

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// Operations the negotiation core performs against a ledger.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Whether the named substrate instance currently accepts writes.
    async fn is_writable(&self, ledger_type: &str, name: &str, org: &str) -> bool;

    /// Anchor a finalized agreement. May be slow; callers must not hold the
    /// agreement lock across this call.
    async fn record_agreement(
        &self,
        agreement_id: &str,
        counterparty_address: &str,
        proposal: &str,
    ) -> LedgerResult<()>;

    /// Terminate the agreement on the substrate.
    async fn terminate_agreement(
        &self,
        agreement_id: &str,
        counterparty_address: &str,
        reason_code: u32,
    ) -> LedgerResult<()>;
}

/// Ledger for deployments with no substrate configured: always writable,
/// commits are no-ops. Agreements with an empty `ledger_type` take this
/// path implicitly.
pub struct NullLedger;

#[async_trait]
impl LedgerClient for NullLedger {
    async fn is_writable(&self, _ledger_type: &str, _name: &str, _org: &str) -> bool {
        true
    }

    async fn record_agreement(
        &self,
        _agreement_id: &str,
        _counterparty_address: &str,
        _proposal: &str,
    ) -> LedgerResult<()> {
        Ok(())
    }

    async fn terminate_agreement(
        &self,
        _agreement_id: &str,
        _counterparty_address: &str,
        _reason_code: u32,
    ) -> LedgerResult<()> {
        Ok(())
    }
}
