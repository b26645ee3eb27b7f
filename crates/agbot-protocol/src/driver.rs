//! Protocol Driver
//!
//! The driver owns everything specific to one agreement protocol variant:
//! how messages are built and validated, how replies are persisted, how the
//! ledger commit and ledger-side termination are performed, and how
//! termination reasons map to wire codes. It is stateless with respect to
//! agreement identity; all agreement state lives in the store.
//!
//! Workers drive it through the [`ProtocolDriver`] trait so protocol
//! variants can be swapped without touching the negotiation handlers.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use agbot_exchange::{ExchangeClient, MessageTarget};
use agbot_policy::{Policy, Workload};
use agbot_store::{Agreement, AgreementStore, StoreError};

use crate::codes::TerminationReason;
use crate::error::{LedgerError, ProtocolError, Result};
use crate::ledger::LedgerClient;
use crate::messages::{DataReceivedAck, Proposal, ProposalReply, ReplyAck};

/// A cancellation that could not complete because the ledger was not
/// writable; queued for retry by the worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncCancelCmd {
    pub agreement_id: String,
    pub protocol: String,
    pub reason: u32,
}

/// Per-protocol-variant operations the negotiation handlers consume.
#[async_trait]
pub trait ProtocolDriver: Send + Sync {
    /// Protocol variant name; also the `protocol` column of every record
    /// this driver touches.
    fn name(&self) -> &str;

    /// Version stamped into outbound messages.
    fn version(&self) -> u32;

    /// Build the proposal for a new agreement and send it to the producer.
    /// The returned proposal is frozen into the agreement record.
    #[allow(clippy::too_many_arguments)]
    async fn initiate_agreement(
        &self,
        agreement_id: &str,
        producer_policy_text: &str,
        consumer_policy: &Policy,
        org: &str,
        target: &MessageTarget,
        workload: &Workload,
        default_workload_pw: &str,
        no_data_interval_s: u64,
    ) -> Result<Proposal>;

    /// Parse a saved proposal back into its message form.
    fn demarshal_proposal(&self, text: &str) -> Result<Proposal>;

    /// Parse and validate an inbound reply for this protocol variant.
    fn validate_reply(&self, text: &str) -> Result<ProposalReply>;

    /// Parse and validate an inbound data-received ack.
    fn validate_data_received_ack(&self, text: &str) -> Result<DataReceivedAck>;

    /// Send the reply ack. `still_valid == false` tells the producer to
    /// tear down.
    async fn confirm(&self, still_valid: bool, agreement_id: &str, target: &MessageTarget)
        -> Result<()>;

    /// Record the reply in the store: counterparty address and protocol
    /// version, exactly once.
    async fn persist_reply(&self, reply: &ProposalReply, merged_policy: &Policy) -> Result<()>;

    /// Publish an agreement state transition to the exchange.
    async fn record_consumer_agreement_state(
        &self,
        agreement_id: &str,
        policy_name: &str,
        org: &str,
        state: &str,
        worker_id: &str,
    ) -> Result<()>;

    /// Perform the durable ledger commit for an accepted agreement. May be
    /// slow; called with the agreement lock released.
    async fn post_reply(
        &self,
        agreement_id: &str,
        proposal: &Proposal,
        reply: &ProposalReply,
        consumer_policy: &Policy,
        org: &str,
        worker_id: &str,
    ) -> Result<()>;

    /// Ledger-side termination. Runs on its own task, joins nothing, and
    /// reports failures only through logs.
    async fn terminate_agreement(&self, agreement: &Agreement, reason_code: u32, worker_id: &str);

    /// Whether a cancellation can complete right now: the agreement has no
    /// substrate bound, or its substrate currently accepts writes.
    async fn can_cancel_now(&self, agreement: &Agreement) -> bool;

    async fn is_ledger_writable(&self, ledger_type: &str, name: &str, org: &str) -> bool;

    /// The substrate identity bound to an agreement.
    fn get_known_ledger(&self, agreement: &Agreement) -> (String, String, String);

    fn get_termination_code(&self, reason: TerminationReason) -> u32;

    fn get_termination_reason(&self, code: u32) -> String;

    /// Queue a cancellation for retry once the ledger becomes writable.
    fn defer_command(&self, cmd: AsyncCancelCmd);
}

/// The built-in protocol variant.
pub struct BasicProtocolDriver {
    agbot_id: String,
    message_ttl_s: u64,
    exchange: Arc<dyn ExchangeClient>,
    store: Arc<dyn AgreementStore>,
    ledger: Arc<dyn LedgerClient>,
    deferred_tx: mpsc::UnboundedSender<AsyncCancelCmd>,
}

pub const BASIC_PROTOCOL_NAME: &str = "Basic";
pub const BASIC_PROTOCOL_VERSION: u32 = 2;

impl BasicProtocolDriver {
    pub fn new(
        agbot_id: &str,
        message_ttl_s: u64,
        exchange: Arc<dyn ExchangeClient>,
        store: Arc<dyn AgreementStore>,
        ledger: Arc<dyn LedgerClient>,
        deferred_tx: mpsc::UnboundedSender<AsyncCancelCmd>,
    ) -> Self {
        Self {
            agbot_id: agbot_id.to_string(),
            message_ttl_s,
            exchange,
            store,
            ledger,
            deferred_tx,
        }
    }

    fn check_protocol(&self, got: &str) -> Result<()> {
        if got != BASIC_PROTOCOL_NAME {
            return Err(ProtocolError::WrongProtocol {
                expected: BASIC_PROTOCOL_NAME.to_string(),
                got: got.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ProtocolDriver for BasicProtocolDriver {
    fn name(&self) -> &str {
        BASIC_PROTOCOL_NAME
    }

    fn version(&self) -> u32 {
        BASIC_PROTOCOL_VERSION
    }

    async fn initiate_agreement(
        &self,
        agreement_id: &str,
        producer_policy_text: &str,
        consumer_policy: &Policy,
        org: &str,
        target: &MessageTarget,
        workload: &Workload,
        default_workload_pw: &str,
        no_data_interval_s: u64,
    ) -> Result<Proposal> {
        // The terms and conditions carry the consumer policy narrowed to
        // exactly the chosen workload, with the agbot-wide password filled
        // in when the policy leaves it empty.
        let mut chosen = workload.clone();
        if chosen.workload_password.is_empty() {
            chosen.workload_password = default_workload_pw.to_string();
        }
        let mut tc_policy = consumer_policy.clone();
        tc_policy.workloads = vec![chosen];
        if tc_policy.data_verify.enabled && tc_policy.data_verify.no_data_interval_s == 0 {
            tc_policy.data_verify.no_data_interval_s = no_data_interval_s;
        }

        let proposal = Proposal::new(
            self.name(),
            self.version(),
            agreement_id,
            &tc_policy.to_json()?,
            producer_policy_text,
            &self.agbot_id,
        );

        self.exchange
            .send_message(target, &proposal.to_json()?, self.message_ttl_s)
            .await?;

        info!(
            agreement_id = %agreement_id,
            org = %org,
            receiver = %target.receiver_id,
            "proposal sent"
        );
        Ok(proposal)
    }

    fn demarshal_proposal(&self, text: &str) -> Result<Proposal> {
        let proposal = Proposal::from_json(text)?;
        self.check_protocol(&proposal.protocol)?;
        Ok(proposal)
    }

    fn validate_reply(&self, text: &str) -> Result<ProposalReply> {
        let reply = ProposalReply::from_json(text)?;
        self.check_protocol(&reply.protocol)?;
        Ok(reply)
    }

    fn validate_data_received_ack(&self, text: &str) -> Result<DataReceivedAck> {
        let ack = DataReceivedAck::from_json(text)?;
        self.check_protocol(&ack.protocol)?;
        Ok(ack)
    }

    async fn confirm(
        &self,
        still_valid: bool,
        agreement_id: &str,
        target: &MessageTarget,
    ) -> Result<()> {
        let ack = ReplyAck::new(self.name(), self.version(), agreement_id, still_valid);
        self.exchange
            .send_message(target, &ack.to_json()?, self.message_ttl_s)
            .await?;
        debug!(agreement_id = %agreement_id, still_valid, "reply ack sent");
        Ok(())
    }

    async fn persist_reply(&self, reply: &ProposalReply, merged_policy: &Policy) -> Result<()> {
        self.store
            .persist_reply(
                &reply.agreement_id,
                self.name(),
                &reply.counterparty_address,
                reply.version,
            )
            .await?;
        debug!(
            agreement_id = %reply.agreement_id,
            policy = %merged_policy.header.name,
            "reply persisted"
        );
        Ok(())
    }

    async fn record_consumer_agreement_state(
        &self,
        agreement_id: &str,
        policy_name: &str,
        org: &str,
        state: &str,
        worker_id: &str,
    ) -> Result<()> {
        self.exchange
            .record_consumer_agreement_state(agreement_id, policy_name, org, state)
            .await?;
        info!(
            worker_id = %worker_id,
            agreement_id = %agreement_id,
            state = %state,
            "agreement state recorded"
        );
        Ok(())
    }

    async fn post_reply(
        &self,
        agreement_id: &str,
        proposal: &Proposal,
        reply: &ProposalReply,
        consumer_policy: &Policy,
        org: &str,
        worker_id: &str,
    ) -> Result<()> {
        let agreement = self
            .store
            .find_single_agreement(agreement_id, self.name(), &[])
            .await?
            .ok_or_else(|| {
                ProtocolError::Store(StoreError::AgreementNotFound(agreement_id.to_string()))
            })?;

        if agreement.ledger_type.is_empty() {
            debug!(agreement_id = %agreement_id, "no ledger bound, commit is a no-op");
            return Ok(());
        }

        if !self
            .ledger
            .is_writable(
                &agreement.ledger_type,
                &agreement.ledger_name,
                &agreement.ledger_org,
            )
            .await
        {
            return Err(LedgerError::NotWritable(agreement.ledger_name).into());
        }

        self.ledger
            .record_agreement(
                agreement_id,
                &reply.counterparty_address,
                &proposal.to_json()?,
            )
            .await?;

        info!(
            worker_id = %worker_id,
            agreement_id = %agreement_id,
            org = %org,
            policy = %consumer_policy.header.name,
            "agreement recorded on the ledger"
        );
        Ok(())
    }

    async fn terminate_agreement(&self, agreement: &Agreement, reason_code: u32, worker_id: &str) {
        info!(
            worker_id = %worker_id,
            agreement_id = %agreement.current_agreement_id,
            reason_code,
            "terminating agreement on the ledger"
        );
        if agreement.ledger_type.is_empty() {
            return;
        }
        if let Err(e) = self
            .ledger
            .terminate_agreement(
                &agreement.current_agreement_id,
                &agreement.counterparty_address,
                reason_code,
            )
            .await
        {
            error!(
                worker_id = %worker_id,
                agreement_id = %agreement.current_agreement_id,
                error = %e,
                "ledger-side termination failed"
            );
        }
    }

    async fn can_cancel_now(&self, agreement: &Agreement) -> bool {
        if agreement.ledger_type.is_empty() {
            return true;
        }
        self.ledger
            .is_writable(
                &agreement.ledger_type,
                &agreement.ledger_name,
                &agreement.ledger_org,
            )
            .await
    }

    async fn is_ledger_writable(&self, ledger_type: &str, name: &str, org: &str) -> bool {
        self.ledger.is_writable(ledger_type, name, org).await
    }

    fn get_known_ledger(&self, agreement: &Agreement) -> (String, String, String) {
        (
            agreement.ledger_type.clone(),
            agreement.ledger_name.clone(),
            agreement.ledger_org.clone(),
        )
    }

    fn get_termination_code(&self, reason: TerminationReason) -> u32 {
        reason.code()
    }

    fn get_termination_reason(&self, code: u32) -> String {
        match TerminationReason::from_code(code) {
            Some(reason) => reason.description().to_string(),
            None => format!("terminated for unknown reason {code}"),
        }
    }

    fn defer_command(&self, cmd: AsyncCancelCmd) {
        if self.deferred_tx.send(cmd).is_err() {
            warn!("deferred command queue is closed, dropping cancel");
        }
    }
}
